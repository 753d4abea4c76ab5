//! Whole-value atomic swap, the generalization of the teacher's
//! `Arc<RwLock<GtfsData>>` pattern used for any snapshot that must be
//! replaced as a unit (§5 "Implementation mapping"). Readers always see
//! either the old or the new value, never a partial one.

use std::sync::{Arc, RwLock};

pub struct Replaceable<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> Replaceable<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        self.inner.read().unwrap().clone()
    }

    pub fn store(&self, value: T) {
        *self.inner.write().unwrap() = Arc::new(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_see_old_or_new_never_partial() {
        let r = Replaceable::new(vec![1, 2, 3]);
        let before = r.load();
        r.store(vec![4, 5]);
        let after = r.load();
        assert_eq!(*before, vec![1, 2, 3]);
        assert_eq!(*after, vec![4, 5]);
    }
}
