//! Named error kinds (§7). Contracts, not exhaustive wire-level detail:
//! callers match on kind where policy differs (fatal vs. degrade-and-log).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("fetch failed for {feed}: {source}")]
    Fetch {
        feed: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed {feed} payload: {reason}")]
    Parse { feed: &'static str, reason: String },

    #[error("empty snapshot from {feed}")]
    EmptySnapshot { feed: &'static str },

    #[error("required static file missing: {path}")]
    StaticMissing { path: String },

    #[error("cannot resolve {what} for {context}")]
    ResolutionAmbiguous { what: &'static str, context: String },

    #[error("backtrack attempted for {service_instance_id}: would move from seq {from} to {to}")]
    BacktrackAttempted {
        service_instance_id: String,
        from: u32,
        to: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtrack_message_names_the_service() {
        let e = CoreError::BacktrackAttempted {
            service_instance_id: "20260101:T1".into(),
            from: 7,
            to: 4,
        };
        assert!(e.to_string().contains("20260101:T1"));
    }
}
