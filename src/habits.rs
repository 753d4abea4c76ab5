//! C10 — Platform Habits (§4.10, §1.2). Time-decayed platform histogram per
//! (nucleus, route_id, stop_id), persisted as JSON with an atomic
//! write-temp-then-rename, plus the CSV export and blacklist supplement
//! grounded in `platform_habits.py`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use compact_str::CompactString;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{NucleusId, RouteId, StopId};

const MAX_TS_PER_PLATFORM: usize = 120;
const THROTTLE_SECONDS: i64 = 25;
const HALF_LIFE_DAYS_DEFAULT: f64 = 30.0;
const PUBLISH_MIN_EFFECTIVE: f64 = 8.0;
const STALE_MAX_DAYS: f64 = 180.0;

static PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(v[ií]a|and[ée]n|platform|pl\.?)\s*").unwrap());
static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{1,3})\s*([A-Za-z]{0,3})?").unwrap());

/// Strips locale-specific prefixes then keeps up to 3 digits + an optional
/// 3-letter suffix, uppercased (§1.2).
pub fn normalize_platform(raw: &str) -> Option<CompactString> {
    let stripped = PREFIX.replace(raw, "");
    let caps = TOKEN.captures(stripped.trim())?;
    let digits = &caps[1];
    let suffix = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    Some(CompactString::from(format!("{digits}{}", suffix.to_uppercase())))
}

type EntryKey = (NucleusId, RouteId, StopId);

struct Store {
    entries: HashMap<EntryKey, HashMap<CompactString, VecDeque<i64>>>,
    last_observed: HashMap<(EntryKey, CompactString), i64>,
}

#[derive(Clone, Debug)]
pub struct HabitualPrediction {
    pub primary: Option<CompactString>,
    pub secondary: Option<CompactString>,
    pub confidence: f64,
    pub n_effective: f64,
    pub frequencies: HashMap<CompactString, f64>,
    pub publishable: bool,
}

#[derive(Serialize, Deserialize)]
struct PersistedMeta {
    version: u32,
    updated_at: i64,
    half_life_days: f64,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedEntry {
    platforms: HashMap<String, Vec<i64>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedFile {
    meta: PersistedMeta,
    entries: HashMap<String, PersistedEntry>,
}

pub struct PlatformHabits {
    path: PathBuf,
    half_life_days: f64,
    store: Mutex<Store>,
    blacklist: HashSet<(NucleusId, StopId, Option<RouteId>)>,
}

impl PlatformHabits {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let path = data_dir.as_ref().join("platform_habits.json");
        let blacklist = Self::load_blacklist(data_dir.as_ref());
        let mut habits = Self {
            path,
            half_life_days: HALF_LIFE_DAYS_DEFAULT,
            store: Mutex::new(Store { entries: HashMap::new(), last_observed: HashMap::new() }),
            blacklist,
        };
        habits.load();
        habits
    }

    fn load_blacklist(data_dir: &Path) -> HashSet<(NucleusId, StopId, Option<RouteId>)> {
        let path = data_dir.join("platform_habits_blacklist.csv");
        let mut set = HashSet::new();
        if let Ok(mut rdr) = csv::Reader::from_path(&path) {
            #[derive(Deserialize)]
            struct Row {
                nucleus: String,
                stop_id: String,
                route_id: String,
            }
            for row in rdr.deserialize::<Row>().flatten() {
                let route = if row.route_id == "*" || row.route_id.is_empty() {
                    None
                } else {
                    Some(RouteId::from(row.route_id))
                };
                set.insert((NucleusId::from(row.nucleus), StopId::from(row.stop_id), route));
            }
        }
        set
    }

    fn is_blacklisted(&self, nucleus: &str, route_id: &str, stop_id: &str) -> bool {
        self.blacklist.contains(&(NucleusId::from(nucleus), StopId::from(stop_id), None))
            || self
                .blacklist
                .contains(&(NucleusId::from(nucleus), StopId::from(stop_id), Some(RouteId::from(route_id))))
    }

    fn load(&mut self) {
        let Ok(text) = std::fs::read_to_string(&self.path) else { return };
        let Ok(parsed) = serde_json::from_str::<PersistedFile>(&text) else { return };
        self.half_life_days = parsed.meta.half_life_days;
        let mut store = self.store.lock().unwrap();
        for (key, entry) in parsed.entries {
            let Some((nucleus, route_id, stop_id)) = split_key(&key) else { continue };
            let mut platforms = HashMap::new();
            for (platform, epochs) in entry.platforms {
                platforms.insert(CompactString::from(platform), epochs.into_iter().collect());
            }
            store.entries.insert((nucleus, route_id, stop_id), platforms);
        }
    }

    /// Best-effort atomic persist: write to a temp file in the same directory, then rename.
    fn save(&self, now: i64) {
        let store = self.store.lock().unwrap();
        let mut entries = HashMap::new();
        for ((nucleus, route_id, stop_id), platforms) in &store.entries {
            let mut out_platforms = HashMap::new();
            for (platform, epochs) in platforms {
                out_platforms.insert(platform.to_string(), epochs.iter().copied().collect());
            }
            entries.insert(format!("{nucleus}|{route_id}|{stop_id}"), PersistedEntry { platforms: out_platforms });
        }
        let persisted = PersistedFile {
            meta: PersistedMeta { version: 1, updated_at: now, half_life_days: self.half_life_days },
            entries,
        };
        drop(store);

        let Ok(text) = serde_json::to_string_pretty(&persisted) else { return };
        let Some(parent) = self.path.parent() else { return };
        if std::fs::create_dir_all(parent).is_err() {
            return;
        }
        let tmp_path = parent.join(format!(".platform_habits.{now}.tmp"));
        if std::fs::write(&tmp_path, text).is_err() {
            return;
        }
        let _ = std::fs::rename(&tmp_path, &self.path);
    }

    /// Throttled observation insert; silently ignored when blacklisted or
    /// within `THROTTLE_SECONDS` of the previous observation for this platform.
    pub fn observe(&self, nucleus: &str, route_id: &str, stop_id: &str, raw_platform: &str, epoch: i64) {
        if self.is_blacklisted(nucleus, route_id, stop_id) {
            return;
        }
        let Some(platform) = normalize_platform(raw_platform) else { return };
        let key: EntryKey = (NucleusId::from(nucleus), RouteId::from(route_id), StopId::from(stop_id));

        let mut store = self.store.lock().unwrap();
        let throttle_key = (key.clone(), platform.clone());
        if let Some(&last) = store.last_observed.get(&throttle_key) {
            if epoch - last < THROTTLE_SECONDS {
                return;
            }
        }
        store.last_observed.insert(throttle_key, epoch);
        let history = store.entries.entry(key).or_default().entry(platform).or_default();
        history.push_back(epoch);
        while history.len() > MAX_TS_PER_PLATFORM {
            history.pop_front();
        }
        drop(store);
        self.save(epoch);
    }

    fn collect(&self, nucleus: Option<&str>, route_id: Option<&str>, stop_id: &str) -> HashMap<CompactString, VecDeque<i64>> {
        let store = self.store.lock().unwrap();
        let mut merged: HashMap<CompactString, VecDeque<i64>> = HashMap::new();
        for ((n, r, s), platforms) in &store.entries {
            if s.as_str() != stop_id {
                continue;
            }
            if let Some(nuc) = nucleus {
                if n.as_str() != nuc {
                    continue;
                }
            }
            if let Some(rid) = route_id {
                if r.as_str() != rid {
                    continue;
                }
            }
            for (platform, epochs) in platforms {
                merged.entry(platform.clone()).or_default().extend(epochs.iter().copied());
            }
        }
        merged
    }

    /// `habitual_for(nucleus, route_id, stop_id, now)` (§4.10).
    pub fn habitual_for(&self, nucleus: &str, route_id: &str, stop_id: &str, now: i64) -> HabitualPrediction {
        let mut candidates = self.collect(Some(nucleus), Some(route_id), stop_id);
        if candidates.is_empty() {
            candidates = self.collect(Some(nucleus), None, stop_id);
        }
        if candidates.is_empty() {
            candidates = self.collect(None, None, stop_id);
        }
        if candidates.is_empty() {
            return HabitualPrediction {
                primary: None,
                secondary: None,
                confidence: 0.0,
                n_effective: 0.0,
                frequencies: HashMap::new(),
                publishable: false,
            };
        }

        let mut weights: Vec<(CompactString, f64, i64)> = Vec::new();
        for (platform, epochs) in &candidates {
            let mut total = 0.0;
            let mut last_seen = i64::MIN;
            for &epoch in epochs {
                let age_days = (now - epoch).max(0) as f64 / 86_400.0;
                total += 2f64.powf(-age_days / self.half_life_days);
                last_seen = last_seen.max(epoch);
            }
            weights.push((platform.clone(), total, last_seen));
        }
        weights.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

        let total_weight: f64 = weights.iter().map(|(_, w, _)| w).sum();
        let frequencies: HashMap<CompactString, f64> = weights
            .iter()
            .map(|(p, w, _)| (p.clone(), if total_weight > 0.0 { w / total_weight } else { 0.0 }))
            .collect();

        let last_seen_overall = weights.iter().map(|(_, _, l)| *l).max().unwrap_or(i64::MIN);
        let age_of_last_seen_days = if last_seen_overall == i64::MIN {
            f64::INFINITY
        } else {
            (now - last_seen_overall).max(0) as f64 / 86_400.0
        };
        let publishable = total_weight >= PUBLISH_MIN_EFFECTIVE && age_of_last_seen_days <= STALE_MAX_DAYS;

        let primary = weights.first().map(|(p, _, _)| p.clone());
        let secondary = weights.get(1).map(|(p, _, _)| p.clone());
        let confidence = primary
            .as_ref()
            .and_then(|p| frequencies.get(p))
            .copied()
            .unwrap_or(0.0);

        HabitualPrediction { primary, secondary, confidence, n_effective: total_weight, frequencies, publishable }
    }

    /// Operational-debugging CSV snapshot (§1.2), grounded in `export_csv`.
    pub fn export_csv(&self, path: impl AsRef<Path>, now: i64) -> std::io::Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(["nucleus", "route_id", "stop_id", "platform", "n_obs", "weight", "last_seen_unix"])?;
        let store = self.store.lock().unwrap();
        for ((nucleus, route_id, stop_id), platforms) in &store.entries {
            for (platform, epochs) in platforms {
                let mut weight = 0.0;
                let mut last_seen = 0i64;
                for &epoch in epochs {
                    let age_days = (now - epoch).max(0) as f64 / 86_400.0;
                    weight += 2f64.powf(-age_days / self.half_life_days);
                    last_seen = last_seen.max(epoch);
                }
                wtr.write_record([
                    nucleus.as_str(),
                    route_id.as_str(),
                    stop_id.as_str(),
                    platform.as_str(),
                    &epochs.len().to_string(),
                    &format!("{weight:.4}"),
                    &last_seen.to_string(),
                ])?;
            }
        }
        wtr.flush()
    }
}

fn split_key(key: &str) -> Option<(NucleusId, RouteId, StopId)> {
    let mut parts = key.splitn(3, '|');
    let nucleus = parts.next()?;
    let route_id = parts.next()?;
    let stop_id = parts.next()?;
    Some((NucleusId::from(nucleus), RouteId::from(route_id), StopId::from(stop_id)))
}
