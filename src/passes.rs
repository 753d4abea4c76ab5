//! C9 — Pass Recorder (§4.9). One global lock around the per-service pass
//! tables, matching §5's "single global lock" wording directly. Enforces the
//! anti-backtrack invariant consumed by C7: `last_seq` for a service instance
//! only ever moves forward.

use std::collections::HashMap;
use std::sync::Mutex;

use compact_str::CompactString;

use crate::domain::{StopPassRecord, StopRow};

struct ServiceRecord {
    by_seq: HashMap<u32, StopPassRecord>,
    last_seq: u32,
    last_update_unix: i64,
}

pub struct PassRecorder {
    services: Mutex<HashMap<CompactString, ServiceRecord>>,
}

impl PassRecorder {
    pub fn new() -> Self {
        Self { services: Mutex::new(HashMap::new()) }
    }

    /// `record(service_key, rows, last_passed_seq, vehicle_ts, forced_arrivals?, forced_departures?)`.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        service_key: &str,
        rows: &[StopRow],
        last_passed_seq: u32,
        vehicle_ts: i64,
        forced_arrivals: &HashMap<u32, i64>,
        forced_departures: &HashMap<u32, i64>,
    ) {
        let mut services = self.services.lock().unwrap();
        let entry = services
            .entry(CompactString::from(service_key))
            .or_insert_with(|| ServiceRecord { by_seq: HashMap::new(), last_seq: 0, last_update_unix: vehicle_ts });

        for row in rows {
            if row.stop_sequence > last_passed_seq {
                continue;
            }
            let arrival_epoch = forced_arrivals
                .get(&row.stop_sequence)
                .copied()
                .or(row.passed_at_epoch)
                .or(row.eta_arr_epoch)
                .or(row.tu_arr_epoch)
                .or(row.sched_arr_epoch);
            let departure_epoch = forced_departures
                .get(&row.stop_sequence)
                .copied()
                .or(row.eta_dep_epoch)
                .or(row.tu_dep_epoch)
                .or(row.sched_dep_epoch);

            let record = entry.by_seq.entry(row.stop_sequence).or_insert_with(|| StopPassRecord {
                stop_sequence: row.stop_sequence,
                stop_id: row.stop_id.clone(),
                arrival_epoch: None,
                departure_epoch: None,
                arrival_delay_s: None,
                departure_delay_s: None,
                recorded_at_unix: vehicle_ts,
            });
            if arrival_epoch.is_some() {
                record.arrival_epoch = arrival_epoch;
            }
            if departure_epoch.is_some() {
                record.departure_epoch = departure_epoch;
            }
            record.arrival_delay_s = row.delay_s.or(record.arrival_delay_s);
            record.departure_delay_s = row.delay_s.or(record.departure_delay_s);
            record.recorded_at_unix = vehicle_ts;
        }

        entry.last_seq = entry.last_seq.max(last_passed_seq);
        entry.last_update_unix = vehicle_ts;
    }

    pub fn get_last_seq(&self, service_key: &str) -> u32 {
        self.services
            .lock()
            .unwrap()
            .get(service_key)
            .map(|r| r.last_seq)
            .unwrap_or(0)
    }

    pub fn get_records(&self, service_key: &str) -> Vec<StopPassRecord> {
        let services = self.services.lock().unwrap();
        let Some(record) = services.get(service_key) else { return Vec::new() };
        let mut out: Vec<StopPassRecord> = record.by_seq.values().cloned().collect();
        out.sort_by_key(|r| r.stop_sequence);
        out
    }

    /// Evicts services whose last update is more than 24h old.
    pub fn sweep(&self, now: i64) {
        const MAX_AGE_S: i64 = 24 * 3600;
        self.services.lock().unwrap().retain(|_, r| now - r.last_update_unix <= MAX_AGE_S);
    }
}

impl Default for PassRecorder {
    fn default() -> Self {
        Self::new()
    }
}
