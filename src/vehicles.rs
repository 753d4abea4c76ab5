//! C4 — Vehicle Positions Cache (§4.4). Polls the realtime vehicle endpoint,
//! accepts both Protobuf and JSON transcriptions, and applies the grace rule
//! that absorbs transient empty snapshots. Grounded in `live_trains_cache.py`'s
//! `fetch_with_retry`/snapshot-replace logic and in the teacher's
//! `reqwest::blocking` + `DashMap` usage for `trip_updates`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeZone;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::Deserialize;

use crate::domain::{
    DirectionId, NucleusId, RouteId, TripId, VehicleObservation, VehicleStopStatus,
};
use crate::error::CoreError;
use crate::replaceable::Replaceable;
use crate::scheduled::ScheduledTrainsMaterializer;
use crate::static_repo::StaticRepo;

const EMPTY_GRACE_SNAPSHOTS: u32 = 2;
const MAX_STALE_SECONDS: i64 = 180;
const FAST_RETRY_ATTEMPTS: u32 = 2;
const FAST_RETRY_DELAY: Duration = Duration::from_millis(400);

fn status_from_i32(v: i32) -> VehicleStopStatus {
    match v {
        0 => VehicleStopStatus::IncomingAt,
        1 => VehicleStopStatus::StoppedAt,
        _ => VehicleStopStatus::InTransitTo,
    }
}

struct Indices {
    observations: Vec<VehicleObservation>,
    by_id: HashMap<CompactString, usize>,
    by_route: DashMap<RouteId, Vec<CompactString>>,
    by_nucleus: DashMap<NucleusId, Vec<CompactString>>,
    by_nucleus_route: DashMap<(NucleusId, RouteId), Vec<CompactString>>,
}

impl Indices {
    fn build(observations: Vec<VehicleObservation>) -> Self {
        let by_route: DashMap<RouteId, Vec<CompactString>> = DashMap::new();
        let by_nucleus: DashMap<NucleusId, Vec<CompactString>> = DashMap::new();
        let by_nucleus_route: DashMap<(NucleusId, RouteId), Vec<CompactString>> = DashMap::new();
        let mut by_id = HashMap::new();

        for (i, obs) in observations.iter().enumerate() {
            by_id.insert(obs.train_id.clone(), i);
            if let Some(route_id) = &obs.route_id {
                by_route.entry(route_id.clone()).or_default().push(obs.train_id.clone());
                if let Some(nuc) = &obs.nucleus_id {
                    by_nucleus_route
                        .entry((nuc.clone(), route_id.clone()))
                        .or_default()
                        .push(obs.train_id.clone());
                }
            }
            if let Some(nuc) = &obs.nucleus_id {
                by_nucleus.entry(nuc.clone()).or_default().push(obs.train_id.clone());
            }
        }

        Self { observations, by_id, by_route, by_nucleus, by_nucleus_route }
    }

    fn empty() -> Self {
        Self::build(Vec::new())
    }
}

struct PollState {
    last_header_ts: Option<u64>,
    last_nonempty_unix: i64,
    consecutive_empty: u32,
}

pub struct VehiclePositionsCache {
    client: reqwest::blocking::Client,
    url: String,
    static_repo: Arc<StaticRepo>,
    scheduled: Arc<ScheduledTrainsMaterializer>,
    tz: chrono_tz::Tz,
    indices: Replaceable<Indices>,
    poll_state: Mutex<PollState>,
    errors_streak: AtomicU32,
    last_snapshot_unix: std::sync::atomic::AtomicI64,
}

impl VehiclePositionsCache {
    pub fn new(
        url: impl Into<String>,
        static_repo: Arc<StaticRepo>,
        scheduled: Arc<ScheduledTrainsMaterializer>,
        tz: chrono_tz::Tz,
    ) -> Self {
        Self {
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            url: url.into(),
            static_repo,
            scheduled,
            tz,
            indices: Replaceable::new(Indices::empty()),
            poll_state: Mutex::new(PollState {
                last_header_ts: None,
                last_nonempty_unix: 0,
                consecutive_empty: 0,
            }),
            errors_streak: AtomicU32::new(0),
            last_snapshot_unix: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// One fetch-parse-apply cycle; blocking (runs on a `spawn_blocking` task).
    pub fn poll_once(&self, now: i64) {
        match self.fetch_with_retry() {
            Ok((header_ts, mut observations)) => {
                self.errors_streak.store(0, Ordering::SeqCst);
                for obs in &mut observations {
                    self.enrich_nucleus(obs, now);
                }
                self.apply_snapshot(header_ts, observations, now);
            }
            Err(e) => {
                self.errors_streak.fetch_add(1, Ordering::SeqCst);
                log::warn!("vehicle positions poll failed: {e}");
            }
        }
    }

    fn fetch_with_retry(&self) -> Result<(Option<u64>, Vec<VehicleObservation>), CoreError> {
        let mut last_err = None;
        for attempt in 0..=FAST_RETRY_ATTEMPTS {
            match self.fetch_once() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    last_err = Some(e);
                    if attempt < FAST_RETRY_ATTEMPTS {
                        std::thread::sleep(FAST_RETRY_DELAY);
                    }
                }
            }
        }
        Err(last_err.unwrap_or(CoreError::EmptySnapshot { feed: "vehicle_positions" }))
    }

    fn fetch_once(&self) -> Result<(Option<u64>, Vec<VehicleObservation>), CoreError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| CoreError::Fetch { feed: "vehicle_positions", source: e.into() })?;
        let bytes = resp
            .bytes()
            .map_err(|e| CoreError::Fetch { feed: "vehicle_positions", source: e.into() })?;

        if let Ok((ts, obs)) = Self::parse_protobuf(&bytes) {
            return Ok((ts, obs));
        }
        Self::parse_json(&bytes)
    }

    fn parse_protobuf(bytes: &[u8]) -> Result<(Option<u64>, Vec<VehicleObservation>), CoreError> {
        use prost::Message;
        let msg = gtfs_realtime::FeedMessage::decode(bytes).map_err(|e| CoreError::Parse {
            feed: "vehicle_positions",
            reason: e.to_string(),
        })?;
        let header_ts = msg.header.timestamp;
        let now = msg.header.timestamp.unwrap_or(0) as i64;
        let mut out = Vec::new();
        for entity in &msg.entity {
            let Some(v) = &entity.vehicle else { continue };
            let train_id = v
                .vehicle
                .as_ref()
                .and_then(|vd| vd.id.clone())
                .unwrap_or_else(|| entity.id.clone());
            out.push(VehicleObservation {
                train_id: CompactString::from(train_id),
                trip_id: v.trip.as_ref().and_then(|t| t.trip_id.clone()).map(TripId::from),
                route_id: v.trip.as_ref().and_then(|t| t.route_id.clone()).map(RouteId::from),
                direction_id: v
                    .trip
                    .as_ref()
                    .and_then(|t| t.direction_id)
                    .map(|d| DirectionId::from(d.to_string())),
                lat: v.position.as_ref().map(|p| p.latitude as f64),
                lon: v.position.as_ref().map(|p| p.longitude as f64),
                speed_kmh: v.position.as_ref().and_then(|p| p.speed).map(|s| (s as f64) * 3.6),
                bearing: v.position.as_ref().and_then(|p| p.bearing).map(|b| b as f64),
                stop_id: v.stop_id.clone().map(crate::domain::StopId::from),
                current_status: v.current_status.map(status_from_i32).unwrap_or(VehicleStopStatus::InTransitTo),
                ts_unix: v.timestamp.map(|t| t as i64).unwrap_or(now),
                label: v.vehicle.as_ref().and_then(|vd| vd.label.clone()).map(CompactString::from),
                nucleus_id: None,
                platform_by_stop: HashMap::new(),
            });
        }
        Ok((header_ts, out))
    }

    fn parse_json(bytes: &[u8]) -> Result<(Option<u64>, Vec<VehicleObservation>), CoreError> {
        #[derive(Deserialize)]
        struct JsonHeader {
            timestamp: Option<u64>,
        }
        #[derive(Deserialize, Default)]
        struct JsonTrip {
            trip_id: Option<String>,
            route_id: Option<String>,
            direction_id: Option<u32>,
        }
        #[derive(Deserialize, Default)]
        struct JsonVehicleDesc {
            id: Option<String>,
            label: Option<String>,
        }
        #[derive(Deserialize, Default)]
        struct JsonPosition {
            latitude: Option<f64>,
            longitude: Option<f64>,
            bearing: Option<f64>,
            speed: Option<f64>,
        }
        #[derive(Deserialize)]
        struct JsonVehiclePosition {
            #[serde(default)]
            trip: JsonTrip,
            #[serde(default)]
            vehicle: JsonVehicleDesc,
            #[serde(default)]
            position: JsonPosition,
            stop_id: Option<String>,
            current_status: Option<String>,
            timestamp: Option<u64>,
        }
        #[derive(Deserialize)]
        struct JsonEntity {
            id: String,
            vehicle: Option<JsonVehiclePosition>,
        }
        #[derive(Deserialize)]
        struct JsonFeed {
            header: JsonHeader,
            entity: Vec<JsonEntity>,
        }

        let feed: JsonFeed = serde_json::from_slice(bytes).map_err(|e| CoreError::Parse {
            feed: "vehicle_positions",
            reason: e.to_string(),
        })?;
        let now = feed.header.timestamp.unwrap_or(0) as i64;
        let mut out = Vec::new();
        for entity in feed.entity {
            let Some(v) = entity.vehicle else { continue };
            let train_id = v.vehicle.id.clone().unwrap_or(entity.id);
            let status = match v.current_status.as_deref() {
                Some("STOPPED_AT") => VehicleStopStatus::StoppedAt,
                Some("INCOMING_AT") => VehicleStopStatus::IncomingAt,
                _ => VehicleStopStatus::InTransitTo,
            };
            out.push(VehicleObservation {
                train_id: CompactString::from(train_id),
                trip_id: v.trip.trip_id.map(TripId::from),
                route_id: v.trip.route_id.map(RouteId::from),
                direction_id: v.trip.direction_id.map(|d| DirectionId::from(d.to_string())),
                lat: v.position.latitude,
                lon: v.position.longitude,
                speed_kmh: v.position.speed.map(|s| s * 3.6),
                bearing: v.position.bearing,
                stop_id: v.stop_id.map(crate::domain::StopId::from),
                current_status: status,
                ts_unix: v.timestamp.map(|t| t as i64).unwrap_or(now),
                label: v.vehicle.label.map(CompactString::from),
                nucleus_id: None,
                platform_by_stop: HashMap::new(),
            });
        }
        Ok((feed.header.timestamp, out))
    }

    fn service_date_now(&self, now: i64) -> chrono::NaiveDate {
        self.tz
            .timestamp_opt(now, 0)
            .single()
            .map(|dt| dt.date_naive())
            .unwrap_or_else(|| chrono::NaiveDate::from_num_days_from_ce_opt(now as i32 / 86_400 + 719_163).unwrap())
    }

    /// §4.4 nucleus enrichment heuristic: trip_id lookup first, then a
    /// short_name + stop_id scan narrowed by parity and direction.
    fn enrich_nucleus(&self, obs: &mut VehicleObservation, now: i64) {
        let date = self.service_date_now(now);
        if let Some(trip_id) = obs.trip_id.clone() {
            let materialized = self.scheduled.for_date(date);
            if let Some(train) = materialized.by_trip.get(&trip_id) {
                if obs.route_id.is_none() {
                    obs.route_id = Some(train.route_id.clone());
                }
                if obs.direction_id.is_none() {
                    obs.direction_id = Some(train.direction_id.clone());
                }
                obs.nucleus_id = train.nucleus_id.clone();
                return;
            }
        }

        let (Some(short_name), Some(stop_id)) = (obs.route_id.clone(), obs.stop_id.clone()) else {
            return;
        };
        let mut candidates = self.static_repo.routes_by_short_name(&short_name);
        candidates.retain(|r| r.station_by_stop_id(&stop_id).is_some());
        if candidates.len() > 1 {
            if let Some(train_number) = obs.train_number() {
                if let Some(parity) = crate::train_number::parity_of(&train_number) {
                    let narrowed: Vec<_> = candidates
                        .iter()
                        .filter(|r| {
                            self.static_repo
                                .dir_for_parity(&r.route_id, parity)
                                .map(|(d, _)| d == r.direction_id)
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect();
                    if !narrowed.is_empty() {
                        candidates = narrowed;
                    }
                }
            }
        }
        if candidates.len() > 1 {
            if let Some(dir) = &obs.direction_id {
                candidates.retain(|r| &r.direction_id == dir);
            }
        }
        let chosen = candidates.into_iter().max_by_key(|r| r.stations.len());
        if let Some(route) = chosen {
            obs.nucleus_id = route.nucleus_id.clone();
            obs.route_id = Some(route.route_id.clone());
        }
    }

    /// §4.4 snapshot semantics.
    fn apply_snapshot(&self, header_ts: Option<u64>, observations: Vec<VehicleObservation>, now: i64) {
        let mut state = self.poll_state.lock().unwrap();

        if observations.is_empty() {
            if header_ts.is_some() && header_ts == state.last_header_ts {
                return;
            }
            state.consecutive_empty += 1;
            let stale_for = now - state.last_nonempty_unix;
            if state.consecutive_empty <= EMPTY_GRACE_SNAPSHOTS && stale_for <= MAX_STALE_SECONDS {
                log::info!(
                    "vehicle positions: empty snapshot #{} within grace ({}s stale)",
                    state.consecutive_empty,
                    stale_for
                );
                state.last_header_ts = header_ts;
                return;
            }
            log::info!("vehicle positions: grace exhausted, clearing snapshot ({}s stale)", stale_for);
            self.indices.store(Indices::empty());
            self.last_snapshot_unix.store(now, Ordering::SeqCst);
            state.last_header_ts = header_ts;
            return;
        }

        state.consecutive_empty = 0;
        state.last_nonempty_unix = now;
        state.last_header_ts = header_ts;
        drop(state);

        self.indices.store(Indices::build(observations));
        self.last_snapshot_unix.store(now, Ordering::SeqCst);
    }

    pub fn get_by_id(&self, train_id: &str) -> Option<VehicleObservation> {
        let idx = self.indices.load();
        idx.by_id.get(train_id).map(|&i| idx.observations[i].clone())
    }

    pub fn get_by_route_id(&self, route_id: &str) -> Vec<VehicleObservation> {
        let idx = self.indices.load();
        idx.by_route
            .get(route_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| idx.by_id.get(id).map(|&i| idx.observations[i].clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_by_nucleus(&self, nucleus: &str) -> Vec<VehicleObservation> {
        let idx = self.indices.load();
        idx.by_nucleus
            .get(nucleus)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| idx.by_id.get(id).map(|&i| idx.observations[i].clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_by_nucleus_and_route(&self, nucleus: &str, route_id: &str) -> Vec<VehicleObservation> {
        let idx = self.indices.load();
        idx.by_nucleus_route
            .get(&(NucleusId::from(nucleus), RouteId::from(route_id)))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| idx.by_id.get(id).map(|&i| idx.observations[i].clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_sorted(&self) -> Vec<VehicleObservation> {
        let idx = self.indices.load();
        let mut all = idx.observations.clone();
        all.sort_by(|a, b| b.ts_unix.cmp(&a.ts_unix).then_with(|| a.train_id.cmp(&b.train_id)));
        all
    }

    pub fn errors_streak(&self) -> u32 {
        self.errors_streak.load(Ordering::SeqCst)
    }

    pub fn is_stale(&self, now: i64) -> bool {
        let last = self.last_snapshot_unix.load(Ordering::SeqCst);
        last > 0 && now - last > MAX_STALE_SECONDS
    }

    pub fn last_snapshot_age_s(&self, now: i64) -> Option<i64> {
        let last = self.last_snapshot_unix.load(Ordering::SeqCst);
        if last == 0 {
            None
        } else {
            Some(now - last)
        }
    }
}
