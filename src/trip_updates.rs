//! C5 — Trip Updates Cache (§4.5). Same dual-fetch/fast-retry policy as C4,
//! but cumulative: entries survive across snapshots until `MISSING_TTL_SECONDS`
//! after their last sighting. Grounded in `live_trains_cache.py`'s
//! `fetch_with_retry` and the teacher's `DashMap<String, TripUpdate>` for
//! `trip_updates`, generalized to a richer per-trip `TripUpdateItem`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use compact_str::CompactString;
use serde::Deserialize;

use crate::domain::{
    DirectionId, RouteId, StopScheduleRelationship, TripId, TripScheduleRelationship,
    TripUpdateItem, TuStopTimeUpdate,
};
use crate::error::CoreError;
use crate::scheduled::ScheduledTrainsMaterializer;
use crate::static_repo::StaticRepo;
use crate::vehicles::VehiclePositionsCache;

const MISSING_TTL_SECONDS: i64 = 900;
const FAST_RETRY_ATTEMPTS: u32 = 2;
const FAST_RETRY_DELAY: Duration = Duration::from_millis(400);

fn schedule_relationship_from_i32(v: i32) -> TripScheduleRelationship {
    match v {
        1 => TripScheduleRelationship::Added,
        2 => TripScheduleRelationship::Unscheduled,
        3 => TripScheduleRelationship::Canceled,
        _ => TripScheduleRelationship::Scheduled,
    }
}

fn stop_relationship_from_i32(v: i32) -> StopScheduleRelationship {
    match v {
        1 => StopScheduleRelationship::Skipped,
        2 => StopScheduleRelationship::NoData,
        _ => StopScheduleRelationship::Scheduled,
    }
}

pub struct TripUpdatesCache {
    client: reqwest::blocking::Client,
    url: String,
    static_repo: Arc<StaticRepo>,
    scheduled: Arc<ScheduledTrainsMaterializer>,
    vehicles: Arc<VehiclePositionsCache>,
    tz: chrono_tz::Tz,
    entries: Mutex<HashMap<TripId, TripUpdateItem>>,
    errors_streak: AtomicU32,
    last_snapshot_unix: AtomicI64,
}

impl TripUpdatesCache {
    pub fn new(
        url: impl Into<String>,
        static_repo: Arc<StaticRepo>,
        scheduled: Arc<ScheduledTrainsMaterializer>,
        vehicles: Arc<VehiclePositionsCache>,
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
            vehicles,
            tz,
            entries: Mutex::new(HashMap::new()),
            errors_streak: AtomicU32::new(0),
            last_snapshot_unix: AtomicI64::new(0),
        }
    }

    pub fn poll_once(&self, now: i64) {
        match self.fetch_with_retry() {
            Ok(mut items) => {
                self.errors_streak.store(0, Ordering::SeqCst);
                for item in &mut items {
                    self.enrich(item, now);
                }
                self.merge(items, now);
                self.sweep(now);
                self.last_snapshot_unix.store(now, Ordering::SeqCst);
            }
            Err(e) => {
                self.errors_streak.fetch_add(1, Ordering::SeqCst);
                log::warn!("trip updates poll failed: {e}");
            }
        }
    }

    fn fetch_with_retry(&self) -> Result<Vec<TripUpdateItem>, CoreError> {
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
        Err(last_err.unwrap_or(CoreError::EmptySnapshot { feed: "trip_updates" }))
    }

    fn fetch_once(&self) -> Result<Vec<TripUpdateItem>, CoreError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .map_err(|e| CoreError::Fetch { feed: "trip_updates", source: e.into() })?;
        let bytes = resp
            .bytes()
            .map_err(|e| CoreError::Fetch { feed: "trip_updates", source: e.into() })?;

        if let Ok(items) = Self::parse_protobuf(&bytes) {
            return Ok(items);
        }
        Self::parse_json(&bytes)
    }

    fn parse_protobuf(bytes: &[u8]) -> Result<Vec<TripUpdateItem>, CoreError> {
        use prost::Message;
        let msg = gtfs_realtime::FeedMessage::decode(bytes).map_err(|e| CoreError::Parse {
            feed: "trip_updates",
            reason: e.to_string(),
        })?;
        let now = msg.header.timestamp.unwrap_or(0) as i64;
        let mut out = Vec::new();
        for entity in &msg.entity {
            let Some(tu) = &entity.trip_update else { continue };
            let trip = &tu.trip;
            let Some(trip_id) = &trip.trip_id else { continue };
            let stop_time_update = tu
                .stop_time_update
                .iter()
                .map(|stu| TuStopTimeUpdate {
                    stop_id: stu.stop_id.clone().map(crate::domain::StopId::from),
                    stop_sequence: stu.stop_sequence,
                    arrival_epoch: stu.arrival.as_ref().and_then(|e| e.time),
                    arrival_delay: stu.arrival.as_ref().and_then(|e| e.delay),
                    departure_epoch: stu.departure.as_ref().and_then(|e| e.time),
                    departure_delay: stu.departure.as_ref().and_then(|e| e.delay),
                    schedule_relationship: stu
                        .schedule_relationship
                        .map(stop_relationship_from_i32)
                        .unwrap_or(StopScheduleRelationship::Scheduled),
                    uncertainty: stu.arrival.as_ref().and_then(|e| e.uncertainty),
                })
                .collect();
            out.push(TripUpdateItem {
                trip_id: TripId::from(trip_id.to_uppercase()),
                route_id: trip.route_id.clone().map(RouteId::from),
                direction_id: trip.direction_id.map(|d| DirectionId::from(d.to_string())),
                schedule_relationship: trip
                    .schedule_relationship
                    .map(schedule_relationship_from_i32)
                    .unwrap_or(TripScheduleRelationship::Scheduled),
                delay: tu.delay,
                timestamp: tu.timestamp.map(|t| t as i64).unwrap_or(now),
                stop_time_update,
                last_seen_unix: now,
            });
        }
        Ok(out)
    }

    fn parse_json(bytes: &[u8]) -> Result<Vec<TripUpdateItem>, CoreError> {
        #[derive(Deserialize, Default)]
        struct JsonTrip {
            trip_id: Option<String>,
            route_id: Option<String>,
            direction_id: Option<u32>,
            schedule_relationship: Option<String>,
        }
        #[derive(Deserialize, Default)]
        struct JsonEvent {
            delay: Option<i32>,
            time: Option<i64>,
            uncertainty: Option<i32>,
        }
        #[derive(Deserialize, Default)]
        struct JsonStopTimeUpdate {
            stop_id: Option<String>,
            stop_sequence: Option<u32>,
            arrival: Option<JsonEvent>,
            departure: Option<JsonEvent>,
            schedule_relationship: Option<String>,
        }
        #[derive(Deserialize)]
        struct JsonTripUpdate {
            #[serde(default)]
            trip: JsonTrip,
            #[serde(default)]
            stop_time_update: Vec<JsonStopTimeUpdate>,
            delay: Option<i32>,
            timestamp: Option<u64>,
        }
        #[derive(Deserialize)]
        struct JsonEntity {
            trip_update: Option<JsonTripUpdate>,
        }
        #[derive(Deserialize)]
        struct JsonHeader {
            timestamp: Option<u64>,
        }
        #[derive(Deserialize)]
        struct JsonFeed {
            header: JsonHeader,
            entity: Vec<JsonEntity>,
        }

        let feed: JsonFeed = serde_json::from_slice(bytes).map_err(|e| CoreError::Parse {
            feed: "trip_updates",
            reason: e.to_string(),
        })?;
        let now = feed.header.timestamp.unwrap_or(0) as i64;
        let mut out = Vec::new();
        for entity in feed.entity {
            let Some(tu) = entity.trip_update else { continue };
            let Some(trip_id) = tu.trip.trip_id.clone() else { continue };
            let schedule_relationship = match tu.trip.schedule_relationship.as_deref() {
                Some("ADDED") => TripScheduleRelationship::Added,
                Some("CANCELED") => TripScheduleRelationship::Canceled,
                Some("UNSCHEDULED") => TripScheduleRelationship::Unscheduled,
                _ => TripScheduleRelationship::Scheduled,
            };
            let stop_time_update = tu
                .stop_time_update
                .into_iter()
                .map(|stu| TuStopTimeUpdate {
                    stop_id: stu.stop_id.map(crate::domain::StopId::from),
                    stop_sequence: stu.stop_sequence,
                    arrival_epoch: stu.arrival.as_ref().and_then(|e| e.time),
                    arrival_delay: stu.arrival.as_ref().and_then(|e| e.delay),
                    departure_epoch: stu.departure.as_ref().and_then(|e| e.time),
                    departure_delay: stu.departure.as_ref().and_then(|e| e.delay),
                    schedule_relationship: match stu.schedule_relationship.as_deref() {
                        Some("SKIPPED") => StopScheduleRelationship::Skipped,
                        Some("NO_DATA") => StopScheduleRelationship::NoData,
                        _ => StopScheduleRelationship::Scheduled,
                    },
                    uncertainty: stu.arrival.as_ref().and_then(|e| e.uncertainty),
                })
                .collect();
            out.push(TripUpdateItem {
                trip_id: TripId::from(trip_id.to_uppercase()),
                route_id: tu.trip.route_id.map(RouteId::from),
                direction_id: tu.trip.direction_id.map(|d| DirectionId::from(d.to_string())),
                schedule_relationship,
                delay: tu.delay,
                timestamp: tu.timestamp.map(|t| t as i64).unwrap_or(now),
                stop_time_update,
                last_seen_unix: now,
            });
        }
        Ok(out)
    }

    fn service_date_now(&self, now: i64) -> chrono::NaiveDate {
        use chrono::TimeZone;
        self.tz
            .timestamp_opt(now, 0)
            .single()
            .map(|dt| dt.date_naive())
            .unwrap_or_else(|| chrono::NaiveDate::from_num_days_from_ce_opt(now as i32 / 86_400 + 719_163).unwrap())
    }

    /// §4.5 per-trip enrichment, run once at insert time.
    fn enrich(&self, item: &mut TripUpdateItem, now: i64) {
        if item.route_id.is_none() || item.direction_id.is_none() {
            let date = self.service_date_now(now);
            let materialized = self.scheduled.for_date(date);
            if let Some(train) = materialized.by_trip.get(&item.trip_id) {
                if item.route_id.is_none() {
                    item.route_id = Some(train.route_id.clone());
                }
                if item.direction_id.is_none() {
                    item.direction_id = Some(train.direction_id.clone());
                }
            }
        }

        if item.route_id.is_none() || item.direction_id.is_none() {
            if let Some(v) = self
                .vehicles
                .list_sorted()
                .into_iter()
                .find(|v| v.trip_id.as_deref() == Some(item.trip_id.as_str()))
            {
                if item.route_id.is_none() {
                    item.route_id = v.route_id.clone();
                }
                if item.direction_id.is_none() {
                    item.direction_id = v.direction_id.clone();
                }
            }
        }

        if item.route_id.is_none() {
            let observed_stops: HashSet<&str> = item
                .stop_time_update
                .iter()
                .filter_map(|s| s.stop_id.as_deref())
                .collect();
            if !observed_stops.is_empty() {
                let mut best: Option<(RouteId, usize)> = None;
                for route_id in self.static_repo.list_routes() {
                    for dir in ["0", "1", ""] {
                        let Some(route) = self.static_repo.route(&route_id, Some(dir)) else { continue };
                        let score = route
                            .stations
                            .iter()
                            .filter(|s| observed_stops.contains(s.stop_id.as_str()))
                            .count();
                        if score > 0 && best.as_ref().map(|(_, b)| score > *b).unwrap_or(true) {
                            best = Some((route_id.clone(), score));
                        }
                    }
                }
                if let Some((route_id, _)) = best {
                    item.route_id = Some(route_id);
                }
            }
        }

        if item.direction_id.is_none() && item.stop_time_update.len() >= 2 {
            if let Some(route_id) = item.route_id.clone() {
                let score = |dir: &str| -> Option<i64> {
                    let route = self.static_repo.route(&route_id, Some(dir))?;
                    let observed: Vec<u32> = item
                        .stop_time_update
                        .iter()
                        .filter_map(|s| s.stop_id.as_deref())
                        .filter_map(|sid| route.station_seq(sid))
                        .collect();
                    let membership = observed.len() as i64;
                    let ascending = observed.windows(2).filter(|w| w[1] > w[0]).count() as i64;
                    Some(membership + ascending)
                };
                let score0 = score("0");
                let score1 = score("1");
                item.direction_id = match (score0, score1) {
                    (Some(a), Some(b)) if a > b => Some(DirectionId::from("0")),
                    (Some(a), Some(b)) if b > a => Some(DirectionId::from("1")),
                    (Some(_), None) => Some(DirectionId::from("0")),
                    (None, Some(_)) => Some(DirectionId::from("1")),
                    _ => None,
                };
            }
        }
    }

    fn merge(&self, items: Vec<TripUpdateItem>, now: i64) {
        let mut entries = self.entries.lock().unwrap();
        for mut item in items {
            item.last_seen_unix = now;
            entries.insert(item.trip_id.clone(), item);
        }
    }

    fn sweep(&self, now: i64) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, item| now - item.last_seen_unix <= MISSING_TTL_SECONDS);
    }

    pub fn get_by_trip_id(&self, trip_id: &str) -> Option<TripUpdateItem> {
        self.entries.lock().unwrap().get(&trip_id.to_uppercase()).cloned()
    }

    pub fn get_stop_update(&self, trip_id: &str, stop_id: &str) -> Option<TuStopTimeUpdate> {
        self.get_by_trip_id(trip_id)?.stop_update(stop_id).cloned()
    }

    pub fn trip_delay_seconds(&self, trip_id: &str) -> Option<i32> {
        self.get_by_trip_id(trip_id)?.delay
    }

    /// `eta_for_trip_to_stop`: picks departure over arrival once `now ≥ arr − 45s`.
    pub fn eta_for_trip_to_stop(&self, trip_id: &str, stop_id: &str, now: i64) -> Option<i64> {
        let item = self.get_by_trip_id(trip_id)?;
        let stop = item.stop_update(stop_id)?;
        match (stop.arrival_epoch, stop.departure_epoch) {
            (Some(arr), Some(dep)) if now >= arr - 45 => Some(dep),
            (Some(arr), _) => Some(arr),
            (None, Some(dep)) => Some(dep),
            (None, None) => None,
        }
    }

    pub fn errors_streak(&self) -> u32 {
        self.errors_streak.load(Ordering::SeqCst)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(trip_id: &str, now: i64) -> TripUpdateItem {
        TripUpdateItem {
            trip_id: TripId::from(trip_id),
            route_id: Some(RouteId::from("R1")),
            direction_id: Some(DirectionId::from("0")),
            schedule_relationship: TripScheduleRelationship::Scheduled,
            delay: Some(120),
            timestamp: now,
            stop_time_update: vec![TuStopTimeUpdate {
                stop_id: Some(crate::domain::StopId::from("S1")),
                stop_sequence: Some(0),
                arrival_epoch: Some(now + 100),
                arrival_delay: Some(120),
                departure_epoch: Some(now + 110),
                departure_delay: Some(120),
                schedule_relationship: StopScheduleRelationship::Scheduled,
                uncertainty: None,
            }],
            last_seen_unix: now,
        }
    }

    fn cache() -> TripUpdatesCache {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("route_stations.csv"),
            "route_id,direction_id,seq,stop_id,stop_name,km,lat,lon,route_short_name,route_long_name,length_km,color_bg,color_fg\n\
             R1,0,0,S1,Origin,0.0,40.0,-3.0,C1,Commuter One,10.0,,\n",
        )
        .unwrap();
        let repo = Arc::new(StaticRepo::new(dir.path()));
        repo.load().unwrap();

        let gdir = tempfile::tempdir().unwrap();
        std::fs::write(gdir.path().join("agency.txt"), "agency_id,agency_name,agency_url,agency_timezone\nA1,A,https://x,Europe/Madrid\n").unwrap();
        std::fs::write(gdir.path().join("routes.txt"), "route_id,agency_id,route_short_name,route_long_name,route_type\nR1,A1,C1,Commuter One,2\n").unwrap();
        std::fs::write(gdir.path().join("stops.txt"), "stop_id,stop_name,stop_lat,stop_lon\nS1,Origin,40.0,-3.0\n").unwrap();
        std::fs::write(gdir.path().join("trips.txt"), "route_id,service_id,trip_id,direction_id\nR1,SVC,T1,0\n").unwrap();
        std::fs::write(gdir.path().join("stop_times.txt"), "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nT1,08:00:00,08:00:00,S1,0\n").unwrap();
        std::fs::write(gdir.path().join("calendar.txt"), "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nSVC,1,1,1,1,1,1,1,20260101,20261231\n").unwrap();
        let scheduled = Arc::new(
            ScheduledTrainsMaterializer::load(gdir.path(), repo.clone(), chrono_tz::Europe::Madrid).unwrap(),
        );
        let vehicles = Arc::new(VehiclePositionsCache::new(
            "http://localhost:0/vehicles",
            repo.clone(),
            scheduled.clone(),
            chrono_tz::Europe::Madrid,
        ));

        TripUpdatesCache::new("http://localhost:0/trip-updates", repo, scheduled, vehicles, chrono_tz::Europe::Madrid)
    }

    #[test]
    fn merge_is_cumulative_keyed_by_uppercased_trip_id() {
        let c = cache();
        c.merge(vec![sample_item("t1", 1000)], 1000);
        assert!(c.get_by_trip_id("T1").is_some());
        assert!(c.get_by_trip_id("t1").is_some());
    }

    #[test]
    fn sweep_evicts_entries_past_missing_ttl() {
        let c = cache();
        c.merge(vec![sample_item("T1", 0)], 0);
        c.sweep(MISSING_TTL_SECONDS + 1);
        assert!(c.get_by_trip_id("T1").is_none());
    }

    #[test]
    fn sweep_keeps_entries_within_missing_ttl() {
        let c = cache();
        c.merge(vec![sample_item("T1", 0)], 0);
        c.sweep(MISSING_TTL_SECONDS - 1);
        assert!(c.get_by_trip_id("T1").is_some());
    }

    #[test]
    fn eta_prefers_departure_once_within_45s_of_arrival() {
        let c = cache();
        let now = 1000;
        c.merge(vec![sample_item("T1", now)], now);
        let item = c.get_by_trip_id("T1").unwrap();
        let arr = item.stop_time_update[0].arrival_epoch.unwrap();
        let eta = c.eta_for_trip_to_stop("T1", "S1", arr - 10).unwrap();
        assert_eq!(eta, item.stop_time_update[0].departure_epoch.unwrap());
    }

    #[test]
    fn enrich_fills_route_and_direction_from_static_timetable() {
        let c = cache();
        let now = crate::geo::date_and_sec_of_day_to_epoch(
            chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            7 * 3600,
            &chrono_tz::Europe::Madrid,
        );
        let mut item = TripUpdateItem {
            trip_id: TripId::from("T1"),
            route_id: None,
            direction_id: None,
            schedule_relationship: TripScheduleRelationship::Scheduled,
            delay: None,
            timestamp: now,
            stop_time_update: vec![],
            last_seen_unix: now,
        };
        c.enrich(&mut item, now);
        assert_eq!(item.route_id.as_deref(), Some("R1"));
        assert_eq!(item.direction_id.as_deref(), Some("0"));
    }
}
