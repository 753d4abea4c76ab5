//! Core data model shared by every component (§3 of the design doc).

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

pub type StopId = CompactString;
pub type RouteId = CompactString;
pub type TripId = CompactString;
pub type NucleusId = CompactString;

/// "0", "1" or "" (unspecified). Never any other value.
pub type DirectionId = CompactString;

pub fn empty_direction() -> DirectionId {
    CompactString::const_new("")
}

#[derive(Clone, Debug, PartialEq)]
pub struct StationOnLine {
    pub seq: u32,
    pub stop_id: StopId,
    pub stop_name: CompactString,
    pub km_from_origin: f64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Clone, Debug)]
pub struct Route {
    pub route_id: RouteId,
    pub short_name: CompactString,
    pub long_name: CompactString,
    pub direction_id: DirectionId,
    pub nucleus_id: Option<NucleusId>,
    pub stations: Vec<StationOnLine>,
    pub length_km: f64,
    pub color_bg: Option<CompactString>,
    pub color_fg: Option<CompactString>,
}

impl Route {
    pub fn origin(&self) -> Option<&StationOnLine> {
        self.stations.first()
    }

    pub fn destination(&self) -> Option<&StationOnLine> {
        self.stations.last()
    }

    pub fn station_by_stop_id(&self, stop_id: &str) -> Option<&StationOnLine> {
        self.stations.iter().find(|s| s.stop_id == stop_id)
    }

    pub fn station_seq(&self, stop_id: &str) -> Option<u32> {
        self.station_by_stop_id(stop_id).map(|s| s.seq)
    }
}

#[derive(Clone, Debug)]
pub struct Stop {
    pub stop_id: StopId,
    pub station_id: CompactString,
    pub route_id: RouteId,
    pub direction_id: DirectionId,
    pub seq: u32,
    pub km: f64,
    pub lat: f64,
    pub lon: f64,
    pub name: CompactString,
    pub nucleus_id: Option<NucleusId>,
    pub slug: Option<CompactString>,
}

/// Parity-derived directional hint: `dir_for_parity(route_id, even|odd)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    Even,
    Odd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParityStatus {
    Final,
    Tentative,
    Disabled,
}

#[derive(Clone, Debug)]
pub struct ParityEntry {
    pub even: DirectionId,
    pub odd: DirectionId,
    pub status: ParityStatus,
}

/// A single scheduled call within a `ScheduledTrain`.
#[derive(Clone, Debug, Serialize)]
pub struct ScheduledCall {
    pub stop_id: StopId,
    pub stop_sequence: u32,
    pub arrival_sec_of_day: Option<i64>,
    pub departure_sec_of_day: Option<i64>,
    pub platform_code: Option<CompactString>,
    pub pickup_type: Option<u8>,
    pub drop_off_type: Option<u8>,
}

/// A service instance materialized for a concrete `service_date` (§3, §4.3).
#[derive(Clone, Debug, Serialize)]
pub struct ScheduledTrain {
    pub trip_id: TripId,
    pub route_id: RouteId,
    pub direction_id: DirectionId,
    pub service_date: chrono::NaiveDate,
    pub headsign: Option<CompactString>,
    pub train_number: Option<CompactString>,
    pub nucleus_id: Option<NucleusId>,
    pub calls: Vec<ScheduledCall>,
}

impl ScheduledTrain {
    pub fn first_departure_epoch(&self, tz: &chrono_tz::Tz) -> Option<i64> {
        let first = self.calls.first()?;
        let sod = first.departure_sec_of_day.or(first.arrival_sec_of_day)?;
        Some(crate::geo::date_and_sec_of_day_to_epoch(
            self.service_date,
            sod,
            tz,
        ))
    }

    pub fn call_epoch_arr(&self, call: &ScheduledCall, tz: &chrono_tz::Tz) -> Option<i64> {
        call.arrival_sec_of_day
            .map(|sod| crate::geo::date_and_sec_of_day_to_epoch(self.service_date, sod, tz))
    }

    pub fn call_epoch_dep(&self, call: &ScheduledCall, tz: &chrono_tz::Tz) -> Option<i64> {
        call.departure_sec_of_day
            .map(|sod| crate::geo::date_and_sec_of_day_to_epoch(self.service_date, sod, tz))
    }

    pub fn call_by_stop(&self, stop_id: &str) -> Option<&ScheduledCall> {
        self.calls.iter().find(|c| c.stop_id == stop_id)
    }

    pub fn call_by_seq(&self, seq: u32) -> Option<&ScheduledCall> {
        self.calls.iter().find(|c| c.stop_sequence == seq)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStopStatus {
    StoppedAt,
    InTransitTo,
    IncomingAt,
}

/// One physical vehicle observed at one instant (§3, owned by C4).
#[derive(Clone, Debug, Serialize)]
pub struct VehicleObservation {
    pub train_id: CompactString,
    pub trip_id: Option<TripId>,
    pub route_id: Option<RouteId>,
    pub direction_id: Option<DirectionId>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub bearing: Option<f64>,
    pub stop_id: Option<StopId>,
    pub current_status: VehicleStopStatus,
    pub ts_unix: i64,
    pub label: Option<CompactString>,
    pub nucleus_id: Option<NucleusId>,
    pub platform_by_stop: std::collections::HashMap<StopId, CompactString>,
}

impl VehicleObservation {
    pub fn is_fresh(&self, now: i64) -> bool {
        now - self.ts_unix <= 180
    }

    pub fn train_number(&self) -> Option<CompactString> {
        crate::train_number::extract(self.trip_id.as_deref().unwrap_or(""))
            .or_else(|| crate::train_number::extract(self.label.as_deref().unwrap_or("")))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripScheduleRelationship {
    Scheduled,
    Added,
    Canceled,
    Unscheduled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopScheduleRelationship {
    Scheduled,
    Skipped,
    NoData,
}

#[derive(Clone, Debug)]
pub struct TuStopTimeUpdate {
    pub stop_id: Option<StopId>,
    pub stop_sequence: Option<u32>,
    pub arrival_epoch: Option<i64>,
    pub arrival_delay: Option<i32>,
    pub departure_epoch: Option<i64>,
    pub departure_delay: Option<i32>,
    pub schedule_relationship: StopScheduleRelationship,
    pub uncertainty: Option<i32>,
}

/// One trip update as held by C5.
#[derive(Clone, Debug)]
pub struct TripUpdateItem {
    pub trip_id: TripId,
    pub route_id: Option<RouteId>,
    pub direction_id: Option<DirectionId>,
    pub schedule_relationship: TripScheduleRelationship,
    pub delay: Option<i32>,
    pub timestamp: i64,
    pub stop_time_update: Vec<TuStopTimeUpdate>,
    pub last_seen_unix: i64,
}

impl TripUpdateItem {
    pub fn stop_update(&self, stop_id: &str) -> Option<&TuStopTimeUpdate> {
        self.stop_time_update
            .iter()
            .find(|s| s.stop_id.as_deref() == Some(stop_id))
    }

    pub fn is_canceled(&self) -> bool {
        self.schedule_relationship == TripScheduleRelationship::Canceled
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Med,
    Low,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchMethod {
    TripId,
    StopWindow,
    TrainNumber,
    None,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchStatus {
    Matched,
    RealtimeOnly,
}

#[derive(Clone, Debug)]
pub struct MatchingInfo {
    pub status: MatchStatus,
    pub confidence: Option<Confidence>,
    pub method: MatchMethod,
}

/// One fused, ephemeral service instance (§3). Produced per query by C6.
#[derive(Clone, Debug)]
pub struct ServiceInstance {
    pub service_instance_id: CompactString,
    pub scheduled_trip_id: Option<TripId>,
    pub route_id: Option<RouteId>,
    pub direction_id: Option<DirectionId>,
    pub scheduled: Option<ScheduledTrain>,
    pub realtime: Option<VehicleObservation>,
    pub matching: MatchingInfo,
}

impl ServiceInstance {
    pub fn service_instance_id_for(service_date: chrono::NaiveDate, trip_id: &str) -> CompactString {
        CompactString::from(format!("{}:{}", service_date.format("%Y%m%d"), trip_id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopStatus {
    Passed,
    Current,
    Next,
    Future,
    Skipped,
    Canceled,
}

/// One stop row of the assembled view (§4.7, C7 output).
#[derive(Clone, Debug, Serialize)]
pub struct StopRow {
    pub stop_id: StopId,
    pub stop_name: CompactString,
    pub stop_sequence: u32,
    pub status: StopStatus,
    pub sched_arr_epoch: Option<i64>,
    pub sched_dep_epoch: Option<i64>,
    pub eta_arr_epoch: Option<i64>,
    pub eta_dep_epoch: Option<i64>,
    pub tu_arr_epoch: Option<i64>,
    pub tu_dep_epoch: Option<i64>,
    pub delay_s: Option<i32>,
    pub platform: Option<CompactString>,
    pub platform_alt: Option<CompactString>,
    /// Filled in by C9 once a stop has been confirmed passed.
    pub passed_at_epoch: Option<i64>,
}

/// Output of C9: one recorded pass for a stop of a service instance (§3, §4.9).
#[derive(Clone, Debug)]
pub struct StopPassRecord {
    pub stop_sequence: u32,
    pub stop_id: StopId,
    pub arrival_epoch: Option<i64>,
    pub departure_epoch: Option<i64>,
    pub arrival_delay_s: Option<i32>,
    pub departure_delay_s: Option<i32>,
    pub recorded_at_unix: i64,
}

/// The full view produced by C7 (§4.7).
#[derive(Clone, Debug, Serialize)]
pub struct TripView {
    pub has_tu: bool,
    pub tu_updated_iso: Option<CompactString>,
    pub stops: Vec<StopRow>,
    pub next_stop_progress_pct: f64,
    pub current_stop_id: Option<StopId>,
    pub current_stop_name: Option<CompactString>,
    pub next_stop_id: Option<StopId>,
    pub next_stop_name: Option<CompactString>,
}

/// §6 output of `nearest_prediction_for_stop`.
#[derive(Clone, Debug, Serialize)]
pub enum PredictionSource {
    Realtime,
    Scheduled,
}

#[derive(Clone, Debug, Serialize)]
pub struct StopPrediction {
    pub status: PredictionSource,
    pub epoch: i64,
    pub hhmm: CompactString,
    pub eta_seconds: i64,
    pub delay_seconds: Option<i32>,
    pub confidence: Confidence,
    pub source: CompactString,
    pub trip_id: Option<TripId>,
    pub service_instance_id: Option<CompactString>,
    pub vehicle_id: Option<CompactString>,
    pub train_id: Option<CompactString>,
}

/// §6 output of `build_train_detail_vm`.
#[derive(Clone, Debug, Serialize)]
pub enum DetailKind {
    Live,
    Scheduled,
}

#[derive(Clone, Debug, Serialize)]
pub struct TrainDetailVm {
    pub kind: DetailKind,
    pub train: Option<VehicleObservation>,
    pub scheduled: Option<ScheduledTrain>,
    pub unified: TripView,
    pub trip_id: Option<TripId>,
    pub origin_stop_id: Option<StopId>,
    pub origin_name: Option<CompactString>,
    pub destination_stop_id: Option<StopId>,
    pub destination_name: Option<CompactString>,
    pub train_seen_iso: Option<CompactString>,
    pub train_seen_age_s: Option<i64>,
    pub platform: Option<CompactString>,
}
