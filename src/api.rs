//! §6 — the three query functions the HTTP layer wraps directly. Each is a
//! thin assembly over C1-C9: resolve a `ServiceInstance` (C6), build its view
//! (C7), or walk the static stop index (C3) for a pure-schedule lookup.
//! Grounded in `app/services/train_services_index.py`'s `build_train_detail_vm`
//! and `nearest_prediction_for_stop`.

use std::collections::HashMap;

use chrono::{NaiveDate, TimeZone};
use compact_str::CompactString;
use serde::Serialize;

use crate::domain::{
    Confidence, DetailKind, MatchMethod, MatchStatus, MatchingInfo, PredictionSource,
    ServiceInstance, StopId, StopPrediction, TrainDetailVm,
};
use crate::matcher::match_vehicle;
use crate::state::AppState;
use crate::view;

fn epoch_to_date(epoch: i64, tz: &chrono_tz::Tz) -> NaiveDate {
    tz.timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.date_naive())
        .unwrap_or_else(|| chrono::Utc::now().date_naive())
}

fn epoch_to_hhmm(epoch: i64, tz: &chrono_tz::Tz) -> CompactString {
    tz.timestamp_opt(epoch, 0)
        .single()
        .map(|dt| CompactString::from(dt.format("%H:%M").to_string()))
        .unwrap_or_default()
}

/// Resolves `identifier` (a live `train_id`, or a 3-6 digit train number) to a
/// `ServiceInstance` within `nucleus`. Tries, in order: exact live train_id,
/// live train-number match among the nucleus's own vehicles, then a pure
/// scheduled lookup via `next_departure_for_train_number`.
fn resolve_service_instance(
    state: &AppState,
    nucleus: &str,
    identifier: &str,
    date: NaiveDate,
    now: i64,
) -> Option<ServiceInstance> {
    if let Some(obs) = state.vehicles.get_by_id(identifier) {
        return Some(match_vehicle(&obs, &state.scheduled, date, now));
    }

    for obs in state.vehicles.get_by_nucleus(nucleus) {
        if obs.train_number().as_deref() == Some(identifier) {
            return Some(match_vehicle(&obs, &state.scheduled, date, now));
        }
    }

    for route_id in state.static_repo.routes_by_nucleus(nucleus) {
        if let Some((train, _epoch)) =
            state.scheduled.next_departure_for_train_number(Some(route_id.as_str()), None, identifier, date, 1, now)
        {
            return Some(ServiceInstance {
                service_instance_id: ServiceInstance::service_instance_id_for(date, &train.trip_id),
                scheduled_trip_id: Some(train.trip_id.clone()),
                route_id: Some(train.route_id.clone()),
                direction_id: Some(train.direction_id.clone()),
                scheduled: Some(train),
                realtime: None,
                matching: MatchingInfo {
                    status: MatchStatus::Matched,
                    confidence: Some(Confidence::Med),
                    method: MatchMethod::TrainNumber,
                },
            });
        }
    }
    None
}

/// `build_train_detail_vm(nucleus, identifier, tz)` (§6).
pub fn build_train_detail_vm(state: &AppState, nucleus: &str, identifier: &str, now: i64) -> Option<TrainDetailVm> {
    let date = epoch_to_date(now, &state.tz);
    let instance = resolve_service_instance(state, nucleus, identifier, date, now)?;

    let tu = instance
        .scheduled_trip_id
        .as_deref()
        .and_then(|trip_id| state.trip_updates.get_by_trip_id(trip_id));

    let unified = view::build_trip_view(
        &instance,
        &state.static_repo,
        Some(&state.shapes),
        tu.as_ref(),
        &state.passes,
        &state.habits,
        &state.tz,
        now,
    );
    let kind = view::train_detail_kind(&instance);

    let route = instance
        .route_id
        .as_deref()
        .and_then(|rid| state.static_repo.route(rid, instance.direction_id.as_deref()));
    let origin = route.as_ref().and_then(|r| r.origin());
    let destination = route.as_ref().and_then(|r| r.destination());

    let train_seen_iso = instance
        .realtime
        .as_ref()
        .and_then(|v| chrono::DateTime::from_timestamp(v.ts_unix, 0))
        .map(|dt| CompactString::from(dt.to_rfc3339()));
    let train_seen_age_s = instance.realtime.as_ref().map(|v| now - v.ts_unix);
    let platform = unified
        .current_stop_id
        .as_deref()
        .and_then(|id| unified.stops.iter().find(|r| r.stop_id == id))
        .and_then(|r| r.platform.clone());

    Some(TrainDetailVm {
        kind,
        train: instance.realtime.clone(),
        scheduled: instance.scheduled.clone(),
        unified,
        trip_id: instance.scheduled_trip_id.clone(),
        origin_stop_id: origin.map(|s| s.stop_id.clone()),
        origin_name: origin.map(|s| s.stop_name.clone()),
        destination_stop_id: destination.map(|s| s.stop_id.clone()),
        destination_name: destination.map(|s| s.stop_name.clone()),
        train_seen_iso,
        train_seen_age_s,
        platform,
    })
}

/// `nearest_prediction_for_stop(route_id, direction_id?, stop_id, tz, limit, allow_next_day)` (§6).
/// Walks the materialized schedule for upcoming calls at `stop_id`, enriching
/// each with a trip update's fused ETA when one is held for that trip.
pub fn nearest_prediction_for_stop(
    state: &AppState,
    route_id: Option<&str>,
    direction_id: Option<&str>,
    stop_id: &str,
    limit: usize,
    allow_next_day: bool,
    now: i64,
) -> Vec<StopPrediction> {
    let date = epoch_to_date(now, &state.tz);
    let hits = state
        .scheduled
        .for_stop_after(stop_id, date, now, limit.max(1) * 2, route_id, direction_id, allow_next_day);

    let mut out: Vec<StopPrediction> = hits
        .into_iter()
        .map(|(train, sched_epoch)| {
            let service_instance_id = Some(ServiceInstance::service_instance_id_for(date, &train.trip_id));
            if let Some(rt_epoch) = state.trip_updates.eta_for_trip_to_stop(&train.trip_id, stop_id, now) {
                StopPrediction {
                    status: PredictionSource::Realtime,
                    epoch: rt_epoch,
                    hhmm: epoch_to_hhmm(rt_epoch, &state.tz),
                    eta_seconds: rt_epoch - now,
                    delay_seconds: state.trip_updates.trip_delay_seconds(&train.trip_id),
                    confidence: Confidence::High,
                    source: CompactString::from("trip_update"),
                    trip_id: Some(train.trip_id.clone()),
                    service_instance_id,
                    vehicle_id: None,
                    train_id: train.train_number.clone(),
                }
            } else {
                StopPrediction {
                    status: PredictionSource::Scheduled,
                    epoch: sched_epoch,
                    hhmm: epoch_to_hhmm(sched_epoch, &state.tz),
                    eta_seconds: sched_epoch - now,
                    delay_seconds: None,
                    confidence: if train.trip_id.is_empty() { Confidence::Low } else { Confidence::Med },
                    source: CompactString::from("scheduled"),
                    trip_id: Some(train.trip_id.clone()),
                    service_instance_id,
                    vehicle_id: None,
                    train_id: train.train_number.clone(),
                }
            }
        })
        .collect();

    out.sort_by_key(|p| p.epoch);
    out.truncate(limit);
    out
}

#[derive(Clone, Debug, Serialize)]
pub struct RtArrival {
    pub epoch: i64,
    pub delay_s: Option<i32>,
    pub delay_min: Option<i32>,
}

/// `build_rt_arrival_times_from_vm(vm, tz, downstream_tu_override?)` (§6).
/// Reshapes an already-built view into a stop-keyed arrival map. With the
/// override on, a stop's raw trip-update arrival wins over the propagated
/// fallback; with it off, the propagated (constant-delay-carried) ETA is used
/// even where a trip update exists for that stop.
pub fn build_rt_arrival_times_from_vm(
    vm: &TrainDetailVm,
    _tz: &chrono_tz::Tz,
    downstream_tu_override: bool,
) -> HashMap<StopId, RtArrival> {
    let mut out = HashMap::with_capacity(vm.unified.stops.len());
    for row in &vm.unified.stops {
        let epoch = if downstream_tu_override {
            row.tu_arr_epoch.or(row.eta_arr_epoch)
        } else {
            row.eta_arr_epoch
        }
        .or(row.sched_arr_epoch);
        let Some(epoch) = epoch else { continue };
        out.insert(
            row.stop_id.clone(),
            RtArrival { epoch, delay_s: row.delay_s, delay_min: row.delay_s.map(delay_minutes) },
        );
    }
    out
}

/// "Minutes of delay" per §9: `sign(delta) * floor(|delta| / 60)`, distinct
/// from the `ceil`-based rounding used for display-facing minute counts.
fn delay_minutes(delay_s: i32) -> i32 {
    delay_s.signum() * (delay_s.abs() / 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduled::ScheduledTrainsMaterializer;
    use crate::static_repo::StaticRepo;
    use std::sync::Arc;

    fn state_fixture() -> (AppState, chrono::NaiveDate) {
        let rdir = tempfile::tempdir().unwrap();
        std::fs::write(
            rdir.path().join("route_stations.csv"),
            "route_id,direction_id,seq,stop_id,stop_name,km,lat,lon,route_short_name,route_long_name,length_km,color_bg,color_fg\n\
             R1,0,0,S1,Origin,0.0,40.0,-3.0,C1,Commuter One,10.0,,\n\
             R1,0,1,S2,End,10.0,40.1,-3.0,C1,Commuter One,10.0,,\n",
        )
        .unwrap();
        std::fs::write(
            rdir.path().join("nucleos_map.csv"),
            "route_id,nucleus_slug\nR1,10\n",
        )
        .unwrap();
        let static_repo = Arc::new(StaticRepo::new(rdir.path()));
        static_repo.load().unwrap();

        let gdir = tempfile::tempdir().unwrap();
        std::fs::write(gdir.path().join("agency.txt"), "agency_id,agency_name,agency_url,agency_timezone\nA1,A,https://x,Europe/Madrid\n").unwrap();
        std::fs::write(gdir.path().join("routes.txt"), "route_id,agency_id,route_short_name,route_long_name,route_type\nR1,A1,C1,Commuter One,2\n").unwrap();
        std::fs::write(gdir.path().join("stops.txt"), "stop_id,stop_name,stop_lat,stop_lon\nS1,Origin,40.0,-3.0\nS2,End,40.1,-3.0\n").unwrap();
        std::fs::write(gdir.path().join("trips.txt"), "route_id,service_id,trip_id,direction_id,trip_short_name\nR1,SVC,T1,0,4521\n").unwrap();
        std::fs::write(
            gdir.path().join("stop_times.txt"),
            "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nT1,08:00:00,08:00:00,S1,0\nT1,08:30:00,08:30:00,S2,1\n",
        )
        .unwrap();
        std::fs::write(gdir.path().join("calendar.txt"), "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nSVC,1,1,1,1,1,1,1,20260101,20261231\n").unwrap();

        let tz = chrono_tz::Europe::Madrid;
        let scheduled = Arc::new(ScheduledTrainsMaterializer::load(gdir.path(), static_repo.clone(), tz).unwrap());
        let vehicles = Arc::new(crate::vehicles::VehiclePositionsCache::new(
            "http://unused.invalid".to_string(),
            static_repo.clone(),
            scheduled.clone(),
            tz,
        ));
        let trip_updates = Arc::new(crate::trip_updates::TripUpdatesCache::new(
            "http://unused.invalid".to_string(),
            static_repo.clone(),
            scheduled.clone(),
            vehicles.clone(),
            tz,
        ));
        let shapes = Arc::new(crate::shapes_index::ShapesIndex::new(gdir.path()));

        let state = AppState {
            static_repo,
            shapes,
            scheduled,
            vehicles,
            trip_updates,
            passes: Arc::new(crate::passes::PassRecorder::new()),
            habits: Arc::new(crate::habits::PlatformHabits::new(rdir.path())),
            tz,
        };
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        (state, date)
    }

    #[test]
    fn pure_scheduled_prediction_has_medium_confidence_and_no_delay() {
        let (state, date) = state_fixture();
        let now = crate::geo::date_and_sec_of_day_to_epoch(date, 7 * 3600 + 45 * 60, &state.tz);
        let preds = nearest_prediction_for_stop(&state, Some("R1"), None, "S1", 5, false, now);
        assert_eq!(preds.len(), 1);
        assert!(matches!(preds[0].status, PredictionSource::Scheduled));
        assert_eq!(preds[0].confidence, Confidence::Med);
        assert!(preds[0].delay_seconds.is_none());
    }

    #[test]
    fn build_train_detail_vm_falls_back_to_scheduled_kind_without_a_live_vehicle() {
        let (state, date) = state_fixture();
        let now = crate::geo::date_and_sec_of_day_to_epoch(date, 7 * 3600, &state.tz);
        let vm = build_train_detail_vm(&state, "10", "4521", now).expect("scheduled match");
        assert!(matches!(vm.kind, DetailKind::Scheduled));
        assert_eq!(vm.origin_stop_id.as_deref(), Some("S1"));
        assert_eq!(vm.destination_stop_id.as_deref(), Some("S2"));
    }

    #[test]
    fn unknown_identifier_resolves_to_none() {
        let (state, date) = state_fixture();
        let now = crate::geo::date_and_sec_of_day_to_epoch(date, 7 * 3600, &state.tz);
        assert!(build_train_detail_vm(&state, "10", "99999", now).is_none());
    }
}
