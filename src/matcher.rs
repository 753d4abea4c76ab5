//! C6 — Trip Matcher (§4.6). Pure function: given one VehicleObservation and
//! the day's materialized scheduled trains, produces a ServiceInstance via
//! three ordered stages (trip_id, stop-window, train-number). Grounded in
//! `app/services/train_services_index.py`'s `link_vehicle_to_service`
//! (exact id, then windowed stop scan, then train-number fallback).

use chrono::NaiveDate;

use crate::domain::{
    Confidence, DirectionId, MatchMethod, MatchStatus, MatchingInfo, RouteId, ServiceInstance,
    VehicleObservation,
};
use crate::scheduled::ScheduledTrainsMaterializer;

const STOP_WINDOW_BEFORE_S: i64 = 1800;
const STOP_WINDOW_AFTER_S: i64 = 3600;
const HIGH_CONFIDENCE_WINDOW_S: i64 = 900;
const MED_CONFIDENCE_WINDOW_S: i64 = 1800;

pub fn match_vehicle(
    obs: &VehicleObservation,
    scheduled: &ScheduledTrainsMaterializer,
    date: NaiveDate,
    now: i64,
) -> ServiceInstance {
    let materialized = scheduled.for_date(date);

    // Stage 1: trip_id match.
    if let Some(trip_id) = &obs.trip_id {
        if let Some(train) = materialized.by_trip.get(trip_id) {
            return ServiceInstance {
                service_instance_id: ServiceInstance::service_instance_id_for(date, trip_id),
                scheduled_trip_id: Some(trip_id.clone()),
                route_id: Some(train.route_id.clone()),
                direction_id: Some(train.direction_id.clone()),
                scheduled: Some(train.clone()),
                realtime: Some(obs.clone()),
                matching: MatchingInfo {
                    status: MatchStatus::Matched,
                    confidence: Some(Confidence::High),
                    method: MatchMethod::TripId,
                },
            };
        }
    }

    // Stage 2: stop-window match.
    if let Some(stop_id) = &obs.stop_id {
        if let Some(entries) = materialized.by_stop.get(stop_id) {
            let obs_number = obs.train_number();
            let mut best: Option<(u8, i64, &crate::domain::TripId, i64)> = None;
            for (trip_id, sod) in entries {
                let Some(train) = materialized.by_trip.get(trip_id) else { continue };
                if let Some(route_id) = &obs.route_id {
                    if &train.route_id != route_id {
                        continue;
                    }
                }
                if let Some(direction_id) = &obs.direction_id {
                    if !direction_id.is_empty() && &train.direction_id != direction_id {
                        continue;
                    }
                }
                let call_epoch = crate::geo::date_and_sec_of_day_to_epoch(date, *sod, scheduled.tz());
                let dt = call_epoch - now;
                if dt < -STOP_WINDOW_BEFORE_S || dt > STOP_WINDOW_AFTER_S {
                    continue;
                }
                let number_mismatch: u8 = match (&obs_number, &train.train_number) {
                    (Some(a), Some(b)) if a != b => 1,
                    _ => 0,
                };
                let key = (number_mismatch, dt.abs());
                if best
                    .as_ref()
                    .map(|(bm, bdt, _, _)| key < (*bm, *bdt))
                    .unwrap_or(true)
                {
                    best = Some((number_mismatch, dt.abs(), trip_id, call_epoch));
                }
            }
            if let Some((number_mismatch, abs_dt, trip_id, _)) = best {
                let train = materialized.by_trip.get(trip_id).unwrap();
                let confidence = if abs_dt <= HIGH_CONFIDENCE_WINDOW_S && number_mismatch == 0 {
                    Confidence::High
                } else if abs_dt <= MED_CONFIDENCE_WINDOW_S {
                    Confidence::Med
                } else {
                    Confidence::Low
                };
                return ServiceInstance {
                    service_instance_id: ServiceInstance::service_instance_id_for(date, trip_id),
                    scheduled_trip_id: Some(trip_id.clone()),
                    route_id: Some(train.route_id.clone()),
                    direction_id: Some(train.direction_id.clone()),
                    scheduled: Some(train.clone()),
                    realtime: Some(obs.clone()),
                    matching: MatchingInfo {
                        status: MatchStatus::Matched,
                        confidence: Some(confidence),
                        method: MatchMethod::StopWindow,
                    },
                };
            }
        }
    }

    // Stage 3: train-number fallback.
    if let Some(number) = obs.train_number() {
        let route_id: Option<&str> = obs.route_id.as_deref();
        let direction_id: Option<&str> = obs.direction_id.as_deref();
        if let Some((train, _epoch)) =
            scheduled.next_departure_for_train_number(route_id, direction_id, &number, date, 1, now)
        {
            return ServiceInstance {
                service_instance_id: ServiceInstance::service_instance_id_for(date, &train.trip_id),
                scheduled_trip_id: Some(train.trip_id.clone()),
                route_id: Some(train.route_id.clone()),
                direction_id: Some(train.direction_id.clone()),
                scheduled: Some(train.clone()),
                realtime: Some(obs.clone()),
                matching: MatchingInfo {
                    status: MatchStatus::Matched,
                    confidence: Some(Confidence::Med),
                    method: MatchMethod::TrainNumber,
                },
            };
        }
    }

    // No stage succeeded: realtime-only.
    let fallback_trip_id = obs.trip_id.clone();
    let service_instance_id = match &fallback_trip_id {
        Some(trip_id) => ServiceInstance::service_instance_id_for(date, trip_id),
        None => compact_str::CompactString::from(format!("{}:{}", date.format("%Y%m%d"), obs.train_id)),
    };
    ServiceInstance {
        service_instance_id,
        scheduled_trip_id: fallback_trip_id,
        route_id: obs.route_id.clone(),
        direction_id: obs.direction_id.clone(),
        scheduled: None,
        realtime: Some(obs.clone()),
        matching: MatchingInfo {
            status: MatchStatus::RealtimeOnly,
            confidence: None,
            method: MatchMethod::None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VehicleStopStatus;
    use crate::static_repo::StaticRepo;
    use std::sync::Arc;

    fn setup() -> (Arc<ScheduledTrainsMaterializer>, NaiveDate) {
        let rdir = tempfile::tempdir().unwrap();
        std::fs::write(
            rdir.path().join("route_stations.csv"),
            "route_id,direction_id,seq,stop_id,stop_name,km,lat,lon,route_short_name,route_long_name,length_km,color_bg,color_fg\n\
             R1,0,0,S1,Origin,0.0,40.0,-3.0,C1,Commuter One,10.0,,\n\
             R1,0,1,S2,End,10.0,40.1,-3.0,C1,Commuter One,10.0,,\n",
        )
        .unwrap();
        let repo = Arc::new(StaticRepo::new(rdir.path()));
        repo.load().unwrap();

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
        let scheduled = Arc::new(
            ScheduledTrainsMaterializer::load(gdir.path(), repo, chrono_tz::Europe::Madrid).unwrap(),
        );
        (scheduled, NaiveDate::from_ymd_opt(2026, 1, 5).unwrap())
    }

    fn obs(trip_id: Option<&str>, stop_id: Option<&str>) -> VehicleObservation {
        VehicleObservation {
            train_id: compact_str::CompactString::from("V1"),
            trip_id: trip_id.map(crate::domain::TripId::from),
            route_id: None,
            direction_id: None,
            lat: None,
            lon: None,
            speed_kmh: None,
            bearing: None,
            stop_id: stop_id.map(crate::domain::StopId::from),
            current_status: VehicleStopStatus::StoppedAt,
            ts_unix: 0,
            label: None,
            nucleus_id: None,
            platform_by_stop: std::collections::HashMap::new(),
        }
    }

    #[test]
    fn trip_id_match_is_high_confidence() {
        let (scheduled, date) = setup();
        let now = crate::geo::date_and_sec_of_day_to_epoch(date, 8 * 3600, scheduled.tz());
        let si = match_vehicle(&obs(Some("T1"), None), &scheduled, date, now);
        assert_eq!(si.matching.method, MatchMethod::TripId);
        assert_eq!(si.matching.confidence, Some(Confidence::High));
    }

    #[test]
    fn stop_window_match_when_trip_id_unknown() {
        let (scheduled, date) = setup();
        let now = crate::geo::date_and_sec_of_day_to_epoch(date, 8 * 3600, scheduled.tz());
        let si = match_vehicle(&obs(Some("UNKNOWN"), Some("S1")), &scheduled, date, now);
        assert_eq!(si.matching.method, MatchMethod::StopWindow);
        assert_eq!(si.matching.confidence, Some(Confidence::High));
    }

    #[test]
    fn train_number_fallback_when_no_trip_or_stop_match() {
        let (scheduled, date) = setup();
        let now = crate::geo::date_and_sec_of_day_to_epoch(date, 7 * 3600, scheduled.tz());
        let mut v = obs(None, None);
        v.label = Some(compact_str::CompactString::from("4521"));
        let si = match_vehicle(&v, &scheduled, date, now);
        assert_eq!(si.matching.method, MatchMethod::TrainNumber);
    }

    #[test]
    fn realtime_only_when_nothing_resolves() {
        let (scheduled, date) = setup();
        let now = crate::geo::date_and_sec_of_day_to_epoch(date, 8 * 3600, scheduled.tz());
        let si = match_vehicle(&obs(None, None), &scheduled, date, now);
        assert_eq!(si.matching.status, MatchStatus::RealtimeOnly);
        assert_eq!(si.matching.method, MatchMethod::None);
    }
}
