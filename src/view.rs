//! C7 — Trip View Builder (§4.7). The largest component: assembles the
//! per-stop row list for one ServiceInstance, fuses schedule/trip-update/
//! vehicle information into a status and an inter-stop progress percentage,
//! and consults C9 to enforce the anti-backtrack invariant. Grounded in
//! `train_services_index.py`'s `_build_trip_rows`/`_progress_for_segment`
//! stop-list/status/progress pipeline.

use std::collections::HashMap;

use compact_str::CompactString;

use crate::domain::{
    DetailKind, Route, ServiceInstance, StopId, StopRow, StopScheduleRelationship, StopStatus,
    TripUpdateItem, TripView, TuStopTimeUpdate, VehicleObservation, VehicleStopStatus,
};
use crate::habits::PlatformHabits;
use crate::passes::PassRecorder;
use crate::shapes_index::ShapesIndex;
use crate::static_repo::StaticRepo;

const STOPPED_DISTANCE_THRESHOLD_M: f64 = 300.0;
const LOW_SPEED_KMH: f64 = 5.0;
const INCOMING_PROGRESS_FLOOR: f64 = 0.8;
const FUSION_DIVERGENCE: f64 = 0.30;
const OVERSHOOT_PROGRESS_PCT: f64 = 95.0;
const AMBIGUOUS_MARGIN_PP: f64 = 0.15;
const AMBIGUOUS_CONFIDENCE_CEIL: f64 = 0.6;

struct Seed {
    stop_id: StopId,
    stop_name: CompactString,
    seq: u32,
    sched_arr: Option<i64>,
    sched_dep: Option<i64>,
    lat: f64,
    lon: f64,
}

fn seed_stops(instance: &ServiceInstance, route: Option<&Route>, tz: &chrono_tz::Tz) -> Vec<Seed> {
    if let Some(train) = &instance.scheduled {
        let mut out = Vec::with_capacity(train.calls.len());
        for call in &train.calls {
            let station = route.and_then(|r| r.station_by_stop_id(&call.stop_id));
            out.push(Seed {
                stop_id: call.stop_id.clone(),
                stop_name: station.map(|s| s.stop_name.clone()).unwrap_or_else(|| call.stop_id.clone()),
                seq: call.stop_sequence,
                sched_arr: train.call_epoch_arr(call, tz),
                sched_dep: train.call_epoch_dep(call, tz),
                lat: station.map(|s| s.lat).unwrap_or(0.0),
                lon: station.map(|s| s.lon).unwrap_or(0.0),
            });
        }
        return out;
    }
    route
        .map(|r| {
            r.stations
                .iter()
                .map(|s| Seed {
                    stop_id: s.stop_id.clone(),
                    stop_name: s.stop_name.clone(),
                    seq: s.seq,
                    sched_arr: None,
                    sched_dep: None,
                    lat: s.lat,
                    lon: s.lon,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn tu_lookup<'a>(tu: Option<&'a TripUpdateItem>, stop_id: &str) -> Option<&'a TuStopTimeUpdate> {
    tu.and_then(|t| t.stop_update(stop_id))
}

fn predecessor_seq(seeds: &[Seed], stop_id: &str) -> Option<usize> {
    seeds.iter().position(|s| s.stop_id == stop_id).and_then(|i| i.checked_sub(1))
}

fn successor_seq(seeds: &[Seed], stop_id: &str) -> Option<usize> {
    seeds.iter().position(|s| s.stop_id == stop_id).map(|i| i + 1).filter(|&i| i < seeds.len())
}

fn next_service_stop(seeds: &[Seed], tu: Option<&TripUpdateItem>, vehicle: Option<&VehicleObservation>, now: i64) -> Option<StopId> {
    if let Some(tu) = tu {
        for seed in seeds {
            if let Some(u) = tu.stop_update(&seed.stop_id) {
                if u.schedule_relationship == StopScheduleRelationship::Scheduled && u.arrival_epoch.map(|e| e >= now).unwrap_or(false) {
                    return Some(seed.stop_id.clone());
                }
            }
        }
    }
    if let Some(v) = vehicle {
        if matches!(v.current_status, VehicleStopStatus::InTransitTo | VehicleStopStatus::IncomingAt) {
            return v.stop_id.clone();
        }
    }
    None
}

fn pivot_seq(seeds: &[Seed], tu: Option<&TripUpdateItem>, vehicle: Option<&VehicleObservation>, now: i64) -> Option<u32> {
    if let Some(v) = vehicle {
        if v.current_status == VehicleStopStatus::StoppedAt {
            if let Some(seed) = v.stop_id.as_deref().and_then(|id| seeds.iter().find(|s| s.stop_id == id)) {
                return Some(seed.seq);
            }
        }
    }
    if let Some(tu) = tu {
        for seed in seeds {
            if let Some(u) = tu.stop_update(&seed.stop_id) {
                if u.arrival_epoch.map(|e| e >= now).unwrap_or(false) {
                    return Some(seed.seq);
                }
            }
        }
    }
    if let Some(v) = vehicle {
        if v.current_status == VehicleStopStatus::InTransitTo {
            if let Some(seed) = v.stop_id.as_deref().and_then(|id| seeds.iter().find(|s| s.stop_id == id)) {
                return Some(seed.seq);
            }
        }
    }
    None
}

fn choose_current_next(
    seeds: &[Seed],
    vehicle: Option<&VehicleObservation>,
    derived_next_service_stop: Option<&StopId>,
) -> (Option<StopId>, Option<StopId>) {
    let Some(v) = vehicle else { return (None, None) };
    match v.current_status {
        VehicleStopStatus::StoppedAt => {
            let Some(stop_id) = &v.stop_id else { return (None, None) };
            let Some(seed) = seeds.iter().find(|s| &s.stop_id == stop_id) else { return (None, None) };
            let far = match (v.lat, v.lon) {
                (Some(lat), Some(lon)) => crate::geo::haversine_m(lat, lon, seed.lat, seed.lon) > STOPPED_DISTANCE_THRESHOLD_M,
                _ => false,
            };
            if far {
                let prev = predecessor_seq(seeds, stop_id).map(|i| seeds[i].stop_id.clone());
                (prev, Some(stop_id.clone()))
            } else {
                (Some(stop_id.clone()), None)
            }
        }
        VehicleStopStatus::InTransitTo | VehicleStopStatus::IncomingAt => {
            let current = v.stop_id.as_deref().and_then(|id| predecessor_seq(seeds, id)).map(|i| seeds[i].stop_id.clone());
            let next = derived_next_service_stop.cloned().or_else(|| v.stop_id.clone());
            if current.is_none() && v.speed_kmh.map(|s| s < LOW_SPEED_KMH).unwrap_or(false) {
                let adopted = v.stop_id.clone();
                let advanced = adopted.as_deref().and_then(|id| successor_seq(seeds, id)).map(|i| seeds[i].stop_id.clone());
                (adopted, advanced)
            } else {
                (current, next)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn compute_progress(
    seeds: &[Seed],
    rows_times: &HashMap<StopId, (Option<i64>, Option<i64>)>,
    current: &StopId,
    next: &StopId,
    vehicle: &VehicleObservation,
    shapes: Option<&ShapesIndex>,
    route: Option<&Route>,
    now: i64,
) -> f64 {
    if vehicle.current_status == VehicleStopStatus::StoppedAt {
        return 0.0;
    }

    let from_seed = seeds.iter().find(|s| &s.stop_id == current);
    let to_seed = seeds.iter().find(|s| &s.stop_id == next);

    let temporal = match (from_seed, to_seed) {
        (Some(_), Some(_)) => {
            let from_dep = rows_times.get(current).and_then(|(_, d)| *d);
            let to_arr = rows_times.get(next).and_then(|(a, _)| *a);
            match (from_dep, to_arr) {
                (Some(dep), Some(arr)) if arr > dep => Some(((now - dep) as f64 / (arr - dep) as f64).clamp(0.0, 1.0)),
                _ => None,
            }
        }
        _ => None,
    };

    let spatial = match (from_seed, to_seed, vehicle.lat, vehicle.lon) {
        (Some(from), Some(to), Some(vlat), Some(vlon)) => {
            let via_shape = route.and_then(|r| shapes.and_then(|s| s.polyline_for_route(&r.route_id, Some(&r.direction_id)))).and_then(|poly| {
                let cum_from = ShapesIndex::project(&poly, from.lat, from.lon)?;
                let cum_to = ShapesIndex::project(&poly, to.lat, to.lon)?;
                let cum_v = ShapesIndex::project(&poly, vlat, vlon)?;
                if cum_to == cum_from {
                    None
                } else {
                    Some(((cum_v - cum_from) / (cum_to - cum_from)).clamp(0.0, 1.0))
                }
            });
            via_shape.or_else(|| crate::geo::project_fraction_clamped(from.lat, from.lon, to.lat, to.lon, vlat, vlon))
        }
        _ => None,
    };

    let fused = if vehicle.current_status == VehicleStopStatus::IncomingAt {
        let base = spatial.or(temporal).unwrap_or(0.0);
        base.max(INCOMING_PROGRESS_FLOOR)
    } else if vehicle.speed_kmh.map(|s| s < LOW_SPEED_KMH).unwrap_or(false) && vehicle.current_status == VehicleStopStatus::InTransitTo {
        spatial.or(temporal).unwrap_or(0.0)
    } else {
        match (spatial, temporal) {
            (Some(sp), Some(te)) if (sp - te).abs() > FUSION_DIVERGENCE => sp.min(te),
            (Some(sp), _) => sp,
            (None, Some(te)) => te,
            (None, None) => 0.0,
        }
    };

    (fused.clamp(0.0, 1.0) * 100.0).round()
}

fn effective_delay_chain(seeds: &[Seed], tu: Option<&TripUpdateItem>) -> HashMap<StopId, Option<i32>> {
    let mut carried: Option<i32> = None;
    let mut out = HashMap::with_capacity(seeds.len());
    for seed in seeds {
        let explicit = tu_lookup(tu, &seed.stop_id).and_then(|u| u.arrival_delay.or(u.departure_delay));
        if explicit.is_some() {
            carried = explicit;
        }
        out.insert(seed.stop_id.clone(), carried);
    }
    out
}

fn platform_for_stop(
    vehicle: Option<&VehicleObservation>,
    habits: &PlatformHabits,
    nucleus: Option<&str>,
    route_id: Option<&str>,
    stop_id: &str,
    now: i64,
) -> (Option<CompactString>, Option<CompactString>) {
    if let Some(p) = vehicle.and_then(|v| v.platform_by_stop.get(stop_id)) {
        if let (Some(nucleus), Some(route_id)) = (nucleus, route_id) {
            habits.observe(nucleus, route_id, stop_id, p, now);
        }
        return (Some(p.clone()), None);
    }
    let Some(nucleus) = nucleus else { return (None, None) };
    let Some(route_id) = route_id else { return (None, None) };
    let prediction = habits.habitual_for(nucleus, route_id, stop_id, now);
    if !prediction.publishable {
        return (None, None);
    }
    let (Some(primary), Some(secondary)) = (&prediction.primary, &prediction.secondary) else {
        return (prediction.primary, None);
    };
    let p_primary = prediction.frequencies.get(primary).copied().unwrap_or(0.0);
    let p_secondary = prediction.frequencies.get(secondary).copied().unwrap_or(0.0);
    if (p_primary - p_secondary).abs() < AMBIGUOUS_MARGIN_PP && prediction.confidence < AMBIGUOUS_CONFIDENCE_CEIL {
        (None, Some(CompactString::from(format!("{primary} ó {secondary}"))))
    } else {
        (Some(primary.clone()), None)
    }
}

/// Assembles the full per-stop view for one ServiceInstance (§4.7).
#[allow(clippy::too_many_arguments)]
pub fn build_trip_view(
    instance: &ServiceInstance,
    static_repo: &StaticRepo,
    shapes: Option<&ShapesIndex>,
    tu: Option<&TripUpdateItem>,
    passes: &PassRecorder,
    habits: &PlatformHabits,
    tz: &chrono_tz::Tz,
    now: i64,
) -> TripView {
    let route = instance
        .route_id
        .as_deref()
        .and_then(|rid| static_repo.route(rid, instance.direction_id.as_deref()));
    let seeds = seed_stops(instance, route.as_ref(), tz);
    let nucleus = route.as_ref().and_then(|r| r.nucleus_id.clone());

    let derived_next_service = next_service_stop(&seeds, tu, instance.realtime.as_ref(), now);
    let (mut current_id, mut next_id) = choose_current_next(&seeds, instance.realtime.as_ref(), derived_next_service.as_ref());
    let pivot = pivot_seq(&seeds, tu, instance.realtime.as_ref(), now);

    let delays = effective_delay_chain(&seeds, tu);
    let mut row_times: HashMap<StopId, (Option<i64>, Option<i64>)> = HashMap::with_capacity(seeds.len());
    for seed in &seeds {
        let u = tu_lookup(tu, &seed.stop_id);
        let effective_delay = delays.get(&seed.stop_id).copied().flatten();
        let eta_arr = u.and_then(|u| u.arrival_epoch).or_else(|| seed.sched_arr.map(|s| s + effective_delay.unwrap_or(0) as i64));
        let eta_dep = u.and_then(|u| u.departure_epoch).or_else(|| seed.sched_dep.map(|s| s + effective_delay.unwrap_or(0) as i64));
        row_times.insert(seed.stop_id.clone(), (eta_arr, eta_dep));
    }

    let mut effective_vehicle = instance.realtime.clone();
    let mut progress = 0.0;
    if let (Some(vehicle), Some(cur), Some(nxt)) = (&instance.realtime, &current_id, &next_id) {
        progress = compute_progress(&seeds, &row_times, cur, nxt, vehicle, shapes, route.as_ref(), now);
        if vehicle.current_status == VehicleStopStatus::IncomingAt && progress >= OVERSHOOT_PROGRESS_PCT {
            let target = nxt.clone();
            current_id = Some(target.clone());
            next_id = successor_seq(&seeds, &target).map(|i| seeds[i].stop_id.clone());
            progress = 0.0;
            let mut synthetic = vehicle.clone();
            synthetic.current_status = VehicleStopStatus::StoppedAt;
            synthetic.stop_id = Some(target);
            effective_vehicle = Some(synthetic);
        }
    }

    // §4.9 anti-backtrack: consult C9 before committing to this current_stop.
    let prior_last_seq = passes.get_last_seq(&instance.service_instance_id);
    if let Some(cur_id) = &current_id {
        if let Some(seed) = seeds.iter().find(|s| &s.stop_id == cur_id) {
            if prior_last_seq > 0 && seed.seq < prior_last_seq {
                log::warn!(
                    "anti-backtrack: service {} reported seq {} below confirmed {}; restoring",
                    instance.service_instance_id,
                    seed.seq,
                    prior_last_seq
                );
                current_id = seeds.iter().find(|s| s.seq == prior_last_seq).map(|s| s.stop_id.clone());
                next_id = seeds.iter().find(|s| s.seq == prior_last_seq + 1).map(|s| s.stop_id.clone());
                if let Some(vehicle) = &effective_vehicle {
                    let mut restored = vehicle.clone();
                    restored.current_status = VehicleStopStatus::StoppedAt;
                    restored.stop_id = current_id.clone();
                    effective_vehicle = Some(restored);
                }
            }
        }
    }

    let mut stops = Vec::with_capacity(seeds.len());
    for seed in &seeds {
        let u = tu_lookup(tu, &seed.stop_id);
        let rel = u.map(|u| u.schedule_relationship).unwrap_or(StopScheduleRelationship::Scheduled);
        let status = if tu.map(|t| t.is_canceled()).unwrap_or(false) {
            StopStatus::Canceled
        } else if rel == StopScheduleRelationship::Skipped {
            StopStatus::Skipped
        } else if derived_next_service.as_ref() == Some(&seed.stop_id) {
            StopStatus::Next
        } else if effective_vehicle
            .as_ref()
            .map(|v| v.current_status == VehicleStopStatus::StoppedAt && v.stop_id.as_ref() == Some(&seed.stop_id))
            .unwrap_or(false)
        {
            StopStatus::Current
        } else if effective_vehicle
            .as_ref()
            .map(|v| matches!(v.current_status, VehicleStopStatus::InTransitTo | VehicleStopStatus::IncomingAt) && v.stop_id.as_ref() == Some(&seed.stop_id))
            .unwrap_or(false)
            && derived_next_service.is_none()
        {
            StopStatus::Next
        } else if pivot.map(|p| seed.seq < p).unwrap_or(false) {
            StopStatus::Passed
        } else {
            StopStatus::Future
        };

        let (eta_arr, eta_dep) = row_times.get(&seed.stop_id).copied().unwrap_or((None, None));
        let (platform, platform_alt) =
            platform_for_stop(effective_vehicle.as_ref(), habits, nucleus.as_deref(), instance.route_id.as_deref(), &seed.stop_id, now);

        stops.push(StopRow {
            stop_id: seed.stop_id.clone(),
            stop_name: seed.stop_name.clone(),
            stop_sequence: seed.seq,
            status,
            sched_arr_epoch: seed.sched_arr,
            sched_dep_epoch: seed.sched_dep,
            eta_arr_epoch: eta_arr,
            eta_dep_epoch: eta_dep,
            tu_arr_epoch: u.and_then(|u| u.arrival_epoch),
            tu_dep_epoch: u.and_then(|u| u.departure_epoch),
            delay_s: delays.get(&seed.stop_id).copied().flatten(),
            platform,
            platform_alt,
            passed_at_epoch: None,
        });
    }

    // Record this view's pass state with C9 (§4.9).
    if let Some(vehicle) = &effective_vehicle {
        let mut forced_arrivals = HashMap::new();
        let mut forced_departures = HashMap::new();
        let last_passed_seq = if vehicle.current_status == VehicleStopStatus::StoppedAt {
            current_id
                .as_deref()
                .and_then(|id| seeds.iter().find(|s| s.stop_id == id))
                .map(|s| {
                    forced_arrivals.insert(s.seq, vehicle.ts_unix);
                    s.seq
                })
                .unwrap_or(0)
        } else {
            current_id
                .as_deref()
                .and_then(|id| seeds.iter().find(|s| s.stop_id == id))
                .map(|s| {
                    forced_departures.insert(s.seq, vehicle.ts_unix);
                    s.seq
                })
                .unwrap_or(0)
        };
        passes.record(&instance.service_instance_id, &stops, last_passed_seq, vehicle.ts_unix, &forced_arrivals, &forced_departures);
    }

    TripView {
        has_tu: tu.is_some(),
        tu_updated_iso: tu.and_then(|t| chrono::DateTime::from_timestamp(t.timestamp, 0)).map(|dt| CompactString::from(dt.to_rfc3339())),
        stops,
        next_stop_progress_pct: progress,
        current_stop_id: current_id.clone(),
        current_stop_name: current_id.as_deref().and_then(|id| static_repo.stop_name(id)),
        next_stop_id: next_id.clone(),
        next_stop_name: next_id.as_deref().and_then(|id| static_repo.stop_name(id)),
    }
}

pub fn train_detail_kind(instance: &ServiceInstance) -> DetailKind {
    if instance.realtime.is_some() {
        DetailKind::Live
    } else {
        DetailKind::Scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Confidence, MatchMethod, MatchStatus, MatchingInfo, ScheduledCall, ScheduledTrain};
    use std::io::Write;

    fn repo_with_route() -> StaticRepo {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("route_stations.csv")).unwrap();
        writeln!(f, "route_id,direction_id,seq,stop_id,stop_name,km,lat,lon,route_short_name,route_long_name,length_km,color_bg,color_fg").unwrap();
        writeln!(f, "R1,0,0,S0,Origin,0.0,40.00,-3.00,C1,Commuter One,20.0,,").unwrap();
        writeln!(f, "R1,0,1,S1,A,5.0,40.05,-3.00,C1,Commuter One,20.0,,").unwrap();
        writeln!(f, "R1,0,2,S2,B,10.0,40.10,-3.00,C1,Commuter One,20.0,,").unwrap();
        writeln!(f, "R1,0,3,S3,C,15.0,40.15,-3.00,C1,Commuter One,20.0,,").unwrap();
        writeln!(f, "R1,0,4,S4,Terminus,20.0,40.20,-3.00,C1,Commuter One,20.0,,").unwrap();
        let repo = StaticRepo::new(dir.path());
        repo.load().unwrap();
        repo
    }

    fn instance_with_train(realtime: Option<VehicleObservation>) -> ServiceInstance {
        let calls = (0..5)
            .map(|i| ScheduledCall {
                stop_id: StopId::from(format!("S{i}")),
                stop_sequence: i,
                arrival_sec_of_day: Some(8 * 3600 + i as i64 * 600),
                departure_sec_of_day: Some(8 * 3600 + i as i64 * 600 + 60),
                platform_code: None,
                pickup_type: None,
                drop_off_type: None,
            })
            .collect();
        let train = ScheduledTrain {
            trip_id: CompactString::from("T1"),
            route_id: CompactString::from("R1"),
            direction_id: CompactString::from("0"),
            service_date: chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
            headsign: None,
            train_number: Some(CompactString::from("4521")),
            nucleus_id: None,
            calls,
        };
        ServiceInstance {
            service_instance_id: CompactString::from("20260105:T1"),
            scheduled_trip_id: Some(CompactString::from("T1")),
            route_id: Some(CompactString::from("R1")),
            direction_id: Some(CompactString::from("0")),
            scheduled: Some(train),
            realtime,
            matching: MatchingInfo { status: MatchStatus::Matched, confidence: Some(Confidence::High), method: MatchMethod::TripId },
        }
    }

    fn vehicle(stop_id: &str, status: VehicleStopStatus, lat: f64, lon: f64) -> VehicleObservation {
        VehicleObservation {
            train_id: CompactString::from("V1"),
            trip_id: Some(CompactString::from("T1")),
            route_id: Some(CompactString::from("R1")),
            direction_id: Some(CompactString::from("0")),
            lat: Some(lat),
            lon: Some(lon),
            speed_kmh: Some(40.0),
            bearing: None,
            stop_id: Some(StopId::from(stop_id)),
            current_status: status,
            ts_unix: 0,
            label: None,
            nucleus_id: None,
            platform_by_stop: HashMap::new(),
        }
    }

    #[test]
    fn stopped_at_known_stop_yields_zero_progress_and_current_status() {
        let repo = repo_with_route();
        let passes = PassRecorder::new();
        let habits_dir = tempfile::tempdir().unwrap();
        let habits = PlatformHabits::new(habits_dir.path());
        let tz = chrono_tz::Europe::Madrid;
        let instance = instance_with_train(Some(vehicle("S2", VehicleStopStatus::StoppedAt, 40.10, -3.00)));
        let view = build_trip_view(&instance, &repo, None, None, &passes, &habits, &tz, 1000);
        assert_eq!(view.next_stop_progress_pct, 0.0);
        let row = view.stops.iter().find(|r| r.stop_id == "S2").unwrap();
        assert_eq!(row.status, StopStatus::Current);
    }

    #[test]
    fn at_most_one_current_and_one_next_row() {
        let repo = repo_with_route();
        let passes = PassRecorder::new();
        let habits_dir = tempfile::tempdir().unwrap();
        let habits = PlatformHabits::new(habits_dir.path());
        let tz = chrono_tz::Europe::Madrid;
        let instance = instance_with_train(Some(vehicle("S2", VehicleStopStatus::InTransitTo, 40.08, -3.00)));
        let view = build_trip_view(&instance, &repo, None, None, &passes, &habits, &tz, 1000);
        assert!(view.stops.iter().filter(|r| r.status == StopStatus::Current).count() <= 1);
        assert!(view.stops.iter().filter(|r| r.status == StopStatus::Next).count() <= 1);
    }

    #[test]
    fn anti_backtrack_restores_forward_position() {
        let repo = repo_with_route();
        let passes = PassRecorder::new();
        let habits_dir = tempfile::tempdir().unwrap();
        let habits = PlatformHabits::new(habits_dir.path());
        let tz = chrono_tz::Europe::Madrid;

        let advanced = instance_with_train(Some(vehicle("S3", VehicleStopStatus::StoppedAt, 40.15, -3.00)));
        build_trip_view(&advanced, &repo, None, None, &passes, &habits, &tz, 2000);
        assert_eq!(passes.get_last_seq("20260105:T1"), 3);

        let glitched = instance_with_train(Some(vehicle("S1", VehicleStopStatus::StoppedAt, 40.05, -3.00)));
        let view = build_trip_view(&glitched, &repo, None, None, &passes, &habits, &tz, 2100);
        assert_eq!(view.current_stop_id.as_deref(), Some("S3"), "must not move backwards");
    }
}
