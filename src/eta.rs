//! C8 — ETA Fusion (§4.8). Pure function over one service's ordered stop
//! schedule: chooses a pivot stop, anchors its ETA against the trip update or
//! a minimum physically-reachable time, then propagates a constant delay
//! downstream with per-stop trip-update overrides and minimum-headway
//! enforcement. Grounded in `eta_projector.py`'s `_select_eta_pivot_and_delay_s`
//! / `_constant_delay_eta_stream` split.

use crate::domain::{StopId, TripUpdateItem, VehicleObservation, VehicleStopStatus};

const MIN_HEADWAY_S: i64 = 5;
const PHYS_MIN_LEAD_S: i64 = 5;

#[derive(Clone, Debug)]
pub struct StopSchedule {
    pub stop_id: StopId,
    pub sched_arr: Option<i64>,
    pub sched_dep: Option<i64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FusedEta {
    pub stop_id: StopId,
    pub epoch: i64,
    pub delay_s: i32,
}

fn pivot_index(stops: &[StopSchedule], tu: Option<&TripUpdateItem>, next_stop_id: Option<&str>, now: i64) -> usize {
    if let Some(next) = next_stop_id {
        if let Some(i) = stops.iter().position(|s| s.stop_id == next) {
            return i;
        }
    }
    if let Some(tu) = tu {
        let first_future = tu
            .stop_time_update
            .iter()
            .filter(|u| u.schedule_relationship != crate::domain::StopScheduleRelationship::Skipped)
            .find(|u| u.arrival_epoch.map(|e| e >= now).unwrap_or(false))
            .and_then(|u| u.stop_id.as_deref());
        if let Some(stop_id) = first_future {
            if let Some(i) = stops.iter().position(|s| s.stop_id == stop_id) {
                return i;
            }
        }
    }
    stops
        .iter()
        .position(|s| s.sched_arr.map(|a| a >= now).unwrap_or(false))
        .unwrap_or(0)
}

/// `fuse_etas(stops, tu, vehicle, next_stop_id, downstream_tu_override, now)` (§4.8).
pub fn fuse_etas(
    stops: &[StopSchedule],
    tu: Option<&TripUpdateItem>,
    vehicle: Option<&VehicleObservation>,
    next_stop_id: Option<&str>,
    downstream_tu_override: bool,
    now: i64,
) -> Vec<FusedEta> {
    if stops.is_empty() {
        return Vec::new();
    }
    if tu.map(|t| t.is_canceled()).unwrap_or(false) {
        return Vec::new();
    }

    let pivot = pivot_index(stops, tu, next_stop_id, now);

    let vehicle_stopped_at_terminus = pivot == stops.len() - 1
        && vehicle
            .map(|v| v.current_status == VehicleStopStatus::StoppedAt && v.stop_id.as_deref() == Some(stops[pivot].stop_id.as_str()))
            .unwrap_or(false);
    if vehicle_stopped_at_terminus {
        return Vec::new();
    }

    let pivot_sched = &stops[pivot];
    let tu_arr_pivot = tu.and_then(|t| t.stop_update(&pivot_sched.stop_id)).and_then(|u| u.arrival_epoch);
    let vehicle_stopped_here = vehicle
        .map(|v| v.current_status == VehicleStopStatus::StoppedAt && v.stop_id.as_deref() == Some(pivot_sched.stop_id.as_str()))
        .unwrap_or(false);

    let eta_pivot = match tu_arr_pivot {
        Some(e) => e,
        None => {
            let eta_phys_min = if vehicle_stopped_here { now } else { now + PHYS_MIN_LEAD_S };
            let sched_pivot = pivot_sched.sched_arr.unwrap_or(now);
            eta_phys_min.max(sched_pivot)
        }
    };
    let delay_pivot_s = (eta_pivot - pivot_sched.sched_arr.unwrap_or(eta_pivot)) as i32;

    let mut out = Vec::with_capacity(stops.len() - pivot);
    let mut carried_delay = delay_pivot_s;
    let mut prev_eta: Option<i64> = None;

    for stop in &stops[pivot..] {
        let tu_override = if downstream_tu_override {
            tu.and_then(|t| t.stop_update(&stop.stop_id)).and_then(|u| u.arrival_epoch)
        } else {
            None
        };

        let mut eta = if stop.stop_id == pivot_sched.stop_id {
            eta_pivot
        } else if let Some(o) = tu_override {
            carried_delay = (o - stop.sched_arr.unwrap_or(o)) as i32;
            o
        } else {
            stop.sched_arr.unwrap_or(now) + carried_delay as i64
        };

        eta = eta.max(now + MIN_HEADWAY_S);
        if let Some(prev) = prev_eta {
            eta = eta.max(prev + MIN_HEADWAY_S);
        }
        prev_eta = Some(eta);

        out.push(FusedEta { stop_id: stop.stop_id.clone(), epoch: eta, delay_s: carried_delay });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StopScheduleRelationship, TripScheduleRelationship, TuStopTimeUpdate};
    use compact_str::CompactString;

    fn stops() -> Vec<StopSchedule> {
        (0..5)
            .map(|i| StopSchedule {
                stop_id: StopId::from(format!("S{i}")),
                sched_arr: Some(1000 + i * 600),
                sched_dep: Some(1010 + i * 600),
            })
            .collect()
    }

    fn tu_with_delay(pivot_stop: &str, delay: i64) -> TripUpdateItem {
        TripUpdateItem {
            trip_id: CompactString::from("T1"),
            route_id: None,
            direction_id: None,
            schedule_relationship: TripScheduleRelationship::Scheduled,
            delay: Some(delay as i32),
            timestamp: 0,
            stop_time_update: vec![TuStopTimeUpdate {
                stop_id: Some(StopId::from(pivot_stop)),
                stop_sequence: None,
                arrival_epoch: Some(1000 + delay),
                arrival_delay: Some(delay as i32),
                departure_epoch: None,
                departure_delay: None,
                schedule_relationship: StopScheduleRelationship::Scheduled,
                uncertainty: None,
            }],
            last_seen_unix: 0,
        }
    }

    #[test]
    fn delay_propagates_downstream_with_min_headway() {
        let stops = stops();
        let tu = tu_with_delay("S0", 180);
        let out = fuse_etas(&stops, Some(&tu), None, Some("S0"), false, 900);
        assert_eq!(out[0].epoch, 1180);
        for i in 1..out.len() {
            assert!(out[i].epoch >= out[i - 1].epoch + 5);
        }
        assert!(out.iter().all(|e| e.delay_s == 180));
    }

    #[test]
    fn canceled_trip_update_yields_no_etas() {
        let stops = stops();
        let mut tu = tu_with_delay("S0", 0);
        tu.schedule_relationship = TripScheduleRelationship::Canceled;
        let out = fuse_etas(&stops, Some(&tu), None, Some("S0"), false, 900);
        assert!(out.is_empty());
    }

    #[test]
    fn stopped_at_terminus_yields_no_downstream_etas() {
        let stops = stops();
        let last = stops.last().unwrap().stop_id.clone();
        let vehicle = VehicleObservation {
            train_id: CompactString::from("V1"),
            trip_id: None,
            route_id: None,
            direction_id: None,
            lat: None,
            lon: None,
            speed_kmh: None,
            bearing: None,
            stop_id: Some(last.clone()),
            current_status: VehicleStopStatus::StoppedAt,
            ts_unix: 0,
            label: None,
            nucleus_id: None,
            platform_by_stop: std::collections::HashMap::new(),
        };
        let out = fuse_etas(&stops, None, Some(&vehicle), Some(last.as_str()), false, 3500);
        assert!(out.is_empty());
    }

    #[test]
    fn no_trip_update_falls_back_to_physically_reachable_eta() {
        let stops = stops();
        let out = fuse_etas(&stops, None, None, Some("S0"), false, 500);
        assert_eq!(out[0].epoch, 1000, "sched time is later than now+5, wins");
    }
}
