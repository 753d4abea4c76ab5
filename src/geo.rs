//! Great-circle distance, local-frame segment projection, and the time/date
//! helpers shared by C2, C3, C7 and C8. Grounded in `shapes_repo.py`'s
//! `_haversine_m`/`_project_fraction_on_segment` and `models.py::Stop.distance_km_to`.

use chrono::{NaiveDate, TimeZone};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two lat/lon points.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlmb = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlmb / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Parametric projection of point P onto segment A-B in a local equirectangular
/// frame centered at the segment's mean latitude (§4.2 step 1). Returns `t`,
/// unclamped: `t < 0` or `t > 1` means P projects outside the segment.
pub fn project_fraction_on_segment(
    lat_a: f64,
    lon_a: f64,
    lat_b: f64,
    lon_b: f64,
    lat_p: f64,
    lon_p: f64,
) -> Option<f64> {
    let mean_lat_rad = ((lat_a + lat_b) / 2.0).to_radians();
    let cos_mean = mean_lat_rad.cos();
    let ax = lon_a.to_radians() * cos_mean * EARTH_RADIUS_M;
    let ay = lat_a.to_radians() * EARTH_RADIUS_M;
    let bx = lon_b.to_radians() * cos_mean * EARTH_RADIUS_M;
    let by = lat_b.to_radians() * EARTH_RADIUS_M;
    let px = lon_p.to_radians() * cos_mean * EARTH_RADIUS_M;
    let py = lat_p.to_radians() * EARTH_RADIUS_M;

    let dx = bx - ax;
    let dy = by - ay;
    let denom = dx * dx + dy * dy;
    if denom <= 0.0 {
        return None;
    }
    Some(((px - ax) * dx + (py - ay) * dy) / denom)
}

/// Straight-segment projection fallback used by C7 when no Shape is available:
/// returns the fraction along (from, to) that the point falls at, clamped to
/// [0, 1], or `None` if the segment is degenerate.
pub fn project_fraction_clamped(
    lat_a: f64,
    lon_a: f64,
    lat_b: f64,
    lon_b: f64,
    lat_p: f64,
    lon_p: f64,
) -> Option<f64> {
    project_fraction_on_segment(lat_a, lon_a, lat_b, lon_b, lat_p, lon_p)
        .map(|t| t.clamp(0.0, 1.0))
}

/// Resolve a `(service_date, sec_of_day)` pair to an absolute unix epoch in the
/// given service timezone. `sec_of_day` may exceed 86_399 for trips that run
/// past midnight; this extends naturally rather than wrapping.
pub fn date_and_sec_of_day_to_epoch(date: NaiveDate, sec_of_day: i64, tz: &chrono_tz::Tz) -> i64 {
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight always valid");
    let local = tz
        .from_local_datetime(&midnight)
        .single()
        .unwrap_or_else(|| tz.from_utc_datetime(&midnight));
    local.timestamp() + sec_of_day
}

/// §9: "minutes displayed to the user" = `max(0, ceil(delta/60))`.
pub fn display_minutes(delta_s: i64) -> i64 {
    if delta_s <= 0 {
        0
    } else {
        (delta_s + 59) / 60
    }
}

/// §9: "minutes of delay" = `sign(delta) * floor(|delta|/60)`.
pub fn delay_minutes(delta_s: i32) -> i32 {
    let sign = delta_s.signum();
    sign * (delta_s.abs() / 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_for_identical_points() {
        assert!(haversine_m(40.0, -3.0, 40.0, -3.0) < 1e-6);
    }

    #[test]
    fn haversine_one_degree_longitude_at_equator_is_about_111km() {
        let d = haversine_m(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
    }

    #[test]
    fn projection_midpoint_is_half() {
        let t = project_fraction_clamped(40.0, -3.0, 40.0, -2.0, 40.0, -2.5).unwrap();
        assert!((t - 0.5).abs() < 0.01, "got {t}");
    }

    #[test]
    fn projection_outside_segment_reports_unclamped_t() {
        let t = project_fraction_on_segment(40.0, -3.0, 40.0, -2.0, 40.0, -1.0).unwrap();
        assert!(t > 1.0, "got {t}");
    }

    #[test]
    fn display_minutes_rounds_up() {
        assert_eq!(display_minutes(61), 2);
        assert_eq!(display_minutes(60), 1);
        assert_eq!(display_minutes(0), 0);
        assert_eq!(display_minutes(-5), 0);
    }

    #[test]
    fn delay_minutes_floors_by_magnitude_preserving_sign() {
        assert_eq!(delay_minutes(125), 2);
        assert_eq!(delay_minutes(-125), -2);
        assert_eq!(delay_minutes(59), 0);
    }

    #[test]
    fn sec_of_day_past_midnight_extends_naturally() {
        let tz: chrono_tz::Tz = chrono_tz::Europe::Madrid;
        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let e_2359 = date_and_sec_of_day_to_epoch(date, 23 * 3600 + 59 * 60, &tz);
        let e_2501 = date_and_sec_of_day_to_epoch(date, 25 * 3600 + 60, &tz);
        assert!(e_2501 > e_2359);
    }
}
