//! C2 — Shapes Index (§4.2). Grounded in `shapes_repo.py`: per route_id picks
//! the most frequent shape_id across its trips (lexicographically-smallest on
//! ties), accumulates cumulative haversine distance along each shape, and
//! projects a lat/lon onto the chosen polyline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;

use crate::domain::{DirectionId, RouteId};
use crate::geo::{haversine_m, project_fraction_on_segment};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShapePoint {
    pub lat: f64,
    pub lon: f64,
    pub cum_m: f64,
}

#[derive(Debug, Deserialize)]
struct ShapeRow {
    shape_id: String,
    shape_pt_lat: f64,
    shape_pt_lon: f64,
    shape_pt_sequence: i64,
}

#[derive(Debug, Deserialize)]
struct TripRow {
    route_id: String,
    #[serde(default)]
    direction_id: String,
    #[serde(default)]
    shape_id: String,
}

#[derive(Default)]
struct Tables {
    polylines: HashMap<String, Vec<ShapePoint>>,
    route_dir_shape: HashMap<(RouteId, DirectionId), String>,
    route_shape: HashMap<RouteId, String>,
}

pub struct ShapesIndex {
    gtfs_raw_dir: PathBuf,
    tables: RwLock<Tables>,
    loaded: std::sync::atomic::AtomicBool,
}

impl ShapesIndex {
    pub fn new(gtfs_raw_dir: impl AsRef<Path>) -> Self {
        Self {
            gtfs_raw_dir: gtfs_raw_dir.as_ref().to_path_buf(),
            tables: RwLock::new(Tables::default()),
            loaded: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn load(&self) {
        use std::sync::atomic::Ordering;
        if self.loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tables = Tables::default();
        self.load_shapes(&mut tables);
        self.load_route_shape_mapping(&mut tables);
        *self.tables.write().unwrap() = tables;
    }

    fn load_shapes(&self, tables: &mut Tables) {
        let path = self.gtfs_raw_dir.join("shapes.txt");
        if !path.exists() {
            return;
        }
        let mut by_shape: HashMap<String, Vec<(i64, f64, f64)>> = HashMap::new();
        let Ok(mut rdr) = csv::Reader::from_path(&path) else {
            return;
        };
        for row in rdr.deserialize::<ShapeRow>().flatten() {
            by_shape
                .entry(row.shape_id)
                .or_default()
                .push((row.shape_pt_sequence, row.shape_pt_lat, row.shape_pt_lon));
        }
        for (shape_id, mut pts) in by_shape {
            pts.sort_by_key(|(seq, _, _)| *seq);
            let mut poly = Vec::with_capacity(pts.len());
            let mut cum_m = 0.0;
            let mut prev: Option<(f64, f64)> = None;
            for (_, lat, lon) in pts {
                if let Some((plat, plon)) = prev {
                    cum_m += haversine_m(plat, plon, lat, lon);
                }
                poly.push(ShapePoint { lat, lon, cum_m });
                prev = Some((lat, lon));
            }
            if poly.len() >= 2 {
                tables.polylines.insert(shape_id, poly);
            }
        }
    }

    fn load_route_shape_mapping(&self, tables: &mut Tables) {
        let path = self.gtfs_raw_dir.join("trips.txt");
        if !path.exists() {
            return;
        }
        let Ok(mut rdr) = csv::Reader::from_path(&path) else {
            return;
        };
        let mut counts: HashMap<(String, String, String), u32> = HashMap::new();
        let mut counts_route: HashMap<(String, String), u32> = HashMap::new();
        for row in rdr.deserialize::<TripRow>().flatten() {
            if row.route_id.is_empty() || row.shape_id.is_empty() {
                continue;
            }
            *counts
                .entry((row.route_id.clone(), row.direction_id.clone(), row.shape_id.clone()))
                .or_insert(0) += 1;
            *counts_route
                .entry((row.route_id.clone(), row.shape_id.clone()))
                .or_insert(0) += 1;
        }

        fn choose(items: impl Iterator<Item = (String, u32)>) -> Option<String> {
            let mut best: Option<(String, u32)> = None;
            for (sid, cnt) in items {
                best = Some(match best {
                    None => (sid, cnt),
                    Some((bsid, bcnt)) => {
                        if cnt > bcnt || (cnt == bcnt && sid < bsid) {
                            (sid, cnt)
                        } else {
                            (bsid, bcnt)
                        }
                    }
                });
            }
            best.map(|(sid, _)| sid)
        }

        let mut by_route_dir: HashMap<(String, String), HashMap<String, u32>> = HashMap::new();
        for ((rid, did, sid), cnt) in &counts {
            *by_route_dir
                .entry((rid.clone(), did.clone()))
                .or_default()
                .entry(sid.clone())
                .or_insert(0) += cnt;
        }
        for ((rid, did), cmap) in by_route_dir {
            if let Some(chosen) = choose(cmap.into_iter()) {
                tables
                    .route_dir_shape
                    .insert((RouteId::from(rid), DirectionId::from(did)), chosen);
            }
        }

        let mut by_route: HashMap<String, HashMap<String, u32>> = HashMap::new();
        for ((rid, sid), cnt) in &counts_route {
            *by_route
                .entry(rid.clone())
                .or_default()
                .entry(sid.clone())
                .or_insert(0) += cnt;
        }
        for (rid, cmap) in by_route {
            if let Some(chosen) = choose(cmap.into_iter()) {
                tables.route_shape.insert(RouteId::from(rid), chosen);
            }
        }
    }

    /// `polyline_for_route`: tries the given direction, then "0", "1", "", then
    /// falls back to the route-only mapping.
    pub fn polyline_for_route(&self, route_id: &str, direction_id: Option<&str>) -> Option<Vec<ShapePoint>> {
        let tables = self.tables.read().unwrap();
        let mut dir_candidates: Vec<String> = Vec::new();
        if let Some(d) = direction_id {
            dir_candidates.push(d.to_string());
        }
        dir_candidates.extend(["0".to_string(), "1".to_string(), "".to_string()]);

        let mut shape_id = None;
        for d in dir_candidates {
            if let Some(sid) = tables
                .route_dir_shape
                .get(&(RouteId::from(route_id), DirectionId::from(d)))
            {
                shape_id = Some(sid.clone());
                break;
            }
        }
        let shape_id = shape_id.or_else(|| tables.route_shape.get(route_id).cloned())?;
        tables.polylines.get(&shape_id).cloned()
    }

    /// `project(polyline, lat, lon) -> cum_m?` (§4.2).
    pub fn project(polyline: &[ShapePoint], lat: f64, lon: f64) -> Option<f64> {
        if polyline.len() < 2 {
            return None;
        }
        let mut best_cum = None;
        let mut best_err = f64::INFINITY;
        for w in polyline.windows(2) {
            let (a, b) = (w[0], w[1]);
            let Some(t) = project_fraction_on_segment(a.lat, a.lon, b.lat, b.lon, lat, lon) else {
                continue;
            };
            let t_clamped = t.clamp(0.0, 1.0);
            let lat_p = a.lat + (b.lat - a.lat) * t_clamped;
            let lon_p = a.lon + (b.lon - a.lon) * t_clamped;
            let mut err = haversine_m(lat, lon, lat_p, lon_p);
            if !(0.0..=1.0).contains(&t) {
                err *= 1.5;
            }
            let cum = a.cum_m + (b.cum_m - a.cum_m) * t_clamped;
            if err < best_err {
                best_err = err;
                best_cum = Some(cum);
            }
        }
        best_cum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(dir: &Path) {
        let mut shapes = std::fs::File::create(dir.join("shapes.txt")).unwrap();
        writeln!(shapes, "shape_id,shape_pt_lat,shape_pt_lon,shape_pt_sequence").unwrap();
        writeln!(shapes, "SH1,40.0,-3.0,0").unwrap();
        writeln!(shapes, "SH1,40.1,-3.0,1").unwrap();
        writeln!(shapes, "SH1,40.2,-3.0,2").unwrap();

        let mut trips = std::fs::File::create(dir.join("trips.txt")).unwrap();
        writeln!(trips, "route_id,direction_id,shape_id,trip_id,service_id").unwrap();
        writeln!(trips, "R1,0,SH1,T1,SVC").unwrap();
        writeln!(trips, "R1,0,SH1,T2,SVC").unwrap();
    }

    #[test]
    fn picks_most_frequent_shape_and_projects_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path());
        let idx = ShapesIndex::new(dir.path());
        idx.load();

        let poly = idx.polyline_for_route("R1", Some("0")).expect("polyline");
        assert_eq!(poly.len(), 3);
        assert!(poly[2].cum_m > poly[1].cum_m);

        let cum_start = ShapesIndex::project(&poly, 40.0, -3.0).unwrap();
        let cum_mid = ShapesIndex::project(&poly, 40.1, -3.0).unwrap();
        assert!(cum_mid > cum_start);
    }

    #[test]
    fn project_returns_none_for_short_polyline() {
        assert_eq!(ShapesIndex::project(&[ShapePoint { lat: 0.0, lon: 0.0, cum_m: 0.0 }], 0.0, 0.0), None);
    }

    #[test]
    fn missing_shapes_file_yields_no_polyline() {
        let dir = tempfile::tempdir().unwrap();
        let idx = ShapesIndex::new(dir.path());
        idx.load();
        assert!(idx.polyline_for_route("R1", Some("0")).is_none());
    }
}
