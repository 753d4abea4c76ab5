//! C1 — Static Timetable Repository (§4.1). Read-only; loaded once at startup
//! from the derived `route_stations.csv`/`nucleos_map.csv`/`parity_map.json`
//! files (§6 Inputs) and swapped atomically on reload, the same
//! publish-and-swap discipline the teacher uses for `GtfsData`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use compact_str::CompactString;
use serde::Deserialize;

use crate::domain::{DirectionId, NucleusId, ParityEntry, ParityStatus, Route, RouteId, StationOnLine, Stop, StopId};
use crate::error::CoreError;

#[derive(Debug, Deserialize)]
struct RouteStationRow {
    route_id: String,
    direction_id: String,
    seq: u32,
    stop_id: String,
    stop_name: String,
    km: f64,
    lat: f64,
    lon: f64,
    route_short_name: String,
    route_long_name: String,
    length_km: f64,
    color_bg: Option<String>,
    color_fg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NucleusRow {
    route_id: String,
    nucleus_slug: String,
}

#[derive(Debug, Deserialize)]
struct ParityEntryRaw {
    even: String,
    odd: String,
    status: String,
}

struct Tables {
    /// (route_id, direction_id) -> Route, direction_id is always "0"/"1"/"".
    routes: HashMap<(RouteId, DirectionId), Route>,
    route_ids: Vec<RouteId>,
    nucleus_by_route: HashMap<RouteId, NucleusId>,
    routes_by_nucleus: HashMap<NucleusId, Vec<RouteId>>,
    parity: HashMap<RouteId, ParityEntry>,
    stop_names: HashMap<StopId, CompactString>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            routes: HashMap::new(),
            route_ids: Vec::new(),
            nucleus_by_route: HashMap::new(),
            routes_by_nucleus: HashMap::new(),
            parity: HashMap::new(),
            stop_names: HashMap::new(),
        }
    }
}

pub struct StaticRepo {
    data_dir: PathBuf,
    tables: Arc<RwLock<Tables>>,
}

impl StaticRepo {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            tables: Arc::new(RwLock::new(Tables::default())),
        }
    }

    /// Loads `route_stations.csv` (fatal if missing), `nucleos_map.csv` and
    /// `parity_map.json` (both optional: missing degrades to empty maps).
    pub fn load(&self) -> Result<(), CoreError> {
        let route_stations = self.data_dir.join("route_stations.csv");
        if !route_stations.exists() {
            return Err(CoreError::StaticMissing {
                path: route_stations.display().to_string(),
            });
        }

        let mut by_route: HashMap<(RouteId, DirectionId), Vec<RouteStationRow>> = HashMap::new();
        let mut rdr = csv::Reader::from_path(&route_stations).map_err(|e| CoreError::Parse {
            feed: "route_stations.csv",
            reason: e.to_string(),
        })?;
        for rec in rdr.deserialize::<RouteStationRow>() {
            let row = rec.map_err(|e| CoreError::Parse {
                feed: "route_stations.csv",
                reason: e.to_string(),
            })?;
            let key = (
                RouteId::from(row.route_id.clone()),
                DirectionId::from(row.direction_id.clone()),
            );
            by_route.entry(key).or_default().push(row);
        }

        let mut tables = Tables::default();
        for ((route_id, direction_id), mut rows) in by_route {
            rows.sort_by_key(|r| r.seq);
            let first = &rows[0];
            let mut stations: Vec<StationOnLine> = Vec::with_capacity(rows.len());
            for r in &rows {
                tables
                    .stop_names
                    .insert(StopId::from(r.stop_id.clone()), CompactString::from(r.stop_name.clone()));
                stations.push(StationOnLine {
                    seq: r.seq,
                    stop_id: StopId::from(r.stop_id.clone()),
                    stop_name: CompactString::from(r.stop_name.clone()),
                    km_from_origin: r.km,
                    lat: r.lat,
                    lon: r.lon,
                });
            }
            let route = Route {
                route_id: route_id.clone(),
                short_name: CompactString::from(first.route_short_name.clone()),
                long_name: CompactString::from(first.route_long_name.clone()),
                direction_id: direction_id.clone(),
                nucleus_id: None,
                stations,
                length_km: first.length_km,
                color_bg: first.color_bg.clone().map(CompactString::from),
                color_fg: first.color_fg.clone().map(CompactString::from),
            };
            if !tables.route_ids.contains(&route_id) {
                tables.route_ids.push(route_id.clone());
            }
            tables.routes.insert((route_id, direction_id), route);
        }

        let nucleos_map = self.data_dir.join("nucleos_map.csv");
        if nucleos_map.exists() {
            if let Ok(mut rdr) = csv::Reader::from_path(&nucleos_map) {
                for rec in rdr.deserialize::<NucleusRow>().flatten() {
                    let rid = RouteId::from(rec.route_id);
                    let nuc = NucleusId::from(rec.nucleus_slug);
                    tables
                        .routes_by_nucleus
                        .entry(nuc.clone())
                        .or_default()
                        .push(rid.clone());
                    tables.nucleus_by_route.insert(rid, nuc);
                }
            }
            for ((rid, _did), route) in tables.routes.iter_mut() {
                route.nucleus_id = tables.nucleus_by_route.get(rid).cloned();
            }
        }

        let parity_map = self.data_dir.join("parity_map.json");
        if parity_map.exists() {
            if let Ok(text) = std::fs::read_to_string(&parity_map) {
                if let Ok(raw) = serde_json::from_str::<HashMap<String, ParityEntryRaw>>(&text) {
                    for (route_id, entry) in raw {
                        let status = match entry.status.as_str() {
                            "final" => ParityStatus::Final,
                            "tentative" => ParityStatus::Tentative,
                            _ => ParityStatus::Disabled,
                        };
                        tables.parity.insert(
                            RouteId::from(route_id),
                            ParityEntry {
                                even: DirectionId::from(entry.even),
                                odd: DirectionId::from(entry.odd),
                                status,
                            },
                        );
                    }
                }
            }
        }

        *self.tables.write().unwrap() = tables;
        Ok(())
    }

    /// `route(route_id, direction_id?)`: tries "", "0", "1" in order when unspecified.
    pub fn route(&self, route_id: &str, direction_id: Option<&str>) -> Option<Route> {
        let tables = self.tables.read().unwrap();
        let candidates: Vec<&str> = match direction_id {
            Some(d) => vec![d],
            None => vec!["", "0", "1"],
        };
        for d in candidates {
            if let Some(r) = tables
                .routes
                .get(&(RouteId::from(route_id), DirectionId::from(d)))
            {
                return Some(r.clone());
            }
        }
        None
    }

    pub fn list_routes(&self) -> Vec<RouteId> {
        self.tables.read().unwrap().route_ids.clone()
    }

    pub fn list_nuclei(&self) -> Vec<NucleusId> {
        self.tables
            .read()
            .unwrap()
            .routes_by_nucleus
            .keys()
            .cloned()
            .collect()
    }

    pub fn routes_by_nucleus(&self, nucleus: &str) -> Vec<RouteId> {
        self.tables
            .read()
            .unwrap()
            .routes_by_nucleus
            .get(nucleus)
            .cloned()
            .unwrap_or_default()
    }

    pub fn nucleus_for_route_id(&self, route_id: &str) -> Option<NucleusId> {
        self.tables
            .read()
            .unwrap()
            .nucleus_by_route
            .get(route_id)
            .cloned()
    }

    pub fn stop_name(&self, stop_id: &str) -> Option<CompactString> {
        self.tables.read().unwrap().stop_names.get(stop_id).cloned()
    }

    pub fn km_for_stop(&self, route_id: &str, direction_id: &str, stop_id: &str) -> Option<f64> {
        self.route(route_id, Some(direction_id))
            .and_then(|r| r.station_by_stop_id(stop_id).map(|s| s.km_from_origin))
    }

    pub fn stations_ordered(&self, route_id: &str, direction_id: &str) -> Vec<StationOnLine> {
        self.route(route_id, Some(direction_id))
            .map(|r| r.stations)
            .unwrap_or_default()
    }

    /// Every Route whose station list contains `stop_id` (used by C4's
    /// nucleus-enrichment fallback heuristic).
    pub fn routes_with_stop(&self, stop_id: &str) -> Vec<Route> {
        self.tables
            .read()
            .unwrap()
            .routes
            .values()
            .filter(|r| r.station_by_stop_id(stop_id).is_some())
            .cloned()
            .collect()
    }

    pub fn routes_by_short_name(&self, short_name: &str) -> Vec<Route> {
        self.tables
            .read()
            .unwrap()
            .routes
            .values()
            .filter(|r| r.short_name == short_name)
            .cloned()
            .collect()
    }

    /// `dir_for_parity(route_id, parity)`.
    pub fn dir_for_parity(&self, route_id: &str, parity: crate::domain::Parity) -> Option<(DirectionId, ParityStatus)> {
        let tables = self.tables.read().unwrap();
        let entry = tables.parity.get(route_id)?;
        let dir = match parity {
            crate::domain::Parity::Even => &entry.even,
            crate::domain::Parity::Odd => &entry.odd,
        };
        Some((dir.clone(), entry.status))
    }

    /// Minimal synthetic `Stop` view for a (route_id, direction_id, stop_id) triple.
    pub fn stop(&self, route_id: &str, direction_id: &str, stop_id: &str) -> Option<Stop> {
        let route = self.route(route_id, Some(direction_id))?;
        let station = route.station_by_stop_id(stop_id)?;
        Some(Stop {
            stop_id: station.stop_id.clone(),
            station_id: station.stop_id.clone(),
            route_id: route.route_id.clone(),
            direction_id: route.direction_id.clone(),
            seq: station.seq,
            km: station.km_from_origin,
            lat: station.lat,
            lon: station.lon,
            name: station.stop_name.clone(),
            nucleus_id: route.nucleus_id.clone(),
            slug: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal_fixture(dir: &Path) {
        let mut f = std::fs::File::create(dir.join("route_stations.csv")).unwrap();
        writeln!(
            f,
            "route_id,direction_id,seq,stop_id,stop_name,km,lat,lon,route_short_name,route_long_name,length_km,color_bg,color_fg"
        )
        .unwrap();
        writeln!(f, "R1,0,0,S1,Origin,0.0,40.0,-3.0,C1,Commuter One,10.0,,").unwrap();
        writeln!(f, "R1,0,1,S2,Middle,5.0,40.05,-3.0,C1,Commuter One,10.0,,").unwrap();
        writeln!(f, "R1,0,2,S3,End,10.0,40.1,-3.0,C1,Commuter One,10.0,,").unwrap();
    }

    #[test]
    fn missing_route_stations_csv_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let repo = StaticRepo::new(dir.path());
        assert!(matches!(repo.load(), Err(CoreError::StaticMissing { .. })));
    }

    #[test]
    fn loads_route_and_orders_stations_by_seq() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_fixture(dir.path());
        let repo = StaticRepo::new(dir.path());
        repo.load().unwrap();

        let route = repo.route("R1", Some("0")).expect("route present");
        assert_eq!(route.stations.len(), 3);
        assert_eq!(route.stations[0].stop_id, "S1");
        assert_eq!(route.stations[2].seq, 2);
        assert_eq!(repo.stop_name("S2").as_deref(), Some("Middle"));
    }

    #[test]
    fn route_lookup_tries_unspecified_then_0_then_1() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_fixture(dir.path());
        let repo = StaticRepo::new(dir.path());
        repo.load().unwrap();

        // No "" or "1" direction was loaded, only "0" — lookup without a direction must still find it.
        assert!(repo.route("R1", None).is_some());
    }

    #[test]
    fn missing_nucleus_and_parity_files_degrade_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_fixture(dir.path());
        let repo = StaticRepo::new(dir.path());
        repo.load().unwrap();

        assert!(repo.nucleus_for_route_id("R1").is_none());
        assert!(repo
            .dir_for_parity("R1", crate::domain::Parity::Even)
            .is_none());
    }
}
