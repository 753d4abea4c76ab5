//! Process-wide state: every component constructed once at startup and
//! shared behind `Arc` (§9 "module-level singletons become process-wide
//! state"). Mirrors the teacher's `AppState`, generalized from one
//! `GTFSManager` to the full C1-C10 component set.

use std::sync::Arc;

use crate::config::Config;
use crate::error::CoreError;
use crate::habits::PlatformHabits;
use crate::passes::PassRecorder;
use crate::scheduled::ScheduledTrainsMaterializer;
use crate::shapes_index::ShapesIndex;
use crate::static_repo::StaticRepo;
use crate::trip_updates::TripUpdatesCache;
use crate::vehicles::VehiclePositionsCache;

pub struct AppState {
    pub static_repo: Arc<StaticRepo>,
    pub shapes: Arc<ShapesIndex>,
    pub scheduled: Arc<ScheduledTrainsMaterializer>,
    pub vehicles: Arc<VehiclePositionsCache>,
    pub trip_updates: Arc<TripUpdatesCache>,
    pub passes: Arc<PassRecorder>,
    pub habits: Arc<PlatformHabits>,
    pub tz: chrono_tz::Tz,
}

impl AppState {
    /// Loads static tables and constructs every cache. Fatal (`StaticMissing`)
    /// if `route_stations.csv` or the GTFS `stop_times.txt`/`calendar.txt`
    /// inputs are absent, matching §7's policy for startup data.
    pub fn new(config: &Config) -> Result<Self, CoreError> {
        let static_repo = Arc::new(StaticRepo::new(&config.data_dir));
        static_repo.load()?;

        let shapes = Arc::new(ShapesIndex::new(&config.gtfs_raw_dir));
        shapes.load();

        let tz = chrono_tz::Europe::Madrid;
        let scheduled = Arc::new(ScheduledTrainsMaterializer::load(
            &config.gtfs_raw_dir,
            static_repo.clone(),
            tz,
        )?);

        let vehicles = Arc::new(VehiclePositionsCache::new(
            config.vehicle_positions_url.clone(),
            static_repo.clone(),
            scheduled.clone(),
            tz,
        ));

        let trip_updates = Arc::new(TripUpdatesCache::new(
            config.trip_updates_url.clone(),
            static_repo.clone(),
            scheduled.clone(),
            vehicles.clone(),
            tz,
        ));

        let passes = Arc::new(PassRecorder::new());
        let habits = Arc::new(PlatformHabits::new(&config.data_dir));

        Ok(Self { static_repo, shapes, scheduled, vehicles, trip_updates, passes, habits, tz })
    }
}
