use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use warp::Filter;

mod api;
mod config;
mod domain;
mod error;
mod eta;
mod geo;
mod habits;
mod matcher;
mod passes;
mod replaceable;
mod scheduled;
mod shapes_index;
mod state;
mod static_repo;
mod train_number;
mod trip_updates;
mod vehicles;
mod view;

use config::Config;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::from_env();
    log::info!("loading static tables from {} / {}", config.gtfs_raw_dir, config.data_dir);
    let state = Arc::new(AppState::new(&config)?);

    spawn_poll_loop(
        "vehicle_positions",
        config.poll_period_vehicles,
        {
            let state = state.clone();
            move |now| state.vehicles.poll_once(now)
        },
    );
    spawn_poll_loop(
        "trip_updates",
        config.poll_period_trip_updates,
        {
            let state = state.clone();
            move |now| state.trip_updates.poll_once(now)
        },
    );
    spawn_sweep_loop(state.clone());

    let routes = build_routes(state.clone());
    log::info!("server listening on 0.0.0.0:{}", config.port);
    warp::serve(routes).run(([0, 0, 0, 0], config.port)).await;

    Ok(())
}

/// Runs `poll` on a fixed period on a blocking thread, matching the teacher's
/// background-updater loop but parameterized per feed instead of hardcoded.
fn spawn_poll_loop(feed: &'static str, period: Duration, poll: impl Fn(i64) + Send + Sync + Clone + 'static) {
    tokio::spawn(async move {
        loop {
            let now = chrono::Utc::now().timestamp();
            let poll = poll.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || poll(now)).await {
                log::warn!("{feed} poll task panicked: {e}");
            }
            tokio::time::sleep(period).await;
        }
    });
}

/// Evicts stale C9 pass records once an hour (§4.9's 24h retention policy).
fn spawn_sweep_loop(state: Arc<AppState>) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            state.passes.sweep(chrono::Utc::now().timestamp());
        }
    });
}

#[derive(Deserialize)]
struct NextQuery {
    route_id: Option<String>,
    direction_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    allow_next_day: bool,
}

fn default_limit() -> usize {
    5
}

#[derive(Deserialize)]
struct ArrivalsQuery {
    #[serde(default)]
    downstream_tu_override: bool,
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn build_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    // GET /trains/{nucleus}/{identifier}
    let train_detail = warp::path!("trains" / String / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|nucleus: String, identifier: String, state: Arc<AppState>| {
            let now = chrono::Utc::now().timestamp();
            match api::build_train_detail_vm(&state, &nucleus, &identifier, now) {
                Some(vm) => warp::reply::with_status(warp::reply::json(&vm), warp::http::StatusCode::OK),
                None => warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"error": "train not found"})),
                    warp::http::StatusCode::NOT_FOUND,
                ),
            }
        });

    // GET /trains/{nucleus}/{identifier}/arrivals
    let train_arrivals = warp::path!("trains" / String / String / "arrivals")
        .and(warp::get())
        .and(warp::query::<ArrivalsQuery>())
        .and(with_state(state.clone()))
        .map(|nucleus: String, identifier: String, q: ArrivalsQuery, state: Arc<AppState>| {
            let now = chrono::Utc::now().timestamp();
            match api::build_train_detail_vm(&state, &nucleus, &identifier, now) {
                Some(vm) => {
                    let arrivals = api::build_rt_arrival_times_from_vm(&vm, &state.tz, q.downstream_tu_override);
                    warp::reply::with_status(warp::reply::json(&arrivals), warp::http::StatusCode::OK)
                }
                None => warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({"error": "train not found"})),
                    warp::http::StatusCode::NOT_FOUND,
                ),
            }
        });

    // GET /stops/{stop_id}/next
    let stop_next = warp::path!("stops" / String / "next")
        .and(warp::get())
        .and(warp::query::<NextQuery>())
        .and(with_state(state.clone()))
        .map(|stop_id: String, q: NextQuery, state: Arc<AppState>| {
            let now = chrono::Utc::now().timestamp();
            let preds = api::nearest_prediction_for_stop(
                &state,
                q.route_id.as_deref(),
                q.direction_id.as_deref(),
                &stop_id,
                q.limit,
                q.allow_next_day,
                now,
            );
            warp::reply::json(&preds)
        });

    // GET /debug/pollers
    let debug_pollers = warp::path!("debug" / "pollers")
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(|state: Arc<AppState>| {
            let now = chrono::Utc::now().timestamp();
            warp::reply::json(&serde_json::json!({
                "vehicle_positions": {
                    "errors_streak": state.vehicles.errors_streak(),
                    "last_snapshot_age_s": state.vehicles.last_snapshot_age_s(now),
                },
                "trip_updates": {
                    "errors_streak": state.trip_updates.errors_streak(),
                    "last_snapshot_age_s": state.trip_updates.last_snapshot_age_s(now),
                },
            }))
        });

    train_arrivals
        .or(train_detail)
        .or(stop_next)
        .or(debug_pollers)
        .boxed()
}
