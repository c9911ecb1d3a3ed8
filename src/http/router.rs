//! Router configuration for the HTTP API.

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request},
    http::HeaderName,
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::error::{set_dev_mode, REVISION_HEADER};
use super::handlers;
use super::state::AppState;

/// Count and time every request by matched route.
async fn track_metrics(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();

    metrics::counter!(crate::observability::REQUESTS_TOTAL, "route" => route.clone(), "status" => status)
        .increment(1);
    metrics::histogram!(crate::observability::REQUEST_DURATION_SECONDS, "route" => route)
        .record(start.elapsed().as_secs_f64());
    response
}

/// Create the application router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    set_dev_mode(state.config.dev_mode);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(REVISION_HEADER)]);

    Router::new()
        .route("/health", get(handlers::health_check))
        // Edit lock
        .route("/lock/status", get(handlers::lock_status))
        .route("/lock/acquire", post(handlers::acquire_lock))
        .route("/lock/renew", post(handlers::renew_lock))
        .route("/lock/release", post(handlers::release_lock))
        // Groups and locations
        .route("/groups/{id}", put(handlers::upsert_group))
        .route("/groups/{id}/status", put(handlers::set_group_status))
        .route("/groups/{id}/schedules", get(handlers::get_group_schedules))
        .route("/groups/{id}/schedules/batch", post(handlers::replace_group_schedules))
        .route("/locations/{id}", put(handlers::upsert_location))
        // Single assignments
        .route("/activities", get(handlers::list_activities).post(handlers::create_activity))
        .route(
            "/activities/{id}",
            put(handlers::update_activity).delete(handlers::delete_activity),
        )
        // Planning
        .route("/planning/export", post(handlers::export_plan))
        .route("/planning/import", post(handlers::import_plan))
        .route("/planning/allocate", post(handlers::allocate_plan))
        // Solver previews
        .route("/solver-preview-runs", post(handlers::create_solver_run))
        .route("/solver-preview-runs/{id}", get(handlers::get_solver_run))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
