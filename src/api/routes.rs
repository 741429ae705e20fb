//! API route definitions.

use axum::{
    Router,
    routing::{get, post},
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
pub fn router(state: AppState) -> Router {
    // Permissive CORS: any origin, method and header, preflight cached for
    // a day. Note: allow_credentials(true) is incompatible with the
    // wildcard origin in tower-http; the wildcard wins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(86_400));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/healthz", get(handlers::health))
        // Session management
        .route(
            "/sessions",
            post(handlers::create_session)
                .get(handlers::list_sessions)
                .delete(handlers::delete_all_sessions),
        )
        .route("/sessions/stats", get(handlers::session_stats))
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        // GPU information
        .route("/gpus", get(handlers::list_gpus))
        .route("/gpus/profiles", get(handlers::list_profiles))
        .route("/gpus/available", get(handlers::list_available_gpus))
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}
