use axum::routing::get;
use axum::Router;
use service::AppState;

use crate::controller::{stats_controller, status_controller};
use crate::sse;

/// GET / — identification body the original service answers with.
async fn index() -> &'static str {
    "Frodo"
}

pub fn define_routes(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/appstatus", get(status_controller::appstatus))
        .route("/api/stats", get(stats_controller::stats))
        // Every remaining path is a channel subscription; OPTIONS answers
        // the CORS preflight browsers send before subscribing cross-origin.
        .route(
            "/*channel",
            get(sse::handler::subscribe).options(sse::handler::preflight),
        )
        .with_state(app_state)
}
