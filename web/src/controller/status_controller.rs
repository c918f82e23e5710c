use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use service::AppState;

/// GET /appstatus — bus (and cache, when configured) liveness in the
/// key:value format the deployment health checks scrape. The bus being
/// unreachable is the only condition that turns the response into a 500.
pub async fn appstatus(State(app_state): State<AppState>) -> impl IntoResponse {
    let broker_ok = app_state.broker.ping().await;

    let body = match &app_state.store {
        Some(store) => {
            let cache_ok = store.ping().await;
            format!(
                "status:{},cache:{},broker:{}",
                broker_ok && cache_ok,
                cache_ok,
                broker_ok
            )
        }
        None => format!("status:{broker_ok}"),
    };

    let status_code = if broker_ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status_code, body)
}
