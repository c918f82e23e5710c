use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use service::AppState;

#[derive(Debug, Serialize)]
pub struct ChannelStats {
    pub client_count: usize,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub channel_count: usize,
    pub client_count: usize,
    pub channels: HashMap<String, ChannelStats>,
}

/// GET /api/stats — aggregate connection counts, overall and per channel.
pub async fn stats(State(app_state): State<AppState>) -> Json<Stats> {
    let event_source = &app_state.event_source;

    let channels = event_source.channels().await;
    let mut per_channel = HashMap::with_capacity(channels.len());

    for name in &channels {
        per_channel.insert(
            name.clone(),
            ChannelStats {
                client_count: event_source.connection_count_per_channel(name).await,
            },
        );
    }

    Json(Stats {
        channel_count: channels.len(),
        client_count: event_source.connection_count().await,
        channels: per_channel,
    })
}
