use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use ::sse::{outbound_queue, valid_channel_name, ClientId, ClientInfo, EventSource};
use async_stream::stream;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use log::debug;
use service::AppState;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{Error, Result};

/// Heart-beat cadence on idle streams.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Comment frame that keeps intermediaries from timing out the stream.
const KEEP_ALIVE_FRAME: &str = ": keep-alive\n\n";

/// Unregisters the subscriber when its response stream goes away: peer
/// close, a failed write, and the dispatcher closing the queue all end up
/// dropping the stream, and RemoveClient is idempotent on the dispatcher
/// side.
struct Unregister {
    event_source: EventSource,
    id: ClientId,
    channel: String,
}

impl Drop for Unregister {
    fn drop(&mut self) {
        self.event_source
            .remove_client(self.id.clone(), self.channel.clone());
    }
}

/// GET on a channel path: registers a subscriber and answers with a
/// long-lived `text/event-stream` response fed from its outbound queue.
pub(crate) async fn subscribe(
    State(app_state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response> {
    // Channel name is the full request path.
    let channel = format!("/{path}");
    if !valid_channel_name(&channel) {
        return Err(Error::ChannelNotFound);
    }

    let info = ClientInfo {
        id: ClientId::new(),
        channel: channel.clone(),
        ip: client_ip(&headers, peer),
    };
    debug!("Establishing event stream for '{}' on '{channel}'.", info.ip);

    let (queue, mut outbound) = outbound_queue();

    if !app_state.event_source.add_client(info.clone(), queue) {
        return Err(Error::StreamingUnsupported);
    }

    let guard = Unregister {
        event_source: app_state.event_source.clone(),
        id: info.id,
        channel,
    };

    let body = stream! {
        // Moved into the stream so its drop runs when the stream is dropped,
        // whichever side ends it first.
        let _guard = guard;

        let mut heartbeat = interval(KEEP_ALIVE_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                received = outbound.recv() => match received {
                    Some(payload) => {
                        yield Ok::<Bytes, Infallible>(Bytes::from(format!("data: {payload}\n\n")));
                    }
                    // Queue closed by the dispatcher: channel close or shutdown.
                    None => break,
                },
                _ = heartbeat.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_FRAME));
                }
            }
        }
    };

    let mut response = axum::http::Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive");

    if app_state.config.cors {
        response = cors_headers(response);
    }

    response
        .body(Body::from_stream(body))
        .map_err(|_| Error::StreamingUnsupported)
}

/// OPTIONS on a channel path: the preflight answer browsers need before
/// opening a cross-origin event stream. Carries the same CORS headers as
/// the stream response, with an empty body.
pub(crate) async fn preflight(State(app_state): State<AppState>) -> Response {
    let mut response = axum::http::Response::builder();

    if app_state.config.cors {
        response = cors_headers(response);
    }

    response.body(Body::empty()).unwrap_or_default()
}

fn cors_headers(builder: axum::http::response::Builder) -> axum::http::response::Builder {
    builder
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS")
        .header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            "Keep-Alive, X-Requested-With, Cache-Control, Content-Type, Last-Event-ID",
        )
}

/// First hop of X-Forwarded-For when present, else the socket peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}
