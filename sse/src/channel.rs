use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::client::{ClientId, ClientInfo};

/// How long a channel may sit idle before the sweep closes it.
pub(crate) const CHANNEL_IDLE_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Cadence of the idle-channel sweep.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Returns true when `channel` is a usable channel identifier: one or more
/// characters from `a-z`, `0-9`, `_`, `-` and `/`.
pub fn valid_channel_name(channel: &str) -> bool {
    !channel.is_empty()
        && channel
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'/'))
}

/// A registered subscriber: its request metadata and the sending half of its
/// outbound queue. Dropping the queue sender ends the subscriber's stream.
pub(crate) struct Subscriber {
    pub(crate) info: ClientInfo,
    pub(crate) queue: mpsc::Sender<String>,
}

/// One named channel: its subscribers, the retained last broadcast, and the
/// idle clock the sweep consults.
pub(crate) struct Channel {
    pub(crate) subscribers: HashMap<ClientId, Subscriber>,
    pub(crate) last_message: Option<String>,
    pub(crate) last_active: Instant,
}

impl Channel {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            last_message: None,
            last_active: Instant::now(),
        }
    }

    /// Refresh the idle clock. Called on every membership change and every
    /// broadcast.
    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub(crate) fn expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.last_active) > CHANNEL_IDLE_EXPIRATION
    }
}
