use async_trait::async_trait;

use crate::client::ClientInfo;

/// Callbacks fired from inside the dispatch loop.
///
/// Hooks are serialized with every other command: while one runs, no client
/// is added or removed and no message is broadcast. Implementations must
/// therefore stay short; a hook that blocks stalls all dispatch.
#[async_trait]
pub trait EventHooks: Send + Sync {
    /// A channel was just created. The returned value, if any, seeds the
    /// channel's last-message slot; the seed is consulted only when
    /// retention is enabled.
    async fn on_channel_create(&self, _channel: &str) -> Option<String> {
        None
    }

    /// A subscriber was added to a channel.
    async fn on_client_connect(&self, _client: &ClientInfo) {}

    /// A subscriber was removed from a channel.
    async fn on_client_disconnect(&self, _client: &ClientInfo) {}

    /// A channel lost its last subscriber and was destroyed.
    async fn on_channel_close(&self, _channel: &str) {}
}

/// Hooks that do nothing.
pub struct NoopHooks;

#[async_trait]
impl EventHooks for NoopHooks {}
