use async_trait::async_trait;
use log::debug;
use sse::EventHooks;
use storage::Store;

/// Bridges the dispatcher's channel lifecycle to the last-message store:
/// a channel created for its first subscriber is seeded with whatever the
/// cache still holds for it.
pub struct StoreHooks {
    store: Store,
}

impl StoreHooks {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHooks for StoreHooks {
    async fn on_channel_create(&self, channel: &str) -> Option<String> {
        let seed = self.store.get(channel).await;
        if seed.is_some() {
            debug!("Channel '{channel}' seeded from cache.");
        }
        seed
    }
}
