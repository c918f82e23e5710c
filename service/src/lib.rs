use broker::Broker;
use sse::EventSource;
use storage::Store;

pub mod config;
pub mod logging;

pub use config::Config;
pub use logging::Logger;

// Service-level state containing only infrastructure concerns
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub event_source: EventSource,
    pub broker: Broker,
    pub store: Option<Store>,
}

impl AppState {
    pub fn new(
        config: Config,
        event_source: EventSource,
        broker: Broker,
        store: Option<Store>,
    ) -> Self {
        Self {
            config,
            event_source,
            broker,
            store,
        }
    }
}
