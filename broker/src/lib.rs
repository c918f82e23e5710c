//! Bus subscriber: a durable fan-out subscription over AMQP 0.9.1.
//!
//! One [`Broker`] owns one connection to the bus. JSON envelopes published
//! to the exchange arrive on the `messages` stream; a lost connection is
//! reported once on the `connection_lost` stream while reconnection retries
//! in the background.

mod broker;
mod envelope;
pub mod error;

pub use broker::{Broker, BrokerStreams};
pub use envelope::{Envelope, JSON_CONTENT_TYPE};
pub use error::{Error, Result};
