use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of a subscriber's outbound queue. Broadcasts await queue space,
/// so a subscriber that stops draining eventually stalls dispatch until its
/// peer disconnect is observed.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

/// Unique identifier for a subscriber handle (server-generated)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-request subscriber record: which channel the request subscribed to
/// and where it came from.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: ClientId,
    pub channel: String,
    pub ip: String,
}

/// Creates the outbound queue pair for a new subscriber. The sending half is
/// handed to the dispatcher on registration; the receiving half feeds the
/// subscriber's event stream.
pub fn outbound_queue() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }
}
