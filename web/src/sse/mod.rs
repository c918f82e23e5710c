//! SSE HTTP handler for the web layer.
//!
//! This module contains only the Axum handler for channel subscriptions.
//! The dispatch machinery (EventSource, subscriber queues, hooks) lives in
//! the `sse` crate.

pub mod handler;
