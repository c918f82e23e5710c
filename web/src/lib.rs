//! HTTP surface: the router, the event-stream handler, and the status and
//! stats endpoints.

mod controller;
pub mod error;
pub mod router;
mod sse;

pub use error::{Error, Result};
pub use router::define_routes;
