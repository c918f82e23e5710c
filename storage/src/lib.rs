//! Optional last-message store: a pooled Redis client holding the most
//! recent payload per channel, used to seed channels when they are created.

pub mod error;
mod store;

pub use error::{Error, Result};
pub use store::Store;
