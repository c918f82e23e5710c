//! Channel-partitioned Event Source dispatch.
//!
//! This crate is the heart of the bridge: a single-writer dispatch loop that
//! owns every channel, every subscriber, and every retained last message.
//!
//! # Architecture
//!
//! - **Single writer**: one spawned task owns the registry. Everything else
//!   (HTTP handlers, the bus bridge, the sweep timer) posts commands to it
//!   and never touches the state directly.
//! - **Channels are lazy**: a channel exists from the first subscriber
//!   registration until its last subscriber leaves (or, with retention on,
//!   until the idle sweep reaps it).
//! - **Per-subscriber queues**: each subscriber owns the receiving half of a
//!   bounded queue; the dispatcher owns the sending half and closing it is
//!   the one and only way a subscriber's stream is ended.
//! - **Last-message retention**: every broadcast lands in the channel's
//!   last-message slot. With retention enabled, the slot is replayed to late
//!   joiners and can be seeded through the [`EventHooks::on_channel_create`]
//!   callback when the channel first appears.
//!
//! # Message flow
//!
//! 1. An HTTP handler builds a [`ClientInfo`] and an [`outbound_queue`] pair
//!    and registers them via [`EventSource::add_client`].
//! 2. The bus bridge posts payloads via [`EventSource::send_message`]; the
//!    loop fans each payload out to the channel's subscriber queues in
//!    broadcast order.
//! 3. When the peer goes away the handler posts
//!    [`EventSource::remove_client`]; when the bus connection is lost the
//!    bridge posts [`EventSource::close_all_channels`] and every stream ends.

mod channel;
mod client;
mod dispatcher;
mod hooks;

pub use channel::valid_channel_name;
pub use client::{outbound_queue, ClientId, ClientInfo, OUTBOUND_QUEUE_CAPACITY};
pub use dispatcher::{EventSource, Settings};
pub use hooks::{EventHooks, NoopHooks};
