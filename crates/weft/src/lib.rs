// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # Weft - brokerless process-to-process messaging
//!
//! Weft gives a process two communication patterns over a peer-to-peer
//! fabric: asynchronous topic-based publish/subscribe of typed messages,
//! and synchronous request/response service calls. Peers find each other
//! over UDP multicast beacons, then talk over direct byte-stream
//! connections. There is no broker.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use weft::{Node, Result};
//!
//! fn main() -> Result<()> {
//!     let node = Node::new()?;
//!
//!     node.subscribe("/chat", |msg: &String, _info| {
//!         println!("heard: {}", msg);
//!     })?;
//!
//!     let publisher = node.advertise::<String>("/chat")?;
//!     publisher.publish(&"hello fabric".to_string())?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |  Node / Publisher (typed handles, partition scoping)             |
//! +------------------------------------------------------------------+
//! |  NodeShared (per-process core)                                   |
//! |    registries: subscriptions | repliers | pending | peers        |
//! |    reception thread: poll -> classify -> dispatch -> expire      |
//! +------------------------------------------------------------------+
//! |  transport: mio poll, framed TCP links, command funnel           |
//! |  discovery: multicast beacons on 11317 (topics) / 11318 (srv)    |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | Entry point: advertise, subscribe, serve, call |
//! | [`Publisher`] | Typed handle for one advertised topic |
//! | [`Message`] | Encode/decode plus the wire type name |
//! | [`NodeShared`] | The per-process transport core |
//!
//! ## Environment
//!
//! - `WEFT_PARTITION`: isolation prefix applied to every topic name
//! - `WEFT_IP`: overrides host address selection
//! - `WEFT_VERBOSE`: console verbosity (0 silent, 1 info, 2+ debug)

/// Global constants and environment configuration.
pub mod config;
/// Peer discovery over UDP multicast beacons.
pub mod discovery;
/// Crate-wide error type.
mod error;
/// Handler capabilities: subscriptions, repliers, pending requests.
pub mod handlers;
/// Identities and host address resolution.
mod identity;
/// Console logging backend for the `log` facade.
pub mod logging;
/// The `Message` trait and implementations for common types.
mod message;
/// Node facade and the transport core.
mod node;
/// Publisher records carried by discovery.
mod publisher;
/// Registries for publisher records and handlers.
pub mod storage;
/// Byte-stream fabric: framing, links, socket multiplexer.
pub mod transport;
/// Framed wire message definitions.
pub mod wire;

pub use error::{Error, Result};
pub use handlers::{ResponseFuture, type_matches};
pub use message::{Message, MessageInfo};
pub use node::{
    Counters, HandlerInfo, Node, NodeOptions, NodeShared, Publisher, SubscriberInfo,
    TypedResponse,
};
pub use publisher::{MessagePublisher, PublisherRecord, ServicePublisher};
