// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Byte-stream fabric: framing, links, and the socket multiplexer.

pub mod codec;
mod link;
mod pump;

pub use link::{Link, LinkKind, LinkState};
pub use pump::{BoundEndpoints, NetCmd, NetEvent, NetHandle, NetPump, SendTarget};
