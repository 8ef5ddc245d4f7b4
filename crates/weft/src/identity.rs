// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Process and socket identities, host address resolution.
//!
//! Every process running a core owns a stable process UUID; every socket
//! role with distinct identity (replier, response receiver) gets its own.
//! All of them travel the wire in hyphenated textual form.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use uuid::Uuid;

use crate::config::env_ip;

/// Fresh random identity.
pub fn new_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Address the transport endpoints bind to.
///
/// Resolution order: `WEFT_IP` override, primary-interface probe, loopback.
pub fn host_addr() -> IpAddr {
    if let Some(ip) = env_ip() {
        match ip.parse() {
            Ok(addr) => return addr,
            Err(_) => log::warn!("ignoring unparsable WEFT_IP {:?}", ip),
        }
    }
    probe_host_addr().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Ask the routing table which source address reaches the outside world.
/// No packet is sent; connect() on UDP only selects a route.
fn probe_host_addr() -> Option<IpAddr> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("8.8.8.8:53").ok()?;
    let addr = sock.local_addr().ok()?.ip();
    if addr.is_unspecified() {
        None
    } else {
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_are_unique() {
        assert_ne!(new_uuid(), new_uuid());
    }

    #[test]
    fn host_addr_is_bindable() {
        let addr = host_addr();
        let listener = std::net::TcpListener::bind((addr, 0));
        assert!(listener.is_ok(), "cannot bind to {}", addr);
    }
}
