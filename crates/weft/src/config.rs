// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Global configuration - single source of truth for wire constants and
//! environment toggles.
//!
//! Everything time- or port-shaped lives here. **Never hardcode elsewhere!**

use std::net::Ipv4Addr;
use std::time::Duration;

// =======================================================================
// Discovery layer
// =======================================================================

/// UDP multicast port used by the message (pub/sub) discovery layer.
pub const MSG_DISCOVERY_PORT: u16 = 11317;

/// UDP multicast port used by the service discovery layer.
pub const SRV_DISCOVERY_PORT: u16 = 11318;

/// Multicast group the discovery beacons are sent to.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

/// Interval between discovery heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A peer silent for this long is considered departed.
pub const SILENCE_INTERVAL: Duration = Duration::from_secs(3);

// =======================================================================
// Transport layer
// =======================================================================

/// Timeout used when polling the inbound sockets for activity.
///
/// Bounds how long shutdown and pending-request expiry can lag behind.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Maximum size of a single framed wire message (anti-OOM guard).
pub const MAX_WIRE_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Message type that matches any other type in handler lookups.
pub const WILDCARD_TYPE: &str = "*";

// =======================================================================
// Environment
// =======================================================================

/// Partition prefix applied to every topic and service name.
pub const ENV_PARTITION: &str = "WEFT_PARTITION";

/// Overrides host address selection.
pub const ENV_IP: &str = "WEFT_IP";

/// Console verbosity: 0 silent, 1 info, 2 and up debug.
pub const ENV_VERBOSE: &str = "WEFT_VERBOSE";

/// Partition from the environment, empty when unset.
pub fn env_partition() -> String {
    std::env::var(ENV_PARTITION).unwrap_or_default()
}

/// Host address override from the environment.
pub fn env_ip() -> Option<String> {
    std::env::var(ENV_IP).ok().filter(|v| !v.is_empty())
}

/// Verbosity level from the environment, 0 when unset or unparsable.
pub fn env_verbosity() -> u8 {
    std::env::var(ENV_VERBOSE)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_timeout_is_250ms() {
        assert_eq!(POLL_TIMEOUT, Duration::from_millis(250));
    }

    #[test]
    fn discovery_ports_are_distinct() {
        assert_ne!(MSG_DISCOVERY_PORT, SRV_DISCOVERY_PORT);
    }

    #[test]
    fn silence_covers_multiple_heartbeats() {
        assert!(SILENCE_INTERVAL >= 2 * HEARTBEAT_INTERVAL);
    }
}
