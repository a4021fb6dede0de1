//! Structured Events
//!
//! Membership, registration and pool events with consistent field names, so
//! the same peer can be followed across the discovery, registrar and pool
//! logs.

use tracing::{error, info, warn};

/// Emit a peer joined (or changed address) event
pub fn peer_joined(namespace: &str, peer_id: &str, address: &str) {
    info!(
        event_type = "peer_joined",
        namespace = %namespace,
        peer_id = %peer_id,
        address = %address,
        "Peer joined"
    );
}

/// Emit a peer departed event
pub fn peer_departed(namespace: &str, peer_id: &str) {
    warn!(
        event_type = "peer_departed",
        namespace = %namespace,
        peer_id = %peer_id,
        "Peer departed"
    );
}

/// Emit a membership stale event (watch stream ended)
pub fn membership_stale(namespace: &str, known_peers: usize, reason: &str) {
    error!(
        event_type = "membership_stale",
        namespace = %namespace,
        known_peers = known_peers,
        reason = %reason,
        "Membership watch ended, cache is stale"
    );
}

/// Emit a lease granted event
pub fn lease_granted(key: &str, lease_id: i64, ttl_secs: i64) {
    info!(
        event_type = "lease_granted",
        key = %key,
        lease_id = lease_id,
        ttl_secs = ttl_secs,
        "Registered with lease"
    );
}

/// Emit a registration lost event
pub fn registration_lost(key: &str, lease_id: i64) {
    warn!(
        event_type = "registration_lost",
        key = %key,
        lease_id = lease_id,
        "Keep-alive stream closed, registration lost"
    );
}

/// Emit a registration restored event
pub fn registration_restored(key: &str, lease_id: i64, attempts: u32) {
    info!(
        event_type = "registration_restored",
        key = %key,
        lease_id = lease_id,
        attempts = attempts,
        "Registration restored"
    );
}

/// Emit a connection opened event
pub fn connection_opened(peer_id: &str, address: &str) {
    info!(
        event_type = "connection_opened",
        peer_id = %peer_id,
        address = %address,
        "Connection opened"
    );
}

/// Emit a connection replaced event
pub fn connection_replaced(peer_id: &str, previous_address: &str, address: &str) {
    info!(
        event_type = "connection_replaced",
        peer_id = %peer_id,
        previous_address = %previous_address,
        address = %address,
        "Replacing stale connection"
    );
}

/// Emit a connection closed event
pub fn connection_closed(peer_id: &str, address: &str, reason: &str) {
    info!(
        event_type = "connection_closed",
        peer_id = %peer_id,
        address = %address,
        reason = %reason,
        "Connection closed"
    );
}

/// Emit a dial failed event
pub fn dial_failed(peer_id: &str, address: &str, error: &str) {
    warn!(
        event_type = "dial_failed",
        peer_id = %peer_id,
        address = %address,
        error = %error,
        "Dial failed, peer left out of pool"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_functions_dont_panic() {
        peer_joined("orders", "node-1", "10.0.0.1:9000");
        peer_departed("orders", "node-1");
        membership_stale("orders", 3, "stream ended");
        lease_granted("/orders/node-1", 7, 15);
        registration_lost("/orders/node-1", 7);
        registration_restored("/orders/node-1", 8, 2);
        connection_opened("node-1", "10.0.0.1:9000");
        connection_replaced("node-1", "10.0.0.1:9000", "10.0.0.2:9000");
        connection_closed("node-1", "10.0.0.2:9000", "peer_removed");
        dial_failed("node-1", "10.0.0.1:9000", "connection refused");
    }
}
