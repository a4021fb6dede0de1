//! Coordination Store
//!
//! The narrow slice of a strongly consistent key/value store that discovery
//! and registration depend on: prefix reads, prefix watches and leases.
//!
//! - `etcd`: production implementation over `etcd-client`
//! - `memory`: in-process implementation with fault injection, for tests

pub mod etcd;
pub mod memory;

pub use self::etcd::EtcdStore;
pub use self::memory::MemoryStore;

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Lease identifier assigned by the store
pub type LeaseId = i64;

/// Shortest renewal period derived from a lease TTL
const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(100);

/// Keep-alive period for a lease granted with `ttl_secs`.
///
/// The configured interval, shortened so that a lease is renewed at least
/// three times per TTL.
pub fn renewal_period(configured: Duration, ttl_secs: i64) -> Duration {
    if ttl_secs <= 0 {
        return configured;
    }
    let third = Duration::from_millis((ttl_secs as u64).saturating_mul(1000) / 3);
    configured.min(third.max(MIN_RENEWAL_PERIOD))
}

/// A single key/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Result of a prefix read, with the store revision it reflects
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

/// Kind of change carried by a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// One change delivered by a watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes
    pub value: String,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Delete,
            key: key.into(),
            value: String::new(),
        }
    }
}

/// Acknowledgement of a lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseAck {
    pub lease_id: LeaseId,
    /// Remaining TTL in seconds after renewal
    pub ttl: i64,
}

/// Batches of watch events in store order. Ends when the watch is gone.
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// Renewal acknowledgements. Ends when the lease expires, is revoked, or the
/// connection is lost.
pub type KeepAliveStream = BoxStream<'static, Result<LeaseAck>>;

/// Operations consumed from the coordination store.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read every key under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot>;

    /// Watch every key under `prefix`, starting at `start_revision` when given.
    async fn watch_prefix(&self, prefix: &str, start_revision: Option<i64>) -> Result<WatchStream>;

    /// Grant a lease with the given TTL in seconds.
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Write a key, optionally bound to a lease.
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Keep a lease alive for as long as the returned stream is consumed.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke a lease, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renewal_period_follows_short_ttl() {
        let configured = Duration::from_secs(5);
        assert_eq!(renewal_period(configured, 1), Duration::from_millis(333));
        assert_eq!(renewal_period(configured, 3), Duration::from_secs(1));
        assert_eq!(renewal_period(configured, 60), configured);
    }

    #[test]
    fn test_renewal_period_edges() {
        let configured = Duration::from_secs(5);
        assert_eq!(renewal_period(configured, 0), configured);
        assert_eq!(renewal_period(configured, -1), configured);
        assert_eq!(renewal_period(configured, i64::MAX), configured);
        // A configured interval below the floor is kept as is
        let fast = Duration::from_millis(20);
        assert_eq!(renewal_period(fast, 1), fast);
    }
}
