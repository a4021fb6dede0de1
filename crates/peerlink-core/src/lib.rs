//! Peerlink Core
//!
//! Namespace-scoped service discovery over a coordination store (etcd):
//!
//! - [`Discovery`]: membership cache seeded from a prefix read and kept
//!   current by a prefix watch, publishing added / removed notifications
//! - [`Registrar`]: lease-bound self registration that re-registers from
//!   scratch whenever its keep-alive stream ends
//! - [`ConnectionPool`]: one connection per discovered peer, reconciled from
//!   the discovery notifications
//!
//! All three take an explicit [`CoordinationStore`] handle; [`EtcdStore`]
//! talks to etcd and [`MemoryStore`] runs in-process.

pub mod config;
pub mod error;
pub mod keys;
pub mod membership;
pub mod observability;
pub mod pool;
pub mod registrar;
pub mod store;

pub use config::{DiscoveryConfig, EtcdConfig, PeerlinkConfig, PoolConfig, RegistrationConfig};
pub use error::{Error, Result};
pub use membership::{Discovery, PeerEntry};
pub use pool::{ConnectionPool, Connector, GrpcConnector, PooledConnection};
pub use registrar::Registrar;
pub use store::{CoordinationStore, EtcdStore, MemoryStore};
