//! Connection Pool
//!
//! Keeps exactly one live connection per discovered peer. A single
//! reconciler task consumes the discovery notifications:
//! - added: close any existing connection for the id, dial the new address,
//!   wrap it with the caller's client factory and store it
//! - removed: close and evict the connection, if any
//!
//! Dial failures leave the peer out of the pool until its next membership
//! event. Random selection draws from the discovery cache rather than the
//! pool, so a peer whose dial is pending or failed can still be picked and
//! then report not-found.
//!
//! Closing goes through [`Connector::close`]. What that means depends on the
//! connector: a tonic [`Channel`](tonic::transport::Channel) from
//! [`GrpcConnector`] only shuts down once every clone is dropped, so a client
//! a caller took out before its peer was replaced or removed keeps working
//! until the caller lets go of it. The pool itself never hands out a
//! superseded connection.

mod connector;

pub use connector::{Connector, GrpcConnector};

use crate::error::{Error, Result};
use crate::membership::{Discovery, PeerEntry};
use crate::observability::{events, metrics};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A live connection to one peer, with the typed client built on top of it
#[derive(Debug)]
pub struct PooledConnection<T, C> {
    pub peer_id: String,
    pub address: String,
    pub connection: T,
    pub client: C,
}

/// Builds a typed client from a raw connection
pub type ClientFactory<T, C> = Arc<dyn Fn(T) -> C + Send + Sync>;

type Entries<T, C> = Arc<RwLock<HashMap<String, Arc<PooledConnection<T, C>>>>>;

/// Pool of connections that follows the membership of a namespace.
///
/// Replaced and removed connections are closed through the connector; copies
/// already returned by [`find`](Self::find) or [`client`](Self::client) may
/// outlive that close (see the module docs).
pub struct ConnectionPool<K: Connector, C> {
    discovery: Discovery,
    connector: Arc<K>,
    entries: Entries<K::Connection, C>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl<K, C> ConnectionPool<K, C>
where
    K: Connector,
    C: Clone + Send + Sync + 'static,
{
    /// Subscribe to `discovery`, connect to every peer it currently knows,
    /// then keep reconciling in the background.
    pub async fn start<F>(discovery: Discovery, connector: K, factory: F) -> Self
    where
        F: Fn(K::Connection) -> C + Send + Sync + 'static,
    {
        // Subscribe before reading the snapshot so nothing falls in between
        let added = discovery.subscribe_added();
        let removed = discovery.subscribe_removed();

        let connector = Arc::new(connector);
        let entries: Entries<K::Connection, C> = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let reconciler = Reconciler {
            discovery: discovery.clone(),
            connector: connector.clone(),
            factory: Arc::new(factory),
            entries: entries.clone(),
        };
        reconciler.resync().await;

        info!(
            namespace = %discovery.namespace(),
            connections = entries.read().await.len(),
            "Connection pool started"
        );

        let task = tokio::spawn(reconciler.run(added, removed, shutdown_rx));

        Self {
            discovery,
            connector,
            entries,
            shutdown_tx,
            task,
        }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Current connection for a peer.
    pub async fn find(&self, peer_id: &str) -> Result<Arc<PooledConnection<K::Connection, C>>> {
        self.entries
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }

    /// Typed client for a peer.
    pub async fn client(&self, peer_id: &str) -> Result<C> {
        Ok(self.find(peer_id).await?.client.clone())
    }

    /// Copy of the id to connection mapping.
    pub async fn snapshot(&self) -> HashMap<String, Arc<PooledConnection<K::Connection, C>>> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Uniformly random peer id among those the discovery cache knows.
    pub async fn random_peer_id(&self) -> Result<String> {
        self.discovery.random_peer_id().await
    }

    /// Connection of a random known peer; not-found if its dial is pending or failed.
    pub async fn random_connection(&self) -> Result<Arc<PooledConnection<K::Connection, C>>> {
        let peer_id = self.random_peer_id().await?;
        self.find(&peer_id).await
    }

    pub async fn random_client(&self) -> Result<C> {
        Ok(self.random_connection().await?.client.clone())
    }

    /// Stop reconciling and close every connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciler task failed");
        }
        close_all(&self.connector, &self.entries, "pool_shutdown").await;
        metrics::set_pool_connections(self.discovery.namespace(), 0);
        info!(namespace = %self.discovery.namespace(), "Connection pool shut down");
    }
}

/// Sole writer of the pool entries
struct Reconciler<K: Connector, C> {
    discovery: Discovery,
    connector: Arc<K>,
    factory: ClientFactory<K::Connection, C>,
    entries: Entries<K::Connection, C>,
}

impl<K, C> Reconciler<K, C>
where
    K: Connector,
    C: Clone + Send + Sync + 'static,
{
    async fn run(
        self,
        mut added: broadcast::Receiver<PeerEntry>,
        mut removed: broadcast::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                result = added.recv() => match result {
                    Ok(entry) => self.on_added(entry).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Reconciler lagged behind added events, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },

                result = removed.recv() => match result {
                    Ok(peer_id) => self.on_removed(&peer_id).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Reconciler lagged behind removed events, resyncing");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },

                _ = self.discovery.stopped() => {
                    warn!(
                        namespace = %self.discovery.namespace(),
                        "Discovery went stale, reconciler stopping"
                    );
                    break;
                }
            }
        }
        debug!(namespace = %self.discovery.namespace(), "Reconciler stopped");
    }

    async fn on_added(&self, entry: PeerEntry) {
        let PeerEntry { peer_id, address } = entry;
        let namespace = self.discovery.namespace();

        // Never two live connections for one id: the old one goes first
        let previous = self.entries.write().await.remove(&peer_id);
        if let Some(previous) = previous {
            events::connection_replaced(&peer_id, &previous.address, &address);
            self.connector.close(&previous.connection).await;
        }

        let started = Instant::now();
        let connection = match self.connector.dial(&address).await {
            Ok(connection) => {
                metrics::record_dial(namespace, started.elapsed(), true);
                connection
            }
            Err(e) => {
                metrics::record_dial(namespace, started.elapsed(), false);
                events::dial_failed(&peer_id, &address, &e.to_string());
                self.publish_size().await;
                return;
            }
        };

        // Membership may have moved on while dialling
        if self.discovery.get(&peer_id).await.as_deref() != Some(address.as_str()) {
            debug!(peer_id = %peer_id, address = %address, "Peer changed during dial, discarding connection");
            self.connector.close(&connection).await;
            self.publish_size().await;
            return;
        }

        let client = (self.factory)(connection.clone());
        let pooled = Arc::new(PooledConnection {
            peer_id: peer_id.clone(),
            address: address.clone(),
            connection,
            client,
        });
        self.entries.write().await.insert(peer_id.clone(), pooled);
        events::connection_opened(&peer_id, &address);
        self.publish_size().await;
    }

    async fn on_removed(&self, peer_id: &str) {
        if self.discovery.get(peer_id).await.is_some() {
            debug!(peer_id = %peer_id, "Peer re-added since removal, keeping connection");
            return;
        }

        let removed = self.entries.write().await.remove(peer_id);
        if let Some(pooled) = removed {
            self.connector.close(&pooled.connection).await;
            events::connection_closed(peer_id, &pooled.address, "peer_removed");
            self.publish_size().await;
        }
    }

    /// Bring the pool in line with the discovery snapshot.
    async fn resync(&self) {
        let desired = self.discovery.snapshot().await;

        let stale: Vec<Arc<PooledConnection<K::Connection, C>>> = {
            let mut entries = self.entries.write().await;
            let ids: Vec<String> = entries
                .iter()
                .filter(|(id, pooled)| desired.get(*id) != Some(&pooled.address))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        for pooled in stale {
            self.connector.close(&pooled.connection).await;
            events::connection_closed(&pooled.peer_id, &pooled.address, "resync");
        }

        let missing: Vec<PeerEntry> = {
            let entries = self.entries.read().await;
            desired
                .into_iter()
                .filter(|(id, _)| !entries.contains_key(id))
                .map(|(peer_id, address)| PeerEntry { peer_id, address })
                .collect()
        };
        for entry in missing {
            self.on_added(entry).await;
        }

        self.publish_size().await;
    }

    async fn publish_size(&self) {
        let count = self.entries.read().await.len();
        metrics::set_pool_connections(self.discovery.namespace(), count);
    }
}

async fn close_all<K: Connector, C>(
    connector: &Arc<K>,
    entries: &Entries<K::Connection, C>,
    reason: &str,
) {
    let drained: Vec<Arc<PooledConnection<K::Connection, C>>> =
        entries.write().await.drain().map(|(_, pooled)| pooled).collect();
    for pooled in drained {
        connector.close(&pooled.connection).await;
        events::connection_closed(&pooled.peer_id, &pooled.address, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use crate::store::{CoordinationStore, MemoryStore};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    struct MockConnection {
        address: String,
        closed: Arc<AtomicBool>,
    }

    impl MockConnection {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct MockState {
        dialed: Mutex<Vec<MockConnection>>,
        unreachable: Mutex<HashSet<String>>,
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        state: Arc<MockState>,
    }

    impl MockConnector {
        fn unreachable(&self, address: &str) {
            self.state
                .unreachable
                .lock()
                .unwrap()
                .insert(address.to_string());
        }

        fn dialed(&self) -> Vec<MockConnection> {
            self.state.dialed.lock().unwrap().clone()
        }

        fn open(&self) -> Vec<MockConnection> {
            self.dialed().into_iter().filter(|c| !c.is_closed()).collect()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        type Connection = MockConnection;

        async fn dial(&self, address: &str) -> Result<MockConnection> {
            if self.state.unreachable.lock().unwrap().contains(address) {
                return Err(Error::Dial {
                    address: address.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
            let connection = MockConnection {
                address: address.to_string(),
                closed: Arc::new(AtomicBool::new(false)),
            };
            self.state.dialed.lock().unwrap().push(connection.clone());
            Ok(connection)
        }

        async fn close(&self, connection: &MockConnection) {
            connection.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Typed client stand-in: remembers which address it talks to
    #[derive(Debug, Clone, PartialEq)]
    struct EchoClient(String);

    type TestPool = ConnectionPool<MockConnector, EchoClient>;

    async fn setup(store: &MemoryStore, connector: &MockConnector) -> TestPool {
        let discovery = Discovery::start(Arc::new(store.clone()), DiscoveryConfig::new("orders"))
            .await
            .unwrap();
        ConnectionPool::start(discovery, connector.clone(), |c: MockConnection| {
            EchoClient(c.address)
        })
        .await
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_start_connects_known_peers() {
        let store = MemoryStore::new();
        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        let connector = MockConnector::default();

        let pool = setup(&store, &connector).await;
        let pooled = pool.find("node-1").await.unwrap();
        assert_eq!(pooled.address, "10.0.0.1:9000");
        assert_eq!(pooled.client, EchoClient("10.0.0.1:9000".into()));
    }

    #[tokio::test]
    async fn test_add_then_remove() {
        let store = MemoryStore::new();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;

        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        eventually(|| async { pool.find("node-1").await.is_ok() }).await;
        assert_eq!(
            pool.client("node-1").await.unwrap(),
            EchoClient("10.0.0.1:9000".into())
        );

        store.delete("/orders/node-1");
        eventually(|| async { pool.find("node-1").await.is_err() }).await;
        assert!(matches!(
            pool.find("node-1").await,
            Err(Error::PeerNotFound(_))
        ));
        assert!(connector.dialed()[0].is_closed());
    }

    #[tokio::test]
    async fn test_readd_replaces_connection() {
        let store = MemoryStore::new();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;

        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        eventually(|| async { pool.find("node-1").await.is_ok() }).await;

        store.put("/orders/node-1", "10.0.0.2:9000", None).await.unwrap();
        eventually(|| async {
            matches!(pool.find("node-1").await, Ok(p) if p.address == "10.0.0.2:9000")
        })
        .await;

        let open = connector.open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].address, "10.0.0.2:9000");
        assert!(connector
            .dialed()
            .iter()
            .filter(|c| c.address == "10.0.0.1:9000")
            .all(MockConnection::is_closed));
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn test_handle_taken_before_replace_is_closed_not_swapped() {
        let store = MemoryStore::new();
        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;

        let held = pool.find("node-1").await.unwrap();
        store.put("/orders/node-1", "10.0.0.2:9000", None).await.unwrap();
        eventually(|| async {
            matches!(pool.find("node-1").await, Ok(p) if p.address == "10.0.0.2:9000")
        })
        .await;

        // The caller's copy still points at the old peer; the pool closed it
        assert_eq!(held.address, "10.0.0.1:9000");
        assert_eq!(held.client, EchoClient("10.0.0.1:9000".into()));
        assert!(held.connection.is_closed());
    }

    #[tokio::test]
    async fn test_back_to_back_adds_leave_one_connection() {
        let store = MemoryStore::new();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;

        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        store.put("/orders/node-1", "10.0.0.2:9000", None).await.unwrap();

        eventually(|| async {
            matches!(pool.find("node-1").await, Ok(p) if p.address == "10.0.0.2:9000")
        })
        .await;
        // Let the reconciler drain anything still queued
        tokio::time::sleep(Duration::from_millis(50)).await;

        let open = connector.open();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].address, "10.0.0.2:9000");
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_peer_absent() {
        let store = MemoryStore::new();
        let connector = MockConnector::default();
        connector.unreachable("10.0.0.9:9000");
        let pool = setup(&store, &connector).await;

        store.put("/orders/node-9", "10.0.0.9:9000", None).await.unwrap();
        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        eventually(|| async { pool.find("node-1").await.is_ok() }).await;

        assert!(matches!(
            pool.find("node-9").await,
            Err(Error::PeerNotFound(_))
        ));
        // Still selectable: selection follows discovery, not the pool
        let ids = pool.discovery().peer_ids().await;
        assert!(ids.contains(&"node-9".to_string()));

        // Removing a peer that never made it into the pool is a no-op
        store.delete("/orders/node-9");
        eventually(|| async { pool.discovery().get("node-9").await.is_none() }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.len().await, 1);
        assert!(pool.find("node-1").await.is_ok());
    }

    #[tokio::test]
    async fn test_random_selection() {
        let store = MemoryStore::new();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;

        assert!(matches!(pool.random_peer_id().await, Err(Error::NoPeers)));
        assert!(matches!(pool.random_client().await, Err(Error::NoPeers)));

        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        eventually(|| async { pool.find("node-1").await.is_ok() }).await;
        assert_eq!(pool.random_peer_id().await.unwrap(), "node-1");
        assert_eq!(
            pool.random_client().await.unwrap(),
            EchoClient("10.0.0.1:9000".into())
        );
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let store = MemoryStore::new();
        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;

        let snapshot = pool.snapshot().await;
        store.delete("/orders/node-1");
        eventually(|| async { pool.is_empty().await }).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["node-1"].address, "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_lagging_reconciler_resyncs() {
        let store = MemoryStore::new();
        let discovery = Discovery::start(
            Arc::new(store.clone()),
            DiscoveryConfig::new("orders").with_event_capacity(1),
        )
        .await
        .unwrap();
        let connector = MockConnector::default();
        let pool = ConnectionPool::start(discovery, connector.clone(), |c: MockConnection| {
            EchoClient(c.address)
        })
        .await;

        for i in 0..10 {
            store
                .put(&format!("/orders/node-{i}"), &format!("10.0.0.{i}:9000"), None)
                .await
                .unwrap();
        }
        eventually(|| async { pool.len().await == 10 }).await;
        for i in 0..10 {
            let pooled = pool.find(&format!("node-{i}")).await.unwrap();
            assert_eq!(pooled.address, format!("10.0.0.{i}:9000"));
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let store = MemoryStore::new();
        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        store.put("/orders/node-2", "10.0.0.2:9000", None).await.unwrap();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;
        assert_eq!(pool.len().await, 2);

        pool.shutdown().await;
        assert!(connector.open().is_empty());
    }

    #[tokio::test]
    async fn test_stale_discovery_freezes_pool() {
        let store = MemoryStore::new();
        store.put("/orders/node-1", "10.0.0.1:9000", None).await.unwrap();
        let connector = MockConnector::default();
        let pool = setup(&store, &connector).await;

        store.close_watches();
        eventually(|| async { pool.discovery().is_stale() }).await;
        assert!(pool.find("node-1").await.is_ok());
        pool.shutdown().await;
        assert!(connector.open().is_empty());
    }
}
