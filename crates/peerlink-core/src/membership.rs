//! Membership Cache
//!
//! Tracks every peer registered under one namespace. Start-up seeds the cache
//! from a prefix read, then a watch opened at the next revision keeps it
//! current. Each applied change is published on one of two broadcast
//! channels (added / removed) after the cache has been mutated.
//!
//! Notification delivery never blocks the watch loop: the channels are
//! bounded ring buffers, and a subscriber that falls more than `capacity`
//! events behind receives `RecvError::Lagged` and should resynchronise from
//! [`Discovery::snapshot`].
//!
//! When the watch stream ends the cache goes stale and stays that way; the
//! owner is expected to build a new `Discovery`.

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::keys;
use crate::observability::{events, metrics};
use crate::store::{CoordinationStore, EventKind, WatchEvent, WatchStream};
use futures::StreamExt;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, trace, warn};

/// A discovered peer and the address it advertises
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerEntry {
    pub peer_id: String,
    pub address: String,
}

struct DiscoveryInner {
    namespace: String,
    prefix: String,
    peers: RwLock<HashMap<String, String>>,
    added_tx: broadcast::Sender<PeerEntry>,
    removed_tx: broadcast::Sender<String>,
    stopped_rx: watch::Receiver<bool>,
}

impl DiscoveryInner {
    /// Apply one watch event: mutate the cache, then notify.
    async fn apply(&self, event: WatchEvent) {
        let Some(peer_id) = keys::peer_id_from_key(&self.prefix, &event.key) else {
            warn!(key = %event.key, namespace = %self.namespace, "Ignoring key outside namespace");
            return;
        };
        let peer_id = peer_id.to_string();

        match event.kind {
            EventKind::Put => {
                let count = {
                    let mut peers = self.peers.write().await;
                    peers.insert(peer_id.clone(), event.value.clone());
                    peers.len()
                };
                metrics::record_watch_event(&self.namespace, "put");
                metrics::set_known_peers(&self.namespace, count);
                events::peer_joined(&self.namespace, &peer_id, &event.value);

                let entry = PeerEntry {
                    peer_id,
                    address: event.value,
                };
                if self.added_tx.send(entry).is_err() {
                    trace!("No subscribers for peer added notification");
                }
            }
            EventKind::Delete => {
                let (removed, count) = {
                    let mut peers = self.peers.write().await;
                    let removed = peers.remove(&peer_id);
                    (removed, peers.len())
                };
                metrics::record_watch_event(&self.namespace, "delete");
                metrics::set_known_peers(&self.namespace, count);
                if removed.is_some() {
                    events::peer_departed(&self.namespace, &peer_id);
                } else {
                    debug!(peer_id = %peer_id, "Delete for unknown peer");
                }

                if self.removed_tx.send(peer_id).is_err() {
                    trace!("No subscribers for peer removed notification");
                }
            }
        }
    }
}

/// Live view of the peers registered under one namespace.
///
/// Cloning is cheap; all clones share the same cache and channels.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    /// Seed the cache from a prefix read and start watching for changes.
    ///
    /// A failed initial read or watch is returned to the caller.
    pub async fn start(store: Arc<dyn CoordinationStore>, config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;

        let prefix = keys::namespace_prefix(&config.namespace);
        let snapshot = store.get_prefix(&prefix).await?;

        let (added_tx, _) = broadcast::channel(config.event_capacity);
        let (removed_tx, _) = broadcast::channel(config.event_capacity);
        let (stopped_tx, stopped_rx) = watch::channel(false);

        let inner = Arc::new(DiscoveryInner {
            namespace: config.namespace.clone(),
            prefix: prefix.clone(),
            peers: RwLock::new(HashMap::new()),
            added_tx,
            removed_tx,
            stopped_rx,
        });

        for kv in snapshot.kvs {
            inner.apply(WatchEvent::put(kv.key, kv.value)).await;
        }

        let stream = store
            .watch_prefix(&prefix, Some(snapshot.revision + 1))
            .await?;

        info!(
            namespace = %config.namespace,
            revision = snapshot.revision,
            peer_count = inner.peers.read().await.len(),
            "Discovery started"
        );

        tokio::spawn(run_watch_loop(inner.clone(), stream, stopped_tx));

        Ok(Self { inner })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Receive every peer added (or re-announced) after this call.
    pub fn subscribe_added(&self) -> broadcast::Receiver<PeerEntry> {
        self.inner.added_tx.subscribe()
    }

    /// Receive the id of every peer removed after this call.
    pub fn subscribe_removed(&self) -> broadcast::Receiver<String> {
        self.inner.removed_tx.subscribe()
    }

    /// Copy of the current peer-id to address mapping.
    pub async fn snapshot(&self) -> HashMap<String, String> {
        self.inner.peers.read().await.clone()
    }

    /// Current address of a peer.
    pub async fn get(&self, peer_id: &str) -> Option<String> {
        self.inner.peers.read().await.get(peer_id).cloned()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.inner.peers.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.peers.read().await.is_empty()
    }

    /// Pick a known peer id uniformly at random.
    pub async fn random_peer_id(&self) -> Result<String> {
        let ids = self.peer_ids().await;
        ids.choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(Error::NoPeers)
    }

    /// Whether the watch loop has ended and the cache no longer updates.
    pub fn is_stale(&self) -> bool {
        *self.inner.stopped_rx.borrow()
    }

    /// Resolve once the watch loop has ended.
    pub async fn stopped(&self) {
        let mut rx = self.inner.stopped_rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

async fn run_watch_loop(
    inner: Arc<DiscoveryInner>,
    mut stream: WatchStream,
    stopped_tx: watch::Sender<bool>,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(batch)) => {
                for event in batch {
                    inner.apply(event).await;
                }
            }
            Some(Err(e)) => break e.to_string(),
            None => break "watch stream ended".to_string(),
        }
    };

    let known_peers = inner.peers.read().await.len();
    events::membership_stale(&inner.namespace, known_peers, &reason);
    let _ = stopped_tx.send(true);
}
