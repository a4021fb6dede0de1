//! In-Memory Store
//!
//! A single-process `CoordinationStore` with etcd-like semantics: a global
//! revision, prefix watches that can replay from a revision, and TTL leases
//! that delete their keys on expiry or revocation. Fault injection hooks let
//! tests break watches, keep-alives and the whole store on demand.
//!
//! Expiry is lazy: an expired lease's keys are deleted, and watchers told,
//! on the next store call or [`MemoryStore::reap_expired`]. The event
//! history grows until [`MemoryStore::compact`] drops the old part; watching
//! from a compacted revision then fails like it does on etcd.

use super::{
    renewal_period, CoordinationStore, EventKind, KeepAliveStream, KeyValue, LeaseAck, LeaseId,
    Snapshot, WatchEvent, WatchStream,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

type WatchItem = Result<Vec<WatchEvent>>;

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: i64,
    deadline: Instant,
    keys: HashSet<String>,
    /// Dropped when the lease goes away, ending its keep-alive streams
    alive: watch::Sender<bool>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchItem>,
}

struct Inner {
    revision: i64,
    kvs: BTreeMap<String, Entry>,
    history: Vec<(i64, WatchEvent)>,
    /// Highest revision dropped from `history`
    compacted: i64,
    watchers: Vec<Watcher>,
    leases: HashMap<LeaseId, LeaseState>,
    next_lease: LeaseId,
    grants: u64,
    unavailable: bool,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Store("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Record a batch of events under one new revision and fan it out.
    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision += 1;
        for event in &events {
            self.history.push((self.revision, event.clone()));
        }
        self.watchers.retain(|watcher| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if batch.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(batch)).is_ok()
        });
    }

    fn detach_from_lease(&mut self, key: &str) {
        if let Some(old) = self.kvs.get(key).and_then(|e| e.lease) {
            if let Some(lease) = self.leases.get_mut(&old) {
                lease.keys.remove(key);
            }
        }
    }

    /// Drop a lease and delete its keys in one revision.
    fn remove_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        let events = keys
            .into_iter()
            .filter(|key| self.kvs.remove(key).is_some())
            .map(WatchEvent::delete)
            .collect();
        self.commit(events);
        true
    }

    fn reap_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            trace!(lease_id = id, "Lease expired");
            self.remove_lease(id);
        }
    }
}

/// In-process coordination store
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    keepalive_interval: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_keepalive_interval(Duration::from_millis(100))
    }

    /// Store whose keep-alive streams renew at the given interval.
    pub fn with_keepalive_interval(keepalive_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                revision: 0,
                kvs: BTreeMap::new(),
                history: Vec::new(),
                compacted: 0,
                watchers: Vec::new(),
                leases: HashMap::new(),
                next_lease: 1,
                grants: 0,
                unavailable: false,
            })),
            keepalive_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current value of a key.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        inner.reap_expired();
        inner.kvs.get(key).map(|e| e.value.clone())
    }

    /// Lease a key is bound to, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        let mut inner = self.lock();
        inner.reap_expired();
        inner.kvs.get(key).and_then(|e| e.lease)
    }

    /// Delete a key, emitting a delete event if it existed.
    pub fn delete(&self, key: &str) -> bool {
        let mut inner = self.lock();
        inner.detach_from_lease(key);
        if inner.kvs.remove(key).is_some() {
            inner.commit(vec![WatchEvent::delete(key)]);
            true
        } else {
            false
        }
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    /// Number of leases currently alive.
    pub fn active_leases(&self) -> usize {
        let mut inner = self.lock();
        inner.reap_expired();
        inner.leases.len()
    }

    /// Number of leases ever granted.
    pub fn grant_count(&self) -> u64 {
        self.lock().grants
    }

    /// Expire a lease now, deleting its keys and ending its keep-alive streams.
    pub fn expire_lease(&self, id: LeaseId) -> bool {
        self.lock().remove_lease(id)
    }

    /// End every keep-alive stream of a lease without expiring it.
    pub fn sever_keep_alives(&self, id: LeaseId) {
        let mut inner = self.lock();
        if let Some(lease) = inner.leases.get_mut(&id) {
            let (alive, _) = watch::channel(true);
            lease.alive = alive;
        }
    }

    /// End every open watch stream.
    pub fn close_watches(&self) {
        self.lock().watchers.clear();
    }

    /// Deliver an error to every open watch stream, then end them.
    pub fn fail_watches(&self) {
        let mut inner = self.lock();
        for watcher in inner.watchers.drain(..) {
            let _ = watcher.tx.send(Err(Error::WatchClosed));
        }
    }

    /// Make every store operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Drop history at or below `revision`.
    pub fn compact(&self, revision: i64) {
        let mut inner = self.lock();
        let revision = revision.min(inner.revision);
        if revision <= inner.compacted {
            return;
        }
        inner.history.retain(|(rev, _)| *rev > revision);
        inner.compacted = revision;
    }

    /// Number of events kept for watch replay.
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// Delete keys of leases whose TTL has run out.
    pub fn reap_expired(&self) {
        self.lock().reap_expired();
    }

    fn renew(&self, id: LeaseId) -> Option<LeaseAck> {
        let mut inner = self.lock();
        inner.reap_expired();
        if inner.unavailable {
            return None;
        }
        let lease = inner.leases.get_mut(&id)?;
        lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);
        Some(LeaseAck {
            lease_id: id,
            ttl: lease.ttl,
        })
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.reap_expired();
        let kvs = inner
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect();
        Ok(Snapshot {
            kvs,
            revision: inner.revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: Option<i64>) -> Result<WatchStream> {
        let mut inner = self.lock();
        inner.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(start) = start_revision {
            if start <= inner.compacted {
                return Err(Error::Store(format!(
                    "revision {start} has been compacted (compacted up to {})",
                    inner.compacted
                )));
            }
            let replay: Vec<WatchEvent> = inner
                .history
                .iter()
                .filter(|(rev, event)| *rev >= start && event.key.starts_with(prefix))
                .map(|(_, event)| event.clone())
                .collect();
            if !replay.is_empty() {
                let _ = tx.send(Ok(replay));
            }
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut inner = self.lock();
        inner.check_available()?;
        if ttl_secs <= 0 {
            return Err(Error::Store(format!("invalid lease TTL {ttl_secs}")));
        }
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.grants += 1;
        let (alive, _) = watch::channel(true);
        inner.leases.insert(
            id,
            LeaseState {
                ttl: ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: HashSet::new(),
                alive,
            },
        );
        Ok(id)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut inner = self.lock();
        inner.check_available()?;
        inner.reap_expired();

        if let Some(id) = lease {
            let lease = inner
                .leases
                .get_mut(&id)
                .ok_or_else(|| Error::Store(format!("lease {id} not found")))?;
            lease.keys.insert(key.to_string());
        }

        let previous = inner.kvs.get(key).and_then(|e| e.lease);
        if previous.is_some() && previous != lease {
            inner.detach_from_lease(key);
        }

        inner.kvs.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        inner.commit(vec![WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: value.to_string(),
        }]);
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (alive, ttl) = {
            let mut inner = self.lock();
            inner.check_available()?;
            inner.reap_expired();
            let state = inner
                .leases
                .get(&lease)
                .ok_or_else(|| Error::Store(format!("lease {lease} not found")))?;
            (state.alive.subscribe(), state.ttl)
        };

        let period = renewal_period(self.keepalive_interval, ttl);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let store = self.clone();
        let acks = futures::stream::unfold(
            Some((store, alive, ticker)),
            move |state| async move {
                let (store, mut alive, mut ticker) = state?;
                tokio::select! {
                    _ = alive.changed() => None,
                    _ = ticker.tick() => {
                        let ack = store.renew(lease)?;
                        Some((Ok(ack), Some((store, alive, ticker))))
                    }
                }
            },
        );
        Ok(acks.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.lock();
        inner.check_available()?;
        if inner.remove_lease(lease) {
            Ok(())
        } else {
            Err(Error::Store(format!("lease {lease} not found")))
        }
    }
}
