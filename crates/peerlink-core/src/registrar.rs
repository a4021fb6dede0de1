//! Self Registration
//!
//! Publishes this node under `/<namespace>/<node-id>` bound to a TTL lease
//! and keeps the lease alive from a background task. When the keep-alive
//! stream ends (lease expired, revoked, or the store connection dropped) the
//! task revokes what is left of the old lease and runs the whole
//! grant / put / keep-alive cycle again after a fixed delay, until it
//! succeeds or the registrar is closed.

use crate::config::RegistrationConfig;
use crate::error::Result;
use crate::keys;
use crate::observability::{events, metrics};
use crate::store::{CoordinationStore, KeepAliveStream, LeaseId};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

struct Shared {
    /// Lease of the current cycle, recorded as soon as it is granted
    lease: watch::Sender<Option<LeaseId>>,
    registrations: AtomicU64,
}

/// Handle to a live registration.
pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    key: String,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Registrar {
    /// Register under the configured namespace and keep the registration alive.
    ///
    /// The first cycle runs before this returns; its failure is the caller's.
    pub async fn register(
        store: Arc<dyn CoordinationStore>,
        config: RegistrationConfig,
    ) -> Result<Self> {
        config.validate()?;

        let key = keys::peer_key(&config.namespace, &config.node_id);
        let (lease, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            lease,
            registrations: AtomicU64::new(0),
        });

        let worker = Worker {
            store: store.clone(),
            config,
            key: key.clone(),
            shared: shared.clone(),
        };
        let stream = worker.register_once().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(worker.run(stream, shutdown_rx));

        Ok(Self {
            store,
            key,
            shared,
            shutdown_tx,
            task,
        })
    }

    /// Store key this node is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease of the current registration, if one has been granted.
    pub fn lease_id(&self) -> Option<LeaseId> {
        *self.shared.lease.borrow()
    }

    /// Number of completed registration cycles.
    pub fn registrations(&self) -> u64 {
        self.shared.registrations.load(Ordering::SeqCst)
    }

    /// Stop re-registering and revoke the lease, removing the key at once.
    pub async fn close(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(key = %self.key, error = %e, "Registration task failed");
        }

        let lease = self.shared.lease.send_replace(None);
        if let Some(lease_id) = lease {
            self.store.revoke(lease_id).await?;
            info!(key = %self.key, lease_id = lease_id, "Registration revoked");
        }
        Ok(())
    }
}

struct Worker {
    store: Arc<dyn CoordinationStore>,
    config: RegistrationConfig,
    key: String,
    shared: Arc<Shared>,
}

impl Worker {
    /// One grant / put / keep-alive cycle.
    async fn register_once(&self) -> Result<KeepAliveStream> {
        let lease_id = self.store.grant_lease(self.config.ttl_secs).await?;
        self.shared.lease.send_replace(Some(lease_id));

        match self.bind(lease_id).await {
            Ok(stream) => {
                self.shared.registrations.fetch_add(1, Ordering::SeqCst);
                metrics::record_registration(&self.config.namespace);
                events::lease_granted(&self.key, lease_id, self.config.ttl_secs);
                Ok(stream)
            }
            Err(e) => {
                metrics::record_registration_failure(&self.config.namespace);
                self.revoke_quietly(lease_id).await;
                Err(e)
            }
        }
    }

    async fn bind(&self, lease_id: LeaseId) -> Result<KeepAliveStream> {
        self.store
            .put(&self.key, &self.config.address, Some(lease_id))
            .await?;
        self.store.keep_alive(lease_id).await
    }

    async fn revoke_quietly(&self, lease_id: LeaseId) {
        if let Err(e) = self.store.revoke(lease_id).await {
            debug!(lease_id = lease_id, error = %e, "Revoke of stale lease failed");
        }
        self.shared
            .lease
            .send_if_modified(|current| match current {
                Some(id) if *id == lease_id => {
                    *current = None;
                    true
                }
                _ => false,
            });
    }

    async fn run(self, mut stream: KeepAliveStream, mut shutdown: watch::Receiver<bool>) {
        loop {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    ack = stream.next() => match ack {
                        Some(Ok(ack)) => {
                            trace!(lease_id = ack.lease_id, ttl = ack.ttl, "Lease renewed");
                        }
                        Some(Err(e)) => {
                            warn!(key = %self.key, error = %e, "Keep-alive failed");
                            break;
                        }
                        None => break,
                    }
                }
            }

            let lost = *self.shared.lease.borrow();
            if let Some(lease_id) = lost {
                events::registration_lost(&self.key, lease_id);
                self.revoke_quietly(lease_id).await;
            }

            let mut attempts: u32 = 0;
            stream = loop {
                attempts = attempts.saturating_add(1);
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }

                let result = tokio::select! {
                    _ = shutdown.changed() => return,
                    result = self.register_once() => result,
                };
                match result {
                    Ok(stream) => {
                        if let Some(lease_id) = *self.shared.lease.borrow() {
                            events::registration_restored(&self.key, lease_id, attempts);
                        }
                        break stream;
                    }
                    Err(e) => {
                        warn!(
                            key = %self.key,
                            attempt = attempts,
                            retry_delay_ms = self.config.retry_delay.as_millis() as u64,
                            error = %e,
                            "Re-registration failed, retrying"
                        );
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn config() -> RegistrationConfig {
        RegistrationConfig::new("orders", "node-1", "10.0.0.1:9000")
            .with_retry_delay(Duration::from_millis(50))
    }

    fn store() -> MemoryStore {
        MemoryStore::with_keepalive_interval(Duration::from_millis(20))
    }

    async fn eventually<F: FnMut() -> bool>(mut check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_register_binds_key_to_lease() {
        let store = store();
        let registrar = Registrar::register(Arc::new(store.clone()), config())
            .await
            .unwrap();

        assert_eq!(registrar.key(), "/orders/node-1");
        assert_eq!(store.get("/orders/node-1").as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(store.lease_of("/orders/node-1"), registrar.lease_id());
        assert_eq!(registrar.registrations(), 1);
    }

    #[tokio::test]
    async fn test_short_ttl_stays_registered() {
        // Store renews every 2 s by default; the lease only lives for 1 s
        let store = MemoryStore::with_keepalive_interval(Duration::from_secs(2));
        let registrar = Registrar::register(Arc::new(store.clone()), config().with_ttl(1))
            .await
            .unwrap();

        for _ in 0..25 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(store.get("/orders/node-1").as_deref(), Some("10.0.0.1:9000"));
        }
        assert_eq!(registrar.registrations(), 1);
        assert_eq!(store.grant_count(), 1);
    }

    #[tokio::test]
    async fn test_reregisters_after_keep_alive_closes() {
        let store = store();
        let registrar = Registrar::register(Arc::new(store.clone()), config())
            .await
            .unwrap();
        let first = registrar.lease_id().unwrap();

        store.sever_keep_alives(first);

        eventually(|| registrar.registrations() == 2).await;
        let second = registrar.lease_id().unwrap();
        assert_ne!(first, second);
        assert_eq!(store.get("/orders/node-1").as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(store.lease_of("/orders/node-1"), Some(second));
        // The old lease was revoked before the new one was taken
        assert_eq!(store.active_leases(), 1);
    }

    #[tokio::test]
    async fn test_reregisters_after_lease_expiry() {
        let store = store();
        let registrar = Registrar::register(Arc::new(store.clone()), config())
            .await
            .unwrap();

        store.expire_lease(registrar.lease_id().unwrap());
        assert!(store.get("/orders/node-1").is_none());

        eventually(|| store.get("/orders/node-1").is_some()).await;
        eventually(|| registrar.registrations() == 2).await;
        assert_eq!(store.lease_of("/orders/node-1"), registrar.lease_id());
    }

    #[tokio::test]
    async fn test_keeps_retrying_while_store_is_down() {
        let store = store();
        let registrar = Registrar::register(Arc::new(store.clone()), config())
            .await
            .unwrap();
        let first = registrar.lease_id().unwrap();

        store.set_unavailable(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(registrar.registrations(), 1);

        store.set_unavailable(false);
        eventually(|| registrar.registrations() == 2).await;
        let current = registrar.lease_id().unwrap();
        assert_ne!(current, first);
        assert_eq!(store.lease_of("/orders/node-1"), Some(current));
    }

    #[tokio::test]
    async fn test_close_revokes_and_deletes_key() {
        let store = store();
        let registrar = Registrar::register(Arc::new(store.clone()), config())
            .await
            .unwrap();

        registrar.close().await.unwrap();
        assert!(store.get("/orders/node-1").is_none());
        assert_eq!(store.active_leases(), 0);

        // No further cycles once closed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get("/orders/node-1").is_none());
        assert_eq!(store.grant_count(), 1);
    }

    #[tokio::test]
    async fn test_close_during_retry_stops_loop() {
        let store = store();
        let registrar = Registrar::register(
            Arc::new(store.clone()),
            config().with_retry_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        store.expire_lease(registrar.lease_id().unwrap());
        eventually(|| registrar.lease_id().is_none()).await;

        registrar.close().await.unwrap();
        assert_eq!(store.grant_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let store: Arc<dyn CoordinationStore> = Arc::new(store());

        let result = Registrar::register(
            store.clone(),
            RegistrationConfig::new("orders", "", "10.0.0.1:9000"),
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));

        let result = Registrar::register(store.clone(), config().with_ttl(0)).await;
        assert!(matches!(result, Err(Error::Config(_))));

        let result =
            Registrar::register(store, RegistrationConfig::new("orders", "node-1", " ")).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_first_cycle_failure_is_returned() {
        let store = store();
        store.set_unavailable(true);

        let result = Registrar::register(Arc::new(store.clone()), config()).await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert_eq!(store.grant_count(), 0);
    }
}
