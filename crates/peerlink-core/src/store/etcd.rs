//! Etcd Store
//!
//! `CoordinationStore` over `etcd-client`: connection with backoff, prefix
//! reads and watches, and lease management.

use super::{
    renewal_period, CoordinationStore, EventKind, KeepAliveStream, KeyValue, LeaseAck, LeaseId,
    Snapshot, WatchEvent, WatchStream,
};
use crate::config::EtcdConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, WatchResponse,
};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Etcd-backed coordination store
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    keepalive_interval: Duration,
}

impl EtcdStore {
    /// Connect to etcd with exponential backoff
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        config.validate()?;

        let backoff = ExponentialBackoff {
            initial_interval: config.backoff_initial,
            max_interval: config.backoff_max,
            max_elapsed_time: Some(config.backoff_max_elapsed),
            multiplier: config.backoff_multiplier,
            ..Default::default()
        };

        let mut options = ConnectOptions::new().with_connect_timeout(config.dial_timeout);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let endpoints = &config.endpoints;
        let client = retry(backoff, || async {
            match Client::connect(endpoints, Some(options.clone())).await {
                Ok(client) => {
                    debug!(endpoints = ?endpoints, "Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await?;

        Ok(Self::from_client(client, config.keepalive_interval))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client, keepalive_interval: Duration) -> Self {
        Self {
            client,
            keepalive_interval,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_prefix(&self, prefix: &str) -> Result<Snapshot> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| {
                Ok(KeyValue {
                    key: kv.key_str()?.to_string(),
                    value: kv.value_str()?.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        trace!(prefix = %prefix, revision = revision, count = kvs.len(), "Prefix read");
        Ok(Snapshot { kvs, revision })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: Option<i64>) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let mut options = WatchOptions::new().with_prefix();
        if let Some(revision) = start_revision {
            options = options.with_start_revision(revision);
        }

        let stream = client.watch(prefix, Some(options)).await?;
        debug!(prefix = %prefix, start_revision = ?start_revision, "Watch stream established");

        let events = futures::stream::unfold(Some(stream), |state| async move {
            let mut stream = state?;
            match stream.message().await {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        warn!("Watch stream canceled by server");
                        return Some((Err(Error::WatchClosed), None));
                    }
                    Some((Ok(convert_events(&resp)), Some(stream)))
                }
                Ok(None) => None,
                Err(e) => Some((Err(Error::from(e)), None)),
            }
        });

        Ok(events.boxed())
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let mut client = self.client.clone();
        let granted = client.lease_time_to_live(lease, None).await?;
        if granted.ttl() < 0 {
            return Err(Error::Store(format!("lease {lease} not found")));
        }
        let (keeper, stream) = client.lease_keep_alive(lease).await?;

        // First renewal one period after the grant
        let period = renewal_period(self.keepalive_interval, granted.granted_ttl());
        trace!(lease_id = lease, period_ms = period.as_millis() as u64, "Keeping lease alive");
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let acks = futures::stream::unfold(
            Some((keeper, stream, ticker)),
            move |state| async move {
                let (mut keeper, mut stream, mut ticker) = state?;
                ticker.tick().await;

                if let Err(e) = keeper.keep_alive().await {
                    return Some((Err(Error::from(e)), None));
                }

                match stream.message().await {
                    Ok(Some(resp)) if resp.ttl() > 0 => {
                        let ack = LeaseAck {
                            lease_id: resp.id(),
                            ttl: resp.ttl(),
                        };
                        Some((Ok(ack), Some((keeper, stream, ticker))))
                    }
                    Ok(Some(_)) => {
                        debug!(lease_id = lease, "Lease expired");
                        None
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(Error::from(e)), None)),
                }
            },
        );

        Ok(acks.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await?;
        Ok(())
    }
}

fn convert_events(resp: &WatchResponse) -> Vec<WatchEvent> {
    let mut events = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let Some(kv) = event.kv() else {
            continue;
        };
        let key = match kv.key_str() {
            Ok(key) => key.to_string(),
            Err(e) => {
                warn!(error = %e, "Skipping watch event with non UTF-8 key");
                continue;
            }
        };
        let kind = match event.event_type() {
            EventType::Put => EventKind::Put,
            EventType::Delete => EventKind::Delete,
        };
        let value = match kind {
            EventKind::Put => match kv.value_str() {
                Ok(value) => value.to_string(),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping watch event with non UTF-8 value");
                    continue;
                }
            },
            EventKind::Delete => String::new(),
        };
        events.push(WatchEvent { kind, key, value });
    }
    events
}
