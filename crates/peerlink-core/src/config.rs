//! Configuration
//!
//! Settings for the etcd connection, discovery, registration and the
//! connection pool. Every struct has defaults; `PeerlinkConfig::from_env`
//! layers environment variable overrides on top of them.

use crate::error::{Error, Result};
use std::time::Duration;

/// Default lease TTL in seconds.
pub const DEFAULT_LEASE_TTL: i64 = 15;

/// Default delay between re-registration attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(6);

/// Default capacity of each discovery notification channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Connection settings for the etcd cluster
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Etcd endpoints (env: ETCD_ENDPOINTS, comma-separated)
    pub endpoints: Vec<String>,

    /// Username (env: ETCD_USERNAME)
    pub username: Option<String>,

    /// Password (env: ETCD_PASSWORD)
    pub password: Option<String>,

    /// Timeout for establishing the connection (env: ETCD_DIAL_TIMEOUT_MS)
    pub dial_timeout: Duration,

    /// Interval between lease keep-alive requests (1/3 of TTL recommended)
    pub keepalive_interval: Duration,

    // Connection backoff
    /// Initial interval for connection retry
    pub backoff_initial: Duration,

    /// Maximum interval for connection retry
    pub backoff_max: Duration,

    /// Maximum elapsed time for connection retries
    pub backoff_max_elapsed: Duration,

    /// Multiplier for connection backoff
    pub backoff_multiplier: f64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            username: None,
            password: None,
            dial_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            backoff_max_elapsed: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl EtcdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(Error::config("etcd endpoints must be set"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(Error::config(
                "etcd username and password must be set together",
            ));
        }
        Ok(())
    }
}

/// Settings for a membership cache
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Service namespace to watch
    pub namespace: String,

    /// Buffered notifications per channel before slow subscribers lag
    pub event_capacity: usize,
}

impl DiscoveryConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_segment("namespace", &self.namespace)?;
        if self.event_capacity == 0 {
            return Err(Error::config("event capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// Settings for self-registration
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Service namespace to register under
    pub namespace: String,

    /// Identifier of this node within the namespace
    pub node_id: String,

    /// Address other peers should dial (host:port)
    pub address: String,

    /// Lease TTL in seconds
    pub ttl_secs: i64,

    /// Delay before each re-registration attempt after the lease is lost
    pub retry_delay: Duration,
}

impl RegistrationConfig {
    pub fn new(
        namespace: impl Into<String>,
        node_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            node_id: node_id.into(),
            address: address.into(),
            ttl_secs: DEFAULT_LEASE_TTL,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_ttl(mut self, ttl_secs: i64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_segment("namespace", &self.namespace)?;
        validate_segment("node id", &self.node_id)?;
        if self.address.trim().is_empty() {
            return Err(Error::config("address must be set"));
        }
        if self.ttl_secs <= 0 {
            return Err(Error::config("lease TTL must be positive"));
        }
        Ok(())
    }
}

/// Settings for gRPC connections held by the pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Timeout for establishing a connection (env: GRPC_CONNECT_TIMEOUT_MS)
    pub connect_timeout: Duration,

    /// HTTP/2 keep-alive ping interval
    pub keepalive_interval: Duration,

    /// Time to wait for a keep-alive ping acknowledgement
    pub keepalive_timeout: Duration,

    /// Create channels without waiting for the connection to come up
    pub lazy_connect: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(10),
            lazy_connect: false,
        }
    }
}

/// Top-level configuration assembled by binaries
#[derive(Debug, Clone)]
pub struct PeerlinkConfig {
    /// Service namespace (env: APP_NAME)
    pub namespace: String,

    /// Node identifier (env: POD_NAME)
    pub node_id: Option<String>,

    /// Advertised address (env: ADVERTISE_ADDR, or POD_IP + GRPC_PORT)
    pub address: Option<String>,

    /// Lease TTL in seconds (env: ETCD_REGISTER_TTL)
    pub ttl_secs: i64,

    /// Re-registration delay (env: REGISTER_RETRY_DELAY_MS)
    pub retry_delay: Duration,

    /// Discovery channel capacity (env: DISCOVERY_EVENT_CAPACITY)
    pub event_capacity: usize,

    pub etcd: EtcdConfig,
    pub pool: PoolConfig,
}

impl Default for PeerlinkConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            node_id: None,
            address: None,
            ttl_secs: DEFAULT_LEASE_TTL,
            retry_delay: DEFAULT_RETRY_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            etcd: EtcdConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl PeerlinkConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(namespace) = lookup("APP_NAME") {
            config.namespace = namespace;
        }

        if let Some(node_id) = lookup("POD_NAME").filter(|v| !v.is_empty()) {
            config.node_id = Some(node_id);
        }

        if let Some(addr) = lookup("ADVERTISE_ADDR").filter(|v| !v.is_empty()) {
            config.address = Some(addr);
        } else if let Some(ip) = lookup("POD_IP").filter(|v| !v.is_empty()) {
            let port = lookup("GRPC_PORT").unwrap_or_else(|| "9000".to_string());
            config.address = Some(format!("{ip}:{port}"));
        }

        if let Some(ttl) = lookup("ETCD_REGISTER_TTL").and_then(|v| v.parse::<i64>().ok()) {
            config.ttl_secs = ttl;
        }

        if let Some(ms) = parse_millis(lookup("REGISTER_RETRY_DELAY_MS")) {
            config.retry_delay = ms;
        }

        if let Some(capacity) =
            lookup("DISCOVERY_EVENT_CAPACITY").and_then(|v| v.parse::<usize>().ok())
        {
            config.event_capacity = capacity;
        }

        if let Some(endpoints) = lookup("ETCD_ENDPOINTS") {
            config.etcd.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.etcd.username = lookup("ETCD_USERNAME").filter(|v| !v.is_empty());
        config.etcd.password = lookup("ETCD_PASSWORD").filter(|v| !v.is_empty());

        if let Some(timeout) = parse_millis(lookup("ETCD_DIAL_TIMEOUT_MS")) {
            config.etcd.dial_timeout = timeout;
        }

        // Renew three times per TTL
        if config.ttl_secs > 0 {
            let ttl_ms = (config.ttl_secs as u64).saturating_mul(1000);
            config.etcd.keepalive_interval = Duration::from_millis((ttl_ms / 3).max(500));
        }

        if let Some(timeout) = parse_millis(lookup("GRPC_CONNECT_TIMEOUT_MS")) {
            config.pool.connect_timeout = timeout;
        }

        config
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig::new(self.namespace.clone()).with_event_capacity(self.event_capacity)
    }

    /// Registration settings; fails when node id or address is missing.
    pub fn registration(&self) -> Result<RegistrationConfig> {
        let node_id = self
            .node_id
            .clone()
            .ok_or_else(|| Error::config("node id must be set"))?;
        let address = self
            .address
            .clone()
            .ok_or_else(|| Error::config("address must be set"))?;
        Ok(RegistrationConfig::new(self.namespace.clone(), node_id, address)
            .with_ttl(self.ttl_secs)
            .with_retry_delay(self.retry_delay))
    }
}

fn parse_millis(value: Option<String>) -> Option<Duration> {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::config(format!("{what} must be set")));
    }
    if value.contains('/') {
        return Err(Error::config(format!("{what} must not contain '/'")));
    }
    Ok(())
}
