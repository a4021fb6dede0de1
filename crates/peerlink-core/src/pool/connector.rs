//! Connectors
//!
//! A `Connector` turns an advertised address into a connection handle and
//! knows how to close it. `GrpcConnector` produces tonic channels.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::trace;

/// Dials and closes connections to peers.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Handle to an established connection
    type Connection: Clone + Send + Sync + 'static;

    async fn dial(&self, address: &str) -> Result<Self::Connection>;

    async fn close(&self, connection: &Self::Connection);
}

/// Connector producing tonic channels with HTTP/2 keep-alive
#[derive(Debug, Clone, Default)]
pub struct GrpcConnector {
    config: PoolConfig,
}

impl GrpcConnector {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    /// Endpoint for an address; plain `host:port` gets an `http://` scheme.
    pub fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let endpoint = Endpoint::from_shared(uri)?
            .connect_timeout(self.config.connect_timeout)
            .http2_keep_alive_interval(self.config.keepalive_interval)
            .keep_alive_timeout(self.config.keepalive_timeout)
            .keep_alive_while_idle(true);
        Ok(endpoint)
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Connection = Channel;

    async fn dial(&self, address: &str) -> Result<Channel> {
        let endpoint = self.endpoint(address)?;
        if self.config.lazy_connect {
            return Ok(endpoint.connect_lazy());
        }
        endpoint.connect().await.map_err(|e| Error::Dial {
            address: address.to_string(),
            reason: e.to_string(),
        })
    }

    async fn close(&self, _connection: &Channel) {
        // A channel shuts down once its last clone is dropped; clones handed
        // to callers keep it open until their in-flight calls finish.
        trace!("Releasing gRPC channel");
    }
}
