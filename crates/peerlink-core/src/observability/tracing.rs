//! Log Setup
//!
//! Console logging through `tracing-subscriber`, filtered by `RUST_LOG`
//! (default INFO).
//!
//! Environment variables:
//! - `LOG_FORMAT` - Set to `json` for JSON output (default: `text`)
//! - `PEERLINK_SERVICE_NAME` - Service name logged at start-up (default: `peerlink`)

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration for log initialization
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Service name reported at start-up
    pub service_name: String,
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "peerlink".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl TracingConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("PEERLINK_SERVICE_NAME")
                .unwrap_or(defaults.service_name),
            log_format: std::env::var("LOG_FORMAT").unwrap_or(defaults.log_format),
        }
    }

    pub fn is_json(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if config.is_json() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init()?;
    }

    tracing::debug!(service_name = %config.service_name, "Tracing initialized");
    Ok(())
}
