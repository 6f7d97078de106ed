//! Configuration for the dispatch processes
//!
//! Values come from, in rising priority: built-in defaults, an optional TOML
//! file, `DISPATCH__<SECTION>__<KEY>` environment variables and command line
//! flags.

use clap::Args;
use serde::{Deserialize, Serialize};
use services_common::constants::{
    DEFAULT_AMQP_URI, DEFAULT_COURIER_URL, DEFAULT_DATABASE_URL, DEFAULT_DB_MAX_CONNECTIONS,
    DEFAULT_QUEUE_NAME, DEFAULT_SERVER_ADDR, DEFAULT_WORKER_ADDR, ENQUEUE_TIMEOUT_MS,
    MAX_PUBLISH_ATTEMPTS, PUBLISH_TIMEOUT_MS, QUEUE_BUFFER_CAPACITY, RECONNECT_DELAY_MS,
    SHUTDOWN_DRAIN_TIMEOUT_MS,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DispatchError, DispatchResult};
use crate::queue::QueueConfig;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "DISPATCH";

/// Dispatch configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// HTTP servers
    pub server: ServerConfig,
    /// Order database
    pub database: DatabaseConfig,
    /// Message broker and publish buffer
    pub queue: QueueSettings,
    /// Courier endpoints
    pub couriers: CourierConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address of the order server
    pub order_addr: String,
    /// Bind address of the courier worker
    pub worker_addr: String,
    /// How long in-flight requests may drain on shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            order_addr: DEFAULT_SERVER_ADDR.to_string(),
            worker_addr: DEFAULT_WORKER_ADDR.to_string(),
            shutdown_timeout_ms: SHUTDOWN_DRAIN_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    /// Shutdown drain timeout
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Accept the `:8080` shorthand for all interfaces
#[must_use]
pub fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string
    pub url: String,
    /// Pool size
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

/// Broker and buffer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// AMQP connection uri
    pub uri: String,
    /// Queue name
    pub name: String,
    /// Publish buffer capacity
    pub buffer_capacity: usize,
    /// Enqueue wait in milliseconds
    pub enqueue_timeout_ms: u64,
    /// Per-attempt publish deadline in milliseconds
    pub publish_timeout_ms: u64,
    /// Publish attempts per message
    pub max_publish_attempts: u32,
    /// Receiver re-subscribe delay in milliseconds
    pub reconnect_delay_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            uri: DEFAULT_AMQP_URI.to_string(),
            name: DEFAULT_QUEUE_NAME.to_string(),
            buffer_capacity: QUEUE_BUFFER_CAPACITY,
            enqueue_timeout_ms: ENQUEUE_TIMEOUT_MS,
            publish_timeout_ms: PUBLISH_TIMEOUT_MS,
            max_publish_attempts: MAX_PUBLISH_ATTEMPTS,
            reconnect_delay_ms: RECONNECT_DELAY_MS,
        }
    }
}

impl QueueSettings {
    /// Runtime settings of the queue manager
    #[must_use]
    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            queue_name: self.name.clone(),
            buffer_capacity: self.buffer_capacity,
            enqueue_timeout: Duration::from_millis(self.enqueue_timeout_ms),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            max_publish_attempts: self.max_publish_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

/// Courier endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    /// Base urls; one is picked at random per call
    pub endpoints: Vec<String>,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_COURIER_URL.to_string()],
        }
    }
}

impl DispatchConfig {
    /// Load defaults, then the file at `path` if it exists, then the environment
    pub fn load(path: Option<&Path>) -> DispatchResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        Self::build(builder.add_source(environment()))
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(document: &str) -> DispatchResult<Self> {
        Self::build(
            config::Config::builder()
                .add_source(config::File::from_str(document, config::FileFormat::Toml)),
        )
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> DispatchResult<Self> {
        builder
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| DispatchError::Configuration {
                message: e.to_string(),
            })
    }

    /// Check values the processes cannot run without
    pub fn validate(&self) -> DispatchResult<()> {
        if self.queue.name.trim().is_empty() {
            return Err(DispatchError::Configuration {
                message: "queue name must not be empty".to_string(),
            });
        }
        if self.queue.buffer_capacity == 0 {
            return Err(DispatchError::Configuration {
                message: "queue buffer capacity must be positive".to_string(),
            });
        }
        if self.queue.max_publish_attempts == 0 {
            return Err(DispatchError::Configuration {
                message: "at least one publish attempt is required".to_string(),
            });
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(" ")
        .with_list_parse_key("couriers.endpoints")
}

/// Which process is applying the overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// HTTP order intake plus sender loop
    OrderServer,
    /// Courier endpoint plus receiver loop
    CourierWorker,
}

/// Command line flags shared by both servers
#[derive(Debug, Clone, Default, Args)]
pub struct CliOverrides {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address the server listens on
    #[arg(long)]
    pub addr: Option<String>,

    /// Broker connection uri
    #[arg(long)]
    pub queue: Option<String>,

    /// Database connection string
    #[arg(long)]
    pub dsn: Option<String>,

    /// Courier base urls, split by single space
    #[arg(long)]
    pub couriers: Option<String>,
}

impl CliOverrides {
    /// Load the configuration and apply the flags on top
    pub fn resolve(&self, role: ProcessRole) -> DispatchResult<DispatchConfig> {
        let mut config = DispatchConfig::load(self.config.as_deref())?;
        self.apply(&mut config, role);
        config.validate()?;
        Ok(config)
    }

    /// Apply the flags that were given
    pub fn apply(&self, config: &mut DispatchConfig, role: ProcessRole) {
        if let Some(addr) = &self.addr {
            match role {
                ProcessRole::OrderServer => config.server.order_addr.clone_from(addr),
                ProcessRole::CourierWorker => config.server.worker_addr.clone_from(addr),
            }
        }
        if let Some(uri) = &self.queue {
            config.queue.uri.clone_from(uri);
        }
        if let Some(dsn) = &self.dsn {
            config.database.url.clone_from(dsn);
        }
        if let Some(couriers) = &self.couriers {
            config.couriers.endpoints = couriers
                .split(' ')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.server.order_addr, "0.0.0.0:8080");
        assert_eq!(config.server.worker_addr, "0.0.0.0:8081");
        assert_eq!(config.couriers.endpoints, vec!["http://localhost:8081/".to_string()]);
        assert_eq!(config.queue.to_queue_config().buffer_capacity, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DispatchConfig::from_toml(
            r#"
            [queue]
            name = "orders_test"
            enqueue_timeout_ms = 250

            [couriers]
            endpoints = ["http://c1", "http://c2"]
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.name, "orders_test");
        assert_eq!(config.queue.enqueue_timeout_ms, 250);
        assert_eq!(config.queue.publish_timeout_ms, 5000);
        assert_eq!(config.couriers.endpoints.len(), 2);
        assert_eq!(config.database, DatabaseConfig::default());
    }

    #[test]
    fn test_cli_overrides_follow_role() {
        let flags = CliOverrides {
            addr: Some(":9090".to_string()),
            couriers: Some("http://c1  http://c2".to_string()),
            dsn: Some("postgresql://localhost/test".to_string()),
            ..CliOverrides::default()
        };

        let mut config = DispatchConfig::default();
        flags.apply(&mut config, ProcessRole::CourierWorker);

        assert_eq!(config.server.worker_addr, ":9090");
        assert_eq!(config.server.order_addr, "0.0.0.0:8080");
        assert_eq!(config.couriers.endpoints, vec!["http://c1", "http://c2"]);
        assert_eq!(config.database.url, "postgresql://localhost/test");
    }

    #[test]
    fn test_bind_addr_shorthand() {
        assert_eq!(bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(bind_addr("127.0.0.1:8081"), "127.0.0.1:8081");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = DispatchConfig::default();
        config.queue.buffer_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(DispatchError::Configuration { .. })
        ));
    }
}
