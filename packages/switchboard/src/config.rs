use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::Backoff;
use crate::error::ConfigError;
use crate::queue::OverflowPolicy;

// =============================================================================
// Client config (figment-deserialized from defaults / TOML file / env vars)
// =============================================================================
//
//   config.toml:     url = "ws://dashboard.local/ws"
//                    [queue]
//                    capacity = 500
//
//   env var:         SWITCHBOARD_QUEUE__CAPACITY=500   (double underscore = nesting)

/// Everything needed to run one client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Consecutive failed attempts tolerated before giving up. Unbounded when
    /// absent.
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Outbound queue tunables (lives under `[queue]`).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Unbounded when absent.
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_reconnect_attempts: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            queue: QueueConfig::default(),
        }
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl ClientConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_cap_ms),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::Invalid(
                "backoff_base_ms must be greater than zero".into(),
            ));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Layer struct defaults, an optional TOML file and `SWITCHBOARD_*` env vars.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(ClientConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("SWITCHBOARD_").split("__"))
}

/// Load, extract and validate. A path that was given must exist.
pub fn resolve(path: Option<&Path>) -> Result<ClientConfig, ConfigError> {
    if let Some(path) = path.filter(|p| !p.exists()) {
        return Err(ConfigError::Invalid(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    let config: ClientConfig = load_config(path).extract()?;
    config.validate()?;
    Ok(config)
}
