use anyhow::{bail, Context};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{env, fs, path::Path};

use crate::core::priority::{DEFAULT_PRIORITY, PRIORITY_LEVELS};
use crate::core::queue::QueueDefaults;

/// Overrides `workers.pool_size`.
pub const ENV_WORKER_POOL_SIZE: &str = "PRIOMQ_WORKER_POOL_SIZE";
/// Path of the TOML file `CONFIG` loads.
pub const ENV_CONFIG_PATH: &str = "PRIOMQ_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "priomq.toml";

pub const DEFAULT_WORKER_POOL_SIZE: usize = 5;
pub const DEFAULT_PREFETCH: u16 = 50;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "memory://localhost".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Handlers running at once across every logical queue.
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_WORKER_POOL_SIZE,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub default_prefetch: u16,
    pub default_priority: u8,
    pub durable: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_prefetch: DEFAULT_PREFETCH,
            default_priority: DEFAULT_PRIORITY,
            durable: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MessageConfig {
    pub persistent: bool,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self { persistent: true }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub workers: WorkerConfig,
    pub queues: QueueConfig,
    pub messages: MessageConfig,
}

impl Config {
    /// Defaults plus environment overrides.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn queue_defaults(&self) -> QueueDefaults {
        QueueDefaults {
            durable: self.queues.durable,
            persistent: self.messages.persistent,
            prefetch: self.queues.default_prefetch,
        }
    }

    fn apply_env(&mut self) -> anyhow::Result<()> {
        if let Ok(raw) = env::var(ENV_WORKER_POOL_SIZE) {
            self.workers.pool_size = raw
                .trim()
                .parse()
                .with_context(|| format!("{ENV_WORKER_POOL_SIZE}={raw:?} is not an integer"))?;
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.broker.url.trim().is_empty() {
            bail!("broker.url must not be blank");
        }
        if self.workers.pool_size == 0 {
            bail!("workers.pool_size must be at least 1");
        }
        if self.queues.default_prefetch == 0 {
            bail!("queues.default_prefetch must be at least 1");
        }
        if self.queues.default_priority as usize >= PRIORITY_LEVELS {
            bail!(
                "queues.default_priority must be within 0..={}",
                PRIORITY_LEVELS - 1
            );
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let path = path.as_ref();
    let raw: String = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let mut config: Config = toml::from_str(&raw)?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Process-wide configuration, read once on first access.
///
/// Loads `$PRIOMQ_CONFIG` if set, else `priomq.toml` when present, else defaults.
/// Environment overrides apply in every case. An unusable configuration falls back
/// to the defaults with an error logged.
pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    let loaded = match env::var(ENV_CONFIG_PATH) {
        Ok(path) => load_config(path),
        Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => load_config(DEFAULT_CONFIG_FILE),
        Err(_) => Config::from_env(),
    };
    loaded.unwrap_or_else(|err| {
        tracing::error!(target: "priomq::config", error = %err, "Invalid configuration; using defaults");
        Config::default()
    })
});
