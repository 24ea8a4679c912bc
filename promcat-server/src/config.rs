use promcat_core::{
    CatalogError, DEFAULT_POLL_INTERVAL, DEFAULT_SWEEP_INTERVAL, DEFAULT_TIME_TO_LIVE, Result,
    StoreBackend, default_lock_path,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables understood by earlier deployments, mapped onto
/// their configuration keys. They override every other source.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("DB_FILE", "store.path"),
    ("FILE_SD_CONFIG", "discovery.path"),
    ("TIME_TO_LIVE", "catalog.time_to_live_secs"),
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:5000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("db.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_path")]
    pub path: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            path: default_discovery_path(),
        }
    }
}

fn default_discovery_path() -> PathBuf {
    PathBuf::from("file_sd_config.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_time_to_live_secs")]
    pub time_to_live_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            time_to_live_secs: default_time_to_live_secs(),
        }
    }
}

fn default_time_to_live_secs() -> u64 {
    DEFAULT_TIME_TO_LIVE.as_secs()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Defaults to `<store.path>.lock`
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Unset keeps waiting on a held lock forever
    #[serde(default)]
    pub stale_after_secs: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_ms: default_poll_interval_ms(),
            stale_after_secs: None,
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_sources(path, |key| std::env::var(key).ok())
    }

    fn from_sources(path: &str, legacy_env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("PROMCAT")
                    .prefix_separator("_")
                    .separator("__"),
            );

        for (var, key) in LEGACY_ENV_KEYS {
            builder = builder
                .set_override_option(*key, legacy_env(*var))
                .map_err(|e| CatalogError::Config(e.to_string()))?;
        }

        let settings = builder
            .build()
            .map_err(|e| CatalogError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CatalogError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.bind_addr.trim().is_empty() {
            return Err(CatalogError::Config("server.bind_addr is empty".to_string()));
        }
        if self.store.path.as_os_str().is_empty() {
            return Err(CatalogError::Config("store.path is empty".to_string()));
        }
        if self.discovery.path.as_os_str().is_empty() {
            return Err(CatalogError::Config("discovery.path is empty".to_string()));
        }
        if self.catalog.time_to_live_secs == 0 {
            return Err(CatalogError::Config(
                "catalog.time_to_live_secs must be greater than zero".to_string(),
            ));
        }
        if self.lock.poll_interval_ms == 0 {
            return Err(CatalogError::Config(
                "lock.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.sweep.interval_secs == 0 {
            return Err(CatalogError::Config(
                "sweep.interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.lock
            .path
            .clone()
            .unwrap_or_else(|| default_lock_path(&self.store.path))
    }

    pub fn time_to_live(&self) -> Duration {
        Duration::from_secs(self.catalog.time_to_live_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.lock.stale_after_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }
}
