//! Hub Configuration
//!
//! Loaded with figment from built-in defaults, then `hearth.toml`, then
//! `HEARTH_*` environment variables (`HEARTH_JOBS__MAX_ACTIVE=10`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use hearth_runtime::{JobConfig, PluginTimeouts, PropertyValues};

/// Default configuration file name
pub const CONFIG_FILE: &str = "hearth.toml";

/// Top-level hub configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub hub: HubSection,
    pub jobs: JobsConfig,
    pub plugins: PluginsConfig,
    pub tasks: TasksConfig,
    pub availability: AvailabilityConfig,
    pub devices: DevicesConfig,
}

impl HubConfig {
    /// Load configuration, layering `path` (default `hearth.toml`) and the
    /// environment over the defaults. A missing file is not an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.unwrap_or(Path::new(CONFIG_FILE));
        let config = Self::figment(path).extract()?;
        Ok(config)
    }

    /// The provider stack used by [`HubConfig::load`]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(HubConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("HEARTH_").split("__"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub name: String,
    /// Directory holding the device database; `None` keeps devices in memory
    pub data_dir: Option<PathBuf>,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            name: "Hearth".to_string(),
            data_dir: Some(PathBuf::from("./data")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub window_secs: u64,
    pub max_active: usize,
    pub default_timeout_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        let defaults = JobConfig::default();
        Self {
            window_secs: defaults.window.as_secs(),
            max_active: defaults.max_active,
            default_timeout_secs: defaults.default_timeout.as_secs(),
        }
    }
}

impl JobsConfig {
    pub fn to_job_config(&self) -> JobConfig {
        JobConfig {
            window: Duration::from_secs(self.window_secs),
            max_active: self.max_active,
            default_timeout: Duration::from_secs(self.default_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    pub startup_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Start the built-in `hub` plugin
    pub builtin: bool,
    /// Startup configuration handed to each plugin, keyed by plugin id
    pub config: BTreeMap<String, PropertyValues>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        let defaults = PluginTimeouts::default();
        Self {
            startup_timeout_secs: defaults.startup.as_secs(),
            shutdown_timeout_secs: defaults.shutdown.as_secs(),
            builtin: true,
            config: BTreeMap::new(),
        }
    }
}

impl PluginsConfig {
    pub fn timeouts(&self) -> PluginTimeouts {
        PluginTimeouts {
            startup: Duration::from_secs(self.startup_timeout_secs),
            shutdown: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    /// Startup configuration for one plugin (empty if none configured)
    pub fn config_for(&self, plugin_id: &str) -> PropertyValues {
        self.config.get(plugin_id).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Interval between registration sweeps
    pub sweep_interval_secs: u64,
    /// Bound on one `on_create_tasks` delivery
    pub callback_timeout_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            callback_timeout_ms: 10_000,
        }
    }
}

impl TasksConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    /// Silence after which a device is reported unavailable
    pub timeout_secs: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

impl AvailabilityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    /// Descriptors kept in memory at once
    pub max_resident: usize,
    /// Database file name inside the data directory
    pub database: String,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            max_resident: 1024,
            database: "devices.redb".to_string(),
        }
    }
}
