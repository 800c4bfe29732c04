//! Configuration types for iotrace

use crate::backend::{BackendConnector, LocalConnector, NullConnector};
use crate::error::{IoTraceError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IoTraceConfig {
    /// Replay engine configuration
    pub replay: ReplayConfig,

    /// Backend used by replay
    pub backend: BackendConfig,
}

/// Replay engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Route every record through a single lane, with no bandwidth reporting
    pub sequential: bool,

    /// Reproduce the captured gaps between records
    pub wait: bool,

    /// Prefix rewrite applied to OPEN paths
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_rewrite: Option<PathRewrite>,

    /// How long a lane may sit with an empty queue before it is retired
    #[serde(with = "humantime_serde")]
    pub lane_idle_timeout: Duration,

    /// How often the dispatcher looks for idle lanes
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,

    /// Hold each CLOSE until the READs dispatched before it have finished
    pub close_barrier: bool,

    /// Compare replayed read sizes with the captured READ_RET codes
    pub verify_reads: bool,

    /// Bandwidth report period (none disables reporting)
    #[serde(with = "humantime_serde")]
    pub report_interval: Option<Duration>,

    /// Records buffered between the trace reader and the dispatcher
    pub input_buffer: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            sequential: false,
            wait: false,
            path_rewrite: None,
            lane_idle_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_millis(500),
            close_barrier: true,
            verify_reads: false,
            report_interval: Some(Duration::from_secs(1)),
            input_buffer: 1024,
        }
    }
}

impl ReplayConfig {
    /// Check the values replay depends on
    pub fn validate(&self) -> Result<()> {
        if self.lane_idle_timeout.is_zero() {
            return Err(IoTraceError::Configuration(
                "lane_idle_timeout must be greater than zero".to_string(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(IoTraceError::Configuration(
                "reap_interval must be greater than zero".to_string(),
            ));
        }
        if self.input_buffer == 0 {
            return Err(IoTraceError::Configuration(
                "input_buffer must be at least 1".to_string(),
            ));
        }
        if let Some(rewrite) = &self.path_rewrite {
            if rewrite.from.is_empty() {
                return Err(IoTraceError::Configuration(
                    "path_rewrite.from must not be empty".to_string(),
                ));
            }
        }
        if self.report_interval.is_some_and(|d| d.is_zero()) {
            return Err(IoTraceError::Configuration(
                "report_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Replace a leading path prefix on replayed OPENs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRewrite {
    /// Prefix to match
    pub from: String,
    /// Replacement
    pub to: String,
}

impl PathRewrite {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Rewrite `path` if it starts with the prefix, otherwise return it unchanged
    pub fn apply<'a>(&self, path: &'a str) -> std::borrow::Cow<'a, str> {
        match path.strip_prefix(self.from.as_str()) {
            Some(rest) => std::borrow::Cow::Owned(format!("{}{}", self.to, rest)),
            None => std::borrow::Cow::Borrowed(path),
        }
    }
}

impl std::str::FromStr for PathRewrite {
    type Err = IoTraceError;

    /// Parse `FROM=TO`
    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s.split_once('=').ok_or_else(|| {
            IoTraceError::Configuration(format!("Invalid path rewrite '{s}', expected FROM=TO"))
        })?;
        if from.is_empty() {
            return Err(IoTraceError::Configuration(format!(
                "Invalid path rewrite '{s}': empty prefix"
            )));
        }
        Ok(Self::new(from, to))
    }
}

/// Which filesystem backend replay drives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local filesystem, trace paths resolved beneath `root`
    Local {
        /// Root directory
        root: PathBuf,
    },

    /// No I/O at all
    Null,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Local {
            root: PathBuf::from("/"),
        }
    }
}

impl BackendConfig {
    /// Build the connector for this backend
    pub fn connector(&self) -> Arc<dyn BackendConnector> {
        match self {
            BackendConfig::Local { root } => Arc::new(LocalConnector::new(root.clone())),
            BackendConfig::Null => Arc::new(NullConnector),
        }
    }
}

impl IoTraceConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `iotrace.toml` in the working directory
    /// 3. The file named by `IOTRACE_CONFIG_PATH`
    /// 4. `IOTRACE_`-prefixed environment variables, with `__` between
    ///    nesting levels (`IOTRACE_REPLAY__WAIT=true`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Like [`load`](Self::load), with `explicit` taking the place of
    /// `IOTRACE_CONFIG_PATH` when given
    ///
    /// # Errors
    ///
    /// Returns an error if `explicit` does not exist, a configuration file is
    /// invalid or validation fails.
    pub fn load_with(explicit: Option<&std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(IoTraceConfig::default()))
            .merge(Toml::file("iotrace.toml"));

        match explicit {
            Some(path) => {
                if !path.is_file() {
                    return Err(IoTraceError::Configuration(format!(
                        "Configuration file not found: {}",
                        path.display()
                    )));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Ok(path) = std::env::var("IOTRACE_CONFIG_PATH") {
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        let config: IoTraceConfig = figment
            .merge(Env::prefixed("IOTRACE_").split("__"))
            .extract()
            .map_err(|e| {
                IoTraceError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let path = path.as_ref();
        if !path.is_file() {
            return Err(IoTraceError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: IoTraceConfig = Figment::from(Serialized::defaults(IoTraceConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                IoTraceError::Configuration(format!("Failed to load configuration file: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        self.replay.validate()?;
        if let BackendConfig::Local { root } = &self.backend {
            if root.as_os_str().is_empty() {
                return Err(IoTraceError::Configuration(
                    "backend.root must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
