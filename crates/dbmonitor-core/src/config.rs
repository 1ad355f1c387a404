//! Exporter configuration.
//!
//! Instances are read either from a YAML file laid out as
//!
//! ```yaml
//! autoDiscoverInterval: 60
//! datasource:
//!   mysql:
//!     - instance: orders
//!       host: 10.0.0.5
//!       port: "3306"
//!       user: monitor
//!       password: secret
//!       schema: orders
//!       maxIdleConns: 2
//!       maxOpenConns: 4
//!       connMaxLifeTimeInSeconds: 300
//! ```
//!
//! or from `DBMONITOR_*` environment variables (see [`Configuration::from_env_with`]).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Environment variable holding the configuration file path.
pub const CONFIGURATION_PATH_ENV: &str = "DBMONITOR_CONFIGURATION";

/// Configuration file used when no path is given.
pub const DEFAULT_CONFIGURATION_PATH: &str = "/dbmonitor/conf.yaml";

/// Environment variable listing instance names (env source).
pub const INSTANCES_ENV: &str = "DBMONITOR_INSTANCES";

/// Environment variable holding the discovery interval in seconds (env source).
pub const AUTO_DISCOVER_INTERVAL_ENV: &str = "DBMONITOR_AUTO_DISCOVER_INTERVAL";

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    Io { path: PathBuf, source: std::io::Error },
    /// Configuration file is not valid YAML for the expected layout.
    Parse(serde_yaml::Error),
    /// Environment variables are missing or malformed.
    Env(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ConfigError::Parse(e) => write!(f, "failed to parse configuration: {}", e),
            ConfigError::Env(msg) => write!(f, "environment configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Env(_) => None,
        }
    }
}

/// One monitored MySQL instance.
///
/// Empty `host` or `user` means "not configured"; such entries are skipped
/// by discovery rather than rejected here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceConfig {
    /// Unique instance name, emitted as the `dbinstance` label.
    pub instance: String,
    pub schema: String,
    pub host: String,
    #[serde(deserialize_with = "string_or_number")]
    pub port: String,
    pub user: String,
    pub password: String,
    pub protocol: String,
    pub max_idle_conns: i32,
    pub max_open_conns: i32,
    #[serde(rename = "connMaxLifeTimeInSeconds")]
    pub conn_max_lifetime_secs: i64,
}

impl InstanceConfig {
    /// Returns true when both host and user are set.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.user.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Datasource {
    pub mysql: Vec<InstanceConfig>,
}

/// Root of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    /// Seconds between re-reads of the configuration source. 0 disables re-discovery.
    pub auto_discover_interval: u64,
    pub datasource: Datasource,
}

impl Configuration {
    /// Loads the configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses the configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Builds the configuration from environment variables using `lookup`.
    ///
    /// `DBMONITOR_INSTANCES` holds comma-separated instance names. For each name
    /// the upper-cased key (`-` and `.` replaced by `_`) selects
    /// `DBMONITOR_<KEY>_HOST`, `_PORT`, `_USER`, `_PASSWORD`, `_SCHEMA`,
    /// `_PROTOCOL`, `_MAX_IDLE_CONNS`, `_MAX_OPEN_CONNS` and
    /// `_CONN_MAX_LIFETIME_SECS`.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let names = lookup(INSTANCES_ENV)
            .ok_or_else(|| ConfigError::Env(format!("{} not set", INSTANCES_ENV)))?;

        let auto_discover_interval = match lookup(AUTO_DISCOVER_INTERVAL_ENV) {
            Some(v) => parse_env_number(AUTO_DISCOVER_INTERVAL_ENV, &v)?,
            None => 0,
        };

        let mut mysql = Vec::new();
        for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let key = env_key(name);
            let var = |suffix: &str| format!("DBMONITOR_{}_{}", key, suffix);
            let text = |suffix: &str| lookup(&var(suffix)).unwrap_or_default();
            let number = |suffix: &str| -> Result<i64, ConfigError> {
                let name = var(suffix);
                match lookup(&name) {
                    Some(v) => parse_env_number(&name, &v),
                    None => Ok(0),
                }
            };

            mysql.push(InstanceConfig {
                instance: name.to_string(),
                schema: text("SCHEMA"),
                host: text("HOST"),
                port: text("PORT"),
                user: text("USER"),
                password: text("PASSWORD"),
                protocol: text("PROTOCOL"),
                max_idle_conns: clamp_i32(number("MAX_IDLE_CONNS")?),
                max_open_conns: clamp_i32(number("MAX_OPEN_CONNS")?),
                conn_max_lifetime_secs: number("CONN_MAX_LIFETIME_SECS")?,
            });
        }

        Ok(Self {
            auto_discover_interval,
            datasource: Datasource { mysql },
        })
    }

    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Configured instances in file order.
    pub fn instances(&self) -> &[InstanceConfig] {
        &self.datasource.mysql
    }

    /// Re-discovery interval, `None` when disabled.
    pub fn auto_discover_interval(&self) -> Option<Duration> {
        (self.auto_discover_interval > 0).then(|| Duration::from_secs(self.auto_discover_interval))
    }
}

/// Where the configuration comes from. Re-read on every discovery tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Env,
}

impl ConfigSource {
    pub fn load(&self) -> Result<Configuration, ConfigError> {
        match self {
            ConfigSource::File(path) => Configuration::from_file(path),
            ConfigSource::Env => Configuration::from_env(),
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Env => write!(f, "environment"),
        }
    }
}

fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '-' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

fn parse_env_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Env(format!("{}: invalid number '{}'", name, value)))
}

fn clamp_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Accepts `port: 3306` as well as `port: "3306"`.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    Ok(match Option::<StringOrNumber>::deserialize(deserializer)? {
        Some(StringOrNumber::String(s)) => s,
        Some(StringOrNumber::Number(n)) => n.to_string(),
        None => String::new(),
    })
}
