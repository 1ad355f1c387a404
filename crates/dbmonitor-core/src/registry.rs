//! Connection registry and instance discovery.
//!
//! The registry holds one pooled handle per instance name. Handles are opened
//! once and kept for the life of the process; discovery only ever adds names.
//! Pools connect lazily, so an unreachable server is reported by the first
//! scrape rather than here.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::collector::ProcessListSource;
use crate::config::InstanceConfig;

/// Protocol used when the configuration leaves it empty.
pub const DEFAULT_PROTOCOL: &str = "tcp";

/// MySQL's conventional port, used when the configuration leaves it empty.
pub const DEFAULT_PORT: &str = "3306";

/// Shared handle to an instance's pool.
pub type SourceHandle = Arc<dyn ProcessListSource>;

/// Error type for opening an instance handle.
#[derive(Debug)]
pub enum RegistryError {
    /// Protocol is neither `tcp` nor `unix`.
    UnsupportedProtocol(String),
    /// Port is not a valid TCP port number.
    InvalidPort(String),
    /// Pool could not be created.
    Open(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::UnsupportedProtocol(p) => write!(f, "unsupported protocol '{}'", p),
            RegistryError::InvalidPort(p) => write!(f, "invalid port '{}'", p),
            RegistryError::Open(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Connection parameters for one instance, with defaults applied.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub user: String,
    pub password: String,
    pub protocol: String,
    pub host: String,
    pub port: String,
    pub schema: String,
}

impl ConnectionDescriptor {
    /// Builds a descriptor, defaulting protocol to `tcp` and port to `3306`.
    ///
    /// Returns `None` when host or user is empty.
    pub fn from_config(config: &InstanceConfig) -> Option<Self> {
        if !config.is_configured() {
            return None;
        }

        let or_default = |value: &str, default: &str| {
            if value.is_empty() {
                default.to_string()
            } else {
                value.to_string()
            }
        };

        Some(Self {
            user: config.user.clone(),
            password: config.password.clone(),
            protocol: or_default(&config.protocol, DEFAULT_PROTOCOL),
            host: config.host.clone(),
            port: or_default(&config.port, DEFAULT_PORT),
            schema: config.schema.clone(),
        })
    }

    /// Renders `user:password@protocol(host:port)/schema`.
    pub fn dsn(&self) -> String {
        format!(
            "{}:{}@{}({}:{})/{}",
            self.user, self.password, self.protocol, self.host, self.port, self.schema
        )
    }

    /// Parses the port as a TCP port number.
    pub fn port_number(&self) -> Result<u16, RegistryError> {
        self.port
            .parse::<u16>()
            .map_err(|_| RegistryError::InvalidPort(self.port.clone()))
    }
}

/// Masks the password so descriptors can be logged.
impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:***@{}({}:{})/{}",
            self.user, self.protocol, self.host, self.port, self.schema
        )
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionDescriptor({})", self)
    }
}

/// Pool tuning taken verbatim from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolTuning {
    pub max_idle_conns: i32,
    pub max_open_conns: i32,
    /// `None` reuses connections forever.
    pub conn_max_lifetime: Option<Duration>,
}

impl PoolTuning {
    pub fn from_config(config: &InstanceConfig) -> Self {
        let conn_max_lifetime = (config.conn_max_lifetime_secs > 0)
            .then(|| Duration::from_secs(config.conn_max_lifetime_secs as u64));
        Self {
            max_idle_conns: config.max_idle_conns,
            max_open_conns: config.max_open_conns,
            conn_max_lifetime,
        }
    }
}

/// Opens pooled handles. Implemented by `MySqlConnector` and by test doubles.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        descriptor: &ConnectionDescriptor,
        tuning: &PoolTuning,
    ) -> Result<SourceHandle, RegistryError>;
}

/// Counters from one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Instances newly registered by this pass.
    pub registered: Vec<String>,
    /// Entries skipped because host or user is empty.
    pub skipped_unconfigured: usize,
    /// Entries whose name was already registered.
    pub already_known: usize,
    /// Instances whose handle could not be opened.
    pub failed: Vec<String>,
}

/// Instance name → pooled handle.
pub struct ConnectionRegistry {
    connector: Box<dyn Connector>,
    instances: RwLock<BTreeMap<String, SourceHandle>>,
}

impl ConnectionRegistry {
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registers every configured instance not yet known.
    ///
    /// Unconfigured entries and open failures are skipped; the remaining
    /// entries are still processed. Presence check and insert happen under
    /// one write lock, so concurrent passes never open a name twice.
    pub fn discover(&self, configs: &[InstanceConfig]) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for config in configs {
            if instances.contains_key(&config.instance) {
                report.already_known += 1;
                continue;
            }

            let Some(descriptor) = ConnectionDescriptor::from_config(config) else {
                debug!(instance = %config.instance, "host or user empty, skipping");
                report.skipped_unconfigured += 1;
                continue;
            };
            let tuning = PoolTuning::from_config(config);

            match self.connector.open(&descriptor, &tuning) {
                Ok(handle) => {
                    info!(
                        instance = %config.instance,
                        dsn = %descriptor,
                        max_idle_conns = tuning.max_idle_conns,
                        max_open_conns = tuning.max_open_conns,
                        conn_max_lifetime_secs = config.conn_max_lifetime_secs,
                        "instance loaded"
                    );
                    instances.insert(config.instance.clone(), handle);
                    report.registered.push(config.instance.clone());
                }
                Err(e) => {
                    warn!(instance = %config.instance, dsn = %descriptor, error = %e,
                        "failed to open connection pool");
                    report.failed.push(config.instance.clone());
                }
            }
        }

        report
    }

    /// Returns the registered handles, cloned out so the lock is not held during I/O.
    pub fn snapshot(&self) -> Vec<(String, SourceHandle)> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, handle)| (name.clone(), Arc::clone(handle)))
            .collect()
    }

    pub fn contains(&self, instance: &str) -> bool {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(instance)
    }

    pub fn names(&self) -> Vec<String> {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::RecordingConnector;

    fn instance(name: &str, host: &str, user: &str) -> InstanceConfig {
        InstanceConfig {
            instance: name.to_string(),
            host: host.to_string(),
            user: user.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn descriptor_defaults_protocol_and_port() {
        let config = InstanceConfig {
            instance: "a".into(),
            host: "db1".into(),
            user: "u".into(),
            port: String::new(),
            protocol: String::new(),
            ..Default::default()
        };
        let d = ConnectionDescriptor::from_config(&config).unwrap();
        assert_eq!(d.protocol, "tcp");
        assert_eq!(d.port, "3306");
        assert_eq!(d.dsn(), "u:@tcp(db1:3306)/");
    }

    #[test]
    fn descriptor_keeps_explicit_values() {
        let config = InstanceConfig {
            instance: "a".into(),
            host: "/var/run/mysqld/mysqld.sock".into(),
            user: "u".into(),
            password: "p".into(),
            protocol: "unix".into(),
            port: "3307".into(),
            schema: "app".into(),
            ..Default::default()
        };
        let d = ConnectionDescriptor::from_config(&config).unwrap();
        assert_eq!(d.dsn(), "u:p@unix(/var/run/mysqld/mysqld.sock:3307)/app");
        assert_eq!(d.port_number().unwrap(), 3307);
    }

    #[test]
    fn descriptor_display_masks_password() {
        let config = InstanceConfig {
            host: "db1".into(),
            user: "u".into(),
            password: "hunter2".into(),
            ..Default::default()
        };
        let d = ConnectionDescriptor::from_config(&config).unwrap();
        assert!(!d.to_string().contains("hunter2"));
        assert!(!format!("{:?}", d).contains("hunter2"));
    }

    #[test]
    fn descriptor_requires_host_and_user() {
        assert!(ConnectionDescriptor::from_config(&instance("a", "", "u")).is_none());
        assert!(ConnectionDescriptor::from_config(&instance("a", "db1", "")).is_none());
    }

    #[test]
    fn tuning_zero_lifetime_means_forever() {
        let mut config = instance("a", "db1", "u");
        assert_eq!(PoolTuning::from_config(&config).conn_max_lifetime, None);
        config.conn_max_lifetime_secs = 90;
        assert_eq!(
            PoolTuning::from_config(&config).conn_max_lifetime,
            Some(Duration::from_secs(90))
        );
    }

    #[test]
    fn discovery_is_idempotent() {
        let connector = RecordingConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());
        let configs = vec![instance("a", "db1", "u"), instance("b", "db2", "u")];

        let first = registry.discover(&configs);
        assert_eq!(first.registered, vec!["a".to_string(), "b".to_string()]);

        let second = registry.discover(&configs);
        assert!(second.registered.is_empty());
        assert_eq!(second.already_known, 2);

        assert_eq!(registry.len(), 2);
        assert_eq!(connector.open_count(), 2);
    }

    #[test]
    fn unconfigured_instances_are_never_opened() {
        let connector = RecordingConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());
        let configs = vec![
            instance("no-host", "", "u"),
            instance("no-user", "db1", ""),
        ];

        let report = registry.discover(&configs);
        assert_eq!(report.skipped_unconfigured, 2);
        assert!(registry.is_empty());
        assert_eq!(connector.open_count(), 0);
    }

    #[test]
    fn open_failure_does_not_stop_discovery() {
        let connector = RecordingConnector::new().failing_host("bad");
        let registry = ConnectionRegistry::new(connector.clone());
        let configs = vec![
            instance("a", "bad", "u"),
            instance("b", "good", "u"),
        ];

        let report = registry.discover(&configs);
        assert_eq!(report.failed, vec!["a".to_string()]);
        assert_eq!(report.registered, vec!["b".to_string()]);
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));
    }

    #[test]
    fn failed_instance_is_retried_by_next_pass() {
        let connector = RecordingConnector::new().failing_host("bad");
        let registry = ConnectionRegistry::new(connector.clone());
        let configs = vec![instance("a", "bad", "u")];

        registry.discover(&configs);
        registry.discover(&configs);
        assert_eq!(connector.open_count(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn discovery_is_additive_only() {
        let connector = RecordingConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());

        registry.discover(&[instance("a", "db1", "u")]);
        // Changed host for a known name is ignored; new names are added.
        let report = registry.discover(&[instance("a", "db9", "u"), instance("b", "db2", "u")]);

        assert_eq!(report.already_known, 1);
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(connector.opened_hosts(), vec!["db1".to_string(), "db2".to_string()]);
    }

    #[test]
    fn concurrent_discovery_opens_each_name_once() {
        let connector = RecordingConnector::new();
        let registry = Arc::new(ConnectionRegistry::new(connector.clone()));
        let configs: Vec<_> = (0..8)
            .map(|i| instance(&format!("db{i}"), "host", "u"))
            .collect();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let configs = configs.clone();
                std::thread::spawn(move || registry.discover(&configs))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(registry.len(), 8);
        assert_eq!(connector.open_count(), 8);
    }
}
