//! Target registry and search settings.
//!
//! Targets are loaded from JSON of the form
//!
//! ```json
//! {"targets": [{"name": "LOC", "host": "lx2.loc.gov", "port": 210, "database": "LCDB"}]}
//! ```
//!
//! and kept in registration order. [`SearchConfig`] carries the knobs of a
//! federated search; its defaults can be overridden from a JSON file or from
//! `Z3950_RESULT_LIMIT`, `Z3950_MAX_CONCURRENCY` and `Z3950_TIMEOUT_SECS`.

use crate::z3950::session::SessionConfig;
use crate::z3950::DEFAULT_PORT;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding [`SearchConfig::result_limit`].
pub const ENV_RESULT_LIMIT: &str = "Z3950_RESULT_LIMIT";
/// Environment variable overriding [`SearchConfig::max_concurrency`].
pub const ENV_MAX_CONCURRENCY: &str = "Z3950_MAX_CONCURRENCY";
/// Environment variable overriding [`SearchConfig::timeout_secs`].
pub const ENV_TIMEOUT_SECS: &str = "Z3950_TIMEOUT_SECS";

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The JSON could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// Parsed, but the values make no sense.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Login for targets that require one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// User id
    pub user: String,
    /// Password
    pub password: String,
    /// Group id, rarely used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// One remote catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Display name, unique within a registry
    pub name: String,
    /// Host name or address
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database to search
    pub database: String,
    /// Optional login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Target {
    /// A target without credentials.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
    ) -> Self {
        Target {
            name: name.into(),
            host: host.into(),
            port,
            database: database.into(),
            credentials: None,
        }
    }

    /// Attach credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("target name is empty".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "target {} has no host",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "target {} has port 0",
                self.name
            )));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "target {} has no database",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    targets: Vec<Target>,
}

/// Named targets in registration order.
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: IndexMap<String, Target>,
}

impl TargetRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse registry JSON.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for bad JSON, [`ConfigError::Invalid`] for an
    /// incomplete target or a repeated name.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: RegistryFile = serde_json::from_str(json)?;
        let mut registry = TargetRegistry::new();
        for target in file.targets {
            registry.insert(target)?;
        }
        Ok(registry)
    }

    /// Read and parse a registry file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_json`](Self::from_json).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&read_file(path.as_ref())?)
    }

    /// Serialize back to registry JSON.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        let file = RegistryFile {
            targets: self.targets.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Add a target.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the target is incomplete or its name is
    /// taken.
    pub fn insert(&mut self, target: Target) -> Result<(), ConfigError> {
        target.validate()?;
        if self.targets.contains_key(&target.name) {
            return Err(ConfigError::Invalid(format!(
                "duplicate target name {}",
                target.name
            )));
        }
        self.targets.insert(target.name.clone(), target);
        Ok(())
    }

    /// Look a target up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Target> {
        self.targets.get(name)
    }

    /// Targets named in `names`, in that order.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first unknown target.
    pub fn select(&self, names: &[&str]) -> Result<Vec<Target>, ConfigError> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| ConfigError::Invalid(format!("unknown target {name}")))
            })
            .collect()
    }

    /// All targets in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Target> {
        self.targets.values()
    }

    /// Owned copies of every target.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Target> {
        self.targets.values().cloned().collect()
    }

    /// Number of targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when no targets are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Settings for a federated search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Records fetched per target when the caller passes no positive limit
    pub result_limit: usize,
    /// Targets searched at the same time
    pub max_concurrency: usize,
    /// Per-operation network timeout in seconds
    pub timeout_secs: u64,
    /// Preferred message size offered at Init
    pub preferred_message_size: usize,
    /// Largest single record accepted
    pub max_record_size: usize,
    /// Events buffered between workers and the sink
    pub channel_capacity: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            result_limit: 5,
            max_concurrency: 8,
            timeout_secs: 30,
            preferred_message_size: 1024 * 1024,
            max_record_size: 1024 * 1024,
            channel_capacity: 256,
        }
    }
}

impl SearchConfig {
    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if an override is not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = SearchConfig::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read settings from a JSON file; absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`], [`ConfigError::Parse`], or
    /// [`ConfigError::Invalid`] from [`validate`](Self::validate).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: SearchConfig = serde_json::from_str(&read_file(path.as_ref())?)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a present value does not parse as a
    /// positive integer.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(limit) = positive(&lookup, ENV_RESULT_LIMIT)? {
            self.result_limit = usize::try_from(limit)
                .map_err(|_| ConfigError::Invalid(format!("{ENV_RESULT_LIMIT} too large")))?;
        }
        if let Some(max) = positive(&lookup, ENV_MAX_CONCURRENCY)? {
            self.max_concurrency = usize::try_from(max)
                .map_err(|_| ConfigError::Invalid(format!("{ENV_MAX_CONCURRENCY} too large")))?;
        }
        if let Some(secs) = positive(&lookup, ENV_TIMEOUT_SECS)? {
            self.timeout_secs = secs;
        }
        Ok(())
    }

    /// Reject settings that would stall or disable the search.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("result_limit", self.result_limit),
            ("max_concurrency", self.max_concurrency),
            ("channel_capacity", self.channel_capacity),
            ("preferred_message_size", self.preferred_message_size),
            ("max_record_size", self.max_record_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    /// Network timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Session settings for one target.
    #[must_use]
    pub fn session_config(&self, target: &Target) -> SessionConfig {
        SessionConfig {
            timeout: self.timeout(),
            preferred_message_size: self.preferred_message_size,
            max_record_size: self.max_record_size,
            credentials: target.credentials.clone(),
            ..SessionConfig::default()
        }
    }
}

fn positive<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(ConfigError::Invalid(format!(
            "{key} must be a positive integer, got {raw:?}"
        ))),
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const REGISTRY: &str = r#"{
        "targets": [
            {"name": "LOC", "host": "lx2.loc.gov", "port": 210, "database": "LCDB"},
            {"name": "Local", "host": "127.0.0.1", "database": "Default",
             "credentials": {"user": "u", "password": "p"}}
        ]
    }"#;

    #[test]
    fn test_registry_keeps_order_and_defaults_port() {
        let registry = TargetRegistry::from_json(REGISTRY).unwrap();
        let names: Vec<&str> = registry.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["LOC", "Local"]);
        let local = registry.get("Local").unwrap();
        assert_eq!(local.port, 210);
        assert_eq!(local.credentials.as_ref().unwrap().user, "u");
        assert_eq!(local.address(), "127.0.0.1:210");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let json = r#"{"targets": [
            {"name": "A", "host": "h", "database": "d"},
            {"name": "A", "host": "h2", "database": "d"}
        ]}"#;
        assert!(matches!(
            TargetRegistry::from_json(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_registry_rejects_incomplete_target() {
        let json = r#"{"targets": [{"name": "A", "host": "", "database": "d"}]}"#;
        assert!(matches!(
            TargetRegistry::from_json(json),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TargetRegistry::from_json("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_registry_select() {
        let registry = TargetRegistry::from_json(REGISTRY).unwrap();
        let picked = registry.select(&["Local", "LOC"]).unwrap();
        assert_eq!(picked[0].name, "Local");
        assert!(registry.select(&["Nope"]).is_err());
    }

    #[test]
    fn test_registry_file_roundtrip() {
        let registry = TargetRegistry::from_json(REGISTRY).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(registry.to_json().unwrap().as_bytes()).unwrap();
        let loaded = TargetRegistry::load(file.path()).unwrap();
        assert_eq!(loaded.to_vec(), registry.to_vec());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TargetRegistry::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_search_config_defaults() {
        let config = SearchConfig::default();
        assert_eq!(config.result_limit, 5);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.preferred_message_size, 1_048_576);
        assert_eq!(config.channel_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_RESULT_LIMIT, "12"),
            (ENV_MAX_CONCURRENCY, "3"),
            (ENV_TIMEOUT_SECS, " 4 "),
        ]
        .into_iter()
        .collect();
        let mut config = SearchConfig::default();
        config
            .apply_env(|key| vars.get(key).map(ToString::to_string))
            .unwrap();
        assert_eq!(config.result_limit, 12);
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.timeout_secs, 4);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = SearchConfig::default();
        let err = config
            .apply_env(|key| (key == ENV_MAX_CONCURRENCY).then(|| "0".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_MAX_CONCURRENCY));
        assert_eq!(config.max_concurrency, 8);
    }

    #[test]
    fn test_search_config_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"result_limit": 20}"#).unwrap();
        let config = SearchConfig::load(file.path()).unwrap();
        assert_eq!(config.result_limit, 20);
        assert_eq!(config.max_concurrency, 8);
    }

    #[test]
    fn test_session_config_carries_credentials() {
        let target = Target::new("T", "h", 210, "db").with_credentials(Credentials {
            user: "u".to_string(),
            password: "p".to_string(),
            group: None,
        });
        let session = SearchConfig::default().session_config(&target);
        assert_eq!(session.timeout, Duration::from_secs(30));
        assert_eq!(session.credentials.unwrap().password, "p");
    }
}
