//! Configuration for database engines, storage backends and the pipelines.
//!
//! Adapter settings are free-form mappings selected by a `type` discriminator.
//! Each adapter validates the keys it needs through the typed accessors on
//! [`AdapterConfig`], which never coerce between value types.

use config::{Config, Environment, File, FileFormat, Map as ConfigMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Result, VaultError};

/// Default configuration file looked up by the CLI
pub const DEFAULT_CONFIG_FILE: &str = "db_backup_config.yaml";

/// Prefix for environment variables overlaid on the configuration file
pub const ENV_PREFIX: &str = "DUMPVAULT";

/// Template written by `dumpvault init`
pub const CONFIG_TEMPLATE: &str = r#"# dumpvault configuration
#
# Secrets can stay out of this file: keys can be overridden through the
# environment, e.g. DUMPVAULT_DATABASES__ORDERS__PASSWORD=... or
# DUMPVAULT_DATABASES__ORDERS__PORT=3307

databases:
  orders:
    type: mysql
    host: localhost
    port: 3306
    user: backup
    database: orders
  analytics:
    type: postgres
    host: localhost
    port: 5432
    user: backup
    database: analytics
  local_cache:
    type: sqlite
    path: /var/lib/app/cache.db

storage:
  type: local
  path: /var/backups/dumpvault
  # type: s3
  # bucket: my-backups
  # region: eu-west-1
  # path: databases

# work_dir: /var/tmp
# command_timeout_secs: 3600
# compression_level: 6
# timestamp_artifacts: false
"#;

/// Keys whose values are never printed
const SECRET_KEYS: &[&str] = &["password"];

/// Free-form adapter settings keyed by string, with a `type` discriminator
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdapterConfig {
    values: Map<String, Value>,
}

/// Settings for one database engine
pub type EngineConfig = AdapterConfig;

/// Settings for the storage backend
pub type StorageConfig = AdapterConfig;

impl AdapterConfig {
    /// Create a config with only the `type` discriminator set
    pub fn new(kind: &str) -> Self {
        Self::default().with("type", kind)
    }

    /// Builder-style setter, returns a new config with `key` set
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Create a local filesystem storage config rooted at `path`
    pub fn local_storage<P: AsRef<Path>>(path: P) -> Self {
        Self::new("local").with("path", path.as_ref().to_string_lossy().into_owned())
    }

    /// Create an S3 storage config for `bucket`
    pub fn s3_storage(bucket: &str) -> Self {
        Self::new("s3").with("bucket", bucket)
    }

    /// The variant discriminator
    pub fn kind(&self) -> Result<&str> {
        self.require_str("type")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.values.get(key) {
            Some(Value::Null) | None => None,
            Some(value) => Some(value),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// A required string value
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.optional_str(key)?.ok_or_else(|| {
            VaultError::configuration(format!(
                "{} config is missing required key '{}'",
                self.label(),
                key
            ))
        })
    }

    /// An optional string value; present values of another type are rejected
    pub fn optional_str(&self, key: &str) -> Result<Option<&str>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.wrong_type(key, "a string", other)),
        }
    }

    /// An optional boolean value
    pub fn optional_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.wrong_type(key, "a boolean", other)),
        }
    }

    /// A TCP port, falling back to `default` when absent
    pub fn port_or(&self, key: &str, default: u16) -> Result<u16> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    VaultError::configuration(format!(
                        "{} config key '{}' must be a port number (0-65535), got {}",
                        self.label(),
                        key,
                        n
                    ))
                }),
            Some(other) => Err(self.wrong_type(key, "an integer port", other)),
        }
    }

    fn label(&self) -> &str {
        match self.values.get("type") {
            Some(Value::String(kind)) => kind,
            _ => "adapter",
        }
    }

    fn wrong_type(&self, key: &str, expected: &str, found: &Value) -> VaultError {
        VaultError::configuration(format!(
            "{} config key '{}' must be {}, got {}",
            self.label(),
            key,
            expected,
            value_type_name(found)
        ))
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Lower-cased key path of a `DUMPVAULT_*` variable, split on `__`
fn env_key_path(name: &str) -> Option<Vec<String>> {
    let name = name.to_lowercase();
    let prefix = format!("{}_", ENV_PREFIX.to_lowercase());
    let rest = name.strip_prefix(&prefix)?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.split("__").map(str::to_string).collect())
}

/// Parse an override of a non-string adapter key; `None` for string keys
fn parse_typed_override(var: &str, key: &str, raw: &str) -> Result<Option<Value>> {
    match key {
        "port" => raw
            .trim()
            .parse::<u16>()
            .map(|port| Some(Value::from(port)))
            .map_err(|_| {
                VaultError::configuration(format!(
                    "environment variable {var} must be a port number (0-65535), got '{raw}'"
                ))
            }),
        "drop" => raw
            .trim()
            .to_lowercase()
            .parse::<bool>()
            .map(|flag| Some(Value::Bool(flag)))
            .map_err(|_| {
                VaultError::configuration(format!(
                    "environment variable {var} must be true or false, got '{raw}'"
                ))
            }),
        _ => Ok(None),
    }
}

impl fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            if SECRET_KEYS.contains(&key.as_str()) && !value.is_null() {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// Application configuration: named databases, the storage backend and
/// pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database engines keyed by logical name
    #[serde(default)]
    pub databases: BTreeMap<String, EngineConfig>,
    /// Storage backend receiving the compressed artifacts
    pub storage: StorageConfig,
    /// Directory for per-invocation temporary work directories
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Kill external tools running longer than this
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    /// Gzip level (0-9)
    #[serde(default)]
    pub compression_level: Option<u32>,
    /// Append a UTC timestamp to artifact names
    #[serde(default)]
    pub timestamp_artifacts: bool,
}

impl AppConfig {
    /// Create a configuration with no databases for the given storage backend
    pub fn new(storage: StorageConfig) -> Self {
        AppConfig {
            databases: BTreeMap::new(),
            storage,
            work_dir: None,
            command_timeout_secs: None,
            compression_level: None,
            timestamp_artifacts: false,
        }
    }

    pub fn with_database(mut self, name: &str, config: EngineConfig) -> Self {
        self.databases.insert(name.to_string(), config);
        self
    }

    pub fn with_work_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Load a YAML configuration file overlaid with `DUMPVAULT_*` environment
    /// variables (`__` separates nested keys).
    ///
    /// Overrides arrive as strings. Adapter keys that hold other types
    /// (`port`, `drop`) are parsed into them; everything else, passwords
    /// included, stays a string.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let vars = std::env::vars_os()
            .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)));
        Self::load_with_env(path, vars)
    }

    /// [`AppConfig::load`] with an explicit set of environment variables
    pub fn load_with_env<P, I>(path: P, vars: I) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = (String, String)>,
    {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VaultError::configuration(format!(
                "config file {} not found, run `dumpvault init` to create one",
                path.display()
            )));
        }

        let overrides: ConfigMap<String, String> = vars
            .into_iter()
            .filter(|(name, _)| env_key_path(name).is_some())
            .collect();

        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(Some(overrides.clone())),
            )
            .build()?;

        let mut config: AppConfig = settings.try_deserialize()?;
        config.apply_typed_overrides(&overrides)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_typed_overrides(&mut self, overrides: &ConfigMap<String, String>) -> Result<()> {
        for (name, raw) in overrides {
            let Some(path) = env_key_path(name) else {
                continue;
            };
            let (target, key) = match path.as_slice() {
                [section, database, key] if section == "databases" => {
                    match self.databases.get_mut(database.as_str()) {
                        Some(target) => (target, key),
                        None => continue,
                    }
                }
                [section, key] if section == "storage" => (&mut self.storage, key),
                _ => continue,
            };
            if let Some(value) = parse_typed_override(name, key, raw)? {
                target.values.insert(key.clone(), value);
            }
        }
        Ok(())
    }

    /// Parse configuration from a YAML string, without environment overlay
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> Result<Self> {
        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate discriminators and pipeline settings
    pub fn validate(&self) -> Result<()> {
        self.storage.kind().map_err(|_| {
            VaultError::configuration("storage config is missing required key 'type'")
        })?;

        for (name, database) in &self.databases {
            database.kind().map_err(|_| {
                VaultError::configuration(format!(
                    "database '{name}' is missing required key 'type'"
                ))
            })?;
        }

        if let Some(level) = self.compression_level {
            if level > 9 {
                return Err(VaultError::configuration(format!(
                    "compression_level must be between 0 and 9, got {level}"
                )));
            }
        }

        Ok(())
    }

    /// Look up a database by logical name.
    ///
    /// Keys are lower-cased when loaded from a file, so the lookup falls back
    /// to the lower-cased name.
    pub fn database(&self, name: &str) -> Result<&EngineConfig> {
        self.databases
            .get(name)
            .or_else(|| self.databases.get(&name.to_lowercase()))
            .ok_or_else(|| {
                VaultError::configuration(format!("database '{name}' not found in config"))
            })
    }

    /// Root address under which artifacts are stored (may be empty)
    pub fn storage_root(&self) -> Result<&str> {
        Ok(self.storage.optional_str("path")?.unwrap_or(""))
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}
