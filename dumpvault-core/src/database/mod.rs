/*!
Database adapters.

Each adapter knows how to snapshot one kind of database engine into a single local
file, how to apply such a file back, and how to check connectivity. Adapters are
stateless: all engine settings arrive per call through an [`EngineConfig`], so one
handle serves every database of its type.
*/

pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

use crate::config::EngineConfig;
use crate::process::ProcessRunner;
use crate::{Result, VaultError};

pub use mongo::MongoAdapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

/// Capability set every database engine variant provides
#[cfg_attr(test, mockall::automock)]
pub trait DatabaseAdapter: Send + Sync {
    /// Write a snapshot of the database to `output_path`.
    ///
    /// # Returns
    /// The path actually written
    ///
    /// # Errors
    /// * `VaultError::Configuration` - required keys are missing or mistyped
    /// * `VaultError::AdapterExecution` - the dump tool failed or could not start
    fn backup(&self, config: &EngineConfig, output_path: &Path) -> Result<PathBuf>;

    /// Apply the snapshot at `backup_path` to the database.
    ///
    /// # Errors
    /// Same as `backup`, plus `VaultError::NotFound` when the file is missing
    fn restore(&self, config: &EngineConfig, backup_path: &Path) -> Result<()>;

    /// Check reachability and credentials without producing artifacts
    fn test_connection(&self, config: &EngineConfig) -> Result<()>;

    /// Extension used for raw (uncompressed) artifacts
    fn dump_extension(&self) -> &'static str;

    fn engine_name(&self) -> &'static str;
}

/// Maps `type` discriminators to adapter handles
pub struct DatabaseRegistry {
    adapters: HashMap<String, Arc<dyn DatabaseAdapter>>,
}

impl DatabaseRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// A registry with every built-in engine, running tools through `runner`
    pub fn with_defaults(runner: ProcessRunner) -> Self {
        let mysql: Arc<dyn DatabaseAdapter> = Arc::new(MySqlAdapter::new(runner.clone()));
        let postgres: Arc<dyn DatabaseAdapter> = Arc::new(PostgresAdapter::new(runner.clone()));
        let mongo: Arc<dyn DatabaseAdapter> = Arc::new(MongoAdapter::new(runner));
        let sqlite: Arc<dyn DatabaseAdapter> = Arc::new(SqliteAdapter::new());

        let mut registry = Self::new();
        registry.register("mysql", mysql);
        registry.register("postgres", postgres.clone());
        registry.register("postgresql", postgres);
        registry.register("mongo", mongo.clone());
        registry.register("mongodb", mongo);
        registry.register("sqlite", sqlite);
        registry
    }

    /// Register (or replace) the adapter for a discriminator
    pub fn register(&mut self, kind: &str, adapter: Arc<dyn DatabaseAdapter>) {
        self.adapters.insert(kind.to_string(), adapter);
    }

    /// Resolve the adapter for an engine config's `type`
    pub fn resolve(&self, config: &EngineConfig) -> Result<Arc<dyn DatabaseAdapter>> {
        let kind = config.kind()?;
        self.adapters.get(kind).cloned().ok_or_else(|| {
            VaultError::configuration(format!("unsupported database type: {kind}"))
        })
    }

    /// Registered discriminators, sorted
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for DatabaseRegistry {
    fn default() -> Self {
        Self::with_defaults(ProcessRunner::new())
    }
}

/// Connection settings shared by the networked engines
#[derive(Clone, PartialEq)]
pub(crate) struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

impl ConnectionSettings {
    /// Read the common keys; `user` is required when `user_required` is set
    pub fn from_config(config: &EngineConfig, default_port: u16, user_required: bool) -> Result<Self> {
        let user = if user_required {
            Some(config.require_str("user")?.to_string())
        } else {
            config.optional_str("user")?.map(str::to_string)
        };

        Ok(Self {
            host: config
                .optional_str("host")?
                .unwrap_or("localhost")
                .to_string(),
            port: config.port_or("port", default_port)?,
            user,
            password: config.optional_str("password")?.map(str::to_string),
            database: config.require_str("database")?.to_string(),
        })
    }
}

/// Fail with `NotFound` unless `path` is an existing file
pub(crate) fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(VaultError::not_found(format!(
            "{what} {} does not exist",
            path.display()
        )))
    }
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                VaultError::io(format!("create directory {}", parent.display()), e)
            })?;
        }
    }
    Ok(())
}

/// Write `contents` to a private temporary file readable only by the owner.
///
/// Used to hand secrets to tools that cannot take them from the environment.
pub(crate) fn secret_file(contents: &str, suffix: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("dumpvault-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| VaultError::io("create credentials file", e))?;
    file.write_all(contents.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| VaultError::io("write credentials file", e))?;
    Ok(file)
}

/// Quote a value as a JSON string, which is also a valid YAML and JavaScript
/// string literal
pub(crate) fn quoted(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_kinds() {
        let registry = DatabaseRegistry::default();
        assert_eq!(
            registry.kinds(),
            vec!["mongo", "mongodb", "mysql", "postgres", "postgresql", "sqlite"]
        );
    }

    #[test]
    fn test_resolve_by_type() {
        let registry = DatabaseRegistry::default();
        let adapter = registry.resolve(&EngineConfig::new("postgresql")).unwrap();
        assert_eq!(adapter.engine_name(), "postgres");
    }

    #[test]
    fn test_resolve_unknown_type() {
        let registry = DatabaseRegistry::default();
        let err = registry.resolve(&EngineConfig::new("oracle")).err().unwrap();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(err.to_string().contains("oracle"));
    }

    #[test]
    fn test_resolve_missing_type() {
        let registry = DatabaseRegistry::default();
        let err = registry.resolve(&EngineConfig::default()).err().unwrap();
        assert!(err.to_string().contains("'type'"));
    }

    #[test]
    fn test_register_custom_adapter() {
        let mut mock = MockDatabaseAdapter::new();
        mock.expect_engine_name().return_const("custom");

        let mut registry = DatabaseRegistry::new();
        registry.register("custom", Arc::new(mock));

        let adapter = registry.resolve(&EngineConfig::new("custom")).unwrap();
        assert_eq!(adapter.engine_name(), "custom");
    }

    #[test]
    fn test_connection_settings_defaults() {
        let config = EngineConfig::new("mysql")
            .with("user", "backup")
            .with("database", "orders");
        let settings = ConnectionSettings::from_config(&config, 3306, true).unwrap();

        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 3306);
        assert_eq!(settings.user.as_deref(), Some("backup"));
        assert_eq!(settings.password, None);
    }

    #[test]
    fn test_connection_settings_debug_redacts_password() {
        let config = EngineConfig::new("postgres")
            .with("database", "analytics")
            .with("password", "hunter2");
        let settings = ConnectionSettings::from_config(&config, 5432, false).unwrap();
        let printed = format!("{settings:?}");
        assert!(printed.contains("analytics"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_connection_settings_missing_database() {
        let config = EngineConfig::new("mysql").with("user", "backup");
        let err = ConnectionSettings::from_config(&config, 3306, true).unwrap_err();
        assert!(err.to_string().contains("'database'"));
    }

    #[test]
    fn test_secret_file_contents() {
        let file = secret_file("password: \"x\"\n", ".yaml").unwrap();
        let contents = fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents, "password: \"x\"\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let file = secret_file("secret", ".txt").unwrap();
        let mode = fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }

    #[test]
    fn test_quoted_escapes() {
        assert_eq!(quoted("pa\"ss"), r#""pa\"ss""#);
    }
}
