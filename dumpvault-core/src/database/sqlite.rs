/*!
SQLite adapter: the database is a single file, so backup and restore are
byte-exact file copies.
*/

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::{ensure_parent_dir, require_file, DatabaseAdapter};
use crate::config::EngineConfig;
use crate::{Result, VaultError};

/// Embedded-file adapter for SQLite databases
///
/// Keys: `path` (required), the database file. Restore overwrites that file;
/// no safety copy is taken.
#[derive(Debug, Clone, Default)]
pub struct SqliteAdapter;

impl SqliteAdapter {
    pub fn new() -> Self {
        Self
    }

    fn database_path(config: &EngineConfig) -> Result<PathBuf> {
        Ok(PathBuf::from(config.require_str("path")?))
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    ensure_parent_dir(to)?;
    fs::copy(from, to).map_err(|e| {
        VaultError::io(format!("copy {} to {}", from.display(), to.display()), e)
    })
}

impl DatabaseAdapter for SqliteAdapter {
    fn backup(&self, config: &EngineConfig, output_path: &Path) -> Result<PathBuf> {
        let database = Self::database_path(config)?;
        require_file(&database, "database file")?;

        let bytes = copy_file(&database, output_path)?;
        info!(
            database = %database.display(),
            path = %output_path.display(),
            bytes = bytes,
            "SQLite database copied"
        );
        Ok(output_path.to_path_buf())
    }

    fn restore(&self, config: &EngineConfig, backup_path: &Path) -> Result<()> {
        let database = Self::database_path(config)?;
        require_file(backup_path, "backup file")?;

        if database.exists() {
            warn!(database = %database.display(), "Overwriting SQLite database file");
        }
        copy_file(backup_path, &database)?;
        Ok(())
    }

    fn test_connection(&self, config: &EngineConfig) -> Result<()> {
        let database = Self::database_path(config)?;
        require_file(&database, "database file")
    }

    fn dump_extension(&self) -> &'static str {
        "db"
    }

    fn engine_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_for(path: &Path) -> EngineConfig {
        EngineConfig::new("sqlite").with("path", path.to_string_lossy().into_owned())
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("app.db");
        let original: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        fs::write(&db_path, &original).unwrap();

        let adapter = SqliteAdapter::new();
        let config = config_for(&db_path);
        let backup = temp_dir.path().join("out/nested/app_backup.db");

        let written = adapter.backup(&config, &backup).unwrap();
        assert_eq!(written, backup);
        assert_eq!(fs::read(&backup).unwrap(), original);

        fs::write(&db_path, b"corrupted after backup").unwrap();
        adapter.restore(&config, &backup).unwrap();
        assert_eq!(fs::read(&db_path).unwrap(), original);

        // Backing up the restored database yields the same artifact
        let second = temp_dir.path().join("second.db");
        adapter.backup(&config, &second).unwrap();
        assert_eq!(fs::read(&second).unwrap(), fs::read(&backup).unwrap());
    }

    #[test]
    fn test_restore_creates_missing_target_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let backup = temp_dir.path().join("app_backup.db");
        fs::write(&backup, b"sqlite bytes").unwrap();
        let target = temp_dir.path().join("fresh/dir/app.db");

        SqliteAdapter::new()
            .restore(&config_for(&target), &backup)
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"sqlite bytes");
    }

    #[test]
    fn test_backup_missing_database() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for(&temp_dir.path().join("absent.db"));
        let err = SqliteAdapter::new()
            .backup(&config, &temp_dir.path().join("out.db"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_restore_missing_backup() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for(&temp_dir.path().join("app.db"));
        let err = SqliteAdapter::new()
            .restore(&config, &temp_dir.path().join("absent.db"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_connection_checks_key_and_file() {
        let adapter = SqliteAdapter::new();

        let err = adapter
            .test_connection(&EngineConfig::new("sqlite"))
            .unwrap_err();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(err.to_string().contains("'path'"));

        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("app.db");
        assert!(adapter.test_connection(&config_for(&db_path)).is_err());

        fs::write(&db_path, b"").unwrap();
        assert!(adapter.test_connection(&config_for(&db_path)).is_ok());
    }

    #[test]
    fn test_path_must_be_string() {
        let config = EngineConfig::new("sqlite").with("path", 17);
        let err = SqliteAdapter::new().test_connection(&config).unwrap_err();
        assert!(err.to_string().contains("must be a string"));
    }
}
