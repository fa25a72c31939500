/*!
MySQL / MariaDB adapter built on `mysqldump` and `mysql`.
*/

use std::path::{Path, PathBuf};
use tracing::info;

use super::{ensure_parent_dir, require_file, ConnectionSettings, DatabaseAdapter};
use crate::config::EngineConfig;
use crate::process::{ProcessRunner, ToolCommand};
use crate::Result;

const DEFAULT_PORT: u16 = 3306;

/// Password channel understood by every MySQL client tool
const PASSWORD_ENV: &str = "MYSQL_PWD";

/// MySQL adapter
///
/// Keys: `user` and `database` (required), `host`, `port`, `password`.
/// The dump streams to stdout and is redirected into the output file.
#[derive(Debug, Clone, Default)]
pub struct MySqlAdapter {
    runner: ProcessRunner,
}

impl MySqlAdapter {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    fn client_command(program: &str, settings: &ConnectionSettings) -> ToolCommand {
        let mut command = ToolCommand::new(program)
            .arg(format!("--host={}", settings.host))
            .arg(format!("--port={}", settings.port));
        if let Some(user) = &settings.user {
            command = command.arg(format!("--user={user}"));
        }
        if let Some(password) = &settings.password {
            command = command.env(PASSWORD_ENV, password);
        }
        command
    }

    pub(crate) fn dump_command(config: &EngineConfig, output_path: &Path) -> Result<ToolCommand> {
        let settings = ConnectionSettings::from_config(config, DEFAULT_PORT, true)?;
        Ok(Self::client_command("mysqldump", &settings)
            .arg("--single-transaction")
            .arg(&settings.database)
            .stdout_file(output_path))
    }

    pub(crate) fn restore_command(config: &EngineConfig, backup_path: &Path) -> Result<ToolCommand> {
        let settings = ConnectionSettings::from_config(config, DEFAULT_PORT, true)?;
        Ok(Self::client_command("mysql", &settings)
            .arg(&settings.database)
            .stdin_file(backup_path))
    }

    pub(crate) fn ping_command(config: &EngineConfig) -> Result<ToolCommand> {
        let settings = ConnectionSettings::from_config(config, DEFAULT_PORT, true)?;
        Ok(Self::client_command("mysql", &settings)
            .arg("--batch")
            .arg("--skip-column-names")
            .arg("--execute=SELECT 1")
            .arg(&settings.database))
    }
}

impl DatabaseAdapter for MySqlAdapter {
    fn backup(&self, config: &EngineConfig, output_path: &Path) -> Result<PathBuf> {
        let command = Self::dump_command(config, output_path)?;
        ensure_parent_dir(output_path)?;
        self.runner.run_checked(&command)?;
        info!(path = %output_path.display(), "mysqldump completed");
        Ok(output_path.to_path_buf())
    }

    fn restore(&self, config: &EngineConfig, backup_path: &Path) -> Result<()> {
        let command = Self::restore_command(config, backup_path)?;
        require_file(backup_path, "backup file")?;
        self.runner.run_checked(&command)?;
        Ok(())
    }

    fn test_connection(&self, config: &EngineConfig) -> Result<()> {
        let command = Self::ping_command(config)?;
        self.runner.run_checked(&command)?;
        Ok(())
    }

    fn dump_extension(&self) -> &'static str {
        "sql"
    }

    fn engine_name(&self) -> &'static str {
        "mysql"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VaultError;
    use tempfile::TempDir;

    fn orders_config() -> EngineConfig {
        EngineConfig::new("mysql")
            .with("host", "db.internal")
            .with("port", 3307)
            .with("user", "backup")
            .with("password", "s3cret")
            .with("database", "orders")
    }

    fn args_of(command: &ToolCommand) -> Vec<String> {
        command
            .args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_dump_command_keeps_password_out_of_args() {
        let command = MySqlAdapter::dump_command(&orders_config(), Path::new("/tmp/orders.sql")).unwrap();

        assert_eq!(command.program(), "mysqldump");
        let args = args_of(&command);
        assert!(args.contains(&"--host=db.internal".to_string()));
        assert!(args.contains(&"--port=3307".to_string()));
        assert!(args.contains(&"--user=backup".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("orders"));
        assert!(args.iter().all(|a| !a.contains("s3cret")));

        assert_eq!(command.env_value(PASSWORD_ENV), Some("s3cret"));
        assert_eq!(command.stdout_path(), Some(Path::new("/tmp/orders.sql")));
    }

    #[test]
    fn test_restore_command_streams_file() {
        let command = MySqlAdapter::restore_command(&orders_config(), Path::new("/tmp/orders.sql")).unwrap();

        assert_eq!(command.program(), "mysql");
        assert_eq!(command.stdin_path(), Some(Path::new("/tmp/orders.sql")));
        assert!(args_of(&command).iter().all(|a| !a.contains("s3cret")));
    }

    #[test]
    fn test_ping_command() {
        let command = MySqlAdapter::ping_command(&orders_config()).unwrap();
        assert_eq!(command.program(), "mysql");
        let args = args_of(&command);
        assert!(args.contains(&"--execute=SELECT 1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("orders"));
        assert!(args.iter().all(|a| !a.contains("s3cret")));
    }

    #[test]
    fn test_no_password_sets_no_env() {
        let config = EngineConfig::new("mysql")
            .with("user", "backup")
            .with("database", "orders");
        let command = MySqlAdapter::dump_command(&config, Path::new("out.sql")).unwrap();
        assert_eq!(command.env_value(PASSWORD_ENV), None);
    }

    #[test]
    fn test_backup_fails_fast_on_missing_user() {
        let temp_dir = TempDir::new().unwrap();
        let output = temp_dir.path().join("orders_backup.sql");
        let config = EngineConfig::new("mysql").with("database", "orders");

        let err = MySqlAdapter::default().backup(&config, &output).unwrap_err();

        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(err.to_string().contains("'user'"));
        assert!(!output.exists());
    }

    #[test]
    fn test_backup_rejects_string_port() {
        let temp_dir = TempDir::new().unwrap();
        let config = orders_config().with("port", "3306");
        let err = MySqlAdapter::default()
            .backup(&config, &temp_dir.path().join("out.sql"))
            .unwrap_err();
        assert!(err.to_string().contains("'port'"));
    }

    #[test]
    fn test_restore_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = MySqlAdapter::default()
            .restore(&orders_config(), &temp_dir.path().join("absent.sql"))
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
