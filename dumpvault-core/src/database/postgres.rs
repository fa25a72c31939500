/*!
PostgreSQL adapter built on `pg_dump` and `psql`.

The connection check runs a query rather than `pg_isready`, so it also
verifies the credentials.
*/

use std::path::{Path, PathBuf};
use tracing::info;

use super::{ensure_parent_dir, require_file, ConnectionSettings, DatabaseAdapter};
use crate::config::EngineConfig;
use crate::process::{ProcessRunner, ToolCommand};
use crate::Result;

const DEFAULT_PORT: u16 = 5432;
const PASSWORD_ENV: &str = "PGPASSWORD";

/// PostgreSQL adapter
///
/// Keys: `user` and `database` (required), `host`, `port`, `password`.
/// Tools run with `--no-password` so a missing secret fails instead of prompting.
#[derive(Debug, Clone, Default)]
pub struct PostgresAdapter {
    runner: ProcessRunner,
}

impl PostgresAdapter {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    fn client_command(program: &str, settings: &ConnectionSettings) -> ToolCommand {
        let mut command = ToolCommand::new(program)
            .arg("--host")
            .arg(&settings.host)
            .arg("--port")
            .arg(settings.port.to_string());
        if let Some(user) = &settings.user {
            command = command.arg("--username").arg(user);
        }
        if let Some(password) = &settings.password {
            command = command.env(PASSWORD_ENV, password);
        }
        command
    }

    pub(crate) fn dump_command(config: &EngineConfig, output_path: &Path) -> Result<ToolCommand> {
        let settings = ConnectionSettings::from_config(config, DEFAULT_PORT, true)?;
        Ok(Self::client_command("pg_dump", &settings)
            .arg("--no-password")
            .arg("--dbname")
            .arg(&settings.database)
            .stdout_file(output_path))
    }

    pub(crate) fn restore_command(config: &EngineConfig, backup_path: &Path) -> Result<ToolCommand> {
        let settings = ConnectionSettings::from_config(config, DEFAULT_PORT, true)?;
        Ok(Self::client_command("psql", &settings)
            .arg("--no-password")
            .arg("--quiet")
            .arg("--set")
            .arg("ON_ERROR_STOP=1")
            .arg("--dbname")
            .arg(&settings.database)
            .stdin_file(backup_path))
    }

    pub(crate) fn ping_command(config: &EngineConfig) -> Result<ToolCommand> {
        let settings = ConnectionSettings::from_config(config, DEFAULT_PORT, true)?;
        Ok(Self::client_command("psql", &settings)
            .arg("--no-password")
            .arg("--quiet")
            .arg("--tuples-only")
            .arg("--command")
            .arg("SELECT 1")
            .arg("--dbname")
            .arg(&settings.database))
    }
}

impl DatabaseAdapter for PostgresAdapter {
    fn backup(&self, config: &EngineConfig, output_path: &Path) -> Result<PathBuf> {
        let command = Self::dump_command(config, output_path)?;
        ensure_parent_dir(output_path)?;
        self.runner.run_checked(&command)?;
        info!(path = %output_path.display(), "pg_dump completed");
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
        "postgres"
    }
}
