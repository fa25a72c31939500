/*!
MongoDB adapter built on `mongodump`, `mongorestore` and `mongosh`.

Dumps use the single-file archive format. The password never reaches the
command line: dump and restore read it from a `--config` file and the
connection check embeds it in a script file, both private to the owner and
removed when the call returns.
*/

use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{
    ensure_parent_dir, quoted, require_file, secret_file, ConnectionSettings, DatabaseAdapter,
};
use crate::compression::remove_partial;
use crate::config::EngineConfig;
use crate::process::{ProcessRunner, ToolCommand, ToolOutput};
use crate::Result;

const DEFAULT_PORT: u16 = 27017;
const DEFAULT_AUTH_SOURCE: &str = "admin";

/// MongoDB adapter
///
/// Keys: `database` (required), `host`, `port`, `user`, `password`,
/// `auth_source` (default `admin`), `drop` (restore replaces collections).
#[derive(Debug, Clone, Default)]
pub struct MongoAdapter {
    runner: ProcessRunner,
}

/// A command together with the secret file it references, which must outlive the run
pub(crate) struct PreparedCommand {
    pub command: ToolCommand,
    pub secret: Option<NamedTempFile>,
}

impl PreparedCommand {
    /// Run the command while the secret file still exists
    fn run(&self, runner: &ProcessRunner) -> Result<ToolOutput> {
        if let Some(secret) = &self.secret {
            debug!(config = %secret.path().display(), "Passing credentials through config file");
        }
        runner.run_checked(&self.command)
    }
}

struct MongoSettings {
    connection: ConnectionSettings,
    auth_source: String,
    drop: bool,
}

impl MongoSettings {
    fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            connection: ConnectionSettings::from_config(config, DEFAULT_PORT, false)?,
            auth_source: config
                .optional_str("auth_source")?
                .unwrap_or(DEFAULT_AUTH_SOURCE)
                .to_string(),
            drop: config.optional_bool("drop")?.unwrap_or(false),
        })
    }
}

impl MongoAdapter {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    fn tool_command(program: &str, settings: &MongoSettings) -> Result<PreparedCommand> {
        let connection = &settings.connection;
        let mut command = ToolCommand::new(program)
            .arg(format!("--host={}", connection.host))
            .arg(format!("--port={}", connection.port));
        if let Some(user) = &connection.user {
            command = command
                .arg(format!("--username={user}"))
                .arg(format!("--authenticationDatabase={}", settings.auth_source));
        }

        let secret = match &connection.password {
            Some(password) => {
                let file = secret_file(&format!("password: {}\n", quoted(password)), ".yaml")?;
                command = command.arg(format!("--config={}", file.path().display()));
                Some(file)
            }
            None => None,
        };

        Ok(PreparedCommand { command, secret })
    }

    pub(crate) fn dump_command(config: &EngineConfig, output_path: &Path) -> Result<PreparedCommand> {
        let settings = MongoSettings::from_config(config)?;
        let mut prepared = Self::tool_command("mongodump", &settings)?;
        prepared.command = prepared
            .command
            .arg(format!("--db={}", settings.connection.database))
            .arg(format!("--archive={}", output_path.display()));
        Ok(prepared)
    }

    pub(crate) fn restore_command(config: &EngineConfig, backup_path: &Path) -> Result<PreparedCommand> {
        let settings = MongoSettings::from_config(config)?;
        let mut prepared = Self::tool_command("mongorestore", &settings)?;
        prepared.command = prepared
            .command
            .arg(format!("--nsInclude={}.*", settings.connection.database))
            .arg(format!("--archive={}", backup_path.display()));
        if settings.drop {
            prepared.command = prepared.command.arg("--drop");
        }
        Ok(prepared)
    }

    /// Script run by `mongosh --nodb`; exits nonzero unless the ping succeeds
    pub(crate) fn ping_script(config: &EngineConfig) -> Result<String> {
        let settings = MongoSettings::from_config(config)?;
        let connection = &settings.connection;

        let mut script = format!(
            "const conn = new Mongo({});\n",
            quoted(&format!("mongodb://{}:{}/", connection.host, connection.port))
        );
        if let Some(user) = &connection.user {
            script.push_str(&format!(
                "conn.getDB({}).auth({}, {});\n",
                quoted(&settings.auth_source),
                quoted(user),
                quoted(connection.password.as_deref().unwrap_or(""))
            ));
        }
        script.push_str(&format!(
            "const res = conn.getDB({}).runCommand({{ ping: 1 }});\n",
            quoted(&connection.database)
        ));
        script.push_str("if (res.ok !== 1) { quit(1); }\n");
        Ok(script)
    }
}

impl DatabaseAdapter for MongoAdapter {
    fn backup(&self, config: &EngineConfig, output_path: &Path) -> Result<PathBuf> {
        let prepared = Self::dump_command(config, output_path)?;
        ensure_parent_dir(output_path)?;

        let result = prepared.run(&self.runner);
        if result.is_err() {
            remove_partial(output_path);
        }
        result?;

        info!(path = %output_path.display(), "mongodump completed");
        Ok(output_path.to_path_buf())
    }

    fn restore(&self, config: &EngineConfig, backup_path: &Path) -> Result<()> {
        let prepared = Self::restore_command(config, backup_path)?;
        require_file(backup_path, "backup file")?;
        prepared.run(&self.runner)?;
        Ok(())
    }

    fn test_connection(&self, config: &EngineConfig) -> Result<()> {
        let script = secret_file(&Self::ping_script(config)?, ".js")?;
        let command = ToolCommand::new("mongosh")
            .arg("--nodb")
            .arg("--quiet")
            .arg(script.path());
        self.runner.run_checked(&command)?;
        Ok(())
    }

    fn dump_extension(&self) -> &'static str {
        "archive"
    }

    fn engine_name(&self) -> &'static str {
        "mongo"
    }
}
