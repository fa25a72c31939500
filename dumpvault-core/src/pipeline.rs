/*!
Backup and restore pipelines.

A backup runs dump → compress → upload; a restore runs download →
decompress → restore. Every invocation works inside its own private
temporary directory, so concurrent runs never share paths. Failures abort the
sequence and are reported with the step they happened in. Local artifacts are
removed on every exit path; remote artifacts are never rolled back.
*/

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::compression::{CompressionCodec, GzipCodec};
use crate::config::AppConfig;
use crate::database::DatabaseRegistry;
use crate::error::PipelineStep;
use crate::observability::{self, RunKind};
use crate::process::ProcessRunner;
use crate::report::{file_sha256, file_size, BackupReport, RestoreReport};
use crate::storage::{address_basename, join_address, StorageRegistry};
use crate::{Result, VaultError};

/// Name of the raw artifact for a database
///
/// `<db>_backup.<ext>`, or `<db>_backup_<YYYYmmdd_HHMMSS>.<ext>` when a
/// timestamp is given.
pub fn artifact_name(database: &str, extension: &str, timestamp: Option<DateTime<Utc>>) -> String {
    match timestamp {
        Some(ts) => format!("{database}_backup_{}.{extension}", ts.format("%Y%m%d_%H%M%S")),
        None => format!("{database}_backup.{extension}"),
    }
}

/// Run `f` as pipeline step `step`, attaching the step to any failure
fn run_step<T>(step: PipelineStep, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let started = Instant::now();
    let result = f().map_err(|e| e.in_step(step));
    observability::record_step(step, started.elapsed());
    result
}

/// Private per-invocation work directory, removed when dropped
struct WorkDir {
    dir: Option<TempDir>,
}

impl WorkDir {
    fn create(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent)
            .map_err(|e| VaultError::io(format!("create work directory {}", parent.display()), e))?;
        let dir = tempfile::Builder::new()
            .prefix("dumpvault-")
            .tempdir_in(parent)
            .map_err(|e| VaultError::io(format!("create temporary directory in {}", parent.display()), e))?;
        Ok(Self { dir: Some(dir) })
    }

    fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    /// Delete an artifact that is no longer needed
    fn discard(&self, path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove temporary artifact");
            }
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove work directory");
            }
        }
    }
}

fn gzip_for(config: &AppConfig) -> GzipCodec {
    config
        .compression_level
        .map(GzipCodec::with_level)
        .unwrap_or_default()
}

/// Chains dump → compress → upload for one configured database
pub struct BackupPipeline {
    databases: DatabaseRegistry,
    storages: StorageRegistry,
    codec: Option<Box<dyn CompressionCodec>>,
}

impl BackupPipeline {
    /// Create a pipeline over explicit registries, compressing with gzip at the
    /// configured level
    pub fn new(databases: DatabaseRegistry, storages: StorageRegistry) -> Self {
        Self {
            databases,
            storages,
            codec: None,
        }
    }

    /// Create a pipeline with the built-in engines and backends, bounding
    /// external tools by the configured timeout
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            DatabaseRegistry::with_defaults(ProcessRunner::with_timeout(config.command_timeout())),
            StorageRegistry::with_defaults(),
        )
    }

    /// Use `codec` instead of gzip
    pub fn with_codec(mut self, codec: Box<dyn CompressionCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Back up the database configured under `database`
    ///
    /// # Returns
    /// A report describing the uploaded artifact
    ///
    /// # Errors
    /// * `VaultError::Configuration` - unknown database, unknown or invalid
    ///   adapter type; raised before any I/O
    /// * `VaultError::Step` - a step failed; `root()` gives the cause
    pub fn run(&self, config: &AppConfig, database: &str) -> Result<BackupReport> {
        info!(database = %database, "Starting backup");
        let result = self.execute(config, database);
        observability::record_run(RunKind::Backup, result.is_ok());

        match &result {
            Ok(report) => info!(
                database = %database,
                location = %report.location,
                dump_size = report.dump_size,
                compressed_size = report.compressed_size,
                duration_secs = report.duration_secs(),
                "Backup completed"
            ),
            Err(e) => error!(database = %database, error = %e, "Backup failed"),
        }
        result
    }

    fn execute(&self, config: &AppConfig, database: &str) -> Result<BackupReport> {
        let engine_config = config.database(database)?;
        let adapter = self.databases.resolve(engine_config)?;
        let storage = self.storages.build(&config.storage)?;
        let root = config.storage_root()?;

        let default_codec = gzip_for(config);
        let codec: &dyn CompressionCodec = match &self.codec {
            Some(codec) => codec.as_ref(),
            None => &default_codec,
        };

        let mut report = BackupReport::begin(database, adapter.engine_name());
        report.storage_backend = storage.backend_name().to_string();
        report.compression_algorithm = codec.algorithm_name().to_string();

        let work = run_step(PipelineStep::Prepare, || WorkDir::create(&config.work_dir()))?;

        let timestamp = config.timestamp_artifacts.then(Utc::now);
        let dump_path = work
            .path()
            .join(artifact_name(database, adapter.dump_extension(), timestamp));

        let dump = run_step(PipelineStep::Dump, || {
            let dump = adapter.backup(engine_config, &dump_path)?;
            report.dump_size = file_size(&dump)?;
            Ok(dump)
        })?;

        let compressed = run_step(PipelineStep::Compress, || {
            let compressed = codec.compress(&dump)?;
            report.compressed_size = file_size(&compressed)?;
            report.sha256 = file_sha256(&compressed)?;
            Ok(compressed)
        })?;
        work.discard(&dump);

        let file_name = compressed
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let address = join_address(root, &file_name);

        report.location = run_step(PipelineStep::Upload, || storage.upload(&compressed, &address))?;
        work.discard(&compressed);
        observability::record_artifact_size(report.compressed_size);

        Ok(report.finish())
    }
}

/// Chains download → decompress → restore for one configured database
pub struct RestorePipeline {
    databases: DatabaseRegistry,
    storages: StorageRegistry,
    codec: Option<Box<dyn CompressionCodec>>,
}

impl RestorePipeline {
    pub fn new(databases: DatabaseRegistry, storages: StorageRegistry) -> Self {
        Self {
            databases,
            storages,
            codec: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            DatabaseRegistry::with_defaults(ProcessRunner::with_timeout(config.command_timeout())),
            StorageRegistry::with_defaults(),
        )
    }

    pub fn with_codec(mut self, codec: Box<dyn CompressionCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Restore `database` from the artifact at `backup_address`.
    ///
    /// A bare file name (no `/`) is looked up under the storage root. The
    /// download is decompressed only when its name carries the codec extension.
    pub fn run(&self, config: &AppConfig, backup_address: &str, database: &str) -> Result<RestoreReport> {
        info!(database = %database, backup = %backup_address, "Starting restore");
        let result = self.execute(config, backup_address, database);
        observability::record_run(RunKind::Restore, result.is_ok());

        match &result {
            Ok(report) => info!(
                database = %database,
                source = %report.source,
                restored_size = report.restored_size,
                duration_secs = report.duration_secs(),
                "Restore completed"
            ),
            Err(e) => error!(database = %database, error = %e, "Restore failed"),
        }
        result
    }

    fn execute(&self, config: &AppConfig, backup_address: &str, database: &str) -> Result<RestoreReport> {
        let engine_config = config.database(database)?;
        let adapter = self.databases.resolve(engine_config)?;
        let storage = self.storages.build(&config.storage)?;

        let address = if backup_address.contains('/') {
            backup_address.to_string()
        } else {
            join_address(config.storage_root()?, backup_address)
        };
        let file_name = address_basename(&address);
        if file_name.is_empty() || file_name == "." || file_name == ".." {
            return Err(VaultError::configuration(format!(
                "backup address '{backup_address}' does not name a file"
            )));
        }

        let default_codec = gzip_for(config);
        let codec: &dyn CompressionCodec = match &self.codec {
            Some(codec) => codec.as_ref(),
            None => &default_codec,
        };

        let mut report = RestoreReport::begin(database, adapter.engine_name(), address.as_str());
        report.storage_backend = storage.backend_name().to_string();

        let work = run_step(PipelineStep::Prepare, || WorkDir::create(&config.work_dir()))?;
        let target = work.path().join(file_name);

        let downloaded = run_step(PipelineStep::Download, || {
            let downloaded = storage.download(&address, &target)?;
            report.downloaded_size = file_size(&downloaded)?;
            report.sha256 = file_sha256(&downloaded)?;
            Ok(downloaded)
        })?;

        let restore_path: PathBuf = if codec.is_compressed(&downloaded) {
            report.decompressed = true;
            run_step(PipelineStep::Decompress, || codec.decompress(&downloaded))?
        } else {
            downloaded.clone()
        };

        run_step(PipelineStep::Restore, || {
            report.restored_size = file_size(&restore_path)?;
            adapter.restore(engine_config, &restore_path)
        })?;

        work.discard(&downloaded);
        if restore_path != downloaded {
            work.discard(&restore_path);
        }

        Ok(report.finish())
    }
}
