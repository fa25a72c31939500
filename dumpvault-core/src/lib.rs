/*!
# dumpvault core

Backup and restore orchestration for databases.

The crate drives the vendor dump/restore tools of each database engine,
compresses the artifacts they produce and moves them to and from a storage
backend:

- Database adapters: MySQL, PostgreSQL, MongoDB and SQLite
- Storage adapters: local filesystem and Amazon S3 (feature `s3`)
- Streaming gzip compression
- Backup and restore pipelines with per-step error reporting
- Scheduling of periodic backups through cron

## Architecture

Engines and backends sit behind the [`DatabaseAdapter`] and [`StorageAdapter`]
traits and are selected at run time from the `type` key of their
configuration through registries. The pipelines only see those traits.

## Usage

```rust,no_run
use dumpvault_core::{AppConfig, BackupPipeline, RestorePipeline};

let config = AppConfig::load("db_backup_config.yaml")?;

let report = BackupPipeline::from_config(&config).run(&config, "orders")?;
println!("stored at {}", report.location);

RestorePipeline::from_config(&config).run(&config, "orders_backup.sql.gz", "orders")?;
# Ok::<(), dumpvault_core::VaultError>(())
```
*/

pub mod compression;
pub mod config;
pub mod database;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod scheduler;
pub mod storage;


pub use compression::{CompressionCodec, GzipCodec};
pub use config::{AdapterConfig, AppConfig, EngineConfig, StorageConfig};
pub use database::{DatabaseAdapter, DatabaseRegistry};
pub use error::{PipelineStep, Result, VaultError};
pub use pipeline::{BackupPipeline, RestorePipeline};
pub use report::{BackupReport, RestoreReport};
pub use scheduler::{CronScheduler, CrontabTable, FileJobTable, JobScheduler, JobTable, ScheduledJob};
pub use storage::{LocalStorage, StorageAdapter, StorageRegistry};
#[cfg(feature = "s3")]
pub use storage::S3Storage;
