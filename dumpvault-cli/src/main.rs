/*!
dumpvault CLI - command-line interface for the dumpvault backup system.

Backs up and restores the databases named in a YAML configuration file, lists
stored artifacts and manages cron jobs that run backups periodically.
*/

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dumpvault_core::{
    config::{CONFIG_TEMPLATE, DEFAULT_CONFIG_FILE},
    observability::{LoggingContext, LoggingOptions},
    process::ProcessRunner,
    scheduler::backup_command,
    storage::{address_basename, join_address},
    AppConfig, BackupPipeline, BackupReport, CronScheduler, DatabaseRegistry, FileJobTable,
    JobScheduler, RestorePipeline, RestoreReport, ScheduledJob, StorageRegistry,
};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dumpvault")]
#[command(about = "Back up and restore databases to local or S3 storage")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also append JSON log lines to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log JSON lines to stderr
    #[arg(long, global = true)]
    json_logs: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Write Prometheus metrics for this run to a file on exit
    #[cfg(feature = "metrics")]
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a commented configuration template
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Back up a configured database
    Backup {
        /// Database name from the configuration
        database: String,
    },
    /// Restore a configured database from a stored backup
    Restore {
        /// Backup address, or a file name under the storage root
        backup: String,
        /// Database name from the configuration
        database: String,
    },
    /// Check that a configured database is reachable
    Test {
        /// Database name from the configuration
        database: String,
    },
    /// List stored backups
    List {
        /// Address prefix (defaults to the storage root)
        prefix: Option<String>,
    },
    /// Manage scheduled backups
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Schedule periodic backups of a database
    Add {
        /// Database name from the configuration
        database: String,
        /// Cron schedule, e.g. "0 3 * * *" or "@daily"
        schedule: String,
        /// Where the job appends its output (defaults to dumpvault-<database>.log next to the config)
        #[arg(long)]
        log: Option<PathBuf>,
        /// Edit this file instead of the user crontab
        #[arg(long)]
        table: Option<PathBuf>,
    },
    /// Stop scheduled backups of a database
    Remove {
        /// Database name from the configuration
        database: String,
        /// Edit this file instead of the user crontab
        #[arg(long)]
        table: Option<PathBuf>,
    },
    /// Show scheduled backups
    List {
        /// Read this file instead of the user crontab
        #[arg(long)]
        table: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct ArtifactRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Address")]
    address: String,
}

#[derive(Tabled)]
struct JobRow {
    #[tabled(rename = "Database")]
    name: String,
    #[tabled(rename = "Schedule")]
    schedule: String,
    #[tabled(rename = "Command")]
    command: String,
}

impl From<&ScheduledJob> for JobRow {
    fn from(job: &ScheduledJob) -> Self {
        Self {
            name: job.name.clone(),
            schedule: job.schedule.clone(),
            command: job.command.clone(),
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let logging = LoggingContext::init(&LoggingOptions {
        verbose: cli.verbose,
        json: cli.json_logs,
        log_file: cli.log_file.clone(),
    })?;

    let result = run(&cli);
    if let Err(e) = &result {
        error!("{e:#}");
    }

    #[cfg(feature = "metrics")]
    if let Some(path) = &cli.metrics_file {
        if let Err(e) = write_metrics(path) {
            error!("{e:#}");
        }
    }

    logging.finish()?;
    result
}

fn run(cli: &Cli) -> Result<(), anyhow::Error> {
    match &cli.command {
        Commands::Init { force } => init_config(&cli.config, *force),
        Commands::Backup { database } => backup(cli, database),
        Commands::Restore { backup, database } => restore(cli, backup, database),
        Commands::Test { database } => test_connection(cli, database),
        Commands::List { prefix } => list_backups(cli, prefix.as_deref()),
        Commands::Schedule { command } => match command {
            ScheduleCommands::Add {
                database,
                schedule,
                log,
                table,
            } => schedule_add(cli, database, schedule, log.as_deref(), table.as_deref()),
            ScheduleCommands::Remove { database, table } => {
                schedule_remove(database, table.as_deref())
            }
            ScheduleCommands::List { table } => schedule_list(cli, table.as_deref()),
        },
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig, anyhow::Error> {
    AppConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))
}

fn init_config(path: &Path, force: bool) -> Result<(), anyhow::Error> {
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote configuration template to {}", path.display());
    Ok(())
}

fn backup(cli: &Cli, database: &str) -> Result<(), anyhow::Error> {
    let config = load_config(cli)?;
    let report = BackupPipeline::from_config(&config).run(&config, database)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_backup_report(&report);
    }
    Ok(())
}

fn print_backup_report(report: &BackupReport) {
    println!("Backup of '{}' stored at {}", report.database, report.location);
    println!("  Engine:      {}", report.engine);
    println!("  Dump size:   {}", format_size(report.dump_size));
    match report.compression_ratio() {
        Some(ratio) => println!(
            "  Compressed:  {} ({}, {:.1}%)",
            format_size(report.compressed_size),
            report.compression_algorithm,
            ratio * 100.0
        ),
        None => println!(
            "  Compressed:  {} ({})",
            format_size(report.compressed_size),
            report.compression_algorithm
        ),
    }
    println!("  SHA-256:     {}", report.sha256);
    println!("  Duration:    {:.2}s", report.duration_secs());
}

fn restore(cli: &Cli, backup: &str, database: &str) -> Result<(), anyhow::Error> {
    let config = load_config(cli)?;
    let report = RestorePipeline::from_config(&config).run(&config, backup, database)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_restore_report(&report);
    }
    Ok(())
}

fn print_restore_report(report: &RestoreReport) {
    println!("Restored '{}' from {}", report.database, report.source);
    println!("  Engine:      {}", report.engine);
    println!("  Downloaded:  {}", format_size(report.downloaded_size));
    println!(
        "  Restored:    {}{}",
        format_size(report.restored_size),
        if report.decompressed { " (decompressed)" } else { "" }
    );
    println!("  Duration:    {:.2}s", report.duration_secs());
}

fn test_connection(cli: &Cli, database: &str) -> Result<(), anyhow::Error> {
    let config = load_config(cli)?;
    let engine_config = config.database(database)?;
    let registry = DatabaseRegistry::with_defaults(ProcessRunner::with_timeout(
        config.command_timeout(),
    ));
    let adapter = registry.resolve(engine_config)?;

    adapter
        .test_connection(engine_config)
        .with_context(|| format!("Connection test for '{database}' failed"))?;
    info!(database = %database, engine = adapter.engine_name(), "Connection test passed");

    if cli.json {
        let status = serde_json::json!({
            "database": database,
            "engine": adapter.engine_name(),
            "ok": true,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Connection to '{database}' ({}) OK", adapter.engine_name());
    }
    Ok(())
}

fn list_backups(cli: &Cli, prefix: Option<&str>) -> Result<(), anyhow::Error> {
    let config = load_config(cli)?;
    let storage = StorageRegistry::with_defaults().build(&config.storage)?;

    let prefix = match prefix {
        Some(prefix) => prefix.to_string(),
        None => match config.storage_root()? {
            "" => String::new(),
            root => join_address(root, ""),
        },
    };
    let addresses = storage.list_files(&prefix)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&addresses)?);
        return Ok(());
    }
    if addresses.is_empty() {
        println!("No backups found under '{prefix}'");
        return Ok(());
    }

    let rows: Vec<ArtifactRow> = addresses
        .iter()
        .map(|address| ArtifactRow {
            name: address_basename(address).to_string(),
            address: address.clone(),
        })
        .collect();
    println!("{}", Table::new(rows));
    println!("\nTotal: {} backup(s)", addresses.len());
    Ok(())
}

fn job_scheduler(table: Option<&Path>) -> Box<dyn JobScheduler> {
    match table {
        Some(path) => Box::new(CronScheduler::new(FileJobTable::new(path))),
        None => Box::new(CronScheduler::user_crontab()),
    }
}

fn schedule_add(
    cli: &Cli,
    database: &str,
    schedule: &str,
    log: Option<&Path>,
    table: Option<&Path>,
) -> Result<(), anyhow::Error> {
    let config = load_config(cli)?;
    config.database(database)?;

    let binary = std::env::current_exe().context("Failed to locate the dumpvault binary")?;
    let config_path = std::fs::canonicalize(&cli.config)
        .with_context(|| format!("Failed to resolve {}", cli.config.display()))?;
    let log_path = match log {
        Some(path) => path.to_path_buf(),
        None => config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("dumpvault-{database}.log")),
    };

    let command = backup_command(&binary, &config_path, database, &log_path);
    job_scheduler(table).add_job(database, schedule, &command)?;
    println!("Scheduled backup of '{database}' at '{schedule}'");
    Ok(())
}

fn schedule_remove(database: &str, table: Option<&Path>) -> Result<(), anyhow::Error> {
    job_scheduler(table).remove_job(database)?;
    println!("Removed scheduled backup of '{database}'");
    Ok(())
}

fn schedule_list(cli: &Cli, table: Option<&Path>) -> Result<(), anyhow::Error> {
    let jobs = job_scheduler(table).list_jobs()?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
    } else if jobs.is_empty() {
        println!("No scheduled backups");
    } else {
        let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn write_metrics(path: &Path) -> Result<(), anyhow::Error> {
    let text = dumpvault_core::observability::gather_metrics()?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write metrics to {}", path.display()))
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
