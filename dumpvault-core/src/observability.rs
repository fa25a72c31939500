/*!
Observability infrastructure for dumpvault.

- Structured logging through `tracing`, installed and torn down by a
  [`LoggingContext`]
- Prometheus metrics for pipeline runs (feature `metrics`)
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, HistogramVec, Registry, TextEncoder};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::error::PipelineStep;
use crate::{Result, VaultError};

/// How the process wants its logs
#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Default to `debug` instead of `info` when `RUST_LOG` is unset
    pub verbose: bool,
    /// JSON lines on the console instead of human-readable output
    pub json: bool,
    /// Also append JSON lines to this file
    pub log_file: Option<PathBuf>,
}

/// Installed logging pipeline.
///
/// Created once at process start with [`LoggingContext::init`] and closed with
/// [`LoggingContext::finish`], which flushes the log file.
#[derive(Debug)]
pub struct LoggingContext {
    log_file: Option<(PathBuf, Arc<File>)>,
}

impl LoggingContext {
    /// Install the global tracing subscriber
    ///
    /// # Errors
    /// * `VaultError::StorageIo` - the log file cannot be opened
    /// * `VaultError::Configuration` - a subscriber is already installed
    pub fn init(options: &LoggingOptions) -> Result<Self> {
        let default_level = if options.verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_level));

        let log_file = match &options.log_file {
            Some(path) => Some((path.clone(), Arc::new(open_log_file(path)?))),
            None => None,
        };

        let json_console = options.json.then(|| {
            fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false)
                .with_writer(std::io::stderr)
        });
        let human_console = (!options.json).then(|| {
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        });
        let file_layer = log_file.as_ref().map(|(_, file)| {
            fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false)
                .with_ansi(false)
                .with_writer(file.clone())
        });

        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(json_console)
            .with(human_console)
            .with(file_layer);

        tracing::subscriber::set_global_default(subscriber).map_err(|e| {
            VaultError::configuration(format!("Failed to set global tracing subscriber: {e}"))
        })?;

        #[cfg(feature = "metrics")]
        PipelineMetrics::global();

        Ok(Self { log_file })
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_ref().map(|(path, _)| path.as_path())
    }

    /// Flush and sync the log file, if any
    pub fn finish(self) -> Result<()> {
        if let Some((path, file)) = self.log_file {
            file.sync_all()
                .map_err(|e| VaultError::io(format!("sync log file {}", path.display()), e))?;
        }
        Ok(())
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| VaultError::io(format!("create directory {}", parent.display()), e))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| VaultError::io(format!("open log file {}", path.display()), e))
}

/// Kind of pipeline run, for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Backup,
    Restore,
}

/// Record the outcome of a pipeline run
pub(crate) fn record_run(kind: RunKind, success: bool) {
    #[cfg(feature = "metrics")]
    PipelineMetrics::global().record_run(kind, success);
    #[cfg(not(feature = "metrics"))]
    let _ = (kind, success);
}

/// Record how long a pipeline step took
pub(crate) fn record_step(step: PipelineStep, elapsed: Duration) {
    #[cfg(feature = "metrics")]
    PipelineMetrics::global().record_step(step, elapsed);
    #[cfg(not(feature = "metrics"))]
    let _ = (step, elapsed);
}

/// Record the size of an uploaded artifact
pub(crate) fn record_artifact_size(bytes: u64) {
    #[cfg(feature = "metrics")]
    PipelineMetrics::global().record_artifact_size(bytes);
    #[cfg(not(feature = "metrics"))]
    let _ = bytes;
}

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<PipelineMetrics> = OnceLock::new();

/// Metrics collection for pipeline runs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PipelineMetrics {
    pub backups_total: Counter,
    pub backup_failures_total: Counter,
    pub restores_total: Counter,
    pub restore_failures_total: Counter,

    /// Step latency, labelled by step name
    pub step_duration_seconds: HistogramVec,

    pub artifact_size_bytes: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl PipelineMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let backups_total = counter("dumpvault_backups_total", "Backup runs started")?;
        let backup_failures_total =
            counter("dumpvault_backup_failures_total", "Backup runs that failed")?;
        let restores_total = counter("dumpvault_restores_total", "Restore runs started")?;
        let restore_failures_total =
            counter("dumpvault_restore_failures_total", "Restore runs that failed")?;

        let step_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dumpvault_step_duration_seconds",
                "Duration of pipeline steps in seconds",
            ),
            &["step"],
        )
        .map_err(|e| metric_error("dumpvault_step_duration_seconds", e))?;

        let artifact_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "dumpvault_artifact_size_bytes",
                "Size of uploaded artifacts in bytes",
            )
            .buckets(prometheus::exponential_buckets(1024.0, 4.0, 12).map_err(|e| {
                metric_error("dumpvault_artifact_size_bytes", e)
            })?),
        )
        .map_err(|e| metric_error("dumpvault_artifact_size_bytes", e))?;

        for collector in [
            Box::new(backups_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(backup_failures_total.clone()),
            Box::new(restores_total.clone()),
            Box::new(restore_failures_total.clone()),
            Box::new(step_duration_seconds.clone()),
            Box::new(artifact_size_bytes.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| VaultError::configuration(format!("Failed to register metric: {e}")))?;
        }

        Ok(Self {
            backups_total,
            backup_failures_total,
            restores_total,
            restore_failures_total,
            step_duration_seconds,
            artifact_size_bytes,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static PipelineMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize dumpvault metrics"))
    }

    pub fn record_run(&self, kind: RunKind, success: bool) {
        let (total, failures) = match kind {
            RunKind::Backup => (&self.backups_total, &self.backup_failures_total),
            RunKind::Restore => (&self.restores_total, &self.restore_failures_total),
        };
        total.inc();
        if !success {
            failures.inc();
        }
    }

    pub fn record_step(&self, step: PipelineStep, elapsed: Duration) {
        let label = step.to_string();
        self.step_duration_seconds
            .with_label_values(&[label.as_str()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_artifact_size(&self, bytes: u64) {
        self.artifact_size_bytes.observe(bytes as f64);
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| VaultError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| VaultError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn counter(name: &str, help: &str) -> Result<Counter> {
    Counter::new(name, help).map_err(|e| metric_error(name, e))
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, err: prometheus::Error) -> VaultError {
    VaultError::configuration(format!("Failed to create {name} metric: {err}"))
}

/// Gather the global metrics in Prometheus text format
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    PipelineMetrics::global().gather_metrics()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // The only test in this crate that installs the global subscriber
    #[test]
    fn test_logging_context_writes_log_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs/dumpvault.log");

        let context = LoggingContext::init(&LoggingOptions {
            verbose: false,
            json: true,
            log_file: Some(path.clone()),
        })
        .unwrap();
        assert_eq!(context.log_file(), Some(path.as_path()));

        tracing::info!(database = "orders", "logging context smoke test");
        context.finish().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("logging context smoke test"));
        assert!(contents.contains("orders"));
    }

    #[test]
    fn test_open_log_file_appends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.log");
        std::fs::write(&path, "first\n").unwrap();

        use std::io::Write;
        let mut file = open_log_file(&path).unwrap();
        file.write_all(b"second\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_metrics_gathering() {
        record_run(RunKind::Backup, true);
        record_run(RunKind::Restore, false);
        record_step(PipelineStep::Compress, Duration::from_millis(12));
        record_artifact_size(4096);

        let text = gather_metrics().unwrap();
        assert!(text.contains("dumpvault_backups_total"));
        assert!(text.contains("dumpvault_restore_failures_total"));
        assert!(text.contains("step=\"compress\""));
    }
}
