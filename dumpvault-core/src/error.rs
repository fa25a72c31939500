/*!
Error types for the dumpvault core.
*/

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type used throughout the dumpvault core.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Pipeline stage a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStep {
    Prepare,
    Dump,
    Compress,
    Upload,
    Download,
    Decompress,
    Restore,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStep::Prepare => "prepare",
            PipelineStep::Dump => "dump",
            PipelineStep::Compress => "compress",
            PipelineStep::Upload => "upload",
            PipelineStep::Download => "download",
            PipelineStep::Decompress => "decompress",
            PipelineStep::Restore => "restore",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during backup, restore and scheduling operations.
#[derive(Error, Debug)]
pub enum VaultError {
    /// Missing or malformed configuration key, or unknown adapter type
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// External dump/restore tool could not start or exited unsuccessfully
    #[error("{tool} failed: {message}")]
    AdapterExecution { tool: String, message: String },

    /// Local or remote I/O fault while moving artifacts
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// File does not carry the expected compressed-file extension
    #[error("Format error: {0}")]
    Format(String),

    /// Input is not a valid compressed stream
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Missing local file or remote object
    #[error("Not found: {0}")]
    NotFound(String),

    /// A pipeline step failed; wraps the underlying error
    #[error("{step} step failed: {source}")]
    Step {
        step: PipelineStep,
        #[source]
        source: Box<VaultError>,
    },
}

impl VaultError {
    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new storage I/O error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::StorageIo(msg.into())
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new adapter execution error
    pub fn execution<T: Into<String>, M: Into<String>>(tool: T, message: M) -> Self {
        Self::AdapterExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Classify an I/O error, keeping missing files distinguishable from other faults.
    pub fn io(context: impl fmt::Display, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Self::NotFound(format!("{context}: {err}"))
        } else {
            Self::StorageIo(format!("{context}: {err}"))
        }
    }

    /// Attach the pipeline step this error surfaced in.
    pub fn in_step(self, step: PipelineStep) -> Self {
        Self::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The underlying error with any pipeline step context removed.
    pub fn root(&self) -> &VaultError {
        match self {
            VaultError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// The step a pipeline failure happened in, if any.
    pub fn step(&self) -> Option<PipelineStep> {
        match self {
            VaultError::Step { step, .. } => Some(*step),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), VaultError::NotFound(_))
    }
}

impl From<config::ConfigError> for VaultError {
    fn from(err: config::ConfigError) -> Self {
        VaultError::Configuration(err.to_string())
    }
}
