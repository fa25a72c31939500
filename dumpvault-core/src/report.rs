/*!
Summaries of completed backup and restore runs.
*/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use uuid::Uuid;

use crate::{Result, VaultError};

/// Outcome of a successful backup run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupReport {
    /// Unique identifier for this run
    pub run_id: String,

    /// Logical database name from the configuration
    pub database: String,

    /// Engine that produced the dump (e.g. `mysql`)
    pub engine: String,

    pub storage_backend: String,

    /// Location returned by the storage backend
    pub location: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Size of the raw dump in bytes
    pub dump_size: u64,

    /// Size of the uploaded artifact in bytes
    pub compressed_size: u64,

    /// SHA-256 of the uploaded artifact, hex encoded
    pub sha256: String,

    pub compression_algorithm: String,
}

impl BackupReport {
    /// Start a report for a run beginning now
    pub fn begin<S1, S2>(database: S1, engine: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            database: database.into(),
            engine: engine.into(),
            storage_backend: String::new(),
            location: String::new(),
            started_at: now,
            finished_at: now,
            dump_size: 0,
            compressed_size: 0,
            sha256: String::new(),
            compression_algorithm: String::new(),
        }
    }

    /// Mark the run finished now
    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Compressed size as a fraction of the dump size
    pub fn compression_ratio(&self) -> Option<f64> {
        if self.dump_size == 0 {
            None
        } else {
            Some(self.compressed_size as f64 / self.dump_size as f64)
        }
    }
}

/// Outcome of a successful restore run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub run_id: String,
    pub database: String,
    pub engine: String,
    pub storage_backend: String,

    /// Address the artifact was downloaded from
    pub source: String,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Size of the downloaded artifact in bytes
    pub downloaded_size: u64,

    /// Size of the file handed to the database adapter
    pub restored_size: u64,

    /// Whether the download was decompressed before restoring
    pub decompressed: bool,

    /// SHA-256 of the downloaded artifact, hex encoded
    pub sha256: String,
}

impl RestoreReport {
    pub fn begin<S1, S2, S3>(database: S1, engine: S2, source: S3) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            database: database.into(),
            engine: engine.into(),
            storage_backend: String::new(),
            source: source.into(),
            started_at: now,
            finished_at: now,
            downloaded_size: 0,
            restored_size: 0,
            decompressed: false,
            sha256: String::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Compute the hex SHA-256 of a file without loading it into memory
pub fn file_sha256(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| VaultError::io(format!("open {}", path.display()), e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| VaultError::io(format!("read {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn file_size(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| VaultError::io(format!("stat {}", path.display()), e))
}
