/*!
Compression codecs for backup artifacts.

Codecs work file-to-file and stream their input, so artifacts of any size are
handled in constant memory. The default implementation uses gzip; the trait
leaves room for plugging in other algorithms.
*/

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::{Result, VaultError};

const BUFFER_SIZE: usize = 64 * 1024;

/// File-to-file compression abstraction
pub trait CompressionCodec: Send + Sync {
    /// Extension appended to compressed files, without the dot
    fn extension(&self) -> &'static str;

    fn algorithm_name(&self) -> &'static str;

    /// Compress `path` into a sibling file carrying the codec extension.
    ///
    /// The input file is left untouched.
    ///
    /// # Returns
    /// Path of the compressed file
    fn compress(&self, path: &Path) -> Result<PathBuf>;

    /// Decompress `path` into a sibling file with the codec extension removed.
    ///
    /// # Errors
    /// * `VaultError::Format` - `path` lacks the codec extension; nothing is read
    /// * `VaultError::CorruptArchive` - the input is empty or not a valid stream
    fn decompress(&self, path: &Path) -> Result<PathBuf>;

    /// Whether the name of `path` carries the codec extension
    fn is_compressed(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext == self.extension())
            .unwrap_or(false)
    }
}

/// Gzip codec
///
/// # Example
/// ```rust,no_run
/// use dumpvault_core::compression::{CompressionCodec, GzipCodec};
/// use std::path::Path;
///
/// let codec = GzipCodec::new();
/// let compressed = codec.compress(Path::new("/tmp/orders_backup.sql"))?;
/// assert_eq!(compressed, Path::new("/tmp/orders_backup.sql.gz"));
/// # Ok::<(), dumpvault_core::VaultError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCodec {
    compression_level: Compression,
}

impl GzipCodec {
    /// Create a gzip codec with the default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a gzip codec with the given level
    ///
    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 is no compression and 9 is maximum)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Level 1: less CPU, larger files
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Level 9: more CPU, smaller files
    pub fn max() -> Self {
        Self::with_level(9)
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }

    fn write_compressed(&self, input: &Path, output: &Path) -> Result<u64> {
        let source = File::open(input)
            .map_err(|e| VaultError::io(format!("open {}", input.display()), e))?;
        let target = File::create(output)
            .map_err(|e| VaultError::io(format!("create {}", output.display()), e))?;

        let mut reader = BufReader::with_capacity(BUFFER_SIZE, source);
        let mut encoder = GzEncoder::new(BufWriter::with_capacity(BUFFER_SIZE, target), self.compression_level);

        let copied = io::copy(&mut reader, &mut encoder)
            .map_err(|e| VaultError::io(format!("compress {}", input.display()), e))?;

        let writer = encoder
            .finish()
            .map_err(|e| VaultError::io(format!("finish {}", output.display()), e))?;
        let file = writer
            .into_inner()
            .map_err(|e| VaultError::io(format!("flush {}", output.display()), e.into_error()))?;
        file.sync_all()
            .map_err(|e| VaultError::io(format!("sync {}", output.display()), e))?;

        Ok(copied)
    }

    fn write_decompressed(&self, input: &Path, output: &Path) -> Result<u64> {
        let source = File::open(input)
            .map_err(|e| VaultError::io(format!("open {}", input.display()), e))?;
        let size = source
            .metadata()
            .map_err(|e| VaultError::io(format!("stat {}", input.display()), e))?
            .len();
        if size == 0 {
            return Err(VaultError::CorruptArchive(format!(
                "{} is empty",
                input.display()
            )));
        }

        let target = File::create(output)
            .map_err(|e| VaultError::io(format!("create {}", output.display()), e))?;
        let mut decoder = GzDecoder::new(BufReader::with_capacity(BUFFER_SIZE, source));
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, target);

        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = match decoder.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(VaultError::CorruptArchive(format!(
                        "{}: {}",
                        input.display(),
                        e
                    )))
                }
            };
            writer
                .write_all(&buf[..n])
                .map_err(|e| VaultError::storage(format!("write {}: {}", output.display(), e)))?;
            written += n as u64;
        }

        writer
            .flush()
            .map_err(|e| VaultError::storage(format!("flush {}: {}", output.display(), e)))?;
        Ok(written)
    }
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionCodec for GzipCodec {
    fn extension(&self) -> &'static str {
        "gz"
    }

    fn algorithm_name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, path: &Path) -> Result<PathBuf> {
        let mut name = path.as_os_str().to_os_string();
        name.push(".gz");
        let output = PathBuf::from(name);

        match self.write_compressed(path, &output) {
            Ok(bytes) => {
                debug!(input = %path.display(), output = %output.display(), bytes = bytes, "Compressed artifact");
                Ok(output)
            }
            Err(e) => {
                remove_partial(&output);
                Err(e)
            }
        }
    }

    fn decompress(&self, path: &Path) -> Result<PathBuf> {
        if !self.is_compressed(path) {
            return Err(VaultError::Format(format!(
                "{} does not have a .gz extension",
                path.display()
            )));
        }
        let output = path.with_extension("");

        match self.write_decompressed(path, &output) {
            Ok(bytes) => {
                debug!(input = %path.display(), output = %output.display(), bytes = bytes, "Decompressed artifact");
                Ok(output)
            }
            Err(e) => {
                remove_partial(&output);
                Err(e)
            }
        }
    }
}

/// Delete an incomplete output file, logging instead of failing
pub(crate) fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove partial output");
        }
    }
}
