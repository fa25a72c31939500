/*!
Local filesystem storage adapter implementation.
*/

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::StorageAdapter;
use crate::config::StorageConfig;
use crate::{Result, VaultError};

/// Local filesystem storage adapter
///
/// Remote addresses are plain filesystem paths. Uploads create any missing
/// parent directories of the destination.
///
/// # Example
/// ```rust,no_run
/// use dumpvault_core::storage::{LocalStorage, StorageAdapter};
/// use std::path::Path;
///
/// let storage = LocalStorage::new();
/// let stored = storage.upload(Path::new("/tmp/orders_backup.sql.gz"), "/var/backups/orders_backup.sql.gz")?;
/// assert_eq!(stored, "/var/backups/orders_backup.sql.gz");
/// # Ok::<(), dumpvault_core::VaultError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }

    /// Build from a storage config; `path` (the storage root), when present,
    /// must be a string
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        config.optional_str("path")?;
        Ok(Self)
    }

    fn ensure_parent_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    VaultError::storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn copy(from: &Path, to: &Path) -> Result<u64> {
        if !from.is_file() {
            return Err(VaultError::not_found(format!("{} does not exist", from.display())));
        }
        Self::ensure_parent_dir(to)?;
        fs::copy(from, to).map_err(|e| {
            VaultError::storage(format!(
                "Failed to copy {} to {}: {}",
                from.display(),
                to.display(),
                e
            ))
        })
    }
}

/// Directory to scan for a prefix and the address stem entries are joined to
fn listing_scope(prefix: &str) -> (PathBuf, String) {
    if prefix.is_empty() {
        return (PathBuf::from("."), String::new());
    }
    if prefix.ends_with('/') {
        return (PathBuf::from(prefix), prefix.to_string());
    }
    match prefix.rfind('/') {
        Some(0) => (PathBuf::from("/"), "/".to_string()),
        Some(idx) => (PathBuf::from(&prefix[..idx]), prefix[..=idx].to_string()),
        None => (PathBuf::from("."), String::new()),
    }
}

impl StorageAdapter for LocalStorage {
    fn upload(&self, local_path: &Path, remote_address: &str) -> Result<String> {
        let destination = PathBuf::from(remote_address);
        let bytes = Self::copy(local_path, &destination)?;
        debug!(
            source = %local_path.display(),
            destination = %destination.display(),
            bytes = bytes,
            "Stored artifact on local filesystem"
        );
        Ok(remote_address.to_string())
    }

    fn download(&self, remote_address: &str, local_path: &Path) -> Result<PathBuf> {
        Self::copy(Path::new(remote_address), local_path)?;
        Ok(local_path.to_path_buf())
    }

    fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let (dir, stem) = listing_scope(prefix);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(VaultError::storage(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                VaultError::storage(format!("Failed to list {}: {}", dir.display(), e))
            })?;
            if !entry.path().is_file() {
                continue;
            }
            let address = format!("{}{}", stem, entry.file_name().to_string_lossy());
            if address.starts_with(prefix) {
                files.push(address);
            }
        }
        files.sort();
        Ok(files)
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn address(dir: &Path, name: &str) -> String {
        dir.join(name).to_string_lossy().into_owned()
    }

    #[test]
    fn test_upload_download_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("orders_backup.sql.gz");
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(&source, &payload).unwrap();

        let storage = LocalStorage::new();
        let remote = address(temp_dir.path(), "remote/nested/orders_backup.sql.gz");

        let stored = storage.upload(&source, &remote).unwrap();
        assert_eq!(stored, remote);

        let target = temp_dir.path().join("restore/orders_backup.sql.gz");
        let downloaded = storage.download(&stored, &target).unwrap();
        assert_eq!(downloaded, target);
        assert_eq!(fs::read(&target).unwrap(), payload);
    }

    #[test]
    fn test_upload_missing_source() {
        let temp_dir = TempDir::new().unwrap();
        let err = LocalStorage::new()
            .upload(&temp_dir.path().join("absent.gz"), &address(temp_dir.path(), "out.gz"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_download_missing_object() {
        let temp_dir = TempDir::new().unwrap();
        let err = LocalStorage::new()
            .download(&address(temp_dir.path(), "absent.gz"), &temp_dir.path().join("x"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_download_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let remote = temp_dir.path().join("remote.gz");
        fs::write(&remote, b"new").unwrap();
        let target = temp_dir.path().join("local.gz");
        fs::write(&target, b"old contents").unwrap();

        LocalStorage::new()
            .download(&remote.to_string_lossy(), &target)
            .unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn test_list_files_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["orders_backup.sql.gz", "orders_archive.sql.gz", "users_backup.sql.gz"] {
            fs::write(temp_dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(temp_dir.path().join("orders_dir")).unwrap();

        let storage = LocalStorage::new();
        let listed = storage
            .list_files(&address(temp_dir.path(), "orders_"))
            .unwrap();
        assert_eq!(
            listed,
            vec![
                address(temp_dir.path(), "orders_archive.sql.gz"),
                address(temp_dir.path(), "orders_backup.sql.gz"),
            ]
        );

        let dir_prefix = format!("{}/", temp_dir.path().display());
        assert_eq!(storage.list_files(&dir_prefix).unwrap().len(), 3);
    }

    #[test]
    fn test_list_files_empty_cases() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new();

        assert!(storage
            .list_files(&address(temp_dir.path(), "nothing_"))
            .unwrap()
            .is_empty());
        assert!(storage
            .list_files(&address(temp_dir.path(), "missing/dir/x"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_listing_scope() {
        assert_eq!(listing_scope("/var/b/orders"), (PathBuf::from("/var/b"), "/var/b/".to_string()));
        assert_eq!(listing_scope("/var/b/"), (PathBuf::from("/var/b/"), "/var/b/".to_string()));
        assert_eq!(listing_scope("orders"), (PathBuf::from("."), String::new()));
        assert_eq!(listing_scope("/orders"), (PathBuf::from("/"), "/".to_string()));
    }

    #[test]
    fn test_from_config_rejects_non_string_root() {
        let config = StorageConfig::new("local").with("path", 12);
        assert!(LocalStorage::from_config(&config).is_err());
        assert!(LocalStorage::from_config(&StorageConfig::new("local")).is_ok());
    }
}
