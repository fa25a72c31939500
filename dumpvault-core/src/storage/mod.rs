/*!
Storage adapters for backup artifacts.

This module defines the storage abstraction (port) and its concrete backends
(adapters). Pipelines only ever see a `Box<dyn StorageAdapter>` built by the
[`StorageRegistry`] from the `type` key of the storage config.
*/

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::{Result, VaultError};

pub use local::LocalStorage;
#[cfg(feature = "s3")]
pub use s3::S3Storage;

/// Storage abstraction for moving artifacts between local disk and a backend
pub trait StorageAdapter: Send + Sync {
    /// Persist a local file at a remote address
    ///
    /// # Arguments
    /// * `local_path` - File to upload
    /// * `remote_address` - Destination (interpretation depends on the backend)
    ///
    /// # Returns
    /// The location the backend actually stored the file at
    ///
    /// # Errors
    /// * `VaultError::NotFound` - `local_path` does not exist
    /// * `VaultError::StorageIo` - any other read, write or transport fault
    fn upload(&self, local_path: &Path, remote_address: &str) -> Result<String>;

    /// Fetch a remote artifact into `local_path`, overwriting it
    ///
    /// # Errors
    /// * `VaultError::NotFound` - no artifact at `remote_address`
    /// * `VaultError::StorageIo` - any other fault
    fn download(&self, remote_address: &str, local_path: &Path) -> Result<PathBuf>;

    /// Addresses starting with `prefix`, sorted; empty when nothing matches
    fn list_files(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend_name(&self) -> &'static str;
}

/// Constructor for a storage backend
pub type StorageFactory =
    Box<dyn Fn(&StorageConfig) -> Result<Box<dyn StorageAdapter>> + Send + Sync>;

/// Maps storage `type` discriminators to backend constructors
pub struct StorageRegistry {
    factories: HashMap<String, StorageFactory>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with `local` and `s3`.
    ///
    /// When the crate is built without the `s3` feature the `s3` entry still
    /// resolves, but building it fails with a configuration error.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            "local",
            Box::new(|config: &StorageConfig| {
                Ok(Box::new(LocalStorage::from_config(config)?) as Box<dyn StorageAdapter>)
            }),
        );
        registry.register("s3", Box::new(build_s3));
        registry
    }

    /// Register (or replace) the constructor for a discriminator
    pub fn register(&mut self, kind: &str, factory: StorageFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    /// Build the backend selected by the config's `type`
    pub fn build(&self, config: &StorageConfig) -> Result<Box<dyn StorageAdapter>> {
        let kind = config.kind()?;
        let factory = self.factories.get(kind).ok_or_else(|| {
            VaultError::configuration(format!("unsupported storage type: {kind}"))
        })?;
        factory(config)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(feature = "s3")]
fn build_s3(config: &StorageConfig) -> Result<Box<dyn StorageAdapter>> {
    Ok(Box::new(S3Storage::from_config(config)?))
}

#[cfg(not(feature = "s3"))]
fn build_s3(_config: &StorageConfig) -> Result<Box<dyn StorageAdapter>> {
    Err(VaultError::configuration(
        "storage type 's3' is not compiled in (enable the `s3` feature)",
    ))
}

/// Join a storage root and a file name with a single `/`
pub fn join_address(root: &str, name: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        name.to_string()
    } else {
        format!("{root}/{name}")
    }
}

/// Last path segment of an address
pub fn address_basename(address: &str) -> &str {
    address.rsplit('/').next().unwrap_or(address)
}

/// Memory-based storage adapter for testing
///
/// Stores artifacts in a HashMap, optionally failing every upload.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStorage {
    data: std::sync::Arc<std::sync::Mutex<HashMap<String, Vec<u8>>>>,
    fail_uploads: bool,
}

#[cfg(test)]
impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_uploads() -> Self {
        Self {
            fail_uploads: true,
            ..Self::default()
        }
    }

    /// A second handle onto the same stored objects
    pub fn share(&self) -> Self {
        Self {
            data: self.data.clone(),
            fail_uploads: self.fail_uploads,
        }
    }

    pub fn insert(&self, address: &str, bytes: &[u8]) {
        self.data
            .lock()
            .unwrap()
            .insert(address.to_string(), bytes.to_vec());
    }

    pub fn get(&self, address: &str) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(address).cloned()
    }
}

#[cfg(test)]
impl StorageAdapter for MemoryStorage {
    fn upload(&self, local_path: &Path, remote_address: &str) -> Result<String> {
        if self.fail_uploads {
            return Err(VaultError::storage("injected upload failure"));
        }
        let bytes = std::fs::read(local_path)
            .map_err(|e| VaultError::io(format!("read {}", local_path.display()), e))?;
        self.insert(remote_address, &bytes);
        Ok(remote_address.to_string())
    }

    fn download(&self, remote_address: &str, local_path: &Path) -> Result<PathBuf> {
        let bytes = self
            .get(remote_address)
            .ok_or_else(|| VaultError::not_found(format!("object {remote_address}")))?;
        std::fs::write(local_path, bytes)
            .map_err(|e| VaultError::io(format!("write {}", local_path.display()), e))?;
        Ok(local_path.to_path_buf())
    }

    fn list_files(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_registry_builds_local() {
        let temp_dir = TempDir::new().unwrap();
        let registry = StorageRegistry::default();
        let storage = registry
            .build(&StorageConfig::local_storage(temp_dir.path()))
            .unwrap();
        assert_eq!(storage.backend_name(), "local");
        assert_eq!(registry.kinds(), vec!["local", "s3"]);
    }

    #[test]
    fn test_registry_unknown_type() {
        let err = StorageRegistry::default()
            .build(&StorageConfig::new("ftp"))
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::Configuration(_)));
        assert!(err.to_string().contains("ftp"));
    }

    #[cfg(not(feature = "s3"))]
    #[test]
    fn test_s3_not_compiled_in() {
        let err = StorageRegistry::default()
            .build(&StorageConfig::s3_storage("bucket"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("not compiled in"));
    }

    #[test]
    fn test_registry_custom_backend() {
        let mut registry = StorageRegistry::new();
        registry.register(
            "memory",
            Box::new(|_: &StorageConfig| Ok(Box::new(MemoryStorage::new()) as Box<dyn StorageAdapter>)),
        );
        let storage = registry.build(&StorageConfig::new("memory")).unwrap();
        assert_eq!(storage.backend_name(), "memory");
    }

    #[test]
    fn test_join_address() {
        assert_eq!(join_address("", "a.sql.gz"), "a.sql.gz");
        assert_eq!(join_address("/backups", "a.sql.gz"), "/backups/a.sql.gz");
        assert_eq!(join_address("/backups/", "a.sql.gz"), "/backups/a.sql.gz");
        assert_eq!(join_address("db/nightly", "a.sql.gz"), "db/nightly/a.sql.gz");
    }

    #[test]
    fn test_address_basename() {
        assert_eq!(address_basename("s3://bucket/db/orders_backup.sql.gz"), "orders_backup.sql.gz");
        assert_eq!(address_basename("orders_backup.sql.gz"), "orders_backup.sql.gz");
        assert_eq!(address_basename("/var/backups/x.db.gz"), "x.db.gz");
    }

    #[test]
    fn test_memory_storage_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("in.gz");
        std::fs::write(&source, b"artifact").unwrap();

        let storage = MemoryStorage::new();
        assert_eq!(storage.upload(&source, "root/in.gz").unwrap(), "root/in.gz");
        assert_eq!(storage.list_files("root/").unwrap(), vec!["root/in.gz"]);

        let target = temp_dir.path().join("out.gz");
        storage.download("root/in.gz", &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"artifact");

        assert!(storage.download("absent", &target).unwrap_err().is_not_found());
    }
}
