//! Pluggable key-value persistence.
//!
//! When no adapter is supplied, [`resolve_storage_adapter`] walks an ordered
//! list of candidates and always ends with [`MemoryStorage`], so the rest of
//! the SDK never has to handle "no storage".

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::form_urlencoded;

use crate::error::{ErrorCode, ReflagError, Result};

/// Environment variable naming a directory for persistent file storage.
pub const STORAGE_DIR_ENV: &str = "REFLAG_STORAGE_DIR";

static TEMP_FILE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Async string key-value store.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>>;

    async fn set_item(&self, key: &str, value: &str) -> Result<()>;

    async fn remove_item(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Process-local storage. Does not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        self.items.write().remove(key);
        Ok(())
    }
}

/// Stores each key as a file inside a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// reader never observes a half-written value.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            ReflagError::with_source(
                ErrorCode::StorageWriteError,
                format!("Failed to create storage directory {}", dir.display()),
                e,
            )
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys are percent-encoded, so distinct keys never share a file and
    /// cannot escape the directory.
    fn path_for(&self, key: &str) -> PathBuf {
        let file_name = form_urlencoded::byte_serialize(key.as_bytes())
            .collect::<String>()
            .replace('*', "%2A");
        self.dir.join(format!("{}.json", file_name))
    }

    /// A temporary path unique to this write, so concurrent writers of one
    /// key never share it.
    fn temp_path_for(&self, path: &Path) -> PathBuf {
        let seq = TEMP_FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{}.{}.tmp", std::process::id(), seq));
        PathBuf::from(name)
    }
}

#[async_trait]
impl StorageAdapter for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ReflagError::with_source(
                ErrorCode::StorageReadError,
                format!("Failed to read storage key {}", key),
                e,
            )),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.temp_path_for(&path);
        let write_err = |e: std::io::Error| {
            ReflagError::with_source(
                ErrorCode::StorageWriteError,
                format!("Failed to write storage key {}", key),
                e,
            )
        };

        tokio::fs::write(&tmp, value).await.map_err(write_err)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e));
        }
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ReflagError::with_source(
                ErrorCode::StorageWriteError,
                format!("Failed to remove storage key {}", key),
                e,
            )),
        }
    }
}

/// Which candidate produced the resolved adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Custom,
    File,
    Environment,
    Memory,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageKind::Custom => "custom",
            StorageKind::File => "file",
            StorageKind::Environment => "environment",
            StorageKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

pub struct StorageResolution {
    pub adapter: Arc<dyn StorageAdapter>,
    pub kind: StorageKind,
}

impl fmt::Debug for StorageResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageResolution")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

type StorageFactory = Box<dyn FnOnce() -> Option<Arc<dyn StorageAdapter>>>;

fn file_storage(dir: &Path) -> Option<Arc<dyn StorageAdapter>> {
    match FileStorage::open(dir) {
        Ok(storage) => Some(Arc::new(storage)),
        Err(e) => {
            tracing::warn!("File storage unavailable, trying next adapter: {}", e);
            None
        }
    }
}

/// Pick a storage adapter: custom, then the configured directory, then
/// `REFLAG_STORAGE_DIR`, then memory.
pub fn resolve_storage_adapter(
    custom: Option<Arc<dyn StorageAdapter>>,
    storage_dir: Option<&Path>,
) -> StorageResolution {
    let storage_dir = storage_dir.map(Path::to_path_buf);

    let candidates: Vec<(StorageKind, StorageFactory)> = vec![
        (StorageKind::Custom, Box::new(move || custom)),
        (
            StorageKind::File,
            Box::new(move || storage_dir.as_deref().and_then(file_storage)),
        ),
        (
            StorageKind::Environment,
            Box::new(|| {
                std::env::var_os(STORAGE_DIR_ENV)
                    .filter(|dir| !dir.is_empty())
                    .and_then(|dir| file_storage(Path::new(&dir)))
            }),
        ),
    ];

    for (kind, factory) in candidates {
        if let Some(adapter) = factory() {
            return StorageResolution { adapter, kind };
        }
    }

    StorageResolution {
        adapter: Arc::new(MemoryStorage::new()),
        kind: StorageKind::Memory,
    }
}
