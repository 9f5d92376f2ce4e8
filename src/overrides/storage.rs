use async_trait::async_trait;
use std::sync::Arc;

use super::{parse_overrides, OverridesProvider, DEFAULT_OVERRIDES_KEY};
use crate::error::Result;
use crate::storage::StorageAdapter;
use crate::types::FlagOverrides;

/// Keeps overrides in a [`StorageAdapter`].
///
/// Without an adapter, writes are dropped and reads are empty.
pub struct StorageOverridesProvider {
    storage: Option<Arc<dyn StorageAdapter>>,
    storage_key: String,
}

impl StorageOverridesProvider {
    pub fn new(storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        Self::with_key(storage, DEFAULT_OVERRIDES_KEY)
    }

    pub fn with_key(storage: Option<Arc<dyn StorageAdapter>>, key: impl Into<String>) -> Self {
        Self {
            storage,
            storage_key: key.into(),
        }
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }
}

#[async_trait]
impl OverridesProvider for StorageOverridesProvider {
    async fn set_overrides(&self, overrides: &FlagOverrides) {
        let Some(ref storage) = self.storage else {
            return;
        };

        let serialized = match serde_json::to_string(overrides) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Serializing flag overrides failed, overrides won't persist: {}", e);
                return;
            }
        };

        if let Err(e) = storage.set_item(&self.storage_key, &serialized).await {
            tracing::warn!("Storing flag overrides failed, overrides won't persist: {}", e);
        }
    }

    async fn get_overrides(&self) -> Result<FlagOverrides> {
        let Some(ref storage) = self.storage else {
            return Ok(FlagOverrides::new());
        };

        let raw = match storage.get_item(&self.storage_key).await {
            Ok(Some(raw)) if !raw.is_empty() => raw,
            Ok(_) => return Ok(FlagOverrides::new()),
            Err(e) => {
                tracing::warn!("Reading flag overrides failed: {}", e);
                return Ok(FlagOverrides::new());
            }
        };

        parse_overrides(&raw)
    }
}
