//! Persistence for local flag overrides.
//!
//! Providers never fail on write: a failed write is logged and the
//! override only lives in memory. On read, corrupt JSON is reported as
//! [`ErrorCode::OverridesInvalidJson`] while a well-formed value of the
//! wrong shape reads as no overrides.

mod cookie;
mod storage;

pub use cookie::{CookieAttributes, CookieJar, CookieOverridesProvider, MemoryCookieJar, SameSite};
pub use storage::StorageOverridesProvider;

use async_trait::async_trait;

use crate::error::{ErrorCode, ReflagError, Result};
use crate::types::FlagOverrides;

/// Default storage key / cookie name for persisted overrides.
pub const DEFAULT_OVERRIDES_KEY: &str = "__reflag_overrides";

#[async_trait]
pub trait OverridesProvider: Send + Sync {
    async fn set_overrides(&self, overrides: &FlagOverrides);

    async fn get_overrides(&self) -> Result<FlagOverrides>;
}

/// Parse a persisted overrides blob.
///
/// Entries that are not booleans are dropped.
pub fn parse_overrides(raw: &str) -> Result<FlagOverrides> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
        ReflagError::with_source(ErrorCode::OverridesInvalidJson, "Invalid overrides JSON", e)
    })?;

    let serde_json::Value::Object(map) = value else {
        return Ok(FlagOverrides::new());
    };

    Ok(map
        .into_iter()
        .filter_map(|(key, value)| value.as_bool().map(|b| (key, b)))
        .collect())
}
