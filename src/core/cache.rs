use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorCode, ReflagError, Result};
use crate::storage::StorageAdapter;
use crate::types::{FlagConfig, RawFlag, RawFlags};
use crate::utils::{Clock, SystemClock};

/// Storage key of the persisted cache blob.
pub const DEFAULT_CACHE_STORAGE_KEY: &str = "__reflag_fetched_flags";

/// Flags fetched for one context, with their soft and hard expiry
/// (epoch milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub flags: RawFlags,
    pub stale_at: i64,
    pub expire_at: i64,
}

/// The whole persisted blob, keyed by context fingerprint.
pub type CacheData = HashMap<String, CacheEntry>;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult {
    pub flags: RawFlags,
    pub stale: bool,
}

/// Body of a flags evaluation response after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagsResponse {
    pub success: bool,
    pub flags: RawFlags,
}

/// Persisted fetched-flags cache with stale and expire TTLs.
///
/// All entries live in one storage item, read and rewritten as a unit.
pub struct FlagCache {
    storage: Arc<dyn StorageAdapter>,
    storage_key: String,
    stale_time: Duration,
    expire_time: Duration,
    clock: Arc<dyn Clock>,
}

impl FlagCache {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        stale_time: Duration,
        expire_time: Duration,
    ) -> Self {
        Self {
            storage,
            storage_key: DEFAULT_CACHE_STORAGE_KEY.to_string(),
            stale_time,
            expire_time,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    async fn load(&self) -> CacheData {
        let raw = match self.storage.get_item(&self.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CacheData::new(),
            Err(e) => {
                tracing::warn!("Reading flag cache failed, treating as empty: {}", e);
                return CacheData::new();
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => validate_cache_data(&value).unwrap_or_else(|| {
                tracing::warn!("Discarding malformed flag cache");
                CacheData::new()
            }),
            Err(e) => {
                tracing::warn!("Flag cache is not valid JSON, treating as empty: {}", e);
                CacheData::new()
            }
        }
    }

    /// Store flags under `key`, dropping every expired entry, and return the
    /// blob that was persisted.
    pub async fn set(&self, key: &str, flags: RawFlags) -> Result<CacheData> {
        let now = self.clock.now_millis();
        let mut data = self.load().await;

        data.insert(
            key.to_string(),
            CacheEntry {
                flags,
                stale_at: now + duration_millis(self.stale_time),
                expire_at: now + duration_millis(self.expire_time),
            },
        );
        data.retain(|_, entry| entry.expire_at > now);

        let serialized = serde_json::to_string(&data).map_err(|e| {
            ReflagError::with_source(
                ErrorCode::CacheInvalidData,
                "Failed to serialize flag cache",
                e,
            )
        })?;
        self.storage.set_item(&self.storage_key, &serialized).await?;

        Ok(data)
    }

    /// Look up `key`. Expired entries read as absent even before pruning.
    pub async fn get(&self, key: &str) -> Option<CacheResult> {
        let now = self.clock.now_millis();
        let entry = self.load().await.remove(key)?;

        if entry.expire_at <= now {
            return None;
        }

        Some(CacheResult {
            stale: entry.stale_at < now,
            flags: entry.flags,
        })
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX / 2)
}

fn bool_array(value: Option<&Value>) -> Option<Option<Vec<bool>>> {
    match value {
        None | Some(Value::Null) => Some(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(Value::as_bool)
            .collect::<Option<Vec<_>>>()
            .map(Some),
        Some(_) => None,
    }
}

fn string_array(value: Option<&Value>) -> Option<Option<Vec<String>>> {
    match value {
        None | Some(Value::Null) => Some(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .map(Some),
        Some(_) => None,
    }
}

fn optional_i64(value: Option<&Value>) -> Option<Option<i64>> {
    match value {
        None | Some(Value::Null) => Some(None),
        Some(v) => v.as_i64().map(Some),
    }
}

fn parse_config(value: Option<&Value>) -> Option<Option<FlagConfig>> {
    let obj = match value {
        None | Some(Value::Null) => return Some(None),
        Some(Value::Object(obj)) => obj,
        Some(_) => return None,
    };

    let key = obj.get("key")?.as_str()?;
    Some(Some(FlagConfig {
        key: key.to_string(),
        version: optional_i64(obj.get("version"))?,
        payload: obj.get("payload").filter(|v| !v.is_null()).cloned(),
        rule_evaluation_results: bool_array(obj.get("ruleEvaluationResults"))?,
        missing_context_fields: string_array(obj.get("missingContextFields"))?,
    }))
}

fn parse_flag(key: &str, obj: &Map<String, Value>) -> Option<RawFlag> {
    let is_enabled = obj.get("isEnabled")?.as_bool()?;
    if obj.get("key")?.as_str()? != key {
        return None;
    }
    let targeting_version = obj.get("targetingVersion")?.as_i64()?;

    Some(RawFlag {
        key: key.to_string(),
        is_enabled,
        targeting_version: Some(targeting_version),
        rule_evaluation_results: bool_array(obj.get("ruleEvaluationResults"))?,
        missing_context_fields: string_array(obj.get("missingContextFields"))?,
        config: parse_config(obj.get("config"))?,
    })
}

/// Validate a `features` object from the evaluation endpoint.
///
/// One malformed entry rejects the whole batch.
pub fn parse_api_flags_response(value: &Value) -> Option<RawFlags> {
    let features = value.as_object()?;
    features
        .iter()
        .map(|(key, flag)| {
            let flag = parse_flag(key, flag.as_object()?)?;
            Some((key.clone(), flag))
        })
        .collect()
}

/// Validate the top-level `{success, features}` evaluation response.
pub fn validate_flags_response(value: &Value) -> Option<FlagsResponse> {
    let obj = value.as_object()?;
    let success = obj.get("success")?.as_bool()?;
    let flags = parse_api_flags_response(obj.get("features")?)?;
    Some(FlagsResponse { success, flags })
}

/// Validate a persisted cache blob. Any malformed entry discards all of it.
pub fn validate_cache_data(value: &Value) -> Option<CacheData> {
    let entries = value.as_object()?;
    entries
        .iter()
        .map(|(key, entry)| {
            let entry = entry.as_object()?;
            let expire_at = entry.get("expireAt")?.as_i64()?;
            let stale_at = entry.get("staleAt")?.as_i64()?;
            let flags = parse_api_flags_response(entry.get("flags")?)?;
            Some((
                key.clone(),
                CacheEntry {
                    flags,
                    stale_at,
                    expire_at,
                },
            ))
        })
        .collect()
}
