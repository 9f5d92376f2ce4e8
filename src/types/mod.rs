use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Remote configuration matched for a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagConfig {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_evaluation_results: Option<Vec<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_context_fields: Option<Vec<String>>,
}

impl FlagConfig {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: None,
            payload: None,
            rule_evaluation_results: None,
            missing_context_fields: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A flag as evaluated by the server. Does not reflect local overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawFlag {
    pub key: String,
    pub is_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_evaluation_results: Option<Vec<bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_context_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<FlagConfig>,
}

impl RawFlag {
    pub fn new(key: impl Into<String>, is_enabled: bool) -> Self {
        Self {
            key: key.into(),
            is_enabled,
            targeting_version: None,
            rule_evaluation_results: None,
            missing_context_fields: None,
            config: None,
        }
    }

    pub fn targeting_version(mut self, version: i64) -> Self {
        self.targeting_version = Some(version);
        self
    }

    pub fn config(mut self, config: FlagConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn missing_context_fields(mut self, fields: Vec<String>) -> Self {
        self.missing_context_fields = Some(fields);
        self
    }
}

/// Server-evaluated flags keyed by flag key.
pub type RawFlags = HashMap<String, RawFlag>;

/// Local boolean overrides keyed by flag key.
pub type FlagOverrides = HashMap<String, bool>;

/// A fetched flag decorated with its local override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedFlag {
    #[serde(flatten)]
    pub flag: RawFlag,
    pub is_enabled_override: Option<bool>,
}

impl MergedFlag {
    pub fn new(flag: RawFlag, is_enabled_override: Option<bool>) -> Self {
        Self {
            flag,
            is_enabled_override,
        }
    }

    pub fn key(&self) -> &str {
        &self.flag.key
    }

    /// The value callers should use: the override if set, else the server result.
    pub fn is_enabled(&self) -> bool {
        self.is_enabled_override.unwrap_or(self.flag.is_enabled)
    }

    pub fn config(&self) -> Option<&FlagConfig> {
        self.flag.config.as_ref()
    }

    /// Check event describing a read of `is_enabled()`.
    pub fn check_is_enabled_event(&self) -> CheckEvent {
        CheckEvent {
            action: CheckAction::CheckIsEnabled,
            key: self.flag.key.clone(),
            value: Some(CheckValue::Enabled(self.is_enabled())),
            version: self.flag.targeting_version,
            rule_evaluation_results: self.flag.rule_evaluation_results.clone(),
            missing_context_fields: self.flag.missing_context_fields.clone(),
        }
    }

    /// Check event describing a read of the remote config, if there is one.
    pub fn check_config_event(&self) -> Option<CheckEvent> {
        let config = self.flag.config.as_ref()?;
        Some(CheckEvent {
            action: CheckAction::CheckConfig,
            key: self.flag.key.clone(),
            value: Some(CheckValue::Config {
                key: config.key.clone(),
                payload: config.payload.clone(),
            }),
            version: config.version,
            rule_evaluation_results: config.rule_evaluation_results.clone(),
            missing_context_fields: config.missing_context_fields.clone(),
        })
    }
}

/// Consumer-visible flags keyed by flag key.
pub type MergedFlags = HashMap<String, MergedFlag>;

/// Statically configured flag state used when neither network nor cache
/// produced any data.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackFlagOverride {
    /// Enabled, without config.
    Enabled,
    /// Enabled with a named config variant.
    Config {
        key: String,
        payload: serde_json::Value,
    },
}

impl FallbackFlagOverride {
    pub fn config(key: impl Into<String>, payload: serde_json::Value) -> Self {
        FallbackFlagOverride::Config {
            key: key.into(),
            payload,
        }
    }

    pub fn to_raw_flag(&self, key: &str) -> RawFlag {
        let flag = RawFlag::new(key, true);
        match self {
            FallbackFlagOverride::Enabled => flag,
            FallbackFlagOverride::Config { key, payload } => {
                flag.config(FlagConfig::new(key.clone()).payload(payload.clone()))
            }
        }
    }
}

pub type FallbackFlags = HashMap<String, FallbackFlagOverride>;

/// Which part of a flag was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckAction {
    CheckIsEnabled,
    CheckConfig,
}

/// Outcome of a flag read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CheckValue {
    Enabled(bool),
    Config {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

impl CheckValue {
    /// Stable textual form used in rate-limit keys.
    pub fn dedupe_repr(&self) -> String {
        match self {
            CheckValue::Enabled(b) => b.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

/// A consumer read of a flag, reported as telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckEvent {
    pub action: CheckAction,
    pub key: String,
    pub value: Option<CheckValue>,
    pub version: Option<i64>,
    pub rule_evaluation_results: Option<Vec<bool>>,
    pub missing_context_fields: Option<Vec<String>>,
}

impl CheckEvent {
    pub fn is_enabled(key: impl Into<String>, value: bool) -> Self {
        Self {
            action: CheckAction::CheckIsEnabled,
            key: key.into(),
            value: Some(CheckValue::Enabled(value)),
            version: None,
            rule_evaluation_results: None,
            missing_context_fields: None,
        }
    }

    pub fn version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }
}
