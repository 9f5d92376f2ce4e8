use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ErrorCode, ReflagError, Result};
use crate::types::{FallbackFlagOverride, FallbackFlags, RawFlags};

pub const DEFAULT_BASE_URL: &str = "https://front.reflag.com";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_STALE_TIME: Duration = Duration::ZERO;
pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_EVENTS_PER_MINUTE: usize = 1;

#[derive(Debug, Clone)]
pub struct FlagsOptions {
    pub publishable_key: String,
    pub base_url: String,
    /// Timeout for a single evaluation request.
    pub timeout: Duration,
    /// How long a cached flag set is served without revalidation.
    pub stale_time: Duration,
    /// Serve stale cache immediately and refresh in the background.
    pub stale_while_revalidate: bool,
    /// Hard TTL of a cached flag set.
    pub expire_time: Duration,
    /// Disables all network activity.
    pub offline: bool,
    /// Skip the initial fetch and start from these flags.
    pub bootstrapped_flags: Option<RawFlags>,
    /// Used only when both the network and the cache come up empty.
    pub fallback_flags: FallbackFlags,
    /// Check events allowed per key per minute.
    pub events_per_minute: usize,
    /// Directory for persistent file storage.
    pub storage_dir: Option<PathBuf>,
}

impl FlagsOptions {
    pub fn new(publishable_key: impl Into<String>) -> Self {
        Self {
            publishable_key: publishable_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            stale_time: DEFAULT_STALE_TIME,
            stale_while_revalidate: false,
            expire_time: DEFAULT_EXPIRE_TIME,
            offline: false,
            bootstrapped_flags: None,
            fallback_flags: FallbackFlags::new(),
            events_per_minute: DEFAULT_EVENTS_PER_MINUTE,
            storage_dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.publishable_key.is_empty() {
            return Err(ReflagError::config_error(
                ErrorCode::ConfigMissingRequired,
                "Publishable key is required",
            ));
        }

        if url::Url::parse(&self.base_url).is_err() {
            return Err(ReflagError::config_error(
                ErrorCode::ConfigInvalidUrl,
                format!("Invalid base URL: {}", self.base_url),
            ));
        }

        if self.stale_time > self.expire_time {
            return Err(ReflagError::config_error(
                ErrorCode::ConfigInvalidCacheTtl,
                "Stale time must not exceed expire time",
            ));
        }

        Ok(())
    }

    pub fn builder(publishable_key: impl Into<String>) -> FlagsOptionsBuilder {
        FlagsOptionsBuilder::new(publishable_key)
    }
}

pub struct FlagsOptionsBuilder {
    options: FlagsOptions,
}

impl FlagsOptionsBuilder {
    pub fn new(publishable_key: impl Into<String>) -> Self {
        Self {
            options: FlagsOptions::new(publishable_key),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.options.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.options.stale_time = stale_time;
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.options.stale_while_revalidate = enabled;
        self
    }

    pub fn expire_time(mut self, expire_time: Duration) -> Self {
        self.options.expire_time = expire_time;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.options.offline = offline;
        self
    }

    pub fn bootstrapped_flags(mut self, flags: RawFlags) -> Self {
        self.options.bootstrapped_flags = Some(flags);
        self
    }

    /// Fallback flags with explicit overrides.
    pub fn fallback_flags(mut self, flags: FallbackFlags) -> Self {
        self.options.fallback_flags = flags;
        self
    }

    /// Fallback flags given as a list of keys, each enabled without config.
    pub fn fallback_flag_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.fallback_flags = keys
            .into_iter()
            .map(|key| (key.into(), FallbackFlagOverride::Enabled))
            .collect();
        self
    }

    pub fn events_per_minute(mut self, count: usize) -> Self {
        self.options.events_per_minute = count;
        self
    }

    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.storage_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> FlagsOptions {
        self.options
    }
}
