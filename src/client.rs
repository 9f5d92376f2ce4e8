use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::context::EvaluationContext;
use crate::core::{
    validate_flags_response, FlagCache, FlagsOptions, RateLimiter, RefreshLimiter, Subject,
    Subscription, REFRESH_LIMIT_COUNT, REFRESH_LIMIT_WINDOW,
};
use crate::error::{ReflagError, Result};
use crate::http::HttpClient;
use crate::overrides::{OverridesProvider, StorageOverridesProvider};
use crate::storage::{resolve_storage_adapter, StorageAdapter};
use crate::types::{
    CheckAction, CheckEvent, CheckValue, FlagOverrides, MergedFlag, MergedFlags, RawFlags,
};
use crate::utils::{Clock, SystemClock};

const FLAGS_EVALUATED_PATH: &str = "/features/evaluated";
const CHECK_EVENTS_PATH: &str = "/features/events";

/// Lifecycle of a [`FlagsClient`]. `stop()` is orthogonal, see
/// [`FlagsClient::is_stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Idle,
    Initializing,
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notify {
    Never,
    IfChanged,
    Always,
}

struct State {
    phase: ClientPhase,
    context: EvaluationContext,
    fetched_flags: RawFlags,
    flag_overrides: FlagOverrides,
    flags: MergedFlags,
}

struct Inner {
    options: FlagsOptions,
    bootstrapped: bool,
    http: HttpClient,
    cache: FlagCache,
    rate_limiter: RateLimiter,
    refresh_limiter: RefreshLimiter,
    overrides: Arc<dyn OverridesProvider>,
    state: RwLock<State>,
    updated: Subject<MergedFlags>,
    scope: CancellationToken,
    persist_lock: tokio::sync::Mutex<()>,
}

/// Cache key and query of one fetch, taken from the context at a single
/// point in time.
struct FlagsRequest {
    cache_key: String,
    params: Vec<(String, String)>,
}

/// Puts the client back to `Idle` if `initialize` is dropped midway.
struct InitializeGuard<'a> {
    state: &'a RwLock<State>,
    done: bool,
}

impl Drop for InitializeGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.write().phase = ClientPhase::Idle;
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckEventPayload<'a> {
    action: CheckAction,
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    targeting_version: Option<i64>,
    eval_context: EvaluationContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_result: Option<&'a CheckValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_rule_results: Option<&'a [bool]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    eval_missing_fields: Option<&'a [String]>,
}

/// Fetches, caches and merges feature flags for one evaluation context.
///
/// Cloning is cheap; clones share state, listeners and the stop signal.
#[derive(Clone)]
pub struct FlagsClient {
    inner: Arc<Inner>,
}

impl FlagsClient {
    pub fn builder(options: FlagsOptions) -> FlagsClientBuilder {
        FlagsClientBuilder::new(options)
    }

    pub fn new(options: FlagsOptions) -> Result<Self> {
        FlagsClientBuilder::new(options).build()
    }

    pub fn options(&self) -> &FlagsOptions {
        &self.inner.options
    }

    pub fn phase(&self) -> ClientPhase {
        self.inner.state.read().phase
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.scope.is_cancelled()
    }

    pub fn context(&self) -> EvaluationContext {
        self.inner.state.read().context.clone()
    }

    /// Fingerprint of the current context, used as the cache key.
    pub fn cache_key(&self) -> String {
        self.inner
            .state
            .read()
            .context
            .fingerprint(&self.inner.options.publishable_key)
    }

    /// Merged flags, as consumers should see them.
    pub fn get_flags(&self) -> MergedFlags {
        self.inner.state.read().flags.clone()
    }

    /// Flags as last fetched, without overrides.
    pub fn get_fetched_flags(&self) -> RawFlags {
        self.inner.state.read().fetched_flags.clone()
    }

    pub fn flag(&self, key: &str) -> Option<MergedFlag> {
        self.inner.state.read().flags.get(key).cloned()
    }

    /// Load persisted overrides and, unless bootstrapped, fetch flags.
    ///
    /// A second call logs a warning and does nothing.
    pub async fn initialize(&self) {
        {
            let mut state = self.inner.state.write();
            if state.phase != ClientPhase::Idle {
                tracing::warn!("flags client already initialized");
                return;
            }
            state.phase = ClientPhase::Initializing;
        }
        let mut guard = InitializeGuard {
            state: &self.inner.state,
            done: false,
        };

        match self.inner.overrides.get_overrides().await {
            Ok(persisted) if !persisted.is_empty() => {
                let mut state = self.inner.state.write();
                for (key, value) in persisted {
                    // overrides set before initialization win
                    state.flag_overrides.entry(key).or_insert(value);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Getting flag overrides failed: {}", e),
        }

        if !self.inner.bootstrapped {
            let flags = self.maybe_fetch_flags().await.unwrap_or_default();
            self.set_fetched_flags(flags, true);
        }

        self.update_flags(Notify::IfChanged);
        self.inner.state.write().phase = ClientPhase::Initialized;
        guard.done = true;
    }

    /// Replace the evaluation context and fetch flags for it.
    pub async fn set_context(&self, context: EvaluationContext) {
        self.inner.state.write().context = context;
        let flags = self.maybe_fetch_flags().await.unwrap_or_default();
        self.set_fetched_flags(flags, true);
    }

    /// Install freshly fetched flags and recompute the merged view.
    pub fn set_fetched_flags(&self, fetched_flags: RawFlags, trigger_event: bool) {
        self.warn_missing_context_fields(&fetched_flags);
        self.inner.state.write().fetched_flags = fetched_flags;
        self.update_flags(if trigger_event {
            Notify::IfChanged
        } else {
            Notify::Never
        });
    }

    /// Set (`Some`) or clear (`None`) the local override for `key`.
    ///
    /// Listeners are always notified.
    pub fn set_flag_override(&self, key: &str, is_enabled: Option<bool>) {
        {
            let mut state = self.inner.state.write();
            match is_enabled {
                Some(value) => {
                    state.flag_overrides.insert(key.to_string(), value);
                }
                None => {
                    state.flag_overrides.remove(key);
                }
            }
        }

        self.persist_overrides();
        self.update_flags(Notify::Always);
    }

    /// Like [`set_flag_override`](Self::set_flag_override) for untyped input.
    /// Only booleans and `null` are accepted.
    pub fn set_flag_override_json(&self, key: &str, is_enabled: &serde_json::Value) -> Result<()> {
        let is_enabled = match is_enabled {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Null => None,
            _ => {
                return Err(ReflagError::invalid_argument(
                    "setFlagOverride: isEnabled must be boolean or null",
                ))
            }
        };
        self.set_flag_override(key, is_enabled);
        Ok(())
    }

    pub fn get_flag_override(&self, key: &str) -> Option<bool> {
        self.inner.state.read().flag_overrides.get(key).copied()
    }

    /// Call `callback` whenever the merged flags change. The listener is
    /// removed when the client is stopped.
    pub fn on_updated<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MergedFlags) + Send + Sync + 'static,
    {
        self.inner.updated.subscribe(Some(&self.inner.scope), callback)
    }

    /// Detach all listeners and abandon in-flight fetches. Idempotent.
    pub fn stop(&self) {
        if !self.inner.scope.is_cancelled() {
            tracing::debug!("Stopping flags client");
            self.inner.scope.cancel();
        }
    }

    /// Report a flag read.
    ///
    /// Identical checks for the same context are sent at most
    /// `events_per_minute` times a minute. `on_sent` runs after the request
    /// completes, unless the check was rate limited. Returns the checked
    /// value, or `None` when offline.
    pub async fn send_check_event<F>(&self, event: CheckEvent, on_sent: F) -> Option<CheckValue>
    where
        F: FnOnce(),
    {
        if self.inner.options.offline {
            return None;
        }

        let rate_limit_key = format!(
            "check-event:{}:{}:{}:{}",
            self.cache_key(),
            event.key,
            event.version.map(|v| v.to_string()).unwrap_or_default(),
            event
                .value
                .as_ref()
                .map(CheckValue::dedupe_repr)
                .unwrap_or_default()
        );

        let payload = CheckEventPayload {
            action: event.action,
            key: &event.key,
            targeting_version: event.version,
            eval_context: self.context(),
            eval_result: event.value.as_ref(),
            eval_rule_results: event.rule_evaluation_results.as_deref(),
            eval_missing_fields: event.missing_context_fields.as_deref(),
        };

        self.inner
            .rate_limiter
            .rate_limited(&rate_limit_key, || async move {
                match self.inner.http.post(CHECK_EVENTS_PATH, &payload).await {
                    Ok(()) => tracing::debug!("Sent flag check event for {}", payload.key),
                    Err(e) if e.is_network_error() => {
                        tracing::warn!("Failed to send flag check event: {}", e)
                    }
                    Err(e) => tracing::error!("Error building flag check event: {}", e),
                }
                on_sent();
            })
            .await;

        event.value
    }

    /// Fetch flags for the current context. Failures are logged and
    /// yield `None`.
    pub async fn fetch_flags(&self) -> Option<RawFlags> {
        let request = self.flags_request();
        self.fetch_flags_for(&request).await
    }

    fn flags_request(&self) -> FlagsRequest {
        let state = self.inner.state.read();
        let publishable_key = &self.inner.options.publishable_key;
        FlagsRequest {
            cache_key: state.context.fingerprint(publishable_key),
            params: state.context.query_params(publishable_key),
        }
    }

    async fn fetch_flags_for(&self, request: &FlagsRequest) -> Option<RawFlags> {
        if self.inner.options.offline {
            return None;
        }

        let response = self.inner.http.get(
            FLAGS_EVALUATED_PATH,
            &request.params,
            self.inner.options.timeout,
        );

        let body = tokio::select! {
            _ = self.inner.scope.cancelled() => {
                tracing::debug!("Flags client stopped, abandoning fetch");
                return None;
            }
            result = response => match result {
                Ok(body) => body,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("Error fetching flags: {}", e);
                    return None;
                }
                Err(e) => {
                    tracing::error!("Error fetching flags: {}", e);
                    return None;
                }
            },
        };

        match validate_flags_response(&body) {
            Some(response) if response.success => Some(response.flags),
            _ => {
                tracing::error!("Error fetching flags: unable to validate response");
                None
            }
        }
    }

    /// Fetch bypassing the cache read. At most 10 calls per 5 minutes
    /// reach the network.
    pub async fn refresh_flags(&self) -> Option<RawFlags> {
        if self.inner.options.offline {
            return None;
        }

        if !self.inner.refresh_limiter.try_acquire() {
            tracing::warn!("Refresh rate limit exceeded");
            return None;
        }

        let request = self.flags_request();
        let flags = self.fetch_flags_for(&request).await?;
        self.store_in_cache(&request.cache_key, &flags).await;
        self.set_fetched_flags(flags.clone(), true);
        Some(flags)
    }

    /// Resolve flags for the current context: fresh cache, then stale cache
    /// with background revalidation, then the network, then stale cache,
    /// then fallback flags.
    pub async fn maybe_fetch_flags(&self) -> Option<RawFlags> {
        if self.inner.options.offline {
            return None;
        }

        let request = self.flags_request();
        let cached = self.inner.cache.get(&request.cache_key).await;

        if let Some(ref cached) = cached {
            if !cached.stale {
                tracing::debug!("Serving fresh cached flags");
                return Some(cached.flags.clone());
            }

            if self.inner.options.stale_while_revalidate {
                self.revalidate_in_background(request);
                return Some(cached.flags.clone());
            }
        }

        if let Some(fetched) = self.fetch_flags_for(&request).await {
            self.store_in_cache(&request.cache_key, &fetched).await;
            return Some(fetched);
        }

        if let Some(cached) = cached {
            tracing::debug!("Fetch failed, serving stale cached flags");
            return Some(cached.flags);
        }

        Some(self.fallback_flags())
    }

    fn revalidate_in_background(&self, request: FlagsRequest) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, skipping background flag refresh");
            return;
        };

        let client = self.clone();
        handle.spawn(async move {
            if let Some(flags) = client.fetch_flags_for(&request).await {
                client.store_in_cache(&request.cache_key, &flags).await;
                client.set_fetched_flags(flags, true);
            }
        });
    }

    async fn store_in_cache(&self, cache_key: &str, flags: &RawFlags) {
        if let Err(e) = self.inner.cache.set(cache_key, flags.clone()).await {
            tracing::warn!("Writing flag cache failed: {}", e);
        }
    }

    fn fallback_flags(&self) -> RawFlags {
        self.inner
            .options
            .fallback_flags
            .iter()
            .map(|(key, fallback)| (key.clone(), fallback.to_raw_flag(key)))
            .collect()
    }

    fn update_flags(&self, notify: Notify) {
        let changed = {
            let mut state = self.inner.state.write();
            let merged = merge_flags(&state.fetched_flags, &state.flag_overrides);
            if merged == state.flags {
                None
            } else {
                state.flags = merged.clone();
                Some(merged)
            }
        };

        // publish outside the lock so listeners can read the client
        match (notify, changed) {
            (Notify::Never, _) | (Notify::IfChanged, None) => {}
            (Notify::IfChanged, Some(flags)) => {
                self.inner.updated.publish(&flags);
            }
            (Notify::Always, _) => {
                let flags = self.get_flags();
                self.inner.updated.publish(&flags);
            }
        }
    }

    fn persist_overrides(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime, flag overrides won't persist");
            return;
        };

        let inner = self.inner.clone();
        handle.spawn(async move {
            // latest overrides are read under the lock so the last write wins
            let _guard = inner.persist_lock.lock().await;
            let overrides = inner.state.read().flag_overrides.clone();
            inner.overrides.set_overrides(&overrides).await;
        });
    }

    fn warn_missing_context_fields(&self, flags: &RawFlags) {
        let mut report: BTreeMap<String, &[String]> = BTreeMap::new();
        for flag in flags.values() {
            if let Some(ref fields) = flag.missing_context_fields {
                if !fields.is_empty() {
                    report.insert(flag.key.clone(), fields);
                }
            }
            if let Some(fields) = flag
                .config
                .as_ref()
                .and_then(|c| c.missing_context_fields.as_ref())
            {
                if !fields.is_empty() {
                    report.insert(format!("{}.config", flag.key), fields);
                }
            }
        }

        if report.is_empty() {
            return;
        }

        let key = format!("flag-missing-context-fields:{}", self.cache_key());
        if self.inner.rate_limiter.try_acquire(&key) {
            tracing::warn!(
                missing = ?report,
                "flag targeting rules might not be correctly evaluated due to missing context fields"
            );
        }
    }
}

impl fmt::Debug for FlagsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlagsClient")
            .field("phase", &self.phase())
            .field("stopped", &self.is_stopped())
            .field("offline", &self.inner.options.offline)
            .finish_non_exhaustive()
    }
}

/// Decorate every fetched flag with its override. Overrides for unknown
/// keys are ignored.
fn merge_flags(fetched: &RawFlags, overrides: &FlagOverrides) -> MergedFlags {
    fetched
        .iter()
        .map(|(key, flag)| {
            (
                key.clone(),
                MergedFlag::new(flag.clone(), overrides.get(key).copied()),
            )
        })
        .collect()
}

pub struct FlagsClientBuilder {
    options: FlagsOptions,
    context: EvaluationContext,
    storage: Option<Arc<dyn StorageAdapter>>,
    cache: Option<FlagCache>,
    rate_limiter: Option<RateLimiter>,
    overrides: Option<Arc<dyn OverridesProvider>>,
    clock: Option<Arc<dyn Clock>>,
}

impl FlagsClientBuilder {
    pub fn new(options: FlagsOptions) -> Self {
        Self {
            options,
            context: EvaluationContext::new(),
            storage: None,
            cache: None,
            rate_limiter: None,
            overrides: None,
            clock: None,
        }
    }

    pub fn context(mut self, context: EvaluationContext) -> Self {
        self.context = context;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn cache(mut self, cache: FlagCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    pub fn overrides(mut self, overrides: Arc<dyn OverridesProvider>) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<FlagsClient> {
        self.options.validate()?;

        let options = self.options;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let http = HttpClient::new(options.publishable_key.clone(), options.base_url.clone())?;

        let resolution = resolve_storage_adapter(self.storage, options.storage_dir.as_deref());
        tracing::debug!("Storage adapter: {}", resolution.kind);
        let storage = resolution.adapter;

        let cache = self.cache.unwrap_or_else(|| {
            FlagCache::new(storage.clone(), options.stale_time, options.expire_time)
                .with_clock(clock.clone())
        });
        let rate_limiter = self.rate_limiter.unwrap_or_else(|| {
            RateLimiter::per_minute(options.events_per_minute).with_clock(clock.clone())
        });
        let overrides = self
            .overrides
            .unwrap_or_else(|| Arc::new(StorageOverridesProvider::new(Some(storage))));
        let refresh_limiter = RefreshLimiter::new(REFRESH_LIMIT_COUNT, REFRESH_LIMIT_WINDOW, clock);

        let bootstrapped_flags = options.bootstrapped_flags.clone();
        let client = FlagsClient {
            inner: Arc::new(Inner {
                bootstrapped: bootstrapped_flags.is_some(),
                options,
                http,
                cache,
                rate_limiter,
                refresh_limiter,
                overrides,
                state: RwLock::new(State {
                    phase: ClientPhase::Idle,
                    context: self.context,
                    fetched_flags: RawFlags::new(),
                    flag_overrides: FlagOverrides::new(),
                    flags: MergedFlags::new(),
                }),
                updated: Subject::new(),
                scope: CancellationToken::new(),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        };

        if let Some(flags) = bootstrapped_flags {
            client.set_fetched_flags(flags, false);
        }

        Ok(client)
    }
}
