mod cache;
mod config;
mod emitter;
mod rate_limiter;

pub use cache::{
    parse_api_flags_response, validate_cache_data, validate_flags_response, CacheData,
    CacheEntry, CacheResult, FlagCache, FlagsResponse, DEFAULT_CACHE_STORAGE_KEY,
};
pub use config::{
    FlagsOptions, FlagsOptionsBuilder, DEFAULT_BASE_URL, DEFAULT_EVENTS_PER_MINUTE,
    DEFAULT_EXPIRE_TIME, DEFAULT_STALE_TIME, DEFAULT_TIMEOUT,
};
pub use emitter::{Subject, Subscription};
pub use rate_limiter::{RateLimiter, RefreshLimiter, REFRESH_LIMIT_COUNT, REFRESH_LIMIT_WINDOW};
