//! Reflag Rust SDK
//!
//! Client-side feature flag resolution: flags are fetched for an evaluation
//! context, cached with stale/expire TTLs, decorated with local overrides and
//! pushed to listeners when they change.
//!
//! # Quick Start
//!
//! ```no_run
//! use reflag::{EntityContext, EvaluationContext, FlagsClient, FlagsOptions};
//!
//! #[tokio::main]
//! async fn main() -> reflag::Result<()> {
//!     let options = FlagsOptions::builder("pub_your_key")
//!         .stale_while_revalidate(true)
//!         .fallback_flag_keys(["huddles"])
//!         .build();
//!
//!     let context = EvaluationContext::builder()
//!         .user(EntityContext::with_id("user-123").name("Ada"))
//!         .company(EntityContext::with_id("acme"))
//!         .build();
//!
//!     let client = FlagsClient::builder(options).context(context).build()?;
//!     client.on_updated(|flags| println!("{} flags", flags.len()));
//!     client.initialize().await;
//!
//!     if let Some(flag) = client.flag("huddles") {
//!         let check = flag.check_is_enabled_event();
//!         if flag.is_enabled() {
//!             println!("huddles on");
//!         }
//!         client.send_check_event(check, || {}).await;
//!     }
//!
//!     client.stop();
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod core;
pub mod error;
pub mod http;
pub mod overrides;
pub mod storage;
pub mod types;
pub mod utils;
mod client;
mod registry;

pub use context::{AttributeValue, EntityContext, EvaluationContext, EvaluationContextBuilder};

pub use types::{
    CheckAction, CheckEvent, CheckValue, FallbackFlagOverride, FallbackFlags, FlagConfig,
    FlagOverrides, MergedFlag, MergedFlags, RawFlag, RawFlags,
};

pub use error::{ErrorCode, ReflagError, Result};

pub use core::{
    CacheData, CacheEntry, CacheResult, FlagCache, FlagsOptions, FlagsOptionsBuilder,
    RateLimiter, RefreshLimiter, Subject, Subscription,
};

pub use overrides::{
    CookieOverridesProvider, MemoryCookieJar, OverridesProvider, StorageOverridesProvider,
};

pub use storage::{FileStorage, MemoryStorage, StorageAdapter, StorageKind};

pub use utils::{Clock, ManualClock, SystemClock};

pub use client::{ClientPhase, FlagsClient, FlagsClientBuilder};
pub use registry::ClientRegistry;
