use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{parse_overrides, OverridesProvider, DEFAULT_OVERRIDES_KEY};
use crate::error::Result;
use crate::types::FlagOverrides;

/// Lifetime of the overrides cookie.
pub const DEFAULT_COOKIE_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieAttributes {
    pub max_age: Duration,
    pub same_site: SameSite,
    pub path: String,
    pub secure: bool,
}

impl Default for CookieAttributes {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_COOKIE_MAX_AGE,
            same_site: SameSite::Strict,
            path: "/".to_string(),
            secure: false,
        }
    }
}

impl CookieAttributes {
    /// Render a `Set-Cookie` header value. `value` must already be encoded.
    pub fn to_header(&self, name: &str, value: &str) -> String {
        let mut header = format!(
            "{}={}; Path={}; Max-Age={}; SameSite={}",
            name,
            value,
            self.path,
            self.max_age.as_secs(),
            self.same_site
        );
        if self.secure {
            header.push_str("; Secure");
        }
        header
    }
}

/// Where cookies are read from and written to.
///
/// Values passed through the jar are already URL-encoded.
pub trait CookieJar: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    fn set(&self, name: &str, value: &str, attributes: &CookieAttributes) -> Result<()>;
}

/// In-process cookie jar that records the `Set-Cookie` headers it would send.
#[derive(Debug, Default)]
pub struct MemoryCookieJar {
    values: RwLock<HashMap<String, String>>,
    set_cookie_headers: RwLock<Vec<String>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the jar from a request `Cookie` header (`a=1; b=2`).
    pub fn from_cookie_header(header: &str) -> Self {
        let jar = Self::new();
        {
            let mut values = jar.values.write();
            for pair in header.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    values.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
        jar
    }

    /// Drain the headers produced by writes since the last call.
    pub fn take_set_cookie_headers(&self) -> Vec<String> {
        std::mem::take(&mut *self.set_cookie_headers.write())
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    fn set(&self, name: &str, value: &str, attributes: &CookieAttributes) -> Result<()> {
        self.values.write().insert(name.to_string(), value.to_string());
        self.set_cookie_headers
            .write()
            .push(attributes.to_header(name, value));
        Ok(())
    }
}

fn encode_cookie_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn decode_cookie_value(value: &str) -> String {
    // byte_serialize output never contains '&' or '='
    url::form_urlencoded::parse(value.as_bytes())
        .next()
        .map(|(decoded, _)| decoded.into_owned())
        .unwrap_or_default()
}

/// Keeps overrides in a cookie (7 days, `SameSite=Strict` by default).
pub struct CookieOverridesProvider {
    jar: Arc<dyn CookieJar>,
    cookie_name: String,
    attributes: CookieAttributes,
}

impl CookieOverridesProvider {
    pub fn new(jar: Arc<dyn CookieJar>) -> Self {
        Self {
            jar,
            cookie_name: DEFAULT_OVERRIDES_KEY.to_string(),
            attributes: CookieAttributes::default(),
        }
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }

    pub fn attributes(mut self, attributes: CookieAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

#[async_trait]
impl OverridesProvider for CookieOverridesProvider {
    async fn set_overrides(&self, overrides: &FlagOverrides) {
        let serialized = match serde_json::to_string(overrides) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Serializing flag overrides failed, overrides won't persist: {}", e);
                return;
            }
        };

        if let Err(e) = self.jar.set(
            &self.cookie_name,
            &encode_cookie_value(&serialized),
            &self.attributes,
        ) {
            tracing::warn!(
                "Storing flag overrides in cookies failed, overrides won't persist: {}",
                e
            );
        }
    }

    async fn get_overrides(&self) -> Result<FlagOverrides> {
        match self.jar.get(&self.cookie_name) {
            Some(raw) if !raw.is_empty() => parse_overrides(&decode_cookie_value(&raw)),
            _ => Ok(FlagOverrides::new()),
        }
    }
}
