//! Server transport configuration.
//!
//! [`TransportOptions`] is read once when a transport is built. It can be
//! deserialized (durations in milliseconds), assembled with builder setters,
//! or read from a flat string map with [`TransportOptions::from_options`].

use core::{str::FromStr, time::Duration};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_BROWSER_COOKIE, admission::SessionLimit, browser::BrowserIdentity, error::ConfigError,
};

/// Option keys understood by [`TransportOptions::from_options`].
pub mod keys {
    /// Name of the browser identity cookie.
    pub const BROWSER_ID: &str = "browserId";
    /// `Path` of the browser cookie.
    pub const BROWSER_COOKIE_PATH: &str = "browserCookiePath";
    /// `Domain` of the browser cookie.
    pub const BROWSER_COOKIE_DOMAIN: &str = "browserCookieDomain";
    /// `Max-Age` of the browser cookie, in seconds. Negative means session cookie.
    pub const BROWSER_COOKIE_MAX_AGE: &str = "browserCookieMaxAge";
    /// Suspended connections allowed per browser; negative is unlimited.
    pub const MAX_SESSIONS_PER_BROWSER: &str = "maxSessionsPerBrowser";
    /// Reconnect interval advised to rejected clients, in milliseconds.
    pub const MULTI_SESSION_INTERVAL: &str = "multiSessionInterval";
    /// Whether to batch all replies of a request.
    pub const AUTO_BATCH: &str = "autoBatch";
    /// Whether clients without a browser cookie may always suspend.
    pub const ALLOW_MULTI_SESSIONS_NO_BROWSER: &str = "allowMultiSessionsNoBrowser";
    /// Long-poll hold time, in milliseconds.
    pub const TIMEOUT: &str = "timeout";
    /// Advised pause between polls, in milliseconds.
    pub const INTERVAL: &str = "interval";
    /// Longest expected client pause between polls, in milliseconds.
    pub const MAX_INTERVAL: &str = "maxInterval";
    /// Whether to log raw request content.
    pub const JSON_DEBUG: &str = "jsonDebug";
}

/// Configuration shared by the HTTP long-poll transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportOptions {
    /// Name of the browser identity cookie.
    pub browser_cookie_name: String,

    /// `Path` attribute of the browser cookie.
    pub browser_cookie_path: String,

    /// `Domain` attribute of the browser cookie.
    pub browser_cookie_domain: Option<String>,

    /// `Max-Age` of the browser cookie; `None` makes a session cookie.
    #[serde(with = "opt_millis")]
    pub browser_cookie_max_age: Option<Duration>,

    /// Suspended connections allowed per browser.
    pub max_sessions_per_browser: SessionLimit,

    /// Reconnect interval advised to rejected clients. Zero tells them not to reconnect.
    #[serde(with = "millis")]
    pub multi_session_interval: Duration,

    /// Batch all replies produced by one request.
    pub auto_batch: bool,

    /// Let clients without a browser cookie suspend regardless of the limit.
    pub allow_multi_sessions_no_browser: bool,

    /// How long a connect is held waiting for messages.
    #[serde(with = "millis")]
    pub timeout: Duration,

    /// Advised pause between polls.
    #[serde(with = "millis")]
    pub interval: Duration,

    /// Longest expected client pause between polls.
    #[serde(with = "millis")]
    pub max_interval: Duration,

    /// Log raw request content at debug level.
    pub json_debug: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            browser_cookie_name: String::from(DEFAULT_BROWSER_COOKIE),
            browser_cookie_path: String::from("/"),
            browser_cookie_domain: None,
            browser_cookie_max_age: None,
            max_sessions_per_browser: SessionLimit::default(),
            multi_session_interval: Duration::from_millis(2_000),
            auto_batch: true,
            allow_multi_sessions_no_browser: false,
            timeout: Duration::from_millis(30_000),
            interval: Duration::ZERO,
            max_interval: Duration::from_millis(10_000),
            json_debug: false,
        }
    }
}

impl TransportOptions {
    /// Set the browser cookie name.
    #[must_use]
    pub fn with_browser_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.browser_cookie_name = name.into();
        self
    }

    /// Set the per-browser limit.
    #[must_use]
    pub const fn with_max_sessions_per_browser(mut self, limit: SessionLimit) -> Self {
        self.max_sessions_per_browser = limit;
        self
    }

    /// Set the interval advised to rejected clients.
    #[must_use]
    pub const fn with_multi_session_interval(mut self, interval: Duration) -> Self {
        self.multi_session_interval = interval;
        self
    }

    /// Enable or disable auto-batching.
    #[must_use]
    pub const fn with_auto_batch(mut self, auto_batch: bool) -> Self {
        self.auto_batch = auto_batch;
        self
    }

    /// Allow clients without a browser cookie to suspend.
    #[must_use]
    pub const fn with_allow_multi_sessions_no_browser(mut self, allow: bool) -> Self {
        self.allow_multi_sessions_no_browser = allow;
        self
    }

    /// Set the long-poll hold time.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the advised poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the longest expected client pause.
    #[must_use]
    pub const fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }

    /// Enable raw content logging.
    #[must_use]
    pub const fn with_json_debug(mut self, json_debug: bool) -> Self {
        self.json_debug = json_debug;
        self
    }

    /// The cookie settings as a [`BrowserIdentity`].
    #[must_use]
    pub fn browser_identity(&self) -> BrowserIdentity {
        BrowserIdentity::new(self.browser_cookie_name.clone())
            .with_path(self.browser_cookie_path.clone())
            .with_domain(self.browser_cookie_domain.clone())
            .with_max_age(self.browser_cookie_max_age)
    }

    /// Read options from a flat string map.
    ///
    /// Keys may be qualified with a dotted `prefix`; the most specific match
    /// wins. With prefix `long-polling.jsonp`, the timeout is read from
    /// `long-polling.jsonp.timeout`, then `long-polling.timeout`, then
    /// `timeout`. Absent keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOption`] if a value does not parse.
    pub fn from_options(options: &HashMap<String, String>, prefix: &str) -> Result<Self, ConfigError> {
        let lookup = OptionLookup::new(options, prefix);
        let mut out = Self::default();

        if let Some((_, name)) = lookup.get(keys::BROWSER_ID) {
            out.browser_cookie_name = name.to_owned();
        }
        if let Some((_, path)) = lookup.get(keys::BROWSER_COOKIE_PATH) {
            out.browser_cookie_path = path.to_owned();
        }
        if let Some((_, domain)) = lookup.get(keys::BROWSER_COOKIE_DOMAIN) {
            out.browser_cookie_domain = Some(domain.to_owned()).filter(|d| !d.is_empty());
        }
        if let Some(secs) = lookup.parse::<i64>(keys::BROWSER_COOKIE_MAX_AGE)? {
            out.browser_cookie_max_age = u64::try_from(secs).ok().map(Duration::from_secs);
        }
        if let Some(limit) = lookup.parse::<i64>(keys::MAX_SESSIONS_PER_BROWSER)? {
            out.max_sessions_per_browser = SessionLimit::from(limit);
        }
        if let Some(ms) = lookup.millis(keys::MULTI_SESSION_INTERVAL)? {
            out.multi_session_interval = ms;
        }
        if let Some(flag) = lookup.parse::<bool>(keys::AUTO_BATCH)? {
            out.auto_batch = flag;
        }
        if let Some(flag) = lookup.parse::<bool>(keys::ALLOW_MULTI_SESSIONS_NO_BROWSER)? {
            out.allow_multi_sessions_no_browser = flag;
        }
        if let Some(ms) = lookup.millis(keys::TIMEOUT)? {
            out.timeout = ms;
        }
        if let Some(ms) = lookup.millis(keys::INTERVAL)? {
            out.interval = ms;
        }
        if let Some(ms) = lookup.millis(keys::MAX_INTERVAL)? {
            out.max_interval = ms;
        }
        if let Some(flag) = lookup.parse::<bool>(keys::JSON_DEBUG)? {
            out.json_debug = flag;
        }

        Ok(out)
    }
}

/// Prefix-aware reader over a flat option map.
pub(crate) struct OptionLookup<'a> {
    options: &'a HashMap<String, String>,
    prefix: &'a str,
}

impl<'a> OptionLookup<'a> {
    pub(crate) const fn new(options: &'a HashMap<String, String>, prefix: &'a str) -> Self {
        Self { options, prefix }
    }

    /// Most specific `(qualified key, value)` for `key`.
    pub(crate) fn get(&self, key: &str) -> Option<(String, &'a str)> {
        let mut scope = self.prefix;
        loop {
            let qualified = if scope.is_empty() {
                key.to_owned()
            } else {
                format!("{scope}.{key}")
            };
            if let Some(value) = self.options.get(&qualified) {
                return Some((qualified, value.trim()));
            }
            if scope.is_empty() {
                return None;
            }
            scope = scope.rsplit_once('.').map_or("", |(parent, _)| parent);
        }
    }

    pub(crate) fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|(qualified, value)| {
                value.parse::<T>().map_err(|_| ConfigError::InvalidOption {
                    key: qualified,
                    value: value.to_owned(),
                })
            })
            .transpose()
    }

    pub(crate) fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

mod millis {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation, clippy::ref_option)]
    pub(super) fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
