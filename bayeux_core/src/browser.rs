//! Per-browser identity.
//!
//! Browsers share cookies across tabs, so a cookie-scoped identifier lets the
//! server recognize several tabs of the same browser competing for the
//! browser's limited pool of HTTP connections.

use core::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{context::BayeuxContext, timestamp::TimestampMillis};

/// Opaque identifier of a browser, carried in a cookie.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrowserId(String);

impl BrowserId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for a client connecting from `remote_port`.
    ///
    /// The layout is the port in hex, then a random value, the current time
    /// in milliseconds and the port again, each in base 36.
    #[must_use]
    pub fn generate(remote_port: u16, now: TimestampMillis) -> Self {
        let random: u64 = rand::random();
        let port = u64::from(remote_port);

        let mut id = format!("{port:x}");
        id.push_str(&base36(random));
        id.push_str(&base36(now.as_millis()));
        id.push_str(&base36(port));
        Self(id)
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BrowserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BrowserId({})", self.0)
    }
}

impl fmt::Display for BrowserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase base-36 rendering of `value`.
#[must_use]
pub fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return String::from("0");
    }

    let mut buf = Vec::with_capacity(13);
    while value > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let digit = (value % 36) as usize;
        buf.push(DIGITS.get(digit).copied().unwrap_or(b'0'));
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// A `Set-Cookie` to attach to the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    /// Cookie name.
    pub name: String,
    /// Cookie value.
    pub value: String,
    /// `Path` attribute.
    pub path: Option<String>,
    /// `Domain` attribute.
    pub domain: Option<String>,
    /// `Max-Age` attribute. `None` makes a session cookie.
    pub max_age: Option<Duration>,
}

impl Cookie {
    /// A session cookie with no attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
        }
    }

    /// Render as a `Set-Cookie` header value.
    #[must_use]
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(max_age) = self.max_age {
            out.push_str(&format!("; Max-Age={}", max_age.as_secs()));
        }
        out
    }
}

/// Resolves and assigns browser identities according to the cookie settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserIdentity {
    cookie_name: String,
    cookie_path: String,
    cookie_domain: Option<String>,
    cookie_max_age: Option<Duration>,
}

impl BrowserIdentity {
    /// Identity carried in `cookie_name`, scoped to `/`.
    #[must_use]
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            cookie_path: String::from("/"),
            cookie_domain: None,
            cookie_max_age: None,
        }
    }

    /// Set the cookie `Path`.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.cookie_path = path.into();
        self
    }

    /// Set the cookie `Domain`.
    #[must_use]
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.cookie_domain = domain;
        self
    }

    /// Set the cookie `Max-Age`.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    /// Name of the identity cookie.
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Read the browser id from the request, if the cookie is present and non-empty.
    #[must_use]
    pub fn resolve(&self, ctx: &dyn BayeuxContext) -> Option<BrowserId> {
        ctx.cookie(&self.cookie_name)
            .filter(|value| !value.is_empty())
            .map(BrowserId::new)
    }

    /// Mint a new browser id and queue the cookie that carries it.
    pub fn assign(&self, ctx: &dyn BayeuxContext, cookies: &mut Vec<Cookie>) -> BrowserId {
        let port = ctx.remote_address().map_or(0, |addr| addr.port());
        let id = BrowserId::generate(port, TimestampMillis::now());

        cookies.push(Cookie {
            name: self.cookie_name.clone(),
            value: id.as_str().to_owned(),
            path: Some(self.cookie_path.clone()),
            domain: self.cookie_domain.clone(),
            max_age: self.cookie_max_age,
        });

        tracing::debug!(browser = %id, "assigned browser id");
        id
    }
}

impl Default for BrowserIdentity {
    fn default() -> Self {
        Self::new(crate::DEFAULT_BROWSER_COOKIE)
    }
}
