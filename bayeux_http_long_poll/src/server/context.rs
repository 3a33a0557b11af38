//! [`BayeuxContext`] over an axum request.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{extract::ConnectInfo, http::request::Parts};
use bayeux_core::{
    context::{BayeuxContext, Principal, RequestAttributes, ServerContext, find_cookie},
    error::SessionAttributeError,
};
use serde_json::Value;

/// The address the server is listening on, attached as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddr(pub SocketAddr);

/// An HTTP session shared across requests of one user agent.
///
/// Upstream middleware attaches it as a request extension; the transports
/// only read and write attributes through [`BayeuxContext`].
#[derive(Debug, Clone)]
pub struct HttpSession {
    inner: Arc<HttpSessionInner>,
}

#[derive(Debug)]
struct HttpSessionInner {
    id: String,
    attributes: Mutex<HashMap<String, Value>>,
    invalidated: AtomicBool,
}

impl HttpSession {
    /// An empty session.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HttpSessionInner {
                id: id.into(),
                attributes: Mutex::new(HashMap::new()),
                invalidated: AtomicBool::new(false),
            }),
        }
    }

    /// Session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Read an attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if self.is_invalidated() {
            return None;
        }
        self.inner.attributes.lock().ok()?.get(name).cloned()
    }

    /// Write an attribute.
    pub fn set_attribute(&self, name: impl Into<String>, value: Value) {
        if let Ok(mut attributes) = self.inner.attributes.lock() {
            attributes.insert(name.into(), value);
        }
    }

    /// Drop every attribute and mark the session invalid.
    pub fn invalidate(&self) {
        self.inner.invalidated.store(true, Ordering::Release);
        if let Ok(mut attributes) = self.inner.attributes.lock() {
            attributes.clear();
        }
    }

    /// Whether [`invalidate`](Self::invalidate) was called.
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        self.inner.invalidated.load(Ordering::Acquire)
    }
}

/// Request context backed by the request head.
#[derive(Debug)]
pub struct HttpContext<'a> {
    parts: &'a Parts,
    method: String,
    query: Vec<(String, String)>,
}

impl<'a> HttpContext<'a> {
    /// Borrow the request head.
    #[must_use]
    pub fn new(parts: &'a Parts) -> Self {
        let query = parts
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        Self {
            parts,
            method: parts.method.as_str().to_ascii_uppercase(),
            query,
        }
    }

    fn server_context(&self) -> Option<&'a ServerContext> {
        self.parts
            .extensions
            .get::<Arc<ServerContext>>()
            .map(Arc::as_ref)
    }

    fn session(&self) -> Option<&'a HttpSession> {
        self.parts
            .extensions
            .get::<HttpSession>()
            .filter(|s| !s.is_invalidated())
    }
}

impl BayeuxContext for HttpContext<'_> {
    fn method(&self) -> &str {
        &self.method
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr)
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.parts.extensions.get::<LocalAddr>().map(|LocalAddr(addr)| *addr)
    }

    fn user_principal(&self) -> Option<&Principal> {
        self.parts.extensions.get::<Principal>()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned)
    }

    fn header_values(&self, name: &str) -> Vec<String> {
        self.parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(ToOwned::to_owned)
            .collect()
    }

    fn parameter(&self, name: &str) -> Option<String> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    fn parameter_values(&self, name: &str) -> Vec<String> {
        self.query
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.parts
            .headers
            .get_all(axum::http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|header| find_cookie(header, name))
            .map(ToOwned::to_owned)
    }

    fn http_session_id(&self) -> Option<String> {
        self.session().map(|s| s.id().to_owned())
    }

    fn http_session_attribute(&self, name: &str) -> Option<Value> {
        self.session()?.attribute(name)
    }

    fn set_http_session_attribute(
        &self,
        name: &str,
        value: Value,
    ) -> Result<(), SessionAttributeError> {
        let session = self.session().ok_or(SessionAttributeError::NoSession)?;
        session.set_attribute(name, value);
        Ok(())
    }

    fn invalidate_http_session(&self) -> Result<(), SessionAttributeError> {
        let session = self.session().ok_or(SessionAttributeError::NoSession)?;
        session.invalidate();
        Ok(())
    }

    fn url(&self) -> String {
        let uri = &self.parts.uri;
        let scheme = self
            .header("x-forwarded-proto")
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_ascii_lowercase()))
            .filter(|s| !s.is_empty())
            .or_else(|| uri.scheme_str().map(ToOwned::to_owned))
            .unwrap_or_else(|| String::from("http"));
        let host = uri
            .authority()
            .map(|a| a.as_str().to_owned())
            .or_else(|| self.header(axum::http::header::HOST.as_str()))
            .or_else(|| self.local_address().map(|a| a.to_string()))
            .unwrap_or_else(|| String::from("localhost"));
        let path = uri.path_and_query().map_or("/", |p| p.as_str());
        format!("{scheme}://{host}{path}")
    }

    fn request_attribute(&self, name: &str) -> Option<Value> {
        self.parts
            .extensions
            .get::<RequestAttributes>()?
            .get(name)
            .cloned()
    }

    fn context_attribute(&self, name: &str) -> Option<Value> {
        self.server_context()?.attribute(name)
    }

    fn context_init_parameter(&self, name: &str) -> Option<String> {
        self.server_context()?
            .init_parameter(name)
            .map(ToOwned::to_owned)
    }
}
