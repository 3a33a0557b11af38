//! Read-only view of the request a Bayeux message arrived on.
//!
//! The engine and extensions see the originating HTTP request only through
//! [`BayeuxContext`]. The only mutations allowed are on the HTTP session,
//! and those are explicit operations that can fail.

use std::{collections::HashMap, net::SocketAddr};

use dashmap::DashMap;
use serde_json::Value;

use crate::error::SessionAttributeError;

/// An authenticated user, attached to the request by upstream middleware.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Principal {
    /// User name.
    pub name: String,
    /// Roles granted to the user.
    pub roles: Vec<String>,
}

impl Principal {
    /// A principal with no roles.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
        }
    }

    /// Add a role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    /// Whether `role` was granted.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Attributes attached to a single request by upstream middleware.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestAttributes(HashMap<String, Value>);

impl RequestAttributes {
    /// No attributes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Look up an attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

/// State shared by every request served on one endpoint.
///
/// Init parameters are fixed when the server is built; attributes can be
/// changed at any time.
#[derive(Debug, Default)]
pub struct ServerContext {
    attributes: DashMap<String, Value>,
    init_parameters: HashMap<String, String>,
}

impl ServerContext {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the init parameters.
    #[must_use]
    pub fn with_init_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.init_parameters = parameters;
        self
    }

    /// Set one init parameter.
    #[must_use]
    pub fn with_init_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.init_parameters.insert(name.into(), value.into());
        self
    }

    /// Read an init parameter.
    #[must_use]
    pub fn init_parameter(&self, name: &str) -> Option<&str> {
        self.init_parameters.get(name).map(String::as_str)
    }

    /// Read an attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes.get(name).map(|v| v.value().clone())
    }

    /// Write an attribute, returning the previous value.
    pub fn set_attribute(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.attributes.insert(name.into(), value)
    }

    /// Remove an attribute, returning its value.
    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes.remove(name).map(|(_, v)| v)
    }
}

/// The request context of an inbound Bayeux message.
pub trait BayeuxContext: Send + Sync {
    /// HTTP method, upper case.
    fn method(&self) -> &str;

    /// Peer address, if known.
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Address the request was received on, if known.
    fn local_address(&self) -> Option<SocketAddr>;

    /// The authenticated user, if any.
    fn user_principal(&self) -> Option<&Principal>;

    /// Whether the authenticated user holds `role`.
    fn is_user_in_role(&self, role: &str) -> bool {
        self.user_principal().is_some_and(|p| p.has_role(role))
    }

    /// First value of a request header (case-insensitive name).
    fn header(&self, name: &str) -> Option<String>;

    /// All values of a request header.
    fn header_values(&self, name: &str) -> Vec<String>;

    /// First value of a query parameter.
    fn parameter(&self, name: &str) -> Option<String>;

    /// All values of a query parameter.
    fn parameter_values(&self, name: &str) -> Vec<String>;

    /// Value of a request cookie.
    fn cookie(&self, name: &str) -> Option<String>;

    /// Identifier of the attached HTTP session.
    fn http_session_id(&self) -> Option<String>;

    /// Read an HTTP session attribute.
    fn http_session_attribute(&self, name: &str) -> Option<Value>;

    /// Write an HTTP session attribute.
    ///
    /// # Errors
    ///
    /// Returns [`SessionAttributeError::NoSession`] if no session is attached.
    fn set_http_session_attribute(&self, name: &str, value: Value)
    -> Result<(), SessionAttributeError>;

    /// Invalidate the attached HTTP session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionAttributeError::NoSession`] if no session is attached.
    fn invalidate_http_session(&self) -> Result<(), SessionAttributeError>;

    /// Full request URL, including the query string.
    fn url(&self) -> String;

    /// Read an attribute attached to this request.
    fn request_attribute(&self, name: &str) -> Option<Value>;

    /// Read an attribute shared by the whole endpoint.
    fn context_attribute(&self, name: &str) -> Option<Value>;

    /// Read an endpoint init parameter.
    fn context_init_parameter(&self, name: &str) -> Option<String>;
}

/// Parse a `Cookie` header value and return the named cookie.
#[must_use]
pub fn find_cookie<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"'))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::HashMap, net::SocketAddr, sync::Mutex};

    use serde_json::Value;

    use super::{BayeuxContext, Principal, RequestAttributes, ServerContext};
    use crate::error::SessionAttributeError;

    /// In-memory context for unit tests.
    #[derive(Debug, Default)]
    pub(crate) struct StubContext {
        pub(crate) method: String,
        pub(crate) remote: Option<SocketAddr>,
        pub(crate) headers: Vec<(String, String)>,
        pub(crate) params: Vec<(String, String)>,
        pub(crate) cookies: HashMap<String, String>,
        pub(crate) principal: Option<Principal>,
        pub(crate) session: Option<Mutex<HashMap<String, Value>>>,
        pub(crate) attributes: RequestAttributes,
        pub(crate) server: ServerContext,
    }

    impl StubContext {
        pub(crate) fn with_cookie(mut self, name: &str, value: &str) -> Self {
            self.cookies.insert(name.into(), value.into());
            self
        }

        pub(crate) fn with_header(mut self, name: &str, value: &str) -> Self {
            self.headers.push((name.to_ascii_lowercase(), value.into()));
            self
        }

        pub(crate) fn with_session(mut self) -> Self {
            self.session = Some(Mutex::new(HashMap::new()));
            self
        }
    }

    impl BayeuxContext for StubContext {
        fn method(&self) -> &str {
            &self.method
        }

        fn remote_address(&self) -> Option<SocketAddr> {
            self.remote
        }

        fn local_address(&self) -> Option<SocketAddr> {
            None
        }

        fn user_principal(&self) -> Option<&Principal> {
            self.principal.as_ref()
        }

        fn header(&self, name: &str) -> Option<String> {
            self.header_values(name).into_iter().next()
        }

        fn header_values(&self, name: &str) -> Vec<String> {
            let name = name.to_ascii_lowercase();
            self.headers
                .iter()
                .filter(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .collect()
        }

        fn parameter(&self, name: &str) -> Option<String> {
            self.parameter_values(name).into_iter().next()
        }

        fn parameter_values(&self, name: &str) -> Vec<String> {
            self.params
                .iter()
                .filter(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .collect()
        }

        fn cookie(&self, name: &str) -> Option<String> {
            self.cookies.get(name).cloned()
        }

        fn http_session_id(&self) -> Option<String> {
            self.session.as_ref().map(|_| String::from("stub"))
        }

        fn http_session_attribute(&self, name: &str) -> Option<Value> {
            let session = self.session.as_ref()?;
            session.lock().ok()?.get(name).cloned()
        }

        fn set_http_session_attribute(
            &self,
            name: &str,
            value: Value,
        ) -> Result<(), SessionAttributeError> {
            let session = self.session.as_ref().ok_or(SessionAttributeError::NoSession)?;
            if let Ok(mut map) = session.lock() {
                map.insert(name.into(), value);
            }
            Ok(())
        }

        fn invalidate_http_session(&self) -> Result<(), SessionAttributeError> {
            let session = self.session.as_ref().ok_or(SessionAttributeError::NoSession)?;
            if let Ok(mut map) = session.lock() {
                map.clear();
            }
            Ok(())
        }

        fn url(&self) -> String {
            String::from("http://localhost/cometd")
        }

        fn request_attribute(&self, name: &str) -> Option<Value> {
            self.attributes.get(name).cloned()
        }

        fn context_attribute(&self, name: &str) -> Option<Value> {
            self.server.attribute(name)
        }

        fn context_init_parameter(&self, name: &str) -> Option<String> {
            self.server.init_parameter(name).map(str::to_owned)
        }
    }
}
