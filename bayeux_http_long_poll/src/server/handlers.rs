//! HTTP request handlers.

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bayeux_core::{
    context::ServerContext,
    transport::{Outcome, TransportResponse},
};
use tracing::{debug, warn};

use super::{BayeuxServer, context::HttpContext};
use crate::UNKNOWN_TRANSPORT;

/// Largest request body accepted, in bytes.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Create the Axum router serving `server` on its path, for GET and POST.
pub fn router(server: Arc<BayeuxServer>) -> Router {
    let path = server.path().to_owned();
    Router::new()
        .route(&path, get(handle_bayeux).post(handle_bayeux))
        .with_state(server)
}

async fn handle_bayeux(State(server): State<Arc<BayeuxServer>>, request: Request) -> Response {
    let (mut parts, body) = request.into_parts();
    if parts.extensions.get::<Arc<ServerContext>>().is_none() {
        parts.extensions.insert(Arc::clone(server.context()));
    }

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let Ok(content) = String::from_utf8(bytes.to_vec()) else {
        warn!("request body is not UTF-8");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let ctx = HttpContext::new(&parts);
    let Some(transport) = server.transports().iter().find(|t| t.accept(&ctx)) else {
        debug!(method = %parts.method, uri = %parts.uri, "no transport accepts request");
        return (StatusCode::BAD_REQUEST, UNKNOWN_TRANSPORT).into_response();
    };

    let response = transport.handle(&ctx, content).await;
    debug!(transport = transport.name(), outcome = response.outcome.as_str(), "handled request");
    into_http(response)
}

fn into_http(response: TransportResponse) -> Response {
    let status = match response.outcome {
        Outcome::Malformed => StatusCode::BAD_REQUEST,
        Outcome::Delivered | Outcome::Rejected => StatusCode::OK,
    };

    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = status;

    let headers = http.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(response.content_type),
    );
    for cookie in &response.cookies {
        match HeaderValue::from_str(&cookie.to_header_value()) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(cookie = %cookie.name, error = %e, "skipping unencodable cookie"),
        }
    }

    http
}
