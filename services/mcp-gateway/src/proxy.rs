//! Authenticated forwarding to the MCP upstream
//!
//! Each inbound request walks a fixed sequence: API key check, token lookup,
//! forward, and on an upstream 401 a single refresh followed by exactly one
//! retry. Whatever the retry returns goes back to the caller, 401 included.
//! A failed refresh is not surfaced; the caller sees the upstream's own 401.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use clickup_auth::TokenStore;
use common::Secret;
use token_refresh::RefreshCoordinator;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Error;
use crate::metrics::{self, ServiceMetrics};

/// Header carrying the caller's gateway API key.
pub const API_KEY_HEADER: &str = "x-api-key";

const MCP_SESSION_ID: &str = "mcp-session-id";
const MCP_PROTOCOL_VERSION: &str = "mcp-protocol-version";

fn default_content_type() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct GatewayState {
    pub client: reqwest::Client,
    pub mcp_url: String,
    /// Without a configured key every proxied request is rejected.
    pub api_key: Option<Arc<Secret<String>>>,
    pub store: TokenStore,
    pub refresher: RefreshCoordinator,
    pub timeout: Duration,
    pub max_body_bytes: usize,
    pub metrics: ServiceMetrics,
}

/// The parts of an inbound request that are replayed on retry.
struct Outbound {
    method: Method,
    headers: HeaderMap,
    body: Bytes,
}

struct UpstreamResponse {
    status: StatusCode,
    content_type: Option<HeaderValue>,
    session_id: Option<HeaderValue>,
    body: Bytes,
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            self.content_type.unwrap_or_else(default_content_type),
        );
        if let Some(session_id) = self.session_id {
            headers.insert(MCP_SESSION_ID, session_id);
        }
        response
    }
}

/// Decrements the in-flight counter when the request finishes or is dropped.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[instrument(skip_all, fields(request_id = %request_id, method = %request.method()))]
pub async fn proxy_request(
    state: &GatewayState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = InFlightGuard::enter(&state.metrics.in_flight);
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let method = request.method().clone();

    let response = match forward(state, request).await {
        Ok(response) => response,
        Err(e) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            match &e {
                Error::Unauthorized | Error::NotConfigured | Error::InvalidRequest(_) => {
                    warn!(error = %e, "request rejected")
                }
                Error::UpstreamForwarding(_) | Error::Store(_) => {
                    error!(error = %e, "request failed")
                }
            }
            e.into_response()
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(state: &GatewayState, request: Request<Body>) -> Result<Response, Error> {
    authenticate(state.api_key.as_deref(), request.headers())?;

    let snapshot = state
        .store
        .snapshot()
        .await
        .map_err(|e| Error::Store(e.to_string()))?
        .ok_or(Error::NotConfigured)?;

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| Error::InvalidRequest(format!("invalid request body: {e}")))?;
    let outbound = Outbound {
        method: parts.method,
        headers: forwarded_headers(&parts.headers),
        body,
    };

    let first = send(state, &outbound, &snapshot.tokens.access_token).await?;
    if first.status != StatusCode::UNAUTHORIZED {
        return Ok(first.into_response());
    }
    if snapshot.tokens.refresh_token.is_none() {
        debug!("upstream returned 401 and no refresh token is stored");
        return Ok(first.into_response());
    }

    info!(epoch = snapshot.epoch, "upstream rejected access token, refreshing");
    let refreshed = match state.refresher.refresh(snapshot.epoch).await {
        Ok(refreshed) => refreshed,
        Err(e) => {
            warn!(error = %e, "refresh failed, returning upstream 401");
            return Ok(first.into_response());
        }
    };

    let retry = send(state, &outbound, &refreshed.tokens.access_token).await?;
    debug!(status = %retry.status, epoch = refreshed.epoch, "retried with refreshed token");
    Ok(retry.into_response())
}

async fn send(
    state: &GatewayState,
    outbound: &Outbound,
    access_token: &str,
) -> Result<UpstreamResponse, Error> {
    let response = state
        .client
        .request(outbound.method.clone(), &state.mcp_url)
        .headers(outbound.headers.clone())
        .bearer_auth(access_token)
        .timeout(state.timeout)
        .body(outbound.body.clone())
        .send()
        .await
        .map_err(|e| upstream_failure(&e))?;

    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let session_id = response.headers().get(MCP_SESSION_ID).cloned();
    let body = response.bytes().await.map_err(|e| upstream_failure(&e))?;

    Ok(UpstreamResponse {
        status,
        content_type,
        session_id,
        body,
    })
}

fn upstream_failure(e: &reqwest::Error) -> Error {
    metrics::record_upstream_error(metrics::classify_reqwest_error(e));
    Error::UpstreamForwarding(e.to_string())
}

/// Constant-time comparison against the configured key.
fn authenticate(api_key: Option<&Secret<String>>, headers: &HeaderMap) -> Result<(), Error> {
    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    match (api_key, presented) {
        (Some(expected), Some(presented)) if expected.matches(presented) => Ok(()),
        _ => Err(Error::Unauthorized),
    }
}

/// Only these inbound headers reach the upstream. Gateway credentials
/// (`X-API-Key`, the caller's `Authorization`) never do.
fn forwarded_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        inbound
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(default_content_type),
    );
    for name in ["accept", MCP_SESSION_ID, MCP_PROTOCOL_VERSION] {
        if let Some(value) = inbound.get(name) {
            headers.insert(name, value.clone());
        }
    }
    headers
}
