//! OAuth bootstrap endpoints
//!
//! - GET /                 status page
//! - GET /oauth/start      create a pending flow, redirect to ClickUp
//! - GET /oauth/callback   exchange the returned code, store the token pair
//!
//! Errors here go to the operator's browser as plain text.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::header::{CONTENT_TYPE, HOST, LOCATION};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use clickup_auth::{AuthorizationFlowManager, AuthorizationState, ClientCredentials, TokenStore};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::pages;

/// Authorization attempts waiting for their callback, keyed by `state`.
///
/// Local to this process: the callback must reach the instance that served
/// `/oauth/start`.
#[derive(Clone)]
pub struct PendingFlows {
    flows: Arc<Mutex<HashMap<String, (AuthorizationState, Instant)>>>,
    ttl: Duration,
}

impl PendingFlows {
    pub fn new(ttl: Duration) -> Self {
        Self {
            flows: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub async fn insert(&self, flow: AuthorizationState) {
        let mut flows = self.flows.lock().await;
        // Lazy cleanup while holding the lock
        flows.retain(|_, (_, created_at)| created_at.elapsed() < self.ttl);
        flows.insert(flow.state.clone(), (flow, Instant::now()));
    }

    /// Remove and return the flow for `state` if it has not expired.
    pub async fn take(&self, state: &str) -> Option<AuthorizationState> {
        let (flow, created_at) = self.flows.lock().await.remove(state)?;
        (created_at.elapsed() < self.ttl).then_some(flow)
    }
}

#[derive(Clone)]
pub struct OAuthState {
    pub flows: AuthorizationFlowManager,
    pub store: TokenStore,
    pub credentials: Option<Arc<ClientCredentials>>,
    pub public_url: Option<String>,
    pub use_pkce: bool,
    pub pending: PendingFlows,
}

impl OAuthState {
    /// `{public_url}/oauth/callback`, or built from the request's Host header.
    fn redirect_uri(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(base) = &self.public_url {
            return Some(format!("{base}/oauth/callback"));
        }
        let host = headers.get(HOST)?.to_str().ok()?;
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        Some(format!("{scheme}://{host}/oauth/callback"))
    }
}

fn text(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        message.into(),
    )
        .into_response()
}

/// GET /: status page.
pub async fn home(State(state): State<OAuthState>) -> Response {
    match state.store.snapshot().await {
        Ok(snapshot) => Html(pages::home(
            snapshot.is_some(),
            state.credentials.is_some(),
            snapshot.map(|s| s.epoch),
        ))
        .into_response(),
        Err(e) => {
            error!(error = %e, "failed to read token store");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Token store unavailable: {e}"),
            )
        }
    }
}

/// GET /oauth/start: redirect to the ClickUp authorization page.
pub async fn start(State(state): State<OAuthState>, headers: HeaderMap) -> Response {
    let Some(credentials) = &state.credentials else {
        return text(
            StatusCode::BAD_REQUEST,
            "CLICKUP_CLIENT_ID not configured. Set it before starting authorization.",
        );
    };
    let Some(redirect_uri) = state.redirect_uri(&headers) else {
        return text(
            StatusCode::BAD_REQUEST,
            "Cannot determine redirect URI: set gateway.public_url or send a Host header",
        );
    };

    let flow = AuthorizationState::new(redirect_uri, state.use_pkce);
    let url = match state.flows.authorization_url(&credentials.client_id, &flow) {
        Ok(url) => url,
        Err(e) => {
            error!(error = %e, "failed to build authorization URL");
            return text(StatusCode::INTERNAL_SERVER_ERROR, format!("OAuth error: {e}"));
        }
    };

    info!(
        redirect_uri = %flow.redirect_uri,
        pkce = flow.pkce.is_some(),
        "authorization flow started"
    );
    state.pending.insert(flow).await;

    (StatusCode::FOUND, [(LOCATION, url)]).into_response()
}

fn unknown_state() -> Response {
    text(
        StatusCode::BAD_REQUEST,
        "Unknown or expired authorization state. Restart at /oauth/start",
    )
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    error: Option<String>,
    state: Option<String>,
}

/// GET /oauth/callback: exchange the authorization code.
pub async fn callback(
    State(state): State<OAuthState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(err) = params.error {
        warn!(error = %err, "provider returned an authorization error");
        return text(StatusCode::BAD_REQUEST, format!("OAuth error: {err}"));
    }
    let Some(code) = params.code else {
        return text(StatusCode::BAD_REQUEST, "Missing authorization code");
    };
    let Some(credentials) = &state.credentials else {
        return text(
            StatusCode::BAD_REQUEST,
            "OAuth client credentials not configured",
        );
    };

    // A `state` must be one this instance issued. Only an absent `state`
    // without PKCE falls back to a flow rebuilt from the request.
    let flow = match &params.state {
        Some(key) => match state.pending.take(key).await {
            Some(flow) => flow,
            None => {
                warn!("callback carried an unknown or expired state");
                return unknown_state();
            }
        },
        None if state.use_pkce => return unknown_state(),
        None => match state.redirect_uri(&headers) {
            Some(redirect_uri) => AuthorizationState::new(redirect_uri, false),
            None => {
                return text(StatusCode::BAD_REQUEST, "Cannot determine redirect URI");
            }
        },
    };

    match state.flows.exchange_code(&code, credentials, flow).await {
        Ok(snapshot) => {
            info!(epoch = snapshot.epoch, "OAuth tokens stored");
            Html(pages::callback_success(&snapshot.tokens)).into_response()
        }
        Err(clickup_auth::Error::TokenExchange(body)) => {
            warn!("token exchange rejected");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Token exchange failed: {body}"),
            )
        }
        Err(e) => {
            error!(error = %e, "token exchange failed");
            text(StatusCode::INTERNAL_SERVER_ERROR, format!("OAuth error: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use clickup_auth::{Endpoints, MemoryBackend};

    fn state(public_url: Option<&str>) -> OAuthState {
        let store = TokenStore::new(Arc::new(MemoryBackend::new()));
        OAuthState {
            flows: AuthorizationFlowManager::new(
                reqwest::Client::new(),
                Endpoints::default(),
                store.clone(),
            ),
            store,
            credentials: None,
            public_url: public_url.map(String::from),
            use_pkce: false,
            pending: PendingFlows::new(Duration::from_secs(60)),
        }
    }

    #[test]
    fn redirect_uri_prefers_public_url() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("internal:3000"));
        assert_eq!(
            state(Some("https://gw.example.com")).redirect_uri(&headers),
            Some("https://gw.example.com/oauth/callback".to_string())
        );
    }

    #[test]
    fn redirect_uri_from_host_and_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("gw.example.com"));
        assert_eq!(
            state(None).redirect_uri(&headers),
            Some("http://gw.example.com/oauth/callback".to_string())
        );

        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(
            state(None).redirect_uri(&headers),
            Some("https://gw.example.com/oauth/callback".to_string())
        );

        assert_eq!(state(None).redirect_uri(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn pending_flow_is_single_use() {
        let pending = PendingFlows::new(Duration::from_secs(60));
        let flow = AuthorizationState::new("http://localhost/oauth/callback", true);
        let key = flow.state.clone();
        pending.insert(flow).await;

        let taken = pending.take(&key).await.unwrap();
        assert!(taken.pkce.is_some());
        assert!(pending.take(&key).await.is_none());
    }

    #[tokio::test]
    async fn expired_flow_is_not_returned() {
        let pending = PendingFlows::new(Duration::ZERO);
        let flow = AuthorizationState::new("http://localhost/oauth/callback", false);
        let key = flow.state.clone();
        pending.insert(flow).await;
        assert!(pending.take(&key).await.is_none());
    }
}
