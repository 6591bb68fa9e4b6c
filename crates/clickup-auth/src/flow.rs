//! Authorization code flow
//!
//! An [`AuthorizationState`] is created per `/oauth/start` hit and consumed by
//! the matching callback. The manager builds the provider redirect URL and
//! turns a returned code into a stored token pair.

use reqwest::Url;
use tracing::info;

use crate::constants::CODE_CHALLENGE_METHOD;
use crate::error::{Error, Result};
use crate::pkce::{PkceSession, generate_state};
use crate::store::{TokenSnapshot, TokenStore};
use crate::token::{ClientCredentials, Endpoints, exchange_code};

/// One in-progress authorization attempt.
#[derive(Debug, Clone)]
pub struct AuthorizationState {
    /// Opaque value echoed back by the provider in the callback.
    pub state: String,
    pub redirect_uri: String,
    pub pkce: Option<PkceSession>,
}

impl AuthorizationState {
    pub fn new(redirect_uri: impl Into<String>, use_pkce: bool) -> Self {
        Self {
            state: generate_state(),
            redirect_uri: redirect_uri.into(),
            pkce: use_pkce.then(PkceSession::generate),
        }
    }
}

/// Build the provider authorization URL.
///
/// `challenge` adds `code_challenge` and `code_challenge_method=S256`.
pub fn build_authorization_url(
    authorize_url: &str,
    client_id: &str,
    redirect_uri: &str,
    challenge: Option<&str>,
    state: Option<&str>,
) -> Result<String> {
    let mut params = vec![("client_id", client_id), ("redirect_uri", redirect_uri)];
    if let Some(challenge) = challenge {
        params.push(("code_challenge", challenge));
        params.push(("code_challenge_method", CODE_CHALLENGE_METHOD));
    }
    if let Some(state) = state {
        params.push(("state", state));
    }

    Url::parse_with_params(authorize_url, &params)
        .map(String::from)
        .map_err(|e| Error::InvalidUrl(format!("{authorize_url}: {e}")))
}

/// Drives the authorization code flow against one provider.
#[derive(Clone)]
pub struct AuthorizationFlowManager {
    client: reqwest::Client,
    endpoints: Endpoints,
    store: TokenStore,
}

impl AuthorizationFlowManager {
    pub fn new(client: reqwest::Client, endpoints: Endpoints, store: TokenStore) -> Self {
        Self {
            client,
            endpoints,
            store,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Authorization URL for `flow`.
    pub fn authorization_url(&self, client_id: &str, flow: &AuthorizationState) -> Result<String> {
        build_authorization_url(
            &self.endpoints.authorize_url,
            client_id,
            &flow.redirect_uri,
            flow.pkce.as_ref().map(|p| p.challenge.as_str()),
            Some(&flow.state),
        )
    }

    /// Exchange `code` and store the resulting pair, replacing whatever was
    /// there. Consumes the flow so its verifier cannot be replayed.
    pub async fn exchange_code(
        &self,
        code: &str,
        credentials: &ClientCredentials,
        flow: AuthorizationState,
    ) -> Result<TokenSnapshot> {
        let verifier = flow.pkce.as_ref().map(|p| p.verifier.as_str());
        let tokens = exchange_code(
            &self.client,
            &self.endpoints.token_url,
            credentials,
            code,
            verifier,
        )
        .await?;

        info!(
            redirect_uri = %flow.redirect_uri,
            has_refresh_token = tokens.refresh_token.is_some(),
            "authorization code exchanged"
        );
        self.store.replace(tokens).await
    }
}
