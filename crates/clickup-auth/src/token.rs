//! ClickUp token endpoint: authorization code exchange and refresh
//!
//! Both calls POST a JSON body to the token endpoint. ClickUp answers with an
//! `access_token` and, for apps that have refresh enabled, a `refresh_token`.
//! A refresh response that omits the refresh token means the old one is still
//! valid, so the caller keeps it.

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{AUTHORIZE_ENDPOINT, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// The OAuth token pair the gateway authenticates upstream with.
///
/// Debug output is redacted; only `access_token` prefixes ever reach logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

impl TokenSet {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    /// Apply a refresh response on top of this set, keeping the current
    /// refresh token when the provider did not rotate it.
    pub fn refreshed(&self, response: TokenSet) -> TokenSet {
        TokenSet {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
        }
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// OAuth application credentials registered with ClickUp.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Secret<String>,
}

impl ClientCredentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: Secret::new(client_secret.into()),
        }
    }
}

/// Provider URLs for the authorization redirect and the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize_url: String,
    pub token_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            authorize_url: AUTHORIZE_ENDPOINT.to_string(),
            token_url: TOKEN_ENDPOINT.to_string(),
        }
    }
}

/// Raw token endpoint response. ClickUp reports some failures with a 200 and
/// no `access_token`, so every field is optional here.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

#[derive(Serialize)]
struct ExchangeRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<&'a str>,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    refresh_token: &'a str,
}

/// Exchange an authorization code for tokens.
///
/// Any non-success status, or a success body without an access token, yields
/// `Error::TokenExchange` carrying the endpoint's response body.
pub async fn exchange_code(
    client: &reqwest::Client,
    token_url: &str,
    credentials: &ClientCredentials,
    code: &str,
    verifier: Option<&str>,
) -> Result<TokenSet> {
    let request = ExchangeRequest {
        client_id: &credentials.client_id,
        client_secret: credentials.client_secret.expose(),
        code,
        code_verifier: verifier,
    };

    let response = client
        .post(token_url)
        .json(&request)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading token exchange response: {e}")))?;

    if !status.is_success() {
        debug!(%status, "token endpoint rejected code exchange");
        return Err(Error::TokenExchange(body));
    }

    parse_token_response(&body).ok_or(Error::TokenExchange(body))
}

/// Obtain a new access token with a refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    token_url: &str,
    credentials: &ClientCredentials,
    refresh: &str,
) -> Result<TokenSet> {
    let request = RefreshRequest {
        client_id: &credentials.client_id,
        client_secret: credentials.client_secret.expose(),
        grant_type: "refresh_token",
        refresh_token: refresh,
    };

    let response = client
        .post(token_url)
        .json(&request)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading token refresh response: {e}")))?;

    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(Error::InvalidCredentials(format!(
            "refresh token rejected ({status}): {body}"
        )));
    }
    if !status.is_success() {
        return Err(Error::Refresh(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    parse_token_response(&body)
        .ok_or_else(|| Error::Refresh(format!("no access_token in refresh response: {body}")))
}

fn parse_token_response(body: &str) -> Option<TokenSet> {
    let parsed: TokenResponse = serde_json::from_str(body).ok()?;
    let access_token = parsed.access_token.filter(|t| !t.is_empty())?;
    Some(TokenSet {
        access_token,
        refresh_token: parsed.refresh_token.filter(|t| !t.is_empty()),
    })
}
