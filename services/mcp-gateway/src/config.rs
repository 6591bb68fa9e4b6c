//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Secrets (OAuth client id/secret, gateway API key) are never read from the
//! TOML itself: each comes from its env var, else from a `*_file` path.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clickup_auth::{ClientCredentials, Endpoints, TokenSet};
use common::Secret;
use serde::Deserialize;

pub const CLIENT_ID_ENV: &str = "CLICKUP_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "CLICKUP_CLIENT_SECRET";
pub const API_KEY_ENV: &str = "MCP_API_KEY";
pub const SEED_ACCESS_TOKEN_ENV: &str = "CLICKUP_ACCESS_TOKEN";
pub const SEED_REFRESH_TOKEN_ENV: &str = "CLICKUP_REFRESH_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Bootstrap token pair from the environment, written only into an empty store.
    #[serde(skip)]
    pub seed_tokens: Option<TokenSet>,
}

/// Inbound HTTP settings
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Externally visible base URL, used for the OAuth `redirect_uri`.
    /// Without it the redirect is derived from the request's Host header.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Path to a file containing the gateway API key (alternative to MCP_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
}

/// Provider endpoints
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub mcp_url: String,
    pub authorize_url: String,
    pub token_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            mcp_url: clickup_auth::MCP_ENDPOINT.to_string(),
            authorize_url: clickup_auth::AUTHORIZE_ENDPOINT.to_string(),
            token_url: clickup_auth::TOKEN_ENDPOINT.to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn endpoints(&self) -> Endpoints {
        Endpoints {
            authorize_url: self.authorize_url.clone(),
            token_url: self.token_url.clone(),
        }
    }
}

/// OAuth application settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub use_pkce: bool,
    pub pending_flow_ttl_secs: u64,
    pub client_id_file: Option<PathBuf>,
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub credentials: Option<ClientCredentials>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            use_pkce: false,
            pending_flow_ttl_secs: 600,
            client_id_file: None,
            client_secret_file: None,
            credentials: None,
        }
    }
}

/// Shared token store settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub lease_ttl_secs: u64,
    pub lease_poll_millis: u64,
    pub refresh_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tokens.json"),
            lease_ttl_secs: 30,
            lease_poll_millis: 100,
            refresh_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.lease_poll_millis)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        config.gateway.api_key =
            resolve_secret(API_KEY_ENV, config.gateway.api_key_file.as_deref())?.map(Secret::new);

        let client_id = resolve_secret(CLIENT_ID_ENV, config.oauth.client_id_file.as_deref())?;
        let client_secret =
            resolve_secret(CLIENT_SECRET_ENV, config.oauth.client_secret_file.as_deref())?;
        config.oauth.credentials = match (client_id, client_secret) {
            (Some(id), Some(secret)) => Some(ClientCredentials::new(id, secret)),
            (None, None) => None,
            _ => {
                return Err(common::Error::Config(format!(
                    "{CLIENT_ID_ENV} and {CLIENT_SECRET_ENV} must be configured together"
                )));
            }
        };

        config.seed_tokens = non_empty_env(SEED_ACCESS_TOKEN_ENV)
            .map(|access| TokenSet::new(access, non_empty_env(SEED_REFRESH_TOKEN_ENV)));

        Ok(config)
    }

    fn validate(&mut self) -> common::Result<()> {
        for (name, url) in [
            ("mcp_url", &self.upstream.mcp_url),
            ("authorize_url", &self.upstream.authorize_url),
            ("token_url", &self.upstream.token_url),
        ] {
            require_http_url(name, url)?;
        }

        if let Some(public_url) = self.gateway.public_url.as_mut() {
            require_http_url("public_url", public_url)?;
            let trimmed = public_url.trim_end_matches('/').to_string();
            *public_url = trimmed;
        }

        for (name, value) in [
            ("timeout_secs", self.gateway.timeout_secs),
            ("max_connections", self.gateway.max_connections as u64),
            ("max_body_bytes", self.gateway.max_body_bytes as u64),
            ("pending_flow_ttl_secs", self.oauth.pending_flow_ttl_secs),
            ("lease_ttl_secs", self.store.lease_ttl_secs),
            ("lease_poll_millis", self.store.lease_poll_millis),
            ("refresh_timeout_secs", self.store.refresh_timeout_secs),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.store.refresh_timeout_secs >= self.store.lease_ttl_secs {
            return Err(common::Error::Config(format!(
                "refresh_timeout_secs ({}) must be less than lease_ttl_secs ({})",
                self.store.refresh_timeout_secs, self.store.lease_ttl_secs
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("clickup-mcp-gateway.toml")
    }
}

fn require_http_url(name: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{name} must start with http:// or https://, got: {url}"
        )))
    }
}

/// Env var takes precedence over file. Values are trimmed; empty means unset.
fn resolve_secret(env_var: &str, file: Option<&Path>) -> common::Result<Option<String>> {
    if let Some(value) = non_empty_env(env_var) {
        return Ok(Some(value));
    }
    let Some(path) = file else {
        return Ok(None);
    };
    let contents = std::fs::read_to_string(path).map_err(|e| {
        common::Error::Secret(format!("failed to read {}: {e}", path.display()))
    })?;
    let value = contents.trim();
    Ok((!value.is_empty()).then(|| value.to_owned()))
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}
