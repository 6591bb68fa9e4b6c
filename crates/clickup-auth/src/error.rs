//! Error types for OAuth and token store operations

/// Errors from token endpoint calls and token store access.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Carries the token endpoint's response body verbatim.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("token refresh failed: {0}")]
    Refresh(String),

    /// The token endpoint answered 401/403 to a refresh: the refresh token is
    /// revoked or belongs to another client.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("invalid authorization URL: {0}")]
    InvalidUrl(String),

    #[error("token store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
