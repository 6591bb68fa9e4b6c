//! Error types for token refresh

/// Errors from a refresh attempt.
///
/// `Clone` because one result is handed to every caller that joined the same
/// in-flight refresh.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("refresh not configured: {0}")]
    NotConfigured(String),

    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("token endpoint refused refresh: {0}")]
    Upstream(String),

    #[error("token store error: {0}")]
    Store(String),

    #[error("timed out waiting for refresh held by {0}")]
    LeaseTimeout(String),

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

impl From<clickup_auth::Error> for Error {
    fn from(e: clickup_auth::Error) -> Self {
        match e {
            clickup_auth::Error::NotConfigured(msg) => Error::NotConfigured(msg),
            clickup_auth::Error::MissingRefreshToken => Error::MissingRefreshToken,
            clickup_auth::Error::Store(_)
            | clickup_auth::Error::Io(_)
            | clickup_auth::Error::CredentialParse(_) => Error::Store(e.to_string()),
            other => Error::Upstream(other.to_string()),
        }
    }
}

/// Result alias for refresh operations.
pub type Result<T> = std::result::Result<T, Error>;
