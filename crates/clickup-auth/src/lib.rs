//! ClickUp OAuth library
//!
//! Token endpoint calls, PKCE, the authorization code flow and the shared
//! versioned token store. Independent of the gateway binary.
//!
//! Credential flow:
//! 1. `AuthorizationState::new()` starts an attempt (optionally with PKCE)
//! 2. The operator authorizes via `AuthorizationFlowManager::authorization_url()`
//! 3. `AuthorizationFlowManager::exchange_code()` stores the pair in the `TokenStore`
//! 4. Refresh (see the `token-refresh` crate) calls `token::refresh_token()`
//!    under a lease taken with `TokenStore::try_acquire_lease()`

pub mod backend;
pub mod constants;
pub mod error;
pub mod flow;
pub mod pkce;
pub mod store;
pub mod token;

pub use backend::{FileBackend, MemoryBackend};
pub use constants::*;
pub use error::{Error, Result};
pub use flow::{AuthorizationFlowManager, AuthorizationState, build_authorization_url};
pub use pkce::{PkceSession, compute_challenge, generate_verifier};
pub use store::{
    LeaseAttempt, RefreshLease, Swap, TokenBackend, TokenRecord, TokenSnapshot, TokenStore,
};
pub use token::{ClientCredentials, Endpoints, TokenSet, exchange_code, refresh_token};
