//! Deduplicated access token refresh
//!
//! When the upstream rejects the current access token, every request that saw
//! the rejection asks the [`RefreshCoordinator`] for a new one. Within a
//! process, callers that observed the same epoch share a single refresh. Across
//! processes sharing a token store, the store's refresh lease makes sure only
//! one of them calls the token endpoint; the others adopt what it commits.
//!
//! Refresh lifecycle:
//! 1. Caller reports the epoch of the token that was rejected
//! 2. Epoch already moved → adopt the current tokens, no upstream call
//! 3. Otherwise take the lease, call the token endpoint, commit (epoch + 1)
//! 4. Lease held elsewhere → poll the store until it commits or the lease lapses
//! 5. Failure → release the lease, tokens stay as they were

pub mod coordinator;
pub mod error;

pub use coordinator::{RefreshCoordinator, RefreshSettings};
pub use error::{Error, Result};
