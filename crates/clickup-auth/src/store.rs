//! Shared token store
//!
//! The store holds one versioned [`TokenRecord`]: the current token pair, an
//! `epoch` that advances whenever the pair changes, and at most one refresh
//! lease. Backends only need to offer `load` and a version-checked
//! `compare_and_swap`; every higher-level operation here is a read, modify,
//! CAS loop on top of that. Any number of gateway processes sharing a backend
//! therefore agree on which token is current and on who is refreshing it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::TokenSet;

/// Upper bound on CAS retries for one operation. Conflicts only come from
/// other writers, so hitting this means the backend is pathologically hot.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Exclusive right to refresh the token pair of one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshLease {
    pub holder: String,
    pub epoch: u64,
    pub expires_at_ms: u64,
}

impl RefreshLease {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms > now_ms
    }
}

/// Everything a backend persists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Bumped by the backend on every successful swap.
    pub version: u64,
    /// Bumped whenever `tokens` changes.
    pub epoch: u64,
    #[serde(default)]
    pub tokens: Option<TokenSet>,
    #[serde(default)]
    pub refresh_lease: Option<RefreshLease>,
}

/// Result of a compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Swap {
    /// The record as written, with its new version.
    Applied(TokenRecord),
    /// The expected version was stale; carries the record actually stored.
    Conflict(TokenRecord),
}

/// Persistence for the token record.
///
/// `compare_and_swap` must write `next` (with `version = expected_version + 1`)
/// only if the stored version equals `expected_version`, atomically with
/// respect to every other caller sharing the backend.
pub trait TokenBackend: Send + Sync {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<TokenRecord>> + Send + '_>>;

    fn compare_and_swap(
        &self,
        expected_version: u64,
        next: TokenRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Swap>> + Send + '_>>;
}

/// Token pair together with the epoch it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub epoch: u64,
    pub tokens: TokenSet,
}

/// Outcome of asking for the refresh lease on an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAttempt {
    /// The caller now holds the lease. `tokens` is the pair being replaced.
    Acquired {
        lease: RefreshLease,
        tokens: TokenSet,
    },
    /// The epoch already moved on; these are the current tokens.
    Superseded(TokenSnapshot),
    /// Someone else holds a live lease on this epoch.
    Busy { holder: String, expires_at_ms: u64 },
}

/// Shared token store handle. Cheap to clone.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn TokenBackend>,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn TokenBackend>) -> Self {
        Self { backend }
    }

    /// Current token pair, if any has been stored.
    pub async fn current(&self) -> Result<Option<TokenSet>> {
        Ok(self.backend.load().await?.tokens)
    }

    pub async fn snapshot(&self) -> Result<Option<TokenSnapshot>> {
        let record = self.backend.load().await?;
        Ok(snapshot_of(&record))
    }

    /// Store a new token pair unconditionally (OAuth callback). Advances the
    /// epoch and drops any outstanding lease.
    pub async fn replace(&self, tokens: TokenSet) -> Result<TokenSnapshot> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.backend.load().await?;
            let next = TokenRecord {
                version: record.version,
                epoch: record.epoch + 1,
                tokens: Some(tokens.clone()),
                refresh_lease: None,
            };
            if let Swap::Applied(written) = self.backend.compare_and_swap(record.version, next).await? {
                info!(epoch = written.epoch, "stored new token pair");
                return Ok(TokenSnapshot {
                    epoch: written.epoch,
                    tokens,
                });
            }
        }
        Err(contention("replace"))
    }

    /// Store `tokens` only if the store holds none yet. Returns whether the
    /// seed was written.
    pub async fn seed_if_empty(&self, tokens: TokenSet) -> Result<bool> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.backend.load().await?;
            if record.tokens.is_some() {
                return Ok(false);
            }
            let next = TokenRecord {
                version: record.version,
                epoch: record.epoch + 1,
                tokens: Some(tokens.clone()),
                refresh_lease: None,
            };
            if let Swap::Applied(_) = self.backend.compare_and_swap(record.version, next).await? {
                return Ok(true);
            }
        }
        Err(contention("seed"))
    }

    /// Try to take the refresh lease for `observed_epoch`.
    ///
    /// An expired lease is taken over. A live lease held by `holder` itself
    /// is renewed, which covers a process restarting under the same id.
    pub async fn try_acquire_lease(
        &self,
        observed_epoch: u64,
        holder: &str,
        ttl: Duration,
    ) -> Result<LeaseAttempt> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.backend.load().await?;
            let Some(tokens) = record.tokens.clone() else {
                return Err(Error::NotConfigured("no tokens stored".into()));
            };
            if record.epoch != observed_epoch {
                return Ok(LeaseAttempt::Superseded(TokenSnapshot {
                    epoch: record.epoch,
                    tokens,
                }));
            }

            let now = now_millis();
            if let Some(lease) = &record.refresh_lease
                && lease.epoch == record.epoch
                && lease.is_live(now)
                && lease.holder != holder
            {
                return Ok(LeaseAttempt::Busy {
                    holder: lease.holder.clone(),
                    expires_at_ms: lease.expires_at_ms,
                });
            }

            let lease = RefreshLease {
                holder: holder.to_string(),
                epoch: record.epoch,
                expires_at_ms: now + ttl.as_millis() as u64,
            };
            let next = TokenRecord {
                refresh_lease: Some(lease.clone()),
                ..record.clone()
            };
            match self.backend.compare_and_swap(record.version, next).await? {
                Swap::Applied(_) => {
                    debug!(epoch = lease.epoch, holder, "acquired refresh lease");
                    return Ok(LeaseAttempt::Acquired { lease, tokens });
                }
                Swap::Conflict(_) => continue,
            }
        }
        Err(contention("acquire lease"))
    }

    /// Publish refreshed tokens for the lease's epoch, advancing the epoch and
    /// clearing the lease in the same swap.
    ///
    /// If the epoch already moved (an OAuth callback landed meanwhile) the
    /// refreshed pair is discarded and the current tokens are returned.
    pub async fn commit_refresh(
        &self,
        lease: &RefreshLease,
        tokens: TokenSet,
    ) -> Result<TokenSnapshot> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.backend.load().await?;
            if record.epoch != lease.epoch {
                return snapshot_of(&record)
                    .ok_or_else(|| Error::NotConfigured("tokens removed during refresh".into()));
            }
            let next = TokenRecord {
                version: record.version,
                epoch: record.epoch + 1,
                tokens: Some(tokens.clone()),
                refresh_lease: None,
            };
            if let Swap::Applied(written) = self.backend.compare_and_swap(record.version, next).await? {
                info!(epoch = written.epoch, "committed refreshed token pair");
                return Ok(TokenSnapshot {
                    epoch: written.epoch,
                    tokens,
                });
            }
        }
        Err(contention("commit refresh"))
    }

    /// Drop `lease` without touching the tokens. No-op if it is no longer the
    /// stored lease.
    pub async fn release_lease(&self, lease: &RefreshLease) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let record = self.backend.load().await?;
            if record.refresh_lease.as_ref() != Some(lease) {
                return Ok(());
            }
            let next = TokenRecord {
                refresh_lease: None,
                ..record.clone()
            };
            if let Swap::Applied(_) = self.backend.compare_and_swap(record.version, next).await? {
                debug!(epoch = lease.epoch, "released refresh lease");
                return Ok(());
            }
        }
        Err(contention("release lease"))
    }
}

fn snapshot_of(record: &TokenRecord) -> Option<TokenSnapshot> {
    record.tokens.clone().map(|tokens| TokenSnapshot {
        epoch: record.epoch,
        tokens,
    })
}

fn contention(op: &str) -> Error {
    Error::Store(format!("{op}: gave up after {MAX_CAS_ATTEMPTS} conflicting writes"))
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
