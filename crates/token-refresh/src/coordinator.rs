//! Single-flight refresh coordinator
//!
//! The refresh itself runs on a spawned task and is handed to callers as a
//! shared future. A caller that gives up (client disconnect, handler dropped)
//! only drops its clone; the refresh keeps going and the others still get the
//! result.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clickup_auth::{
    ClientCredentials, LeaseAttempt, RefreshLease, TokenSet, TokenSnapshot, TokenStore,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Tuning for refresh and lease handling.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    /// Identifies this process in the shared store's lease.
    pub holder: String,
    pub token_url: String,
    /// How long a lease stays valid without being committed or released.
    pub lease_ttl: Duration,
    /// Interval between store reads while another holder refreshes.
    pub poll_interval: Duration,
    /// Bound on the token endpoint call. Must stay below `lease_ttl`.
    pub request_timeout: Duration,
}

impl RefreshSettings {
    pub fn new(holder: impl Into<String>, token_url: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            token_url: token_url.into(),
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Refreshed,
    Adopted,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<(TokenSnapshot, Source)>>>;

struct InFlight {
    id: u64,
    epoch: u64,
    result: SharedRefresh,
}

struct Inner {
    store: TokenStore,
    client: reqwest::Client,
    credentials: Option<ClientCredentials>,
    settings: RefreshSettings,
    inflight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

/// Deduplicates token refreshes within this process and, through the store's
/// lease, across every process sharing the store. Cheap to clone.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: TokenStore,
        client: reqwest::Client,
        credentials: Option<ClientCredentials>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                credentials,
                settings,
                inflight: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a token pair newer than `observed_epoch`.
    ///
    /// Callers pass the epoch of the token the upstream just rejected. If an
    /// equal or newer refresh is already running they join it; if the store
    /// already moved past that epoch the current tokens come back without a
    /// token endpoint call.
    pub async fn refresh(&self, observed_epoch: u64) -> Result<TokenSnapshot> {
        let (result, joined) = self.join_or_start(observed_epoch).await;
        let outcome = result.await;

        let label = match (&outcome, joined) {
            (Err(_), _) => "failed",
            (Ok(_), true) => "joined",
            (Ok((_, Source::Adopted)), false) => "adopted",
            (Ok((_, Source::Refreshed)), false) => "refreshed",
        };
        metrics::counter!("gateway_token_refresh_total", "outcome" => label).increment(1);

        outcome.map(|(snapshot, _)| snapshot)
    }

    async fn join_or_start(&self, observed_epoch: u64) -> (SharedRefresh, bool) {
        let mut slot = self.inner.inflight.lock().await;
        if let Some(inflight) = slot.as_ref()
            && inflight.epoch >= observed_epoch
        {
            debug!(epoch = inflight.epoch, "joining in-flight refresh");
            return (inflight.result.clone(), true);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.run(observed_epoch).await;
            inner.finish(id).await;
            result
        });
        let result = task
            .map(|joined| joined.unwrap_or_else(|e| Err(Error::Aborted(e.to_string()))))
            .boxed()
            .shared();

        *slot = Some(InFlight {
            id,
            epoch: observed_epoch,
            result: result.clone(),
        });
        (result, false)
    }
}

impl Inner {
    async fn run(&self, observed_epoch: u64) -> Result<(TokenSnapshot, Source)> {
        let Some(credentials) = &self.credentials else {
            return Err(Error::NotConfigured(
                "client id and secret are required to refresh".into(),
            ));
        };

        let deadline = Instant::now() + self.settings.lease_ttl + self.settings.request_timeout;
        let (lease, current) = loop {
            match self
                .store
                .try_acquire_lease(observed_epoch, &self.settings.holder, self.settings.lease_ttl)
                .await?
            {
                LeaseAttempt::Acquired { lease, tokens } => break (lease, tokens),
                LeaseAttempt::Superseded(snapshot) => {
                    info!(
                        observed_epoch,
                        epoch = snapshot.epoch,
                        "token already refreshed, adopting"
                    );
                    return Ok((snapshot, Source::Adopted));
                }
                LeaseAttempt::Busy { holder, .. } => {
                    if Instant::now() >= deadline {
                        return Err(Error::LeaseTimeout(holder));
                    }
                    debug!(holder, "refresh held by another instance, waiting");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        };

        match self.refresh_with_lease(&lease, &current, credentials).await {
            Ok(snapshot) => Ok((snapshot, Source::Refreshed)),
            Err(e) => {
                warn!(epoch = lease.epoch, error = %e, "token refresh failed");
                if let Err(release) = self.store.release_lease(&lease).await {
                    warn!(error = %release, "failed to release refresh lease");
                }
                Err(e)
            }
        }
    }

    async fn refresh_with_lease(
        &self,
        lease: &RefreshLease,
        current: &TokenSet,
        credentials: &ClientCredentials,
    ) -> Result<TokenSnapshot> {
        let refresh = current
            .refresh_token
            .as_deref()
            .ok_or(Error::MissingRefreshToken)?;

        let timeout = self.settings.request_timeout;
        let call = clickup_auth::refresh_token(
            &self.client,
            &self.settings.token_url,
            credentials,
            refresh,
        );
        let response = tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Error::Upstream(format!("token endpoint timed out after {timeout:?}")))??;

        let snapshot = self
            .store
            .commit_refresh(lease, current.refreshed(response))
            .await?;
        info!(epoch = snapshot.epoch, "access token refreshed");
        Ok(snapshot)
    }

    async fn finish(&self, id: u64) {
        let mut slot = self.inflight.lock().await;
        if slot.as_ref().is_some_and(|f| f.id == id) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::StatusCode;
    use axum::routing::post;
    use clickup_auth::{FileBackend, MemoryBackend};

    struct TokenServer {
        url: String,
        calls: Arc<AtomicU64>,
    }

    /// Token endpoint stub. Issues `at_<n>` for the n-th call, without a new
    /// refresh token, after `delay`.
    async fn start_token_server(status: StatusCode, delay: Duration) -> TokenServer {
        let calls = Arc::new(AtomicU64::new(0));
        let calls_clone = calls.clone();
        let app = axum::Router::new().route(
            "/token",
            post(move || {
                let calls = calls_clone.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    tokio::time::sleep(delay).await;
                    if status.is_success() {
                        (status, format!(r#"{{"access_token":"at_{n}"}}"#))
                    } else {
                        (status, r#"{"err":"invalid_grant"}"#.to_string())
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        TokenServer {
            url: format!("http://{addr}/token"),
            calls,
        }
    }

    fn settings(holder: &str, token_url: &str) -> RefreshSettings {
        RefreshSettings {
            lease_ttl: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(1),
            ..RefreshSettings::new(holder, token_url)
        }
    }

    fn coordinator(store: &TokenStore, settings: RefreshSettings) -> RefreshCoordinator {
        RefreshCoordinator::new(
            store.clone(),
            reqwest::Client::new(),
            Some(ClientCredentials::new("id", "secret")),
            settings,
        )
    }

    async fn seeded_store() -> TokenStore {
        let store = TokenStore::new(Arc::new(MemoryBackend::new()));
        store
            .replace(TokenSet::new("at_stale", Some("rt_1".into())))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = start_token_server(StatusCode::OK, Duration::from_millis(100)).await;
        let store = seeded_store().await;
        let refresher = coordinator(&store, settings("a", &server.url));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let refresher = refresher.clone();
            handles.push(tokio::spawn(async move { refresher.refresh(1).await }));
        }
        for handle in handles {
            let snapshot = handle.await.unwrap().unwrap();
            assert_eq!(snapshot.epoch, 2);
            assert_eq!(snapshot.tokens.access_token, "at_1");
        }
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_survives_cancelled_waiter() {
        let server = start_token_server(StatusCode::OK, Duration::from_millis(300)).await;
        let store = seeded_store().await;
        let refresher = coordinator(&store, settings("a", &server.url));

        let first = {
            let refresher = refresher.clone();
            tokio::spawn(async move { refresher.refresh(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let snapshot = refresher.refresh(1).await.unwrap();
        assert_eq!(snapshot.tokens.access_token, "at_1");
        assert_eq!(snapshot.epoch, 2);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_outcomes_are_counted_by_label() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let server = start_token_server(StatusCode::OK, Duration::from_millis(50)).await;
        let store = seeded_store().await;
        let refresher = coordinator(&store, settings("a", &server.url));

        // One starts the refresh, the other joins it.
        let (first, second) = tokio::join!(refresher.refresh(1), refresher.refresh(1));
        first.unwrap();
        second.unwrap();
        // Epoch already moved past 1.
        refresher.refresh(1).await.unwrap();
        RefreshCoordinator::new(
            store.clone(),
            reqwest::Client::new(),
            None,
            settings("b", &server.url),
        )
        .refresh(2)
        .await
        .unwrap_err();

        let output = handle.render();
        assert!(output.contains("gateway_token_refresh_total"));
        for outcome in ["refreshed", "joined", "adopted", "failed"] {
            assert!(
                output.contains(&format!("outcome=\"{outcome}\"")),
                "missing {outcome} in:\n{output}"
            );
        }
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_keeps_unrotated_refresh_token() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let store = seeded_store().await;

        coordinator(&store, settings("a", &server.url))
            .refresh(1)
            .await
            .unwrap();

        let stored = store.current().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "at_1");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt_1"));
    }

    #[tokio::test]
    async fn stale_epoch_adopts_current_tokens() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let store = seeded_store().await;
        store
            .replace(TokenSet::new("at_fresh", Some("rt_2".into())))
            .await
            .unwrap();

        let snapshot = coordinator(&store, settings("a", &server.url))
            .refresh(1)
            .await
            .unwrap();
        assert_eq!(snapshot.tokens.access_token, "at_fresh");
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sequential_refreshes_after_completion_do_not_repeat() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let store = seeded_store().await;
        let refresher = coordinator(&store, settings("a", &server.url));

        refresher.refresh(1).await.unwrap();
        // A late caller that saw the same rejected token gets the new one.
        let late = refresher.refresh(1).await.unwrap();
        assert_eq!(late.epoch, 2);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_leaves_tokens_and_releases_lease() {
        let server = start_token_server(StatusCode::BAD_REQUEST, Duration::ZERO).await;
        let store = seeded_store().await;
        let before = store.snapshot().await.unwrap();

        let err = coordinator(&store, settings("a", &server.url))
            .refresh(1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        assert_eq!(store.snapshot().await.unwrap(), before);

        let next = store
            .try_acquire_lease(1, "b", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(next, LeaseAttempt::Acquired { .. }));
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_upstream_call() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let store = TokenStore::new(Arc::new(MemoryBackend::new()));
        store.replace(TokenSet::new("at_only", None)).await.unwrap();

        let err = coordinator(&store, settings("a", &server.url))
            .refresh(1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingRefreshToken));
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_credentials_is_not_configured() {
        let store = seeded_store().await;
        let refresher = RefreshCoordinator::new(
            store,
            reqwest::Client::new(),
            None,
            settings("a", "http://127.0.0.1:1/token"),
        );
        let err = refresher.refresh(1).await.unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[tokio::test]
    async fn instances_sharing_a_file_store_refresh_once() {
        let server = start_token_server(StatusCode::OK, Duration::from_millis(150)).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        // Two gateway instances, each with its own backend handle on the file.
        let store_a = TokenStore::new(Arc::new(FileBackend::new(&path)));
        let store_b = TokenStore::new(Arc::new(FileBackend::new(&path)));
        store_a
            .replace(TokenSet::new("at_stale", Some("rt_1".into())))
            .await
            .unwrap();

        let a = coordinator(&store_a, settings("instance-a", &server.url));
        let b = coordinator(&store_b, settings("instance-b", &server.url));

        let (ra, rb) = tokio::join!(a.refresh(1), b.refresh(1));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra, rb);
        assert_eq!(ra.tokens.access_token, "at_1");
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_foreign_lease_is_taken_over() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let store = seeded_store().await;
        store
            .try_acquire_lease(1, "crashed", Duration::from_millis(100))
            .await
            .unwrap();

        let snapshot = coordinator(&store, settings("a", &server.url))
            .refresh(1)
            .await
            .unwrap();
        assert_eq!(snapshot.epoch, 2);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn live_foreign_lease_times_out() {
        let server = start_token_server(StatusCode::OK, Duration::ZERO).await;
        let store = seeded_store().await;
        store
            .try_acquire_lease(1, "stuck", Duration::from_secs(60))
            .await
            .unwrap();

        let mut short = settings("a", &server.url);
        short.lease_ttl = Duration::from_millis(50);
        let err = coordinator(&store, short).refresh(1).await.unwrap_err();
        assert!(matches!(err, Error::LeaseTimeout(holder) if holder == "stuck"));
        assert_eq!(server.calls.load(Ordering::SeqCst), 0);
    }
}
