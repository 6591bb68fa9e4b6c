//! Token store backends
//!
//! `MemoryBackend` serves a single process (and tests). `FileBackend` shares
//! one JSON file between every process on a host or on a shared volume:
//! compare-and-swap runs under an exclusive advisory lock, and the record is
//! written with temp-file + rename so readers never see a torn write.

use std::fs::TryLockError;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::{Swap, TokenBackend, TokenRecord};

/// In-process backend.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    record: Mutex<TokenRecord>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenBackend for MemoryBackend {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<TokenRecord>> + Send + '_>> {
        Box::pin(async move { Ok(self.record.lock().await.clone()) })
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        next: TokenRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Swap>> + Send + '_>> {
        Box::pin(async move {
            let mut record = self.record.lock().await;
            if record.version != expected_version {
                return Ok(Swap::Conflict(record.clone()));
            }
            *record = TokenRecord {
                version: expected_version + 1,
                ..next
            };
            Ok(Swap::Applied(record.clone()))
        })
    }
}

/// How long to wait for the lock before giving up.
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// JSON file backend shared across processes.
///
/// Writers serialize on an advisory lock held on `<file>.lock`. The lock
/// file itself is never removed; the kernel drops the lock when its holder
/// closes the file or dies, so a crashed process cannot wedge the store.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().unwrap_or_default().to_os_string();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<TokenRecord> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing token file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TokenRecord::default()),
            Err(e) => Err(Error::Io(format!("reading token file: {e}"))),
        }
    }

    async fn lock(&self) -> Result<LockGuard> {
        if let Some(parent) = self.lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io(format!("creating token directory: {e}")))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .await
            .map_err(|e| Error::Io(format!("opening lock file: {e}")))?
            .into_std()
            .await;

        let deadline = tokio::time::Instant::now() + LOCK_WAIT;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(TryLockError::WouldBlock) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Store(format!(
                            "timed out waiting for lock {}",
                            self.lock_path.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(TryLockError::Error(e)) => {
                    return Err(Error::Io(format!("locking {}: {e}", self.lock_path.display())));
                }
            }
        }
    }
}

impl TokenBackend for FileBackend {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<TokenRecord>> + Send + '_>> {
        Box::pin(self.read())
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        next: TokenRecord,
    ) -> Pin<Box<dyn Future<Output = Result<Swap>> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.lock().await?;
            let current = self.read().await?;
            if current.version != expected_version {
                debug!(
                    expected = expected_version,
                    actual = current.version,
                    "token record version conflict"
                );
                return Ok(Swap::Conflict(current));
            }
            let record = TokenRecord {
                version: expected_version + 1,
                ..next
            };
            write_atomic(&self.path, &record).await?;
            Ok(Swap::Applied(record))
        })
    }
}

/// Holds the advisory lock until dropped, including on early return.
struct LockGuard {
    file: std::fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // flock(LOCK_UN) never blocks, so this is safe inside async code.
        if let Err(e) = self.file.unlock() {
            warn!(error = %e, "failed to release token file lock");
        }
    }
}

/// Write the record to a temp file beside `path`, then rename over it.
/// The file holds live tokens, so it is created 0600.
async fn write_atomic(path: &Path, record: &TokenRecord) -> Result<()> {
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| Error::CredentialParse(format!("serializing token record: {e}")))?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::Io(format!("creating token directory: {e}")))?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp token file: {e}")))?;

    info!(path = %path.display(), version = record.version, "token file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenSet;
    use std::sync::Arc;

    fn record_with(access: &str) -> TokenRecord {
        TokenRecord {
            version: 0,
            epoch: 1,
            tokens: Some(TokenSet::new(access, Some("rt".into()))),
            refresh_lease: None,
        }
    }

    #[tokio::test]
    async fn memory_cas_rejects_stale_version() {
        let backend = MemoryBackend::new();
        let applied = backend.compare_and_swap(0, record_with("a")).await.unwrap();
        assert!(matches!(applied, Swap::Applied(ref r) if r.version == 1));

        match backend.compare_and_swap(0, record_with("b")).await.unwrap() {
            Swap::Conflict(current) => {
                assert_eq!(current.version, 1);
                assert_eq!(current.tokens.unwrap().access_token, "a");
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_loads_as_empty_record() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("tokens.json"));
        assert_eq!(backend.load().await.unwrap(), TokenRecord::default());
    }

    #[tokio::test]
    async fn file_roundtrip_and_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let backend = FileBackend::new(&path);

        backend.compare_and_swap(0, record_with("a")).await.unwrap();

        // A second handle on the same file sees the write.
        let other = FileBackend::new(&path);
        let loaded = other.load().await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.tokens.unwrap().access_token, "a");

        let swap = other.compare_and_swap(0, record_with("b")).await.unwrap();
        assert!(matches!(swap, Swap::Conflict(_)));
    }

    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        FileBackend::new(&path)
            .compare_and_swap(0, record_with("a"))
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = FileBackend::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::CredentialParse(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn leftover_lock_file_admits_one_writer_per_version() {
        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("tokens.json");
            // Left behind by a process that died mid-swap.
            tokio::fs::write(dir.path().join("tokens.json.lock"), "")
                .await
                .unwrap();

            let mut handles = Vec::new();
            for i in 0..16 {
                let backend = FileBackend::new(&path);
                handles.push(tokio::spawn(async move {
                    backend
                        .compare_and_swap(0, record_with(&format!("at_{i}")))
                        .await
                        .unwrap()
                }));
            }
            let mut applied = 0;
            for handle in handles {
                if matches!(handle.await.unwrap(), Swap::Applied(_)) {
                    applied += 1;
                }
            }
            assert_eq!(applied, 1);
            assert_eq!(FileBackend::new(&path).load().await.unwrap().version, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn held_lock_blocks_other_handles_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let holder = FileBackend::new(&path);
        let guard = holder.lock().await.unwrap();

        let other = FileBackend::new(&path);
        let swap = tokio::spawn(async move { other.compare_and_swap(0, record_with("a")).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!swap.is_finished());

        drop(guard);
        let swap = swap.await.unwrap().unwrap();
        assert!(matches!(swap, Swap::Applied(_)));
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_through_cas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = crate::store::TokenStore::new(Arc::new(FileBackend::new(&path)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .replace(TokenSet::new(format!("at_{i}"), None))
                    .await
                    .unwrap()
            }));
        }
        let mut epochs = Vec::new();
        for handle in handles {
            epochs.push(handle.await.unwrap().epoch);
        }
        epochs.sort();
        assert_eq!(epochs, (1..=8).collect::<Vec<_>>());

        let record = FileBackend::new(&path).load().await.unwrap();
        assert_eq!(record.epoch, 8);
        assert_eq!(record.version, 8);
    }
}
