//! Cross-process mutual exclusion for catalog writers.
//!
//! Worker processes do not share memory, so the lock lives on the filesystem:
//! a marker file next to the store whose presence means "locked". Acquisition
//! is an exclusive create (`O_CREAT | O_EXCL`); a caller that finds the marker
//! already present sleeps for the poll interval and tries again, with no upper
//! bound on the wait. Release deletes the marker and tolerates it being gone.
//!
//! A process that dies while holding the marker leaves every writer blocked
//! until an operator removes it. [`LockManager::with_stale_after`] enables an
//! opt-in takeover of markers older than a threshold. Takeovers are
//! serialized by a second exclusive marker, `<lock>.break`, and the age is
//! re-checked while it is held, so only a marker that is still stale is ever
//! removed. The threshold must be longer than any real critical section.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Default delay between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Informational contents of the marker file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    lock_path: PathBuf,
    poll_interval: Duration,
    stale_after: Option<Duration>,
}

impl LockManager {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: None,
        }
    }

    /// Lock guarding `store_path`, using the `<store_path>.lock` marker.
    pub fn for_store(store_path: &Path) -> Self {
        Self::new(default_lock_path(store_path))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Waits until this process holds the lock. Not reentrant.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let mut contended = false;

        loop {
            if let Some(guard) = self.try_acquire().await? {
                if contended {
                    tracing::debug!("Acquired catalog lock {:?} after waiting", self.lock_path);
                }
                return Ok(guard);
            }

            if contended {
                tracing::debug!("Catalog lock {:?} still held, retrying", self.lock_path);
            } else {
                tracing::info!("Catalog is locked, waiting for {:?}", self.lock_path);
                contended = true;
            }

            if self.break_stale_lock().await? {
                continue;
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Single acquisition attempt; `None` when another holder owns the marker.
    pub async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let Some((mut file, guard)) = create_marker(&self.lock_path).await? else {
            return Ok(None);
        };

        let holder = LockHolder {
            pid: std::process::id(),
            holder_id: ulid::Ulid::new().to_string(),
            acquired_at: Utc::now(),
        };
        let payload = serde_json::to_vec(&holder)?;
        file.write_all(&payload).await?;
        file.flush().await?;

        Ok(Some(guard))
    }

    /// Removes the marker regardless of who created it.
    pub async fn release(&self) -> Result<()> {
        remove_marker(&self.lock_path).await
    }

    /// Reads the current holder, if the marker exists and is readable.
    pub async fn current_holder(&self) -> Option<LockHolder> {
        let bytes = fs::read(&self.lock_path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Returns `true` when the caller should retry at once.
    async fn break_stale_lock(&self) -> Result<bool> {
        let Some(stale_after) = self.stale_after else {
            return Ok(false);
        };

        match self.marker_age().await? {
            None => return Ok(true),
            Some(age) if age < stale_after => return Ok(false),
            Some(_) => {}
        }

        let Some((_, breaker)) = create_marker(&breaker_path(&self.lock_path)).await? else {
            tracing::debug!("Another waiter is taking over {:?}", self.lock_path);
            return Ok(false);
        };

        // Another waiter may have replaced the marker since the first look.
        let age = match self.marker_age().await? {
            None => return finish_break(breaker, true).await,
            Some(age) if age < stale_after => return finish_break(breaker, false).await,
            Some(age) => age,
        };

        let holder = self.current_holder().await;
        tracing::warn!(
            "Taking over stale catalog lock {:?}: age={:?} holder={:?}",
            self.lock_path,
            age,
            holder
        );
        let removed = remove_marker(&self.lock_path).await;
        let released = breaker.release().await;
        removed?;
        released?;
        Ok(true)
    }

    async fn marker_age(&self) -> Result<Option<Duration>> {
        match fs::metadata(&self.lock_path).await {
            Ok(metadata) => Ok(Some(metadata.modified()?.elapsed().unwrap_or_default())),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

async fn finish_break(breaker: LockGuard, retry: bool) -> Result<bool> {
    breaker.release().await?;
    Ok(retry)
}

fn breaker_path(lock_path: &Path) -> PathBuf {
    let mut raw = lock_path.as_os_str().to_owned();
    raw.push(".break");
    PathBuf::from(raw)
}

/// Exclusive create of `path`. The guard exists before anything is written so
/// a failed write still removes the marker.
async fn create_marker(path: &Path) -> Result<Option<(fs::File, LockGuard)>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    let guard = LockGuard {
        lock_path: path.to_path_buf(),
        released: false,
    };
    Ok(Some((file, guard)))
}

pub fn default_lock_path(store_path: &Path) -> PathBuf {
    let mut raw = store_path.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

/// Held lock. Dropping it without calling [`LockGuard::release`] still removes
/// the marker, synchronously.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        remove_marker(&self.lock_path).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(error) = std::fs::remove_file(&self.lock_path) {
            if error.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    "Failed to remove catalog lock {:?} on drop: {}",
                    self.lock_path,
                    error
                );
            }
        }
    }
}

async fn remove_marker(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn acquire_creates_marker_and_release_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockManager::for_store(&dir.path().join("db.json"));
        assert_eq!(lock.lock_path(), dir.path().join("db.json.lock"));

        let guard = lock.acquire().await.unwrap();
        assert!(lock.lock_path().exists());

        let holder = lock.current_holder().await.unwrap();
        assert_eq!(holder.pid, std::process::id());

        guard.release().await.unwrap();
        assert!(!lock.lock_path().exists());

        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockManager::new(dir.path().join("catalog.lock"))
            .with_poll_interval(Duration::from_millis(10));

        let guard = lock.acquire().await.unwrap();
        assert!(lock.try_acquire().await.unwrap().is_none());

        let waiter_lock = lock.clone();
        let waiter = tokio::spawn(async move {
            let guard = waiter_lock.acquire().await.unwrap();
            guard.release().await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        guard.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter acquired the lock")
            .unwrap();
        assert!(!lock.lock_path().exists());
    }

    #[tokio::test]
    async fn dropped_guard_releases_marker() {
        let dir = tempfile::tempdir().unwrap();
        let lock = LockManager::new(dir.path().join("nested").join("catalog.lock"));

        {
            let _guard = lock.acquire().await.unwrap();
            assert!(lock.lock_path().exists());
        }

        assert!(!lock.lock_path().exists());
    }

    #[tokio::test]
    async fn stale_marker_is_taken_over_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.lock");
        std::fs::write(&path, b"left behind").unwrap();

        let strict = LockManager::new(&path);
        assert!(strict.try_acquire().await.unwrap().is_none());

        let lenient = LockManager::new(&path)
            .with_poll_interval(Duration::from_millis(10))
            .with_stale_after(Some(Duration::ZERO));
        let guard = tokio::time::timeout(Duration::from_secs(5), lenient.acquire())
            .await
            .expect("stale lock taken over")
            .unwrap();

        assert!(lenient.current_holder().await.is_some());
        guard.release().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_waiters_take_over_stale_marker_one_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.lock");
        std::fs::write(&path, b"left behind").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(std::time::SystemTime::now() - Duration::from_secs(2 * 60 * 60))
            .unwrap();

        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut waiters = Vec::new();
        for _ in 0..16 {
            let lock = LockManager::new(&path)
                .with_poll_interval(Duration::from_millis(1))
                .with_stale_after(Some(Duration::from_secs(60 * 60)));
            let holders = holders.clone();
            let max_holders = max_holders.clone();

            waiters.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let guard = lock.acquire().await.unwrap();
                    let current = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    guard.release().await.unwrap();
                }
            }));
        }

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(30), waiter)
                .await
                .expect("waiter finished")
                .unwrap();
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
        assert!(!breaker_path(&path).exists());
    }
}
