//! Cross-process advisory locking and versioned YAML documents.
//!
//! # Lock protocol
//!
//! The lock for `<file>` is the sidecar `<file>.lock`, created with
//! `O_CREAT | O_EXCL` so exactly one process wins. Its content
//! (`{pid, hostname, created}`) is informational only; holding the lock means
//! the sidecar exists and is younger than [`LockOptions::stale_after`].
//!
//! Acquisition flow, per attempt:
//! 1. Sidecar present and fresh → back off (`min_backoff * 2^attempt`, capped
//!    at `max_backoff`) and retry.
//! 2. Sidecar present and stale → rename it aside, then delete it (holder
//!    presumed crashed).
//! 3. Exclusive create → success, or back off on `AlreadyExists`.
//!
//! After `retries` attempts the caller gets [`StateError::LockAcquisition`].
//!
//! Reclaiming renames the sidecar to a name unique to the caller, so when
//! several processes see the same stale lock only one of them moves it. A
//! contender whose staleness check raced with another's reclaim can still
//! move the winner's fresh sidecar; the moved file is re-checked and linked
//! back into place when it turns out to be live. One window remains: if a
//! third process creates the lock between that move and the link-back, the
//! original holder's sidecar is dropped and two holders overlap.
//!
//! # Versioned documents
//!
//! Lock-managed YAML files carry `_version` / `_last_modified` next to their
//! own fields (see [`Versioned`]). Every write bumps `_version` by exactly one.
//! Writes go to a `.tmp` sibling and are renamed into place, so unlocked
//! readers never see a torn file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, StateError};

/// Suffix appended to a file path to form its lock sidecar.
pub const LOCK_SUFFIX: &str = ".lock";

/// Suffix of the scratch file [`write_atomic`] renames into place.
pub const TMP_SUFFIX: &str = ".tmp";

static RECLAIM_SEQ: AtomicU64 = AtomicU64::new(0);

/// What to do when a state file exists but cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CorruptionPolicy {
    /// Log a warning and continue with the default document.
    #[default]
    Recover,
    /// Fail with [`StateError::Parse`].
    Fail,
}

/// Tuning for lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Age after which an existing lock is presumed abandoned.
    pub stale_after: Duration,
    /// Total acquisition attempts before giving up.
    pub retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub corruption: CorruptionPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            retries: 10,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            corruption: CorruptionPolicy::Recover,
        }
    }
}

impl LockOptions {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max;
        self
    }

    pub fn with_corruption(mut self, policy: CorruptionPolicy) -> Self {
        self.corruption = policy;
        self
    }
}

/// Content of a `.lock` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken {
    pub pid: u32,
    pub hostname: String,
    pub created: DateTime<Utc>,
}

impl LockToken {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string()),
            created: Utc::now(),
        }
    }
}

/// A YAML document managed under the lock, with its optimistic version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Versioned<T> {
    #[serde(rename = "_version", default)]
    pub version: u64,
    #[serde(
        rename = "_last_modified",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Versioned<T> {
    pub fn new(data: T) -> Self {
        Self {
            version: 0,
            last_modified: None,
            data,
        }
    }
}

/// Outcome of [`StateLock::optimistic_update`].
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticUpdate<T> {
    /// The write went through; `version` is the new `_version`.
    Applied { version: u64 },
    /// Someone else wrote first. `current` is what is on disk now.
    Conflict { current: Versioned<T> },
}

/// Held lock. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Release explicitly, surfacing any I/O error that `Drop` would swallow.
    pub fn release(mut self) -> Result<(), StateError> {
        self.released = true;
        remove_lock_file(&self.lock_path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = remove_lock_file(&self.lock_path) {
                tracing::warn!(path = %self.lock_path.display(), error = %err, "failed to release lock");
            }
        }
    }
}

/// File-based mutual exclusion plus versioned read/modify/write helpers.
#[derive(Debug, Clone, Default)]
pub struct StateLock {
    options: LockOptions,
}

impl StateLock {
    pub fn new(options: LockOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// `<path>.lock`. Pure, no I/O.
    pub fn lock_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(LOCK_SUFFIX);
        PathBuf::from(os)
    }

    /// True when the lock file is older than the staleness threshold, or
    /// cannot be stat'ed at all.
    pub fn is_lock_stale(&self, lock_path: &Path) -> bool {
        let modified = match fs::metadata(lock_path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return true,
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        age > self.options.stale_after
    }

    /// Acquire the lock for `path`, retrying with exponential backoff.
    pub fn acquire_lock(&self, path: &Path) -> Result<LockGuard, StateError> {
        let lock_path = Self::lock_path(path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }

        for attempt in 0..self.options.retries {
            if lock_path.exists() {
                if self.is_lock_stale(&lock_path) {
                    self.reclaim_stale(&lock_path)?;
                } else {
                    tracing::debug!(path = %lock_path.display(), attempt, "lock busy, backing off");
                    std::thread::sleep(self.backoff(attempt));
                    continue;
                }
            }

            match create_lock_file(&lock_path) {
                Ok(()) => {
                    return Ok(LockGuard {
                        lock_path,
                        released: false,
                    })
                }
                Err(StateError::Io { source, .. }) if source.kind() == ErrorKind::AlreadyExists => {
                    tracing::debug!(path = %lock_path.display(), attempt, "lost lock race, backing off");
                    std::thread::sleep(self.backoff(attempt));
                }
                Err(e) => return Err(e),
            }
        }

        Err(StateError::LockAcquisition {
            path: path.to_path_buf(),
            attempts: self.options.retries,
        })
    }

    /// Delete the lock sidecar for `path`. Already gone counts as released.
    pub fn release_lock(&self, path: &Path) -> Result<(), StateError> {
        remove_lock_file(&Self::lock_path(path))
    }

    /// Run `op` while holding the lock for `path`; the lock is released on
    /// every exit path, including errors and panics.
    pub fn with_lock<T, E, F>(&self, path: &Path, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StateError>,
    {
        let guard = self.acquire_lock(path)?;
        let result = op();
        match guard.release() {
            Ok(()) => result,
            Err(release_err) => {
                tracing::warn!(path = %path.display(), error = %release_err, "lock release failed");
                result
            }
        }
    }

    /// Read a versioned document. Missing or empty files yield the default
    /// document at `_version: 0`; unparsable files follow the configured
    /// [`CorruptionPolicy`].
    pub fn read_yaml<T>(&self, path: &Path) -> Result<Versioned<T>, StateError>
    where
        T: DeserializeOwned + Default,
    {
        read_versioned(path, self.options.corruption)
    }

    /// Like [`read_yaml`](Self::read_yaml) but always fails on corrupt content.
    pub fn read_yaml_strict<T>(&self, path: &Path) -> Result<Versioned<T>, StateError>
    where
        T: DeserializeOwned + Default,
    {
        read_versioned(path, CorruptionPolicy::Fail)
    }

    /// Stamp `_version = old + 1` and `_last_modified = now`, then write
    /// atomically. Returns the new version.
    ///
    /// Callers mutating shared files must hold the lock (see
    /// [`update_yaml_with_version`](Self::update_yaml_with_version)).
    pub fn write_yaml<T>(&self, path: &Path, doc: &mut Versioned<T>) -> Result<u64, StateError>
    where
        T: Serialize,
    {
        doc.version += 1;
        doc.last_modified = Some(Utc::now());
        let yaml = serde_yaml::to_string(doc)?;
        write_atomic(path, yaml.as_bytes())?;
        Ok(doc.version)
    }

    /// Lock, read, apply `modifier`, bump the version, write, unlock.
    pub fn update_yaml_with_version<T, F>(
        &self,
        path: &Path,
        modifier: F,
    ) -> Result<Versioned<T>, StateError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        self.with_lock(path, || {
            let mut doc: Versioned<T> = self.read_yaml(path)?;
            modifier(&mut doc.data);
            self.write_yaml(path, &mut doc)?;
            Ok(doc)
        })
    }

    /// Compare-and-swap: write `new_data` at `expected_version + 1` only if the
    /// file is still at `expected_version`. A mismatch is not an error; the
    /// caller gets the current document back and may retry.
    pub fn optimistic_update<T>(
        &self,
        path: &Path,
        expected_version: u64,
        new_data: T,
    ) -> Result<OptimisticUpdate<T>, StateError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        self.with_lock(path, || {
            let current: Versioned<T> = self.read_yaml(path)?;
            if current.version != expected_version {
                tracing::debug!(
                    path = %path.display(),
                    expected = expected_version,
                    found = current.version,
                    "optimistic update conflict"
                );
                return Ok(OptimisticUpdate::Conflict { current });
            }
            let mut doc = Versioned {
                version: expected_version,
                last_modified: current.last_modified,
                data: new_data,
            };
            let version = self.write_yaml(path, &mut doc)?;
            Ok(OptimisticUpdate::Applied { version })
        })
    }

    /// Move a stale sidecar aside and delete it. Losing the rename to another
    /// reclaimer is fine; a sidecar that turns out to be live once moved is
    /// linked back unless the slot has been taken again.
    fn reclaim_stale(&self, lock_path: &Path) -> Result<(), StateError> {
        let aside = reclaim_path(lock_path);
        match fs::rename(lock_path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_err(lock_path, e)),
        }

        if self.is_lock_stale(&aside) {
            tracing::info!(path = %lock_path.display(), "reclaimed stale lock");
        } else {
            match fs::hard_link(&aside, lock_path) {
                Ok(()) => {
                    tracing::debug!(path = %lock_path.display(), "restored live lock moved during reclaim");
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    tracing::warn!(path = %lock_path.display(), "live lock replaced during reclaim");
                }
                Err(e) => {
                    let _ = remove_lock_file(&aside);
                    return Err(io_err(lock_path, e));
                }
            }
        }
        remove_lock_file(&aside)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.options
            .min_backoff
            .saturating_mul(factor)
            .min(self.options.max_backoff)
    }
}

/// Write `bytes` to `<path>.tmp` then rename over `path`.
///
/// The `.tmp` sibling lives in the same directory (same filesystem), and is
/// removed again if the rename fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

fn read_versioned<T>(path: &Path, policy: CorruptionPolicy) -> Result<Versioned<T>, StateError>
where
    T: DeserializeOwned + Default,
{
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Versioned::default()),
        Err(e) => return Err(io_err(path, e)),
    };
    if contents.trim().is_empty() {
        return Ok(Versioned::default());
    }
    match serde_yaml::from_str(&contents) {
        Ok(doc) => Ok(doc),
        Err(source) => match policy {
            CorruptionPolicy::Recover => {
                tracing::warn!(
                    path = %path.display(),
                    error = %source,
                    "corrupt state file, continuing with default document"
                );
                Ok(Versioned::default())
            }
            CorruptionPolicy::Fail => Err(StateError::Parse {
                path: path.to_path_buf(),
                source,
            }),
        },
    }
}

fn create_lock_file(lock_path: &Path) -> Result<(), StateError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
        .map_err(|e| io_err(lock_path, e))?;
    let token = serde_json::to_vec(&LockToken::current())?;
    if let Err(e) = file.write_all(&token) {
        drop(file);
        let _ = fs::remove_file(lock_path);
        return Err(io_err(lock_path, e));
    }
    Ok(())
}

/// `<lock>.reclaim-<pid>-<seq>`, unique per process and call.
fn reclaim_path(lock_path: &Path) -> PathBuf {
    let seq = RECLAIM_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut os = lock_path.as_os_str().to_owned();
    os.push(format!(".reclaim-{}-{seq}", std::process::id()));
    PathBuf::from(os)
}

fn remove_lock_file(lock_path: &Path) -> Result<(), StateError> {
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(lock_path, e)),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
