use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use once_cell::sync::Lazy;
use std::{
    ffi::{OsStr, OsString},
    fs::{self, OpenOptions},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Suffix appended to every lock file, the lock for `jobs.db` is `.jobs.db.lok`
pub const LOCK_FILE_SUFFIX: &str = ".lok";

pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 180;
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(300);

static STAGED_COUNTER: AtomicU64 = AtomicU64::new(0);

static LOCK_FILE_GLOB: Lazy<Result<GlobMatcher, globset::Error>> =
    Lazy::new(|| Glob::new(".*.lok").map(|glob| glob.compile_matcher()));

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {path:?} could not be acquired after {attempts} attempts")]
    Unavailable { path: PathBuf, attempts: u32 },
    #[error("Lock file IO failed")]
    Io(#[from] io::Error),
    #[error("Lock file pattern is invalid")]
    Pattern(#[from] globset::Error),
}

/// Derive the hidden lock file path for a protected resource
pub fn lock_file_path(resource: &Path) -> PathBuf {
    let file_name = resource.file_name().unwrap_or(OsStr::new("hpcq"));
    let mut lock_name = OsString::with_capacity(file_name.len() + 1 + LOCK_FILE_SUFFIX.len());
    lock_name.push(".");
    lock_name.push(file_name);
    lock_name.push(LOCK_FILE_SUFFIX);

    resource.with_file_name(lock_name)
}

/// Advisory lock over a single resource (usually the job store file).
///
/// Acquisition hard-links a fully written private file onto the lock path.
/// Linking fails if the target exists, so only one process can succeed even
/// when all of them poll at the same instant. The file content is the
/// creation timestamp followed by `hostname:pid` of the owner, the timestamp
/// is what `clean_stale` uses to recover locks of crashed workers.
#[derive(Debug, Clone)]
pub struct FileLock {
    resource: PathBuf,
    path: PathBuf,
    sleep_interval: Duration,
    max_attempts: u32,
    stale_timeout: Duration,
}

/// Held lock, released on drop
#[derive(Debug)]
pub struct LockGuard {
    lock: FileLock,
    released: bool,
}

impl FileLock {
    pub fn new(resource: impl Into<PathBuf>) -> Self {
        let resource = resource.into();

        Self {
            path: lock_file_path(&resource),
            resource,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, sleep_interval: Duration, max_attempts: u32) -> Self {
        self.sleep_interval = sleep_interval;
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    pub fn resource(&self) -> &Path {
        &self.resource
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    /// directory which contains the lock file, target of `clean_stale`
    pub fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn acquire(&self) -> Result<LockGuard, LockError> {
        let attempts = self.max_attempts.max(1);

        for attempt in 1..=attempts {
            let staged = self.write_staged()?;
            // linking fails with `AlreadyExists` while another process holds the lock
            let linked = fs::hard_link(&staged, &self.path);

            if let Err(error) = fs::remove_file(&staged) {
                warn!(error = ?error, path = ?staged, "Failed to remove staged lock file");
            }

            match linked {
                Ok(()) => {
                    debug!(path = ?self.path, attempt = attempt, "Acquired lock");

                    return Ok(LockGuard {
                        lock: self.clone(),
                        released: false,
                    });
                }
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                    trace!(path = ?self.path, attempt = attempt, "Lock is held by another process");

                    if attempt < attempts {
                        thread::sleep(self.sleep_interval);
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(LockError::Unavailable {
            path: self.path.clone(),
            attempts,
        })
    }

    /// Fill a private sibling with timestamp and owner, so the lock itself
    /// never exists without content
    fn write_staged(&self) -> Result<PathBuf, LockError> {
        let mut staged_name = self.path.file_name().unwrap_or_default().to_os_string();
        staged_name.push(format!(
            ".{}.{}",
            lock_owner().replace(':', "."),
            STAGED_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let staged = self.path.with_file_name(staged_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staged)?;
        let written = writeln!(file, "{}", Utc::now().to_rfc3339())
            .and_then(|_| writeln!(file, "{}", lock_owner()))
            .and_then(|_| file.sync_all());

        if let Err(error) = written {
            let _ = fs::remove_file(&staged);

            return Err(error.into());
        }

        Ok(staged)
    }

    /// Remove the lock file. Releasing an already released lock is a no-op.
    pub fn release(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = ?self.path, "Released lock"),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                trace!(path = ?self.path, "Lock was already released")
            }
            Err(error) => {
                warn!(error = ?error, path = ?self.path, "Failed to remove lock file, cleaning stale locks instead");

                if let Err(error) = clean_stale(&self.directory(), self.stale_timeout) {
                    error!(error = ?error, "Failed to clean stale locks: {error}");
                }
            }
        }
    }

    pub fn clean_stale(&self) -> Result<usize, LockError> {
        clean_stale(&self.directory(), self.stale_timeout)
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    pub fn release(mut self) {
        self.lock.release();
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.lock.release();
        }
    }
}

pub fn acquire(
    resource: &Path,
    sleep_interval: Duration,
    max_attempts: u32,
) -> Result<LockGuard, LockError> {
    FileLock::new(resource)
        .with_retry(sleep_interval, max_attempts)
        .acquire()
}

pub fn release(resource: &Path) {
    FileLock::new(resource).release()
}

/// Force-delete every lock file in `directory` that is older than `timeout` or
/// whose timestamp can't be parsed. Returns the number of removed locks.
pub fn clean_stale(directory: &Path, timeout: Duration) -> Result<usize, LockError> {
    let matcher = LOCK_FILE_GLOB.as_ref().map_err(Clone::clone)?;
    let now = Utc::now();
    let mut removed = 0;

    for entry in WalkBuilder::new(directory)
        .max_depth(Some(1))
        .standard_filters(false)
        .build()
        .filter_map(Result::ok)
    {
        if !entry.file_type().map_or(false, |kind| kind.is_file()) {
            continue;
        }

        let path = entry.path();

        if !path.file_name().map_or(false, |name| matcher.is_match(name)) {
            continue;
        }

        let is_stale = match fs::read_to_string(path) {
            Ok(content) => match parse_lock_timestamp(&content) {
                Some(created) => (now - created)
                    .to_std()
                    .map_or(false, |age| age > timeout),
                None => true,
            },
            // released between listing and reading
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => {
                warn!(error = ?error, path = ?path, "Failed to read lock file");
                continue;
            }
        };

        if is_stale {
            match fs::remove_file(path) {
                Ok(()) => {
                    info!(path = ?path, "Removed stale lock");
                    removed += 1;
                }
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => warn!(error = ?error, path = ?path, "Failed to remove stale lock"),
            }
        }
    }

    Ok(removed)
}

/// first line of a lock file, either RFC 3339 or a naive local ISO timestamp
pub(crate) fn parse_lock_timestamp(content: &str) -> Option<DateTime<Utc>> {
    let line = content.lines().next()?.trim();

    if line.is_empty() {
        return None;
    }

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(line) {
        return Some(timestamp.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(line, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|timestamp| timestamp.with_timezone(&Utc))
}

fn lock_owner() -> String {
    let hostname = nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());

    format!("{hostname}:{}", std::process::id())
}
