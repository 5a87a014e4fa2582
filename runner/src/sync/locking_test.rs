use super::locking::{
    acquire, clean_stale, lock_file_path, parse_lock_timestamp, release, FileLock, LockError,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};
use tempfile::TempDir;

fn write_lock(dir: &TempDir, name: &str, age_secs: i64) -> PathBuf {
    let path = dir.path().join(name);
    let created = Utc::now() - ChronoDuration::seconds(age_secs);
    fs::write(&path, format!("{}\nnode01:42\n", created.to_rfc3339())).unwrap();

    path
}

#[test]
pub fn lock_path_is_hidden_sibling() {
    assert_eq!(
        lock_file_path(&PathBuf::from("/data/queue/jobs.db")),
        PathBuf::from("/data/queue/.jobs.db.lok")
    );
    assert_eq!(
        lock_file_path(&PathBuf::from("jobs.db")),
        PathBuf::from(".jobs.db.lok")
    );
}

#[test]
pub fn acquire_writes_timestamp() {
    let dir = TempDir::new().unwrap();
    let resource = dir.path().join("jobs.db");

    let guard = acquire(&resource, Duration::from_millis(1), 1).unwrap();
    let content = fs::read_to_string(guard.path()).unwrap();

    let created = parse_lock_timestamp(&content).expect("timestamp in lock file");
    assert!((Utc::now() - created).num_seconds() < 5);
    assert!(content.lines().nth(1).unwrap().contains(':'));
}

#[test]
pub fn second_acquire_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let resource = dir.path().join("jobs.db");
    let lock = FileLock::new(&resource).with_retry(Duration::from_millis(1), 3);

    let _guard = lock.acquire().unwrap();

    match lock.acquire() {
        Err(LockError::Unavailable { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected lock to be unavailable, got {other:?}"),
    }
}

#[test]
pub fn guard_drop_releases() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::new(dir.path().join("jobs.db")).with_retry(Duration::from_millis(1), 1);

    {
        let _guard = lock.acquire().unwrap();
        assert!(lock.path().exists());
    }

    assert!(!lock.path().exists());
    assert!(lock.acquire().is_ok());
}

#[test]
pub fn release_twice_is_noop() {
    let dir = TempDir::new().unwrap();
    let resource = dir.path().join("jobs.db");

    let guard = acquire(&resource, Duration::from_millis(1), 1).unwrap();
    guard.release();

    release(&resource);
    release(&resource);
    assert!(!lock_file_path(&resource).exists());
}

#[test]
pub fn clean_stale_respects_timeout() {
    let dir = TempDir::new().unwrap();
    let old = write_lock(&dir, ".old.db.lok", 120);
    let fresh = write_lock(&dir, ".fresh.db.lok", 10);

    let removed = clean_stale(dir.path(), Duration::from_secs(60)).unwrap();

    assert_eq!(removed, 1);
    assert!(!old.exists());
    assert!(fresh.exists());
}

#[test]
pub fn clean_stale_removes_unparsable() {
    let dir = TempDir::new().unwrap();
    let empty = dir.path().join(".empty.db.lok");
    let garbage = dir.path().join(".garbage.db.lok");
    let unrelated = dir.path().join("jobs.db");
    fs::write(&empty, "").unwrap();
    fs::write(&garbage, "yesterday-ish\n").unwrap();
    fs::write(&unrelated, "not a lock").unwrap();

    let removed = clean_stale(dir.path(), Duration::from_secs(3600)).unwrap();

    assert_eq!(removed, 2);
    assert!(!empty.exists());
    assert!(!garbage.exists());
    assert!(unrelated.exists());
}

#[test]
pub fn naive_timestamps_are_accepted() {
    assert!(parse_lock_timestamp("2020-05-13T10:15:30.123456\n").is_some());
    assert!(parse_lock_timestamp("2020-05-13T10:15:30+00:00").is_some());
    assert!(parse_lock_timestamp("   \n").is_none());
}

#[test]
pub fn held_lock_survives_concurrent_stale_cleanup() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::new(dir.path().join("jobs.db")).with_retry(Duration::from_millis(1), 100);
    let done = AtomicBool::new(false);

    let (vanished, removed) = thread::scope(|scope| {
        let cleaner = scope.spawn(|| {
            let mut removed = 0;
            while !done.load(Ordering::Acquire) {
                removed += clean_stale(dir.path(), Duration::from_secs(3600)).unwrap();
            }
            removed
        });

        let mut vanished = 0;
        for _ in 0..2000 {
            let guard = lock.acquire().unwrap();
            if !guard.path().exists() {
                vanished += 1;
            }
            guard.release();
        }
        done.store(true, Ordering::Release);

        (vanished, cleaner.join().unwrap())
    });

    assert_eq!(vanished, 0);
    assert_eq!(removed, 0);
    // staged files are gone once the lock is released
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
pub fn failed_release_falls_back_to_stale_cleanup() {
    let dir = TempDir::new().unwrap();
    let lock = FileLock::new(dir.path().join("jobs.db")).with_stale_timeout(Duration::from_secs(60));
    // a directory at the lock path can't be removed with `remove_file`
    fs::create_dir(lock.path()).unwrap();
    let stale = write_lock(&dir, ".other.db.lok", 120);

    lock.release();

    assert!(lock.path().is_dir());
    assert!(!stale.exists());
}
