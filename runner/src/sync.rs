pub mod locking;

#[cfg(test)]
mod locking_test;

pub use locking::{acquire, clean_stale, lock_file_path, release, FileLock, LockError, LockGuard};
