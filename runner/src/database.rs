pub mod sqlite;


pub use sqlite::{InnerConnection, JobStore};

use crate::sync::LockError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Sequential job identifier, assigned at population time starting at 0
pub type Pid = i64;

/// Opaque key/value payload handed to the processing routine
pub type JobParams = serde_json::Map<String, Value>;

/// `sqlite:///jobs.db` is relative to the working directory, `sqlite:////data/jobs.db` absolute
pub const SQLITE_SCHEME: &str = "sqlite:///";

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Job store {path:?} is unavailable")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("SQLite error")]
    SQLite(rusqlite::Error),
    #[error("Failed to (de)serialize job payload")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to lock the job store")]
    Lock(#[from] LockError),
    #[error("No job with PID {0} exists")]
    JobNotFound(Pid),
    #[error("Unsupported store connection string '{0}', only sqlite:/// is supported")]
    UnsupportedBackend(String),
    #[error("Store descriptor IO failed")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub pid: Pid,
    pub params: JobParams,
    pub started: bool,
    pub start: Option<DateTime<Utc>>,
    pub completed: bool,
    pub end: Option<DateTime<Utc>>,
    pub checked: bool,
    pub error: bool,
    pub error_info: Option<Value>,
}

impl JobRecord {
    /// Started but neither completed nor errored, i.e., the worker died mid-job
    pub fn is_orphan(&self) -> bool {
        self.started && !self.completed && !self.error
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if self.completed => Some(end - start),
            _ => None,
        }
    }
}

/// Connection info shared with every worker through a small JSON file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StoreDescriptor {
    #[serde(alias = "db_conn_str")]
    pub store_connection_string: String,
    #[serde(alias = "lck_file")]
    pub lock_file_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite_db_file: Option<PathBuf>,
}

impl StoreDescriptor {
    /// Descriptor for a single SQLite file, the lock defaults to the database itself
    pub fn sqlite(database: &Path, lock_file: Option<&Path>) -> Result<Self, ConnectionError> {
        let database = std::path::absolute(database)?;
        let lock_file_path = match lock_file {
            Some(lock_file) => std::path::absolute(lock_file)?,
            None => database.clone(),
        };

        Ok(Self {
            store_connection_string: format!("{SQLITE_SCHEME}{}", database.to_string_lossy()),
            lock_file_path,
            sqlite_db_file: Some(database),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        let content = fs::read_to_string(path)?;

        Ok(serde_json::from_str(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), ConnectionError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content + "\n")?;

        Ok(())
    }

    /// Path of the SQLite file backing this store
    pub fn database_path(&self) -> Result<PathBuf, ConnectionError> {
        if let Some(ref path) = self.sqlite_db_file {
            return Ok(path.clone());
        }

        match self.store_connection_string.strip_prefix(SQLITE_SCHEME) {
            Some(path) if !path.is_empty() => Ok(std::path::absolute(path)?),
            _ => Err(ConnectionError::UnsupportedBackend(
                self.store_connection_string.clone(),
            )),
        }
    }
}
