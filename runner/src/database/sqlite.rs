use super::{ConnectionError, JobParams, JobRecord, Pid, StoreDescriptor};
use crate::sync::{FileLock, LockGuard};
use chrono::{DateTime, Utc};
use rusqlite::{
    params, types::Type, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior,
};
use serde_json::Value;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, error, info, trace, warn};

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

const JOB_COLUMNS: &str = "pid, params, started, start_time, completed, end_time, checked, error, error_info";

/// Subsets of the job table used by the reporting and reset flows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobFilter {
    All,
    Unchecked,
    StartedNotCompleted,
    OrphansOrErrors,
}

impl JobFilter {
    fn condition(&self) -> &'static str {
        match self {
            Self::All => "1 = 1",
            Self::Unchecked => "checked = 0",
            Self::StartedNotCompleted => "started = 1 and completed = 0",
            Self::OrphansOrErrors => "error = 1 or (started = 1 and completed = 0)",
        }
    }
}

/// A single connection to the SQLite job store, opened per operation
#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
    path: PathBuf,
}

impl InnerConnection {
    /// open an existing store, a missing file is reported as unavailable
    pub fn open(path: &Path) -> Result<Self, ConnectionError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        Self::with_flags(path, flags)
    }

    pub fn create(path: &Path) -> Result<Self, ConnectionError> {
        Self::with_flags(path, OpenFlags::default())
    }

    fn with_flags(path: &Path, flags: OpenFlags) -> Result<Self, ConnectionError> {
        let unavailable = |source| ConnectionError::StoreUnavailable {
            path: path.to_path_buf(),
            source,
        };

        let connection = Connection::open_with_flags(path, flags).map_err(unavailable)?;
        // readers that bypass the file lock still have to wait for a committing writer
        connection
            .busy_timeout(Duration::from_secs(30))
            .map_err(unavailable)?;

        for pragma in SQL_PRAGMAS {
            connection
                .execute_batch(pragma)
                .map_err(unavailable)?;
        }

        trace!(path = ?path, "Opened job store connection");

        Ok(Self {
            connection,
            path: path.to_path_buf(),
        })
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!(path = ?self.path, "Failed to close job store connection");

                return Err(ConnectionError::SQLite(error));
            }
        }

        trace!(path = ?self.path, "Closed job store connection");

        Ok(())
    }

    /// insert all jobs in a single transaction, PIDs follow the input order
    pub fn insert_jobs(&mut self, jobs: &[JobParams]) -> Result<usize, ConnectionError> {
        let tx = self.connection.transaction()?;

        for (pid, params) in jobs.iter().enumerate() {
            tx.prepare_cached("insert into jobs (pid, params) values (?, ?)")?
                .execute(params![pid as Pid, serde_json::to_string(params)?])?;
        }
        tx.commit()?;

        Ok(jobs.len())
    }

    /// Flip the oldest unclaimed job to started. Only call while holding the store lock.
    pub fn claim_next(&mut self) -> Result<Option<JobRecord>, ConnectionError> {
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = tx
            .prepare_cached(&format!(
                "select {JOB_COLUMNS} from jobs
                 where started = 0 and completed = 0
                 order by pid asc limit 1"
            ))?
            .query_row([], job_from_row)
            .optional()?;

        let job = match job {
            Some(mut job) => {
                let now = Utc::now();
                tx.prepare_cached("update jobs set started = 1, start_time = ? where pid = ?")?
                    .execute(params![now, job.pid])?;

                job.started = true;
                job.start = Some(now);

                Some(job)
            }
            None => None,
        };
        tx.commit()?;

        Ok(job)
    }

    pub fn mark_completed(&self, pid: Pid) -> Result<bool, ConnectionError> {
        self.update(
            "update jobs set completed = 1, error = 0, end_time = ? where pid = ?",
            params![Utc::now(), pid],
        )
    }

    pub fn mark_error(&self, pid: Pid, error_info: &Value) -> Result<bool, ConnectionError> {
        self.update(
            "update jobs set completed = 0, error = 1, error_info = ?, end_time = null
             where pid = ?",
            params![serde_json::to_string(error_info)?, pid],
        )
    }

    pub fn mark_checked(&self, pid: Pid) -> Result<bool, ConnectionError> {
        self.update("update jobs set checked = 1 where pid = ?", params![pid])
    }

    /// make an orphaned job claimable again
    pub fn reset_orphan(&self, pid: Pid) -> Result<bool, ConnectionError> {
        self.update(
            "update jobs set started = 0 where pid = ? and started = 1 and completed = 0",
            params![pid],
        )
    }

    /// clear all progress of a job so it runs again from scratch
    pub fn reset_job(&self, pid: Pid) -> Result<bool, ConnectionError> {
        self.update(
            "update jobs set started = 0, completed = 0, error = 0, checked = 0,
             start_time = null, end_time = null, error_info = null
             where pid = ?",
            params![pid],
        )
    }

    pub fn get(&self, pid: Pid) -> Result<Option<JobRecord>, ConnectionError> {
        Ok(self
            .connection
            .prepare_cached(&format!("select {JOB_COLUMNS} from jobs where pid = ?"))?
            .query_row(params![pid], job_from_row)
            .optional()?)
    }

    pub fn scan(&self, filter: JobFilter) -> Result<Vec<JobRecord>, ConnectionError> {
        self.connection
            .prepare_cached(&format!(
                "select {JOB_COLUMNS} from jobs where {} order by pid asc",
                filter.condition()
            ))?
            .query_map([], job_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<JobRecord>, ConnectionError>(init)
            })
    }

    fn update<P: rusqlite::Params>(&self, query: &str, params: P) -> Result<bool, ConnectionError> {
        let changed = self.connection.prepare_cached(query)?.execute(params)?;

        Ok(changed > 0)
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row,
    index: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(index)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|error| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(error))),
        None => Ok(None),
    }
}

fn job_from_row(row: &Row) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        pid: row.get(0)?,
        params: json_column(row, 1)?.unwrap_or_default(),
        started: row.get(2)?,
        start: row.get::<_, Option<DateTime<Utc>>>(3)?,
        completed: row.get(4)?,
        end: row.get::<_, Option<DateTime<Utc>>>(5)?,
        checked: row.get(6)?,
        error: row.get(7)?,
        error_info: json_column(row, 8)?,
    })
}

/// Handle on the shared job store as seen by a single process.
///
/// Every mutating operation except `populate` opens its own connection while
/// holding the store's `FileLock`, runs one transaction and closes the
/// connection again before the lock is released. Workers share no memory, so
/// this file lock is what guarantees that a job is claimed at most once.
#[derive(Debug, Clone)]
pub struct JobStore {
    descriptor: StoreDescriptor,
    database: PathBuf,
    lock: FileLock,
}

impl JobStore {
    pub fn new(descriptor: StoreDescriptor) -> Result<Self, ConnectionError> {
        let database = descriptor.database_path()?;
        let lock = FileLock::new(&descriptor.lock_file_path);

        Ok(Self {
            descriptor,
            database,
            lock,
        })
    }

    pub fn load(descriptor_path: &Path) -> Result<Self, ConnectionError> {
        Self::new(StoreDescriptor::load(descriptor_path)?)
    }

    pub fn with_lock(mut self, lock: FileLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    pub fn lock(&self) -> &FileLock {
        &self.lock
    }

    /// Discard any previous batch and insert one job per entry of `jobs`.
    /// Not lock guarded, must finish before any worker starts.
    pub fn populate(&self, jobs: &[JobParams]) -> Result<usize, ConnectionError> {
        match fs::remove_file(&self.database) {
            Ok(()) => info!(path = ?self.database, "Removed previous job store"),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let mut connection = InnerConnection::create(&self.database)?;
        connection.init()?;
        let inserted = connection.insert_jobs(jobs)?;
        connection.close()?;

        info!(path = ?self.database, jobs = inserted, "Populated job store");

        Ok(inserted)
    }

    pub fn claim_next(&self) -> Result<Option<JobRecord>, ConnectionError> {
        let job = self.locked(|connection| connection.claim_next())?;

        match job {
            Some(ref job) => debug!(pid = job.pid, "Claimed job"),
            None => debug!("No unclaimed job left"),
        }

        Ok(job)
    }

    pub fn mark_completed(&self, pid: Pid) -> Result<(), ConnectionError> {
        if !self.locked(|connection| connection.mark_completed(pid))? {
            warn!(pid = pid, "Tried to complete a job which doesn't exist");
        }

        Ok(())
    }

    pub fn mark_error(&self, pid: Pid, error_info: &Value) -> Result<(), ConnectionError> {
        if !self.locked(|connection| connection.mark_error(pid, error_info))? {
            warn!(pid = pid, "Tried to record an error for a job which doesn't exist");
        }

        Ok(())
    }

    pub fn mark_checked(&self, pid: Pid) -> Result<(), ConnectionError> {
        self.locked(|connection| connection.mark_checked(pid))?;

        Ok(())
    }

    pub fn reset_orphan(&self, pid: Pid) -> Result<bool, ConnectionError> {
        self.locked(|connection| connection.reset_orphan(pid))
    }

    pub fn reset_job(&self, pid: Pid) -> Result<bool, ConnectionError> {
        self.locked(|connection| connection.reset_job(pid))
    }

    /// read a single job without touching the lock, used by the debug mode
    pub fn get(&self, pid: Pid) -> Result<JobRecord, ConnectionError> {
        self.read(|connection| connection.get(pid))?
            .ok_or(ConnectionError::JobNotFound(pid))
    }

    pub fn scan_all(&self) -> Result<Vec<JobRecord>, ConnectionError> {
        self.read(|connection| connection.scan(JobFilter::All))
    }

    pub fn scan_unchecked(&self) -> Result<Vec<JobRecord>, ConnectionError> {
        self.read(|connection| connection.scan(JobFilter::Unchecked))
    }

    pub fn scan_started_not_completed(&self) -> Result<Vec<JobRecord>, ConnectionError> {
        self.read(|connection| connection.scan(JobFilter::StartedNotCompleted))
    }

    pub fn scan_orphans_or_errors(&self) -> Result<Vec<JobRecord>, ConnectionError> {
        self.read(|connection| connection.scan(JobFilter::OrphansOrErrors))
    }

    fn read<T>(
        &self,
        operation: impl FnOnce(&InnerConnection) -> Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        let connection = InnerConnection::open(&self.database)?;
        let result = operation(&connection)?;
        connection.close()?;

        Ok(result)
    }

    fn locked<T>(
        &self,
        operation: impl FnOnce(&mut InnerConnection) -> Result<T, ConnectionError>,
    ) -> Result<T, ConnectionError> {
        let guard: LockGuard = self.lock.acquire()?;
        let mut connection = InnerConnection::open(&self.database)?;
        let result = operation(&mut connection)?;
        connection.close()?;
        guard.release();

        Ok(result)
    }
}

// NOTE: timestamps are stored as text by rusqlite's chrono support,
// params and error info as JSON text
pub const SQL_SCHEMA: [&str; 3] = [
    "drop table if exists jobs;",
    "create table jobs (
    pid integer primary key,
    params text not null,
    started boolean not null default 0,
    start_time text,
    completed boolean not null default 0,
    end_time text,
    checked boolean not null default 0,
    error boolean not null default 0,
    error_info text
);",
    "create index if not exists jobs_unclaimed on jobs (started, completed, pid);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

pub const SQL_PRAGMAS: [&str; 3] = [
    "pragma journal_mode = truncate;",
    "pragma synchronous = on;",
    "pragma temp_store = memory;",
];
