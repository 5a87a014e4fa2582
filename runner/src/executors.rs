mod local;
mod slurm;

#[cfg(test)]
mod executors_test;

pub use local::LocalExecutor;
pub use slurm::{SlurmExecutor, DEFAULT_SBATCH_TEMPLATE};

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    database::{ConnectionError, JobParams, JobStore, StoreDescriptor},
    partition::PartitionError,
};
use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to populate the job store or write its descriptor")]
    Store(#[from] ConnectionError),
    #[error("Failed to partition the command list")]
    Partition(#[from] PartitionError),
    #[error("Failed to render the batch file template")]
    Template(#[from] tera::Error),
    #[error("Failed to write submission scripts")]
    Io(#[from] io::Error),
}

/// Worker invocation plus the store every worker connects to
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub command: String,
    pub store: StoreDescriptor,
    pub descriptor_path: PathBuf,
}

impl Submission {
    pub fn new(command: String, store: StoreDescriptor, descriptor_path: PathBuf) -> Self {
        Self {
            command,
            store,
            descriptor_path,
        }
    }

    /// `<command> --storeinfo <descriptor>`
    pub fn worker_command(&self) -> String {
        format!(
            "{} --storeinfo {}",
            self.command,
            self.descriptor_path.to_string_lossy()
        )
    }

    /// Populate the store with `params` and write the descriptor next to it
    pub fn prepare(&self, params: &[JobParams]) -> Result<usize, ExecutorError> {
        let jobs = JobStore::new(self.store.clone())?.populate(params)?;
        self.store.write(&self.descriptor_path)?;
        info!(descriptor = ?self.descriptor_path, "Wrote store descriptor");

        Ok(jobs)
    }
}

/// Files produced by a generator, `run_script` starts everything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScripts {
    pub run_script: PathBuf,
    pub files: Vec<PathBuf>,
}

pub trait Executor {
    /// reject settings that can't produce a single worker, before the store is touched
    fn validate(&self) -> Result<(), ExecutorError>;

    fn write_scripts(&self, submission: &Submission) -> Result<GeneratedScripts, ExecutorError>;
}

#[derive(Clone, Debug)]
pub enum Executors {
    Local(LocalExecutor),
    Slurm(SlurmExecutor),
}

impl Executors {
    pub fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        match (&config.local, &config.slurm) {
            (Some(local), None) => Ok(Self::Local(LocalExecutor::new(local.clone()))),
            (None, Some(slurm)) => Ok(Self::Slurm(SlurmExecutor::new(slurm.clone()))),
            _ => Err(ConfigErrors::InvalidConfig),
        }
    }

    fn executor(&self) -> &dyn Executor {
        match self {
            Self::Local(executor) => executor,
            Self::Slurm(executor) => executor,
        }
    }

    /// Validate, populate the store, write the descriptor and the scripts
    #[instrument(skip_all, level = "info")]
    pub fn generate(
        &self,
        submission: &Submission,
        params: &[JobParams],
    ) -> Result<GeneratedScripts, ExecutorError> {
        let executor = self.executor();
        executor.validate()?;

        let jobs = submission.prepare(params)?;
        let scripts = executor.write_scripts(submission)?;

        info!(
            jobs = jobs,
            run_script = ?scripts.run_script,
            "Generated submission scripts"
        );

        Ok(scripts)
    }
}

/// Slurm job names: ASCII only, dashes and whitespace become single underscores,
/// punctuation other than `_` is dropped
pub fn sanitize_job_name(name: &str) -> String {
    let mut sanitized = String::with_capacity(name.len());

    for character in name.chars().filter(char::is_ascii) {
        if character == '-' || character.is_ascii_whitespace() || character == '_' {
            if !sanitized.ends_with('_') {
                sanitized.push('_');
            }
        } else if character.is_ascii_alphanumeric() {
            sanitized.push(character);
        }
    }

    sanitized
}

pub(crate) fn write_executable(path: &Path, content: &str) -> io::Result<()> {
    fs::write(path, content)?;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
}

pub(crate) fn create_dir(path: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(path)?;

    std::path::absolute(path)
}
