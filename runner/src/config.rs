
use crate::{
    database::{ConnectionError, JobParams, StoreDescriptor},
    executors::Submission,
    partition::read_commands,
    processor::command::CMD_FIELD,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// length of the unique id used in generated descriptor names
const UID_LEN: usize = 6;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read the configuration")]
    Io(#[from] std::io::Error),
    #[error("Configuration is not valid YAML")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Job parameter file is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("Configuration failed the preflight checks")]
    InvalidConfig,
    #[error("Configuration has no '{0}' executor section")]
    MissingExecutor(&'static str),
    #[error("Job parameters are invalid: {0}")]
    InvalidParams(String),
    #[error("Failed to set up the store descriptor")]
    Store(#[from] ConnectionError),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// worker invocation, `--storeinfo <descriptor>` is appended to it
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub store: StoreConfig,
    /// descriptor file handed to every worker
    #[serde(default)]
    pub descriptor: Option<PathBuf>,
    #[serde(default)]
    pub jobs: JobSource,
    pub executor: ExecutorConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    /// resource the lock is taken on, defaults to the database itself
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            lock_file: None,
        }
    }
}

/// Exactly one of the two has to be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JobSource {
    /// one shell command per line, each becomes `{"cmd": <line>}`
    pub commands: Option<PathBuf>,
    /// JSON array of parameter objects
    pub params: Option<PathBuf>,
}

/// Exactly one of the two has to be set
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    pub local: Option<LocalConfig>,
    pub slurm: Option<SlurmConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
    pub n_cores: usize,
    #[serde(default = "default_run_script")]
    pub run_script: PathBuf,
    #[serde(default = "default_cmds_file")]
    pub cmds_file: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SlurmConfig {
    pub job_name: String,
    pub mem_per_core_mb: u64,
    pub log_dir: PathBuf,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default = "default_n_cores_per_job")]
    pub n_cores_per_job: usize,
    /// additional worker copies per slot, replacing workers that die early
    #[serde(default)]
    pub n_extra_commands: usize,
    #[serde(default = "default_n_jobs")]
    pub n_jobs: usize,
    #[serde(default = "default_time_limit")]
    pub time_limit: String,
    #[serde(default = "default_module_load")]
    pub module_load: Option<String>,
    #[serde(default = "default_job_dir")]
    pub job_dir: PathBuf,
    #[serde(default = "default_run_script")]
    pub run_script: PathBuf,
    /// custom tera template for the batch files
    #[serde(default)]
    pub template: Option<PathBuf>,
    /// prepended to every command of a submitted command list
    #[serde(default)]
    pub prefix: Option<String>,
    /// mail Slurm notifications to this address
    #[serde(default)]
    pub email_address: Option<String>,
    #[serde(default = "default_email_type")]
    pub email_type: String,
    /// pin the tasks of a slot to this many per node
    #[serde(default)]
    pub n_cores_node: Option<usize>,
}

impl QueueConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// Validate everything `--generate` needs. Every problem is logged
    /// before failing.
    pub fn preflight_checks(&self) -> Result<(), ConfigErrors> {
        let mut contains_error = false;

        if self.command.trim().is_empty() {
            error!("command must be set to the worker invocation, e.g. 'hpcq'");
            contains_error = true;
        }

        match (&self.jobs.commands, &self.jobs.params) {
            (Some(_), Some(_)) => {
                error!("jobs.commands and jobs.params are mutually exclusive");
                contains_error = true;
            }
            (None, None) => {
                error!("jobs requires either 'commands' or 'params'");
                contains_error = true;
            }
            (Some(path), None) | (None, Some(path)) if !path.is_file() => {
                error!("Job source {} is not a file", path.to_string_lossy());
                contains_error = true;
            }
            _ => {}
        }

        if !self.executor_checks() {
            contains_error = true;
        }

        if let Some(ref lock_file) = self.store.lock_file {
            if lock_file == &self.store.path {
                warn!("store.lock_file equals store.path, this is the default and can be omitted");
            }
        }

        if contains_error {
            Err(ConfigErrors::InvalidConfig)
        } else {
            Ok(())
        }
    }

    /// returns false if any problem was found
    fn executor_checks(&self) -> bool {
        let mut valid = true;

        match (&self.executor.local, &self.executor.slurm) {
            (Some(_), Some(_)) => {
                error!("executor.local and executor.slurm are mutually exclusive");
                valid = false;
            }
            (None, None) => {
                error!("executor requires either a 'local' or a 'slurm' section");
                valid = false;
            }
            (Some(local), None) => {
                if local.n_cores == 0 {
                    error!("executor.local.n_cores must be greater than zero");
                    valid = false;
                }
            }
            (None, Some(slurm)) => valid = slurm.checks(),
        }

        valid
    }

    /// Read the configured job source into one parameter set per job
    pub fn load_params(&self) -> Result<Vec<JobParams>, ConfigErrors> {
        match (&self.jobs.commands, &self.jobs.params) {
            (Some(commands), None) => Ok(read_commands(commands)?
                .into_iter()
                .map(|command| {
                    let mut params = JobParams::new();
                    params.insert(CMD_FIELD.to_owned(), Value::String(command));
                    params
                })
                .collect()),
            (None, Some(params)) => {
                let content = fs::read_to_string(params)?;

                match serde_json::from_str::<Value>(&content)? {
                    Value::Array(jobs) => jobs
                        .into_iter()
                        .enumerate()
                        .map(|(index, job)| match job {
                            Value::Object(params) => Ok(params),
                            _ => Err(ConfigErrors::InvalidParams(format!(
                                "entry {index} is not an object"
                            ))),
                        })
                        .collect(),
                    _ => Err(ConfigErrors::InvalidParams(
                        "expected a JSON array of objects".to_owned(),
                    )),
                }
            }
            _ => Err(ConfigErrors::InvalidConfig),
        }
    }

    /// configured descriptor path, or `process_db_info_<uid>.json` in the working directory
    pub fn descriptor_path(&self) -> Result<PathBuf, ConfigErrors> {
        let path = match self.descriptor {
            Some(ref path) => path.clone(),
            None => {
                let uid = Uuid::new_v4().simple().to_string();
                PathBuf::from(format!("process_db_info_{}.json", &uid[..UID_LEN]))
            }
        };

        Ok(std::path::absolute(path)?)
    }

    pub fn submission(&self) -> Result<Submission, ConfigErrors> {
        let store = StoreDescriptor::sqlite(&self.store.path, self.store.lock_file.as_deref())?;
        let descriptor_path = self.descriptor_path()?;
        info!(descriptor = ?descriptor_path, "Workers will use the store descriptor");

        Ok(Submission::new(self.command.clone(), store, descriptor_path))
    }

    pub fn slurm(&self) -> Result<&SlurmConfig, ConfigErrors> {
        self.executor
            .slurm
            .as_ref()
            .ok_or(ConfigErrors::MissingExecutor("slurm"))
    }
}

impl SlurmConfig {
    /// returns false if any problem was found
    pub fn checks(&self) -> bool {
        let mut valid = true;

        if self.job_name.trim().is_empty() {
            error!("executor.slurm.job_name must not be empty");
            valid = false;
        }

        for (name, value) in [
            ("n_jobs", self.n_jobs),
            ("n_cores_per_job", self.n_cores_per_job),
        ] {
            if value == 0 {
                error!("executor.slurm.{name} must be greater than zero");
                valid = false;
            }
        }

        if self.mem_per_core_mb == 0 {
            error!("executor.slurm.mem_per_core_mb must be greater than zero");
            valid = false;
        }

        if self.n_cores_node == Some(0) {
            error!("executor.slurm.n_cores_node must be greater than zero");
            valid = false;
        }

        if let Some(ref email_address) = self.email_address {
            if !email_address.contains('@') {
                error!("executor.slurm.email_address '{email_address}' is not an address");
                valid = false;
            }
        }

        if let Some(ref template) = self.template {
            if !template.is_file() {
                error!(
                    "executor.slurm.template {} is not a file",
                    template.to_string_lossy()
                );
                valid = false;
            }
        }

        valid
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("hpcq_jobs.db")
}

fn default_run_script() -> PathBuf {
    PathBuf::from("run_exe_analysis.sh")
}

fn default_cmds_file() -> PathBuf {
    PathBuf::from("process_cmds.sh")
}

fn default_email_type() -> String {
    "END".to_owned()
}

fn default_partition() -> String {
    "compute".to_owned()
}

fn default_n_cores_per_job() -> usize {
    10
}

fn default_n_jobs() -> usize {
    10
}

fn default_time_limit() -> String {
    "2-23:59".to_owned()
}

fn default_module_load() -> Option<String> {
    Some("module load parallel".to_owned())
}

fn default_job_dir() -> PathBuf {
    PathBuf::from("job_scripts")
}
