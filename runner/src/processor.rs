pub mod command;

#[cfg(test)]
mod command_test;

pub use command::CommandProcessor;

use crate::database::JobParams;
use std::{collections::BTreeMap, fs, path::Path, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Job parameters are missing the required fields {0:?}")]
    MissingFields(Vec<String>),
    #[error("Processing failed: {0}")]
    Failure(String),
    #[error("Job command exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("Job command ran into the timeout of {0:?}")]
    Timeout(Duration),
    #[error("Failed to spawn or wait for the job command")]
    Io(#[from] std::io::Error),
}

/// Result of an output presence check, keyed by artefact
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputCheck {
    pub present: bool,
    pub errors: BTreeMap<String, String>,
}

impl OutputCheck {
    pub fn ok() -> Self {
        Self {
            present: true,
            errors: BTreeMap::new(),
        }
    }

    pub fn from_errors(errors: BTreeMap<String, String>) -> Self {
        Self {
            present: errors.is_empty(),
            errors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCheck {
    Exists,
    NonEmpty,
}

/// Check a list of expected output files, every problem becomes one entry
pub fn check_files<P: AsRef<Path>>(files: &[P], check: FileCheck) -> OutputCheck {
    let mut errors = BTreeMap::new();

    for file in files {
        let file = file.as_ref();
        let key = file.to_string_lossy().into_owned();

        match fs::metadata(file) {
            Ok(metadata) if check == FileCheck::NonEmpty && metadata.len() == 0 => {
                errors.insert(key, "File is empty.".to_owned());
            }
            Ok(_) => {}
            Err(error) => {
                errors.insert(key, format!("File does not exist: {error}"));
            }
        }
    }

    OutputCheck::from_errors(errors)
}

/// The unit of work executed by a worker for every claimed job.
///
/// Implementations are injected into the worker, the reporting flows and the
/// command line entry point. None of the methods may assume exclusive access
/// to the job store, they only ever see the job's parameters.
pub trait JobProcessor {
    /// Fields `params` has to contain before `do_processing` is called
    fn required_fields(&self, params: &JobParams) -> Vec<String>;

    fn do_processing(&self, params: &JobParams) -> Result<(), ProcessingError>;

    fn outputs_present(&self, params: &JobParams) -> OutputCheck;

    fn remove_outputs(&self, params: &JobParams) -> Result<(), ProcessingError>;

    fn check_required_fields(&self, params: &JobParams) -> Result<(), ProcessingError> {
        let missing: Vec<String> = self
            .required_fields(params)
            .into_iter()
            .filter(|field| !params.contains_key(field))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ProcessingError::MissingFields(missing))
        }
    }
}

impl<P: JobProcessor + ?Sized> JobProcessor for &P {
    fn required_fields(&self, params: &JobParams) -> Vec<String> {
        (**self).required_fields(params)
    }

    fn do_processing(&self, params: &JobParams) -> Result<(), ProcessingError> {
        (**self).do_processing(params)
    }

    fn outputs_present(&self, params: &JobParams) -> OutputCheck {
        (**self).outputs_present(params)
    }

    fn remove_outputs(&self, params: &JobParams) -> Result<(), ProcessingError> {
        (**self).remove_outputs(params)
    }
}
