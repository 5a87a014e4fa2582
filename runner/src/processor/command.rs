use super::{check_files, FileCheck, JobProcessor, OutputCheck, ProcessingError};
use crate::database::JobParams;
use serde_json::Value;
use std::{
    collections::VecDeque,
    fs,
    io::{BufRead, BufReader, ErrorKind},
    path::PathBuf,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, instrument, trace, warn};
use wait_timeout::ChildExt;

pub const CMD_FIELD: &str = "cmd";
pub const TIMEOUT_FIELD: &str = "timeout";
pub const OUTPUTS_FIELD: &str = "outputs";

/// number of trailing stderr lines kept for the error report
const STDERR_TAIL: usize = 20;

/// Runs the job's `cmd` through a shell.
///
/// ```json
/// { "cmd": "gdal_translate in.kea out.tif", "timeout": 3600, "outputs": ["out.tif"] }
/// ```
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    shell: PathBuf,
    default_timeout: Option<Duration>,
}

impl Default for CommandProcessor {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            default_timeout: None,
        }
    }
}

impl CommandProcessor {
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// timeout used for jobs which don't carry their own `timeout`
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn command(params: &JobParams) -> Result<&str, ProcessingError> {
        match params.get(CMD_FIELD) {
            Some(Value::String(cmd)) if !cmd.trim().is_empty() => Ok(cmd),
            Some(_) => Err(ProcessingError::Failure(format!(
                "'{CMD_FIELD}' must be a non-empty string"
            ))),
            None => Err(ProcessingError::MissingFields(vec![CMD_FIELD.to_owned()])),
        }
    }

    fn timeout(&self, params: &JobParams) -> Result<Option<Duration>, ProcessingError> {
        match params.get(TIMEOUT_FIELD) {
            None | Some(Value::Null) => Ok(self.default_timeout),
            Some(value) => match value.as_f64() {
                Some(secs) if secs.is_finite() && secs > 0.0 => {
                    Ok(Some(Duration::from_secs_f64(secs)))
                }
                _ => Err(ProcessingError::Failure(format!(
                    "'{TIMEOUT_FIELD}' must be a positive number of seconds"
                ))),
            },
        }
    }

    fn outputs(params: &JobParams) -> Vec<PathBuf> {
        match params.get(OUTPUTS_FIELD) {
            Some(Value::Array(outputs)) => outputs
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect(),
            Some(Value::String(output)) => vec![PathBuf::from(output)],
            _ => Vec::new(),
        }
    }
}

impl JobProcessor for CommandProcessor {
    fn required_fields(&self, _params: &JobParams) -> Vec<String> {
        vec![CMD_FIELD.to_owned()]
    }

    #[instrument(skip_all, level = "debug")]
    fn do_processing(&self, params: &JobParams) -> Result<(), ProcessingError> {
        let cmd = Self::command(params)?;
        let timeout = self.timeout(params)?;

        debug!("Running '{cmd}' with timeout {timeout:?}");

        let start = Instant::now();
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        // drain stderr concurrently, a full pipe would block the child forever
        let stderr = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL);

                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }

                Vec::from(tail).join("\n")
            })
        });

        let status = match timeout {
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => status,
                None => {
                    warn!("Job command ran into its timeout of {timeout:?}, killing it");
                    child.kill()?;
                    child.wait()?;

                    return Err(ProcessingError::Timeout(timeout));
                }
            },
            None => child.wait()?,
        };

        let stderr = stderr
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        debug!(
            "Finished in {} ms | status: {}",
            start.elapsed().as_millis(),
            status
        );
        trace!("Stderr: {stderr}");

        if status.success() {
            Ok(())
        } else {
            Err(ProcessingError::Exit {
                status: status.to_string(),
                stderr,
            })
        }
    }

    fn outputs_present(&self, params: &JobParams) -> OutputCheck {
        check_files(&Self::outputs(params), FileCheck::NonEmpty)
    }

    fn remove_outputs(&self, params: &JobParams) -> Result<(), ProcessingError> {
        for output in Self::outputs(params) {
            match fs::remove_file(&output) {
                Ok(()) => debug!(path = ?output, "Removed output"),
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }
}
