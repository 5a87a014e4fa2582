use super::{write_executable, Executor, ExecutorError, GeneratedScripts, Submission};
use crate::{config::LocalConfig, partition::{write_lines, PartitionError}};
use std::iter;
use tracing::{debug, instrument};

/// Runs `n_cores` workers on the local machine through GNU parallel
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    config: LocalConfig,
}

impl LocalExecutor {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }
}

impl Executor for LocalExecutor {
    fn validate(&self) -> Result<(), ExecutorError> {
        if self.config.n_cores == 0 {
            return Err(PartitionError::InvalidPartition("n_cores").into());
        }

        Ok(())
    }

    #[instrument(skip_all, level = "debug")]
    fn write_scripts(&self, submission: &Submission) -> Result<GeneratedScripts, ExecutorError> {
        let commands = iter::repeat(submission.worker_command())
            .take(self.config.n_cores)
            .collect::<Vec<_>>();
        write_lines(&self.config.cmds_file, &commands)?;
        debug!(file = ?self.config.cmds_file, copies = commands.len(), "Wrote worker commands");

        write_executable(
            &self.config.run_script,
            &format!(
                "parallel -j {} < {}\n",
                self.config.n_cores,
                self.config.cmds_file.to_string_lossy()
            ),
        )?;

        Ok(GeneratedScripts {
            run_script: self.config.run_script.clone(),
            files: vec![self.config.cmds_file.clone()],
        })
    }
}
