use super::{
    create_dir, sanitize_job_name, write_executable, Executor, ExecutorError, GeneratedScripts,
    Submission,
};
use crate::{
    config::SlurmConfig,
    partition::{split_by_count, write_lines, Distribution, PartitionError},
};
use std::{
    borrow::Cow,
    fs, iter,
    path::{Path, PathBuf},
};
use tera::{Context, Tera};
use tracing::{debug, info, instrument};

pub const DEFAULT_SBATCH_TEMPLATE: &str = r#"#!/bin/bash --login

{% if account %}#SBATCH --account={{ account }}
{% endif %}#SBATCH --partition={{ partition }}
#SBATCH --job-name={{ job_name }}
#SBATCH --output={{ out_log }}.%J
#SBATCH --error={{ err_log }}.%J
#SBATCH --time={{ time_limit }}
#SBATCH --ntasks={{ n_tasks }}
{% if n_cores_node %}#SBATCH --ntasks-per-node={{ n_cores_node }}
{% endif %}#SBATCH --mem-per-cpu={{ mem_per_cpu }}
{% if email_address %}#SBATCH --mail-user={{ email_address }}
#SBATCH --mail-type={{ email_type }}
{% endif %}{% if module_load %}
{{ module_load }}
{% endif %}
{% if cmd %}{{ cmd }}{% else %}parallel -N 1 --delay .2 -j $SLURM_NTASKS < {{ cmds_file }}{% endif %}
"#;

/// Generates one batch file per slot and a script submitting all of them
#[derive(Debug, Clone)]
pub struct SlurmExecutor {
    config: SlurmConfig,
}

/// one slot as seen by the template, running either a command file through
/// GNU parallel or a single command
struct Slot<'a> {
    job_name: String,
    cmds_file: Option<&'a Path>,
    cmd: Option<&'a str>,
    n_tasks: usize,
}

impl SlurmExecutor {
    pub fn new(config: SlurmConfig) -> Self {
        Self { config }
    }

    fn template(&self) -> Result<Cow<'static, str>, ExecutorError> {
        match self.config.template {
            Some(ref path) => Ok(Cow::Owned(fs::read_to_string(path)?)),
            None => Ok(Cow::Borrowed(DEFAULT_SBATCH_TEMPLATE)),
        }
    }

    fn render(&self, template: &str, slot: &Slot, log_dir: &Path) -> Result<String, ExecutorError> {
        let mut context = Context::new();
        context.insert("job_name", &slot.job_name);
        context.insert("account", self.config.account.as_deref().unwrap_or_default());
        context.insert("partition", &self.config.partition);
        context.insert(
            "out_log",
            &log_dir.join(format!("{}_log.out", slot.job_name)),
        );
        context.insert(
            "err_log",
            &log_dir.join(format!("{}_log.err", slot.job_name)),
        );
        context.insert("time_limit", &self.config.time_limit);
        context.insert("n_tasks", &slot.n_tasks);
        context.insert("mem_per_cpu", &self.config.mem_per_core_mb);
        context.insert(
            "module_load",
            self.config.module_load.as_deref().unwrap_or_default(),
        );
        context.insert(
            "email_address",
            self.config.email_address.as_deref().unwrap_or_default(),
        );
        context.insert("email_type", &self.config.email_type);
        context.insert(
            "n_cores_node",
            &self
                .config
                .n_cores_node
                .map(|n| n.to_string())
                .unwrap_or_default(),
        );
        context.insert(
            "cmds_file",
            &slot
                .cmds_file
                .map(Path::to_string_lossy)
                .unwrap_or_default(),
        );
        context.insert("cmd", slot.cmd.unwrap_or_default());

        Ok(Tera::one_off(template, &context, false)?)
    }

    /// Render one batch file per slot and the `sbatch` script for all of them
    fn write_batch_files(
        &self,
        command_files: &[PathBuf],
        job_dir: &Path,
    ) -> Result<GeneratedScripts, ExecutorError> {
        let log_dir = create_dir(&self.config.log_dir)?;
        let template = self.template()?;
        let job_name = sanitize_job_name(&self.config.job_name);
        let mut files = Vec::with_capacity(command_files.len() * 2);
        let mut sbatch = Vec::with_capacity(command_files.len());

        for (n, cmds_file) in command_files.iter().enumerate() {
            let slot = Slot {
                job_name: format!("{job_name}_{n}"),
                cmds_file: Some(cmds_file),
                cmd: None,
                n_tasks: self.config.n_cores_per_job,
            };

            let batch_file = job_dir.join(format!("job_file_{n}.sbatch"));
            fs::write(&batch_file, self.render(&template, &slot, &log_dir)?)?;
            debug!(file = ?batch_file, "Wrote batch file");

            sbatch.push(format!("sbatch {}", batch_file.to_string_lossy()));
            files.push(cmds_file.clone());
            files.push(batch_file);
        }

        self.write_run_script(&sbatch)?;

        Ok(GeneratedScripts {
            run_script: self.config.run_script.clone(),
            files,
        })
    }

    fn write_run_script(&self, sbatch: &[String]) -> Result<(), ExecutorError> {
        let mut run_script = sbatch.join("\n");
        run_script.push('\n');

        Ok(write_executable(&self.config.run_script, &run_script)?)
    }

    /// Batch file running one command directly, without GNU parallel.
    /// Written to `batch_file`, or `job_file_single.sbatch` in the job directory.
    #[instrument(skip(self), level = "info")]
    pub fn generate_single(
        &self,
        command: &str,
        batch_file: Option<&Path>,
    ) -> Result<GeneratedScripts, ExecutorError> {
        self.validate()?;

        let command = match self.config.prefix {
            Some(ref prefix) => format!("{prefix} {command}"),
            None => command.to_owned(),
        };
        let batch_file = match batch_file {
            Some(path) => path.to_path_buf(),
            None => create_dir(&self.config.job_dir)?.join("job_file_single.sbatch"),
        };

        let log_dir = create_dir(&self.config.log_dir)?;
        let slot = Slot {
            job_name: sanitize_job_name(&self.config.job_name),
            cmds_file: None,
            cmd: Some(&command),
            n_tasks: self.config.n_cores_per_job,
        };

        fs::write(&batch_file, self.render(&self.template()?, &slot, &log_dir)?)?;
        self.write_run_script(&[format!("sbatch {}", batch_file.to_string_lossy())])?;
        info!(file = ?batch_file, "Generated batch file for a single command");

        Ok(GeneratedScripts {
            run_script: self.config.run_script.clone(),
            files: vec![batch_file],
        })
    }

    /// Submit an arbitrary command list: the commands are dealt over
    /// `n_jobs` slots and run through `srun` inside every slot.
    #[instrument(skip_all, level = "info")]
    pub fn generate_for_commands(
        &self,
        commands: &[String],
    ) -> Result<GeneratedScripts, ExecutorError> {
        self.validate()?;

        let commands = commands
            .iter()
            .map(|command| match self.config.prefix {
                Some(ref prefix) => format!("srun -n1 -N1 {prefix} {command}"),
                None => format!("srun -n1 -N1 {command}"),
            })
            .collect::<Vec<_>>();
        let groups = split_by_count(&commands, self.config.n_jobs, Distribution::Dealt)?;

        let job_dir = create_dir(&self.config.job_dir)?;
        let mut command_files = Vec::with_capacity(groups.len());

        // fewer commands than slots leaves some groups empty
        for (n, group) in groups.iter().filter(|group| !group.is_empty()).enumerate() {
            let cmds_file = job_dir.join(format!("cmds_{n}.sh"));
            write_lines(&cmds_file, group)?;
            command_files.push(cmds_file);
        }

        let scripts = self.write_batch_files(&command_files, &job_dir)?;
        info!(
            commands = commands.len(),
            slots = command_files.len(),
            "Generated batch files for command list"
        );

        Ok(scripts)
    }
}

impl Executor for SlurmExecutor {
    fn validate(&self) -> Result<(), ExecutorError> {
        if self.config.n_jobs == 0 {
            return Err(PartitionError::InvalidPartition("n_jobs").into());
        }

        if self.config.n_cores_per_job == 0 {
            return Err(PartitionError::InvalidPartition("n_cores_per_job").into());
        }

        Ok(())
    }

    #[instrument(skip_all, level = "debug")]
    fn write_scripts(&self, submission: &Submission) -> Result<GeneratedScripts, ExecutorError> {
        let job_dir = create_dir(&self.config.job_dir)?;
        let copies = self.config.n_cores_per_job + self.config.n_extra_commands;
        let commands = iter::repeat(submission.worker_command())
            .take(copies)
            .collect::<Vec<_>>();

        let mut command_files = Vec::with_capacity(self.config.n_jobs);

        for n in 0..self.config.n_jobs {
            let cmds_file = job_dir.join(format!("jobcmds_{n}.sh"));
            write_lines(&cmds_file, &commands)?;
            command_files.push(cmds_file);
        }

        self.write_batch_files(&command_files, &job_dir)
    }
}
