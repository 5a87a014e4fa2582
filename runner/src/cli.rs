//! Command line surface of the queue, shared by the `hpcq` binary and any
//! binary that plugs its own [`JobProcessor`] into [`run`].


use crate::{
    config::{ConfigErrors, QueueConfig},
    database::{ConnectionError, JobStore, Pid},
    executors::{ExecutorError, Executors, SlurmExecutor},
    partition::{self, Distribution, Partition, PartitionError},
    processor::JobProcessor,
    report::{self, ReportError},
    reset::{self, ResetScope},
    worker::{DebugAction, Worker, WorkerError, WorkerSettings},
};
use clap::{ArgGroup, Parser};
use std::{
    error::Error as StdError,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// environment variable holding the log filter
pub const LOG_ENV: &str = "HPCQ_LOG";

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to generate submission scripts")]
    Executor(#[from] ExecutorError),
    #[error("Failed to split the command list")]
    Partition(#[from] PartitionError),
    #[error("Job store failure")]
    Connection(#[from] ConnectionError),
    #[error("Worker terminated")]
    Worker(#[from] WorkerError),
    #[error("Failed to create the report")]
    Report(#[from] ReportError),
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
}

/// Decentralised job queue for HPC batch processing
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(group(ArgGroup::new("mode").multiple(false)))]
#[command(group(ArgGroup::new("prefixed").args(["split", "prefix_commands"])))]
pub struct Cli {
    /// Populate the job store and write the submission scripts described by --config
    #[arg(long, group = "mode", requires = "config")]
    pub generate: bool,

    /// Queue configuration (YAML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Submit a plain command list to Slurm using the slurm section of --config
    #[arg(long, value_name = "FILE", group = "mode", requires = "config")]
    pub submit_commands: Option<PathBuf>,

    /// Write a Slurm batch file running a single command, using the slurm section of --config
    #[arg(long, value_name = "CMD", group = "mode", requires = "config")]
    pub submit_command: Option<String>,

    /// Split a command list into group files
    #[arg(long, value_name = "FILE", group = "mode", requires = "output")]
    pub split: Option<PathBuf>,

    /// Write a copy of a command list with --prefix prepended to every command
    #[arg(long, value_name = "FILE", group = "mode", requires_all = ["output", "prefix"])]
    pub prefix_commands: Option<PathBuf>,

    /// Output base name for --split, prefixed list for --prefix-commands,
    /// batch file for --submit-command, report file for --report
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    #[arg(long, requires = "split", conflicts_with = "groups")]
    pub group_size: Option<usize>,

    #[arg(long, requires = "split")]
    pub groups: Option<usize>,

    /// Deal commands round-robin instead of contiguous blocks
    #[arg(long, requires = "split")]
    pub deal: bool,

    /// Prepended to every command, e.g. a container launcher
    #[arg(long, requires = "prefixed")]
    pub prefix: Option<String>,

    /// Store descriptor written by --generate
    #[arg(short = 'd', long, value_name = "FILE", visible_alias = "dbinfo")]
    pub storeinfo: Option<PathBuf>,

    /// Debug a single job without touching its bookkeeping
    #[arg(short, long, value_name = "PID", group = "mode")]
    pub job: Option<Pid>,

    #[arg(long, requires = "job", conflicts_with = "removeoutputs")]
    pub printparams: bool,

    #[arg(long, requires = "job")]
    pub removeoutputs: bool,

    /// Check the outputs of all completed jobs
    #[arg(long, group = "mode")]
    pub check: bool,

    /// Write the failed PIDs and their errors into timestamped files
    #[arg(long, requires = "check")]
    pub check_files: bool,

    #[arg(long, group = "mode")]
    pub report: bool,

    /// Remove job outputs and make the jobs claimable again
    #[arg(long, group = "mode")]
    pub reset: bool,

    #[arg(long, requires = "reset", conflicts_with = "errors_only")]
    pub all: bool,

    #[arg(long, requires = "reset")]
    pub errors_only: bool,

    /// Skip the random sleep before the first claim
    #[arg(long)]
    pub no_jitter: bool,

    #[arg(short, long)]
    pub verbose: bool,
}

/// Log to stderr, filtered by `HPCQ_LOG`, stdout is reserved for reports
pub fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        debug!("Logging was already initialised");
    }
}

/// Parse the arguments, initialise logging and run the selected mode
pub fn run<P: JobProcessor>(processor: P) -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match execute(&cli, processor) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");

            let mut source = error.source();
            while let Some(cause) = source {
                error!("  caused by: {cause}");
                source = cause.source();
            }

            ExitCode::FAILURE
        }
    }
}

pub fn execute<P: JobProcessor>(cli: &Cli, processor: P) -> Result<(), CliError> {
    if cli.generate {
        return generate(config_path(cli)?);
    }

    if let Some(ref commands) = cli.submit_commands {
        return submit_commands(config_path(cli)?, commands);
    }

    if let Some(ref command) = cli.submit_command {
        return submit_command(config_path(cli)?, command, cli.output.as_deref());
    }

    if let Some(ref input) = cli.split {
        return split(cli, input);
    }

    if let Some(ref input) = cli.prefix_commands {
        return prefix_commands(cli, input);
    }

    let store = match cli.storeinfo {
        Some(ref descriptor) => JobStore::load(descriptor)?,
        None => return Err(CliError::MissingArgument("--storeinfo")),
    };

    if cli.check {
        let summary = report::check_outputs(&store, &processor)?;

        if cli.check_files {
            summary.write_files(Path::new("."))?;
        }

        if summary.is_ok() {
            println!("Checks complete, all {} jobs have their outputs", summary.checked);
        } else {
            println!("{} jobs failed the check", summary.failures.len());
        }
    } else if cli.report {
        report::report(&store)?.write(cli.output.as_deref())?;
    } else if cli.reset {
        let scope = match (cli.all, cli.errors_only) {
            (true, false) => ResetScope::All,
            (false, true) => ResetScope::ErrorOnly,
            _ => return Err(CliError::MissingArgument("--all or --errors-only")),
        };
        let summary = reset::remove_outputs(&store, &processor, scope)?;
        info!(reset = summary.reset, failed = summary.failed, "Reset jobs");
    } else {
        let mut settings = WorkerSettings::default();
        if cli.no_jitter {
            settings = settings.without_jitter();
        }

        let worker = Worker::new(store, processor, settings);

        match cli.job {
            Some(pid) => {
                let action = if cli.printparams {
                    DebugAction::PrintParams
                } else if cli.removeoutputs {
                    DebugAction::RemoveOutputs
                } else {
                    DebugAction::Run
                };

                worker.run_single(pid, action)?;
            }
            None => {
                worker.run()?;
            }
        }
    }

    Ok(())
}

fn config_path(cli: &Cli) -> Result<&Path, CliError> {
    cli.config
        .as_deref()
        .ok_or(CliError::MissingArgument("--config"))
}

fn generate(path: &Path) -> Result<(), CliError> {
    let config = QueueConfig::load(path)?;
    config.preflight_checks()?;

    let params = config.load_params()?;
    let submission = config.submission()?;
    let scripts = Executors::load(&config.executor)?.generate(&submission, &params)?;

    println!("{}", scripts.run_script.to_string_lossy());

    Ok(())
}

fn submit_commands(path: &Path, commands: &Path) -> Result<(), CliError> {
    let config = QueueConfig::load(path)?;
    let slurm = config.slurm()?;

    if !slurm.checks() {
        return Err(ConfigErrors::InvalidConfig.into());
    }

    let commands = partition::read_commands(commands).map_err(PartitionError::from)?;
    let scripts = SlurmExecutor::new(slurm.clone()).generate_for_commands(&commands)?;

    println!("{}", scripts.run_script.to_string_lossy());

    Ok(())
}

fn submit_command(path: &Path, command: &str, batch_file: Option<&Path>) -> Result<(), CliError> {
    let config = QueueConfig::load(path)?;
    let slurm = config.slurm()?;

    if !slurm.checks() {
        return Err(ConfigErrors::InvalidConfig.into());
    }

    let scripts = SlurmExecutor::new(slurm.clone()).generate_single(command, batch_file)?;

    println!("{}", scripts.run_script.to_string_lossy());

    Ok(())
}

fn output_path(cli: &Cli) -> Result<&Path, CliError> {
    cli.output
        .as_deref()
        .ok_or(CliError::MissingArgument("--output"))
}

fn prefix_commands(cli: &Cli, input: &Path) -> Result<(), CliError> {
    let output = output_path(cli)?;
    let prefix = cli
        .prefix
        .as_deref()
        .ok_or(CliError::MissingArgument("--prefix"))?;

    let commands = partition::read_commands(input).map_err(PartitionError::from)?;
    let prefixed = partition::prefix_commands(&commands, prefix);
    partition::write_lines(output, &prefixed).map_err(PartitionError::from)?;
    info!(commands = prefixed.len(), output = ?output, "Wrote prefixed command list");

    println!("{}", output.to_string_lossy());

    Ok(())
}

fn split(cli: &Cli, input: &Path) -> Result<(), CliError> {
    let output = output_path(cli)?;
    let partition = match (cli.group_size, cli.groups) {
        (Some(size), None) => Partition::GroupSize(size),
        (None, Some(count)) => Partition::GroupCount(count),
        _ => return Err(CliError::MissingArgument("--group-size or --groups")),
    };
    let distribution = if cli.deal {
        Distribution::Dealt
    } else {
        Distribution::Contiguous
    };

    let written = partition::split_commands_file(
        input,
        output,
        partition,
        distribution,
        cli.prefix.as_deref(),
    )?;

    println!("{}", written.manifest.to_string_lossy());

    Ok(())
}
