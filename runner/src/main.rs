use hpcq_runner::{cli, processor::CommandProcessor};
use std::process::ExitCode;

fn main() -> ExitCode {
    cli::run(CommandProcessor::default())
}
