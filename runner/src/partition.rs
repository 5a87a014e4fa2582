//! Splitting of ordered command lists into groups, e.g., one group per
//! scheduler slot.


use itertools::Itertools;
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("Invalid partition: {0} must be greater than zero")]
    InvalidPartition(&'static str),
    #[error("Failed to read or write command files")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// groups of exactly `k` commands, plus a trailing remainder group
    GroupSize(usize),
    /// `m` groups, `k = ceil(n / m)` commands each
    GroupCount(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// `[0, k), [k, 2k), ...`
    #[default]
    Contiguous,
    /// command `i` goes to group `i mod groups`, like dealing cards
    Dealt,
}

/// Files written for a partitioned command list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionOutput {
    pub files: Vec<PathBuf>,
    pub manifest: PathBuf,
}

pub fn split<T: Clone>(
    commands: &[T],
    partition: Partition,
    distribution: Distribution,
) -> Result<Vec<Vec<T>>, PartitionError> {
    match partition {
        Partition::GroupSize(size) => split_by_size(commands, size, distribution),
        Partition::GroupCount(count) => split_by_count(commands, count, distribution),
    }
}

pub fn split_by_size<T: Clone>(
    commands: &[T],
    size: usize,
    distribution: Distribution,
) -> Result<Vec<Vec<T>>, PartitionError> {
    if size == 0 {
        return Err(PartitionError::InvalidPartition("group size"));
    }

    Ok(match distribution {
        Distribution::Contiguous => commands.chunks(size).map(<[T]>::to_vec).collect(),
        Distribution::Dealt => deal(commands, commands.len().div_ceil(size)),
    })
}

pub fn split_by_count<T: Clone>(
    commands: &[T],
    count: usize,
    distribution: Distribution,
) -> Result<Vec<Vec<T>>, PartitionError> {
    if count == 0 {
        return Err(PartitionError::InvalidPartition("group count"));
    }

    if commands.is_empty() {
        return Ok(Vec::new());
    }

    match distribution {
        Distribution::Contiguous => {
            let size = commands.len().div_ceil(count);
            debug!("There will be {size} commands per group");

            split_by_size(commands, size, distribution)
        }
        // dealing into exactly `count` groups keeps every slot within one command of the others
        Distribution::Dealt => Ok(deal(commands, count)),
    }
}

fn deal<T: Clone>(commands: &[T], groups: usize) -> Vec<Vec<T>> {
    let mut dealt = vec![Vec::new(); groups];

    for (index, command) in commands.iter().enumerate() {
        dealt[index % groups].push(command.clone());
    }

    dealt
}

/// `cmds.sh` -> `cmds_<index>.sh`
pub fn group_file_name(output: &Path, index: impl std::fmt::Display) -> PathBuf {
    let mut file_name = OsString::from(output.file_stem().unwrap_or_default());
    file_name.push(format!("_{index}"));

    if let Some(extension) = output.extension() {
        file_name.push(".");
        file_name.push(extension);
    }

    output.with_file_name(file_name)
}

/// Write one file per group (1-based suffix) and a manifest listing all of them
pub fn write_groups(
    groups: &[Vec<String>],
    output: &Path,
) -> Result<PartitionOutput, PartitionError> {
    let mut files = Vec::with_capacity(groups.len());

    for (index, group) in groups.iter().enumerate() {
        let file = group_file_name(output, index + 1);
        info!(file = ?file, commands = group.len(), "Creating command file");
        write_lines(&file, group)?;
        files.push(file);
    }

    let manifest = group_file_name(output, "filelst");
    write_lines(
        &manifest,
        &files
            .iter()
            .map(|file| file.to_string_lossy().into_owned())
            .collect_vec(),
    )?;

    Ok(PartitionOutput { files, manifest })
}

/// Read a command list, one command per line, blank lines are skipped
pub fn read_commands(path: &Path) -> io::Result<Vec<String>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Prepend e.g. a container launcher to every command, lines containing a
/// `#` anywhere are dropped
pub fn prefix_commands(commands: &[String], prefix: &str) -> Vec<String> {
    commands
        .iter()
        .filter(|command| !command.is_empty() && !command.contains('#'))
        .map(|command| format!("{prefix} {command}"))
        .collect()
}

pub fn write_lines<S: AsRef<str>>(path: &Path, lines: &[S]) -> io::Result<()> {
    let mut content = lines.iter().map(AsRef::<str>::as_ref).join("\n");

    if !lines.is_empty() {
        content.push('\n');
    }

    fs::write(path, content)
}

/// Read, optionally prefix, split and write a command list in one go
pub fn split_commands_file(
    input: &Path,
    output: &Path,
    partition: Partition,
    distribution: Distribution,
    prefix: Option<&str>,
) -> Result<PartitionOutput, PartitionError> {
    let mut commands = read_commands(input)?;

    if let Some(prefix) = prefix {
        commands = prefix_commands(&commands, prefix);
    }

    let groups = split(&commands, partition, distribution)?;

    write_groups(&groups, output)
}
