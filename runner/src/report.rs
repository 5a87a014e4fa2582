//! Aggregated job status, duration statistics and the output check pass.


use crate::{
    database::{ConnectionError, JobRecord, JobStore, Pid},
    processor::{JobProcessor, ProcessingError},
};
use chrono::Local;
use itertools::Itertools;
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub const INCOMPLETE_MESSAGE: &str = "Started but did not complete.";
pub const NEVER_STARTED_MESSAGE: &str = "Never Started.";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Job store failure")]
    Connection(#[from] ConnectionError),
    #[error("Failed to serialize the report")]
    Serialization(#[from] serde_json::Error),
    #[error("Failed to write report files")]
    Io(#[from] std::io::Error),
    #[error("Failed to remove job outputs")]
    Processing(#[from] ProcessingError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub completed: usize,
    pub errored: usize,
    pub started: usize,
    pub started_not_completed: usize,
    pub orphaned: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationStats {
    pub mean_secs: f64,
    pub min_secs: f64,
    pub max_secs: f64,
    pub median_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdev_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quartiles_secs: Option<[f64; 3]>,
}

impl DurationStats {
    /// `None` for an empty sample
    pub fn from_secs(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let sorted = samples.iter().copied().sorted_by(f64::total_cmp).collect_vec();
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;

        let median = if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        };

        let (stdev, quartiles) = if n > 1 {
            // sample standard deviation
            let variance =
                sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;

            (Some(variance.sqrt()), Some(quartiles(&sorted)))
        } else {
            (None, None)
        };

        Some(Self {
            mean_secs: mean,
            min_secs: sorted[0],
            max_secs: sorted[n - 1],
            median_secs: median,
            stdev_secs: stdev,
            quartiles_secs: quartiles,
        })
    }
}

/// Quartile cut points with the exclusive method, `sorted` needs at least two entries
fn quartiles(sorted: &[f64]) -> [f64; 3] {
    let n = sorted.len();
    let m = n + 1;
    let mut cuts = [0.0; 3];

    for (i, cut) in (1..4).zip(cuts.iter_mut()) {
        let j = (i * m / 4).clamp(1, n - 1);
        let delta = (i * m) as f64 - (j * 4) as f64;
        *cut = (sorted[j - 1] * (4.0 - delta) + sorted[j] * delta) / 4.0;
    }

    cuts
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobReport {
    pub counts: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durations: Option<DurationStats>,
    pub incomplete: BTreeMap<Pid, String>,
    pub errors: BTreeMap<Pid, Value>,
}

impl JobReport {
    pub fn from_jobs(jobs: &[JobRecord]) -> Self {
        let mut report = Self::default();
        let mut durations = Vec::new();

        for job in jobs {
            report.counts.total += 1;

            if job.started || job.completed {
                report.counts.started += 1;
            }

            if job.completed {
                report.counts.completed += 1;

                if let Some(duration) = job.duration() {
                    durations.push(duration.num_milliseconds() as f64 / 1000.0);
                }

                continue;
            }

            if job.error {
                report.counts.errored += 1;
                report
                    .errors
                    .insert(job.pid, job.error_info.clone().unwrap_or(Value::Null));
            }

            if job.started {
                report.counts.started_not_completed += 1;
                report.incomplete.insert(job.pid, INCOMPLETE_MESSAGE.to_owned());
            }

            if job.is_orphan() {
                report.counts.orphaned += 1;
            }
        }

        report.durations = DurationStats::from_secs(&durations);

        report
    }

    /// Pretty JSON to `output`, or stdout without one
    pub fn write(&self, output: Option<&Path>) -> Result<(), ReportError> {
        let content = serde_json::to_string_pretty(self)?;

        match output {
            Some(path) => {
                fs::write(path, content + "\n")?;
                info!(path = ?path, "Wrote job report");
            }
            None => println!("{content}"),
        }

        Ok(())
    }
}

#[instrument(skip_all, level = "info")]
pub fn report(store: &JobStore) -> Result<JobReport, ReportError> {
    let jobs = store.scan_all()?;
    let report = JobReport::from_jobs(&jobs);

    debug!(
        total = report.counts.total,
        completed = report.counts.completed,
        orphaned = report.counts.orphaned,
        "Created job report"
    );

    Ok(report)
}

/// Outcome of `check_outputs`, failures keyed by PID
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckSummary {
    pub checked: usize,
    pub failures: BTreeMap<Pid, Value>,
}

impl CheckSummary {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Write the failed PIDs and the failure details into `directory`.
    /// Both files are created even if nothing failed.
    pub fn write_files(&self, directory: &Path) -> Result<(PathBuf, PathBuf), ReportError> {
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let pid_file = directory.join(format!("processing_errs_scns_{timestamp}.txt"));
        let info_file = directory.join(format!("non_complete_errs_{timestamp}.txt"));

        if self.failures.is_empty() {
            fs::write(&pid_file, "")?;
            fs::write(&info_file, "")?;
        } else {
            let pids = self.failures.keys().join("\n");
            fs::write(&pid_file, pids + "\n")?;
            fs::write(&info_file, serde_json::to_string_pretty(&self.failures)? + "\n")?;
        }

        info!(pids = ?pid_file, info = ?info_file, "Wrote output check files");

        Ok((pid_file, info_file))
    }
}

/// Validate the outputs of every unchecked job.
///
/// Completed jobs with all outputs present become `checked`, completed jobs
/// with missing outputs are turned into errors carrying the validator's
/// messages. Started but incomplete jobs are made claimable again.
#[instrument(skip_all, level = "info")]
pub fn check_outputs<P: JobProcessor>(
    store: &JobStore,
    processor: &P,
) -> Result<CheckSummary, ReportError> {
    let mut summary = CheckSummary::default();

    for job in store.scan_unchecked()? {
        if job.completed {
            let check = processor.outputs_present(&job.params);

            if check.present {
                store.mark_checked(job.pid)?;
                summary.checked += 1;
            } else {
                debug!(pid = job.pid, "Outputs missing: {:?}", check.errors);
                let info = json!(check.errors);
                store.mark_error(job.pid, &info)?;
                summary.failures.insert(job.pid, info);
            }
        } else if job.started {
            store.reset_orphan(job.pid)?;
            summary
                .failures
                .insert(job.pid, Value::from(INCOMPLETE_MESSAGE));
        } else {
            summary
                .failures
                .insert(job.pid, Value::from(NEVER_STARTED_MESSAGE));
        }
    }

    if summary.is_ok() {
        info!(checked = summary.checked, "Checks complete, all outputs present");
    } else {
        warn!(failures = summary.failures.len(), "Some jobs failed the output check");
    }

    Ok(summary)
}
