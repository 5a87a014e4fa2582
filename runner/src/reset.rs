#[cfg(test)]
mod reset_test;

use crate::{
    database::JobStore,
    processor::JobProcessor,
    report::ReportError,
};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    All,
    /// jobs that were started but never completed, errored ones included
    ErrorOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub reset: usize,
    pub failed: usize,
}

/// Remove the outputs of every job in `scope` and make it claimable again.
/// A job whose outputs can't be removed keeps its state.
#[instrument(skip(store, processor), level = "info")]
pub fn remove_outputs<P: JobProcessor>(
    store: &JobStore,
    processor: &P,
    scope: ResetScope,
) -> Result<ResetSummary, ReportError> {
    let jobs = match scope {
        ResetScope::All => store.scan_all()?,
        ResetScope::ErrorOnly => store.scan_started_not_completed()?,
    };
    let mut summary = ResetSummary::default();

    for job in jobs {
        if let Err(error) = processor.remove_outputs(&job.params) {
            warn!(pid = job.pid, error = ?error, "Failed to remove outputs, job is not reset");
            summary.failed += 1;

            continue;
        }

        store.reset_job(job.pid)?;
        debug!(pid = job.pid, "Reset job");
        summary.reset += 1;
    }

    Ok(summary)
}
