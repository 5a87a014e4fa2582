use super::{remove_outputs, ResetScope, ResetSummary};
use crate::{
    database::{JobParams, JobStore, StoreDescriptor},
    processor::CommandProcessor,
};
use serde_json::json;
use std::{fs, path::Path};
use tempfile::TempDir;

fn store(dir: &Path, jobs: usize) -> JobStore {
    let descriptor = StoreDescriptor::sqlite(&dir.join("jobs.db"), None).unwrap();
    let store = JobStore::new(descriptor).unwrap();
    let params = (0..jobs)
        .map(|i| {
            let output = dir.join(format!("out_{i}.txt"));
            fs::write(&output, "partial").unwrap();

            let mut params = JobParams::new();
            params.insert("cmd".to_owned(), json!("true"));
            params.insert("outputs".to_owned(), json!([output]));
            params
        })
        .collect::<Vec<_>>();
    store.populate(&params).unwrap();

    store
}

#[test]
pub fn error_only_resets_incomplete_jobs() {
    let dir = TempDir::new().unwrap();
    let store = store(dir.path(), 3);
    for _ in 0..3 {
        store.claim_next().unwrap().unwrap();
    }
    store.mark_completed(0).unwrap();
    store.mark_error(1, &json!({"error": "boom"})).unwrap();

    let summary = remove_outputs(&store, &CommandProcessor::default(), ResetScope::ErrorOnly).unwrap();

    assert_eq!(summary, ResetSummary { reset: 2, failed: 0 });
    assert!(dir.path().join("out_0.txt").exists());
    assert!(!dir.path().join("out_1.txt").exists());
    assert!(!dir.path().join("out_2.txt").exists());

    let jobs = store.scan_all().unwrap();
    assert!(jobs[0].completed);
    assert!(!jobs[1].started && !jobs[1].error && jobs[1].error_info.is_none());
    assert_eq!(store.claim_next().unwrap().unwrap().pid, 1);
}

#[test]
pub fn all_resets_every_job() {
    let dir = TempDir::new().unwrap();
    let store = store(dir.path(), 2);
    store.claim_next().unwrap().unwrap();
    store.mark_completed(0).unwrap();
    store.mark_checked(0).unwrap();

    let summary = remove_outputs(&store, &CommandProcessor::default(), ResetScope::All).unwrap();

    assert_eq!(summary.reset, 2);
    assert!(store
        .scan_all()
        .unwrap()
        .iter()
        .all(|job| !job.started && !job.completed && !job.checked && job.start.is_none()));
}
