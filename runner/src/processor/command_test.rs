use super::{
    check_files, CommandProcessor, FileCheck, JobProcessor, OutputCheck, ProcessingError,
};
use crate::database::JobParams;
use serde_json::json;
use std::{fs, time::Duration};
use tempfile::TempDir;

fn params(value: serde_json::Value) -> JobParams {
    match value {
        serde_json::Value::Object(map) => map,
        _ => panic!("job params must be an object"),
    }
}

#[test]
pub fn runs_successful_command() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.txt");
    let job = params(json!({
        "cmd": format!("echo done > {}", output.display()),
        "outputs": [output],
    }));

    CommandProcessor::default().do_processing(&job).unwrap();

    assert_eq!(fs::read_to_string(&output).unwrap(), "done\n");
    assert_eq!(CommandProcessor::default().outputs_present(&job), OutputCheck::ok());
}

#[test]
pub fn failing_command_keeps_stderr_tail() {
    let job = params(json!({ "cmd": "for i in $(seq 1 50); do echo line$i >&2; done; exit 3" }));

    match CommandProcessor::default().do_processing(&job) {
        Err(ProcessingError::Exit { status, stderr }) => {
            assert!(status.contains('3'));
            assert!(stderr.starts_with("line31"));
            assert!(stderr.ends_with("line50"));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
pub fn timeout_kills_command() {
    let job = params(json!({ "cmd": "sleep 5", "timeout": 0.2 }));

    assert!(matches!(
        CommandProcessor::default().do_processing(&job),
        Err(ProcessingError::Timeout(_))
    ));
}

#[test]
pub fn default_timeout_applies() {
    let job = params(json!({ "cmd": "sleep 5" }));
    let processor = CommandProcessor::default().with_default_timeout(Duration::from_millis(200));

    assert!(matches!(
        processor.do_processing(&job),
        Err(ProcessingError::Timeout(_))
    ));
}

#[test]
pub fn required_fields_are_checked() {
    let processor = CommandProcessor::default();

    match processor.check_required_fields(&params(json!({ "other": 1 }))) {
        Err(ProcessingError::MissingFields(fields)) => assert_eq!(fields, vec!["cmd"]),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(processor
        .check_required_fields(&params(json!({ "cmd": "true" })))
        .is_ok());
    assert!(matches!(
        processor.do_processing(&params(json!({ "cmd": 42 }))),
        Err(ProcessingError::Failure(_))
    ));
}

#[test]
pub fn missing_and_empty_outputs_are_reported() {
    let dir = TempDir::new().unwrap();
    let empty = dir.path().join("empty.txt");
    let missing = dir.path().join("missing.txt");
    fs::write(&empty, "").unwrap();

    let check = check_files(&[&empty, &missing], FileCheck::NonEmpty);
    assert!(!check.present);
    assert_eq!(check.errors.len(), 2);

    let check = check_files(&[&empty], FileCheck::Exists);
    assert!(check.present);
}

#[test]
pub fn remove_outputs_tolerates_missing_files() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.txt");
    fs::write(&output, "data").unwrap();
    let job = params(json!({
        "cmd": "true",
        "outputs": [output, dir.path().join("never-written.txt")],
    }));

    CommandProcessor::default().remove_outputs(&job).unwrap();

    assert!(!output.exists());
    assert!(!CommandProcessor::default().outputs_present(&job).present);
}
