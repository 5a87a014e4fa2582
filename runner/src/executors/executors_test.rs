use super::{sanitize_job_name, Executors, ExecutorError, SlurmExecutor, Submission};
use crate::{
    config::{ExecutorConfig, LocalConfig, SlurmConfig},
    database::{JobParams, JobStore, StoreDescriptor},
    partition::{read_commands, PartitionError},
};
use serde_json::json;
use std::{fs, os::unix::fs::PermissionsExt, path::Path};
use tempfile::TempDir;

fn submission(dir: &Path) -> Submission {
    Submission::new(
        "hpcq".to_owned(),
        StoreDescriptor::sqlite(&dir.join("jobs.db"), None).unwrap(),
        dir.join("process_db_info_abc123.json"),
    )
}

fn params(count: usize) -> Vec<JobParams> {
    (0..count)
        .map(|i| json!({ "cmd": format!("echo {i}") }).as_object().unwrap().clone())
        .collect()
}

fn slurm_config(dir: &Path) -> SlurmConfig {
    SlurmConfig {
        job_name: "Sen2 ARD-run".to_owned(),
        mem_per_core_mb: 4096,
        log_dir: dir.join("logs"),
        account: Some("scw1234".to_owned()),
        partition: "compute".to_owned(),
        n_cores_per_job: 4,
        n_extra_commands: 1,
        n_jobs: 3,
        time_limit: "0-12:00".to_owned(),
        module_load: Some("module load parallel".to_owned()),
        job_dir: dir.join("job_scripts"),
        run_script: dir.join("run_exe_analysis.sh"),
        template: None,
        prefix: None,
        email_address: None,
        email_type: "END".to_owned(),
        n_cores_node: None,
    }
}

#[test]
pub fn local_generation() {
    let dir = TempDir::new().unwrap();
    let submission = submission(dir.path());
    let executor = Executors::load(&ExecutorConfig {
        local: Some(LocalConfig {
            n_cores: 3,
            run_script: dir.path().join("run.sh"),
            cmds_file: dir.path().join("cmds.sh"),
        }),
        slurm: None,
    })
    .unwrap();

    let scripts = executor.generate(&submission, &params(5)).unwrap();

    let commands = read_commands(&dir.path().join("cmds.sh")).unwrap();
    assert_eq!(commands.len(), 3);
    let expected = format!("hpcq --storeinfo {}", submission.descriptor_path.display());
    assert!(commands.iter().all(|command| command == &expected));

    let run = fs::read_to_string(&scripts.run_script).unwrap();
    assert_eq!(
        run,
        format!("parallel -j 3 < {}\n", dir.path().join("cmds.sh").display())
    );
    let mode = fs::metadata(&scripts.run_script).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0);

    // the store was populated and the descriptor written
    let store = JobStore::load(&submission.descriptor_path).unwrap();
    assert_eq!(store.scan_all().unwrap().len(), 5);
}

#[test]
pub fn slurm_generation() {
    let dir = TempDir::new().unwrap();
    let submission = submission(dir.path());
    let executor = Executors::load(&ExecutorConfig {
        local: None,
        slurm: Some(slurm_config(dir.path())),
    })
    .unwrap();

    let scripts = executor.generate(&submission, &params(2)).unwrap();

    let job_dir = dir.path().join("job_scripts");
    for n in 0..3 {
        let commands = read_commands(&job_dir.join(format!("jobcmds_{n}.sh"))).unwrap();
        assert_eq!(commands.len(), 5);
    }

    let batch = fs::read_to_string(job_dir.join("job_file_1.sbatch")).unwrap();
    assert!(batch.starts_with("#!/bin/bash --login\n"));
    assert!(batch.contains("#SBATCH --account=scw1234\n"));
    assert!(batch.contains("#SBATCH --job-name=Sen2_ARD_run_1\n"));
    assert!(batch.contains("#SBATCH --ntasks=4\n"));
    assert!(batch.contains("#SBATCH --mem-per-cpu=4096\n"));
    assert!(batch.contains("#SBATCH --time=0-12:00\n"));
    assert!(batch.contains("Sen2_ARD_run_1_log.out.%J"));
    assert!(batch.contains("\nmodule load parallel\n"));
    assert!(batch.contains(&format!(
        "-j $SLURM_NTASKS < {}",
        job_dir.join("jobcmds_1.sh").display()
    )));

    let run = read_commands(&scripts.run_script).unwrap();
    assert_eq!(run.len(), 3);
    assert_eq!(
        run[2],
        format!("sbatch {}", job_dir.join("job_file_2.sbatch").display())
    );
    assert!(dir.path().join("logs").is_dir());
}

#[test]
pub fn slurm_without_account_or_modules() {
    let dir = TempDir::new().unwrap();
    let mut config = slurm_config(dir.path());
    config.account = None;
    config.module_load = None;
    config.n_jobs = 1;

    Executors::Slurm(SlurmExecutor::new(config))
        .generate(&submission(dir.path()), &params(1))
        .unwrap();

    let batch = fs::read_to_string(dir.path().join("job_scripts/job_file_0.sbatch")).unwrap();
    assert!(!batch.contains("--account"));
    assert!(!batch.contains("module"));
    assert!(!batch.contains("--mail-user"));
    assert!(!batch.contains("--ntasks-per-node"));
    assert!(batch.contains("#SBATCH --partition=compute\n"));
}

#[test]
pub fn slurm_with_email_and_tasks_per_node() {
    let dir = TempDir::new().unwrap();
    let mut config = slurm_config(dir.path());
    config.email_address = Some("ops@example.org".to_owned());
    config.email_type = "ALL".to_owned();
    config.n_cores_node = Some(2);
    config.n_jobs = 1;

    Executors::Slurm(SlurmExecutor::new(config))
        .generate(&submission(dir.path()), &params(1))
        .unwrap();

    let batch = fs::read_to_string(dir.path().join("job_scripts/job_file_0.sbatch")).unwrap();
    assert!(batch.contains(
        "#SBATCH --ntasks=4\n#SBATCH --ntasks-per-node=2\n#SBATCH --mem-per-cpu=4096\n"
    ));
    assert!(batch.contains("#SBATCH --mail-user=ops@example.org\n#SBATCH --mail-type=ALL\n"));
}

#[test]
pub fn single_command_batch_file() {
    let dir = TempDir::new().unwrap();
    let mut config = slurm_config(dir.path());
    config.prefix = Some("singularity exec img.sif".to_owned());

    let scripts = SlurmExecutor::new(config)
        .generate_single("gdal_translate in.kea out.tif", None)
        .unwrap();

    let batch_file = dir.path().join("job_scripts/job_file_single.sbatch");
    assert_eq!(scripts.files, vec![batch_file.clone()]);

    let batch = fs::read_to_string(&batch_file).unwrap();
    assert!(batch.contains("#SBATCH --job-name=Sen2_ARD_run\n"));
    assert!(batch.ends_with("\nsingularity exec img.sif gdal_translate in.kea out.tif\n"));
    assert!(!batch.contains("parallel -N 1"));

    assert_eq!(
        read_commands(&scripts.run_script).unwrap(),
        vec![format!("sbatch {}", batch_file.display())]
    );
}

#[test]
pub fn single_command_to_explicit_file() {
    let dir = TempDir::new().unwrap();
    let batch_file = dir.path().join("one.sbatch");

    SlurmExecutor::new(slurm_config(dir.path()))
        .generate_single("echo hello", Some(&batch_file))
        .unwrap();

    assert!(fs::read_to_string(&batch_file)
        .unwrap()
        .ends_with("\necho hello\n"));
    assert!(!dir.path().join("job_scripts/job_file_single.sbatch").exists());
}

#[test]
pub fn custom_template() {
    let dir = TempDir::new().unwrap();
    let template = dir.path().join("custom.sbatch");
    fs::write(&template, "#SBATCH -J {{ job_name }} -n {{ n_tasks }}\n").unwrap();
    let mut config = slurm_config(dir.path());
    config.template = Some(template);
    config.n_jobs = 1;

    Executors::Slurm(SlurmExecutor::new(config))
        .generate(&submission(dir.path()), &params(1))
        .unwrap();

    assert_eq!(
        fs::read_to_string(dir.path().join("job_scripts/job_file_0.sbatch")).unwrap(),
        "#SBATCH -J Sen2_ARD_run_0 -n 4\n"
    );
}

#[test]
pub fn invalid_slot_count_leaves_store_untouched() {
    let dir = TempDir::new().unwrap();
    let mut config = slurm_config(dir.path());
    config.n_jobs = 0;
    let submission = submission(dir.path());

    assert!(matches!(
        Executors::Slurm(SlurmExecutor::new(config)).generate(&submission, &params(2)),
        Err(ExecutorError::Partition(PartitionError::InvalidPartition(_)))
    ));
    assert!(!dir.path().join("jobs.db").exists());
    assert!(!submission.descriptor_path.exists());
}

#[test]
pub fn command_list_submission() {
    let dir = TempDir::new().unwrap();
    let mut config = slurm_config(dir.path());
    config.prefix = Some("singularity exec img.sif".to_owned());
    config.n_jobs = 2;
    let commands = (0..5).map(|i| format!("run {i}")).collect::<Vec<_>>();

    let scripts = SlurmExecutor::new(config)
        .generate_for_commands(&commands)
        .unwrap();

    let job_dir = dir.path().join("job_scripts");
    assert_eq!(
        read_commands(&job_dir.join("cmds_0.sh")).unwrap(),
        vec![
            "srun -n1 -N1 singularity exec img.sif run 0",
            "srun -n1 -N1 singularity exec img.sif run 2",
            "srun -n1 -N1 singularity exec img.sif run 4",
        ]
    );
    assert_eq!(read_commands(&job_dir.join("cmds_1.sh")).unwrap().len(), 2);
    assert_eq!(read_commands(&scripts.run_script).unwrap().len(), 2);
}

#[test]
pub fn command_list_with_fewer_commands_than_slots() {
    let dir = TempDir::new().unwrap();
    let scripts = SlurmExecutor::new(slurm_config(dir.path()))
        .generate_for_commands(&["only".to_owned()])
        .unwrap();

    assert_eq!(read_commands(&scripts.run_script).unwrap().len(), 1);
    assert!(!dir.path().join("job_scripts/cmds_1.sh").exists());
}

#[test]
pub fn job_names_are_sanitized() {
    assert_eq!(sanitize_job_name("Sen2 ARD-run"), "Sen2_ARD_run");
    assert_eq!(sanitize_job_name("a -- b"), "a_b");
    assert_eq!(sanitize_job_name("näme.v2!"), "nmev2");
    assert_eq!(sanitize_job_name("keep_this"), "keep_this");
}
