//! End-to-end runs on the synthetic dataset

use std::path::Path;
use std::sync::Arc;

use burn::backend::{Autodiff, NdArray};

use fixmatch_ssl::checkpoint::{load_checkpoint, BEST_FILE, CHECKPOINT_FILE};
use fixmatch_ssl::config::CONFIG_FILE;
use fixmatch_ssl::dataset::build_data;
use fixmatch_ssl::distributed::{launch_local, SingleProcess};
use fixmatch_ssl::training::{PseudoLabelConfig, PseudoLabeler};
use fixmatch_ssl::utils::scalars::CsvScalarWriter;
use fixmatch_ssl::{run, FixMatchConfig, FixMatchError, ProcessGroup, RunReport, RunState, TrainerParts};

type TestBackend = Autodiff<NdArray>;

fn smoke_config(out: &Path) -> FixMatchConfig {
    FixMatchConfig {
        out: out.to_path_buf(),
        seed: Some(7),
        no_progress: true,
        ..FixMatchConfig::smoke()
    }
}

fn run_single(config: &FixMatchConfig) -> fixmatch_ssl::Result<RunReport> {
    run::<TestBackend>(config, Arc::new(SingleProcess), Default::default())
}

#[test]
fn test_single_process_run_writes_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let config = smoke_config(dir.path());
    let report = run_single(&config).unwrap();

    assert_eq!(report.start_epoch, 0);
    assert_eq!(report.epochs.len(), 2);
    let max_acc = report
        .epochs
        .iter()
        .map(|e| e.test.top1)
        .fold(f64::MIN, f64::max);
    assert_eq!(report.best_acc, max_acc);
    for record in &report.epochs {
        assert_eq!(record.train.steps, config.iterations_per_epoch());
        assert!(record.train.loss.is_finite());
        assert!((0.0..=1.0).contains(&record.train.mask_rate));
        assert_eq!(record.test.num_examples, 160);
    }

    assert!(dir.path().join(BEST_FILE).is_file());
    assert_eq!(
        FixMatchConfig::load(&dir.path().join(CONFIG_FILE)).unwrap(),
        config
    );

    let state = load_checkpoint(&dir.path().join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(state.epoch, 2);
    assert_eq!(state.best_acc, report.best_acc);
    assert_eq!(state.scheduler.step, config.total_steps());
    assert!(state.ema_state_dict.is_some());
    assert!(state.state_dict.keys().all(|k| !k.starts_with("module.")));

    let csv = std::fs::read_to_string(dir.path().join(CsvScalarWriter::FILE_NAME)).unwrap();
    let rows: Vec<&str> = csv.lines().skip(1).collect();
    assert_eq!(rows.len(), 6 * 2);
    for tag in [
        "train_loss",
        "train_loss_x",
        "train_loss_u",
        "mask_rate",
        "test_accuracy",
        "test_loss",
    ] {
        assert_eq!(rows.iter().filter(|r| r.starts_with(&format!("{},", tag))).count(), 2);
    }
}

#[test]
fn test_resume_continues_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let one_epoch = smoke_config(dir.path());
    let mut partial = one_epoch.clone();
    partial.epochs = 1;
    let partial_report = run_single(&partial).unwrap();
    let saved = load_checkpoint(&dir.path().join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(saved.epoch, 1);

    let resumed = FixMatchConfig {
        out: dir.path().join("ignored"),
        resume: Some(dir.path().join(CHECKPOINT_FILE)),
        ..one_epoch
    };
    let report = run_single(&resumed).unwrap();

    assert_eq!(report.start_epoch, 1);
    assert_eq!(report.epochs.len(), 1);
    assert_eq!(report.epochs[0].epoch, 1);
    assert_eq!(report.out_dir, dir.path());
    assert!(report.best_acc >= partial_report.best_acc);
    assert!(!dir.path().join("ignored").exists());

    let state = load_checkpoint(&dir.path().join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(state.epoch, 2);
    assert_eq!(state.scheduler.step, saved.scheduler.step + resumed.iterations_per_epoch() as u64);
    assert_eq!(
        state.optimizer.momentum.keys().collect::<Vec<_>>(),
        saved.optimizer.momentum.keys().collect::<Vec<_>>()
    );
}

#[test]
fn test_restored_trainer_reproduces_saved_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = FixMatchConfig {
        epochs: 2,
        ..smoke_config(dir.path())
    };
    run_single(&config).unwrap();
    let saved = load_checkpoint(&dir.path().join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(saved.epoch, 2);

    let seed = config.seed.unwrap();
    let data = build_data(
        config.dataset,
        &config.data_dir,
        &config.split_budget(seed),
        &config.synthetic,
    )
    .unwrap();
    let device = Default::default();
    let parts = TrainerParts::<TestBackend>::build(&config, seed + 1, &data, 0.0, &device)
        .unwrap()
        .restore(&saved, &device)
        .unwrap();
    let (start_epoch, best_acc) = (parts.start_epoch, parts.best_acc);
    let trainer = parts
        .into_trainer(
            Ok,
            PseudoLabeler::new(PseudoLabelConfig {
                threshold: config.threshold,
            }),
            config.step(),
        )
        .unwrap();
    let snapshot = trainer.snapshot().unwrap();

    // Value by value: weights, shadow, schedule and optimizer groups
    assert_eq!(snapshot.state_dict, saved.state_dict);
    assert_eq!(snapshot.ema_state_dict, saved.ema_state_dict);
    assert_eq!(snapshot.scheduler, saved.scheduler);
    assert_eq!(snapshot.optimizer.groups, saved.optimizer.groups);
    // Momentum buffers re-encode to the same bytes
    assert_eq!(
        snapshot.optimizer.momentum.keys().collect::<Vec<_>>(),
        saved.optimizer.momentum.keys().collect::<Vec<_>>()
    );
    for (name, bytes) in &saved.optimizer.momentum {
        assert_eq!(&snapshot.optimizer.momentum[name], bytes, "momentum of {}", name);
    }
    assert_eq!(start_epoch, saved.epoch);
    assert_eq!(best_acc, saved.best_acc);

    let rebuilt = RunState::from_snapshot(snapshot, start_epoch, saved.acc, best_acc);
    assert_eq!(rebuilt, saved);
}

#[test]
fn test_resume_from_missing_checkpoint_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = FixMatchConfig {
        resume: Some(dir.path().join("missing").join(CHECKPOINT_FILE)),
        ..smoke_config(dir.path())
    };
    assert!(matches!(
        run_single(&config),
        Err(FixMatchError::PathNotFound(_))
    ));
}

#[test]
fn test_run_without_ema() {
    let dir = tempfile::tempdir().unwrap();
    let config = FixMatchConfig {
        use_ema: false,
        epochs: 1,
        ..smoke_config(dir.path())
    };
    run_single(&config).unwrap();

    let state = load_checkpoint(&dir.path().join(CHECKPOINT_FILE)).unwrap();
    assert!(state.ema_state_dict.is_none());
}

#[test]
fn test_data_parallel_ranks_stay_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let base = smoke_config(dir.path());

    let reports = launch_local(2, |group| {
        let config = FixMatchConfig {
            local_rank: group.rank() as i64,
            ..base.clone()
        };
        run::<TestBackend>(&config, Arc::new(group), Default::default())
    })
    .unwrap();

    let reports: Vec<RunReport> = reports.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(reports[0].epochs.len(), 2);
    // Same weights on every rank means the same test results
    for (a, b) in reports[0].epochs.iter().zip(&reports[1].epochs) {
        assert_eq!(a.test, b.test);
    }
    assert_eq!(reports[0].best_acc, reports[1].best_acc);

    let state = load_checkpoint(&dir.path().join(CHECKPOINT_FILE)).unwrap();
    assert_eq!(state.epoch, 2);
    // Replication does not leak into saved names
    assert!(state.state_dict.keys().all(|k| !k.starts_with("module.")));
}
