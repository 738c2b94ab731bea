use std::{fs, path::Path, sync::Arc, time::Duration};

use sweep::search::{
    checkpoint::{global_metrics_name, summary_metrics_name, worker_metrics_name, ArtifactDir},
    metrics::MetricsTable,
    run_local, ArtifactConfig, CacheConfig, DpSolver, ErrorKind, ExchangeConfig, PatternCache,
    RangeDistribution, RunConfig, RunReport, Scenario, ScenarioSolver, Solver,
    StateMachineConfig,
};

const RUN_ID: u64 = 0x5eed;

/// `RUST_LOG=sweep=debug cargo test` shows what every rank is doing.
fn trace() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn artifacts(dir: &Path) -> ArtifactConfig {
    ArtifactConfig::builder()
        .output_dir(dir)
        .fallback_dir(dir.join("fallback"))
        .save_results(true)
        .build()
}

fn base(dir: &Path, horizon: u32) -> RunConfig {
    trace();
    RunConfig::builder()
        .horizon(horizon)
        .artifacts(artifacts(dir))
        .run_id(RUN_ID)
        .collective_timeout(Duration::from_secs(60))
        .build()
}

/// `(id, cost, valid)` of every row of the merged result file, by id.
fn rows(report: &RunReport) -> Vec<(u64, String, String)> {
    let merged = report
        .coordinator()
        .and_then(|coordinator| coordinator.results.as_ref())
        .expect("results were saved");
    let text = fs::read_to_string(&merged.path).unwrap();
    let mut rows: Vec<_> = text
        .lines()
        .skip(1)
        .map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            (
                fields[0].parse().unwrap(),
                fields[2].to_owned(),
                fields[3].to_owned(),
            )
        })
        .collect();
    rows.sort();
    rows
}

#[test]
fn worker_count_does_not_change_results() {
    let mut reference = None;
    for workers in [1, 2, 4] {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            scenario_limit: Some(1000),
            exchange: ExchangeConfig::builder().interval(50).share_every(20).build(),
            ..base(dir.path(), 10)
        };
        let report = run_local(&config, workers).unwrap();
        assert_eq!(report.workers.len(), workers);
        assert_eq!(report.processed(), 1000);

        let rows = rows(&report);
        assert_eq!(rows.len(), 1000);
        assert!(rows.iter().map(|row| row.0).eq(0..1000));
        match &reference {
            None => reference = Some(rows),
            Some(expected) => assert_eq!(&rows, expected, "{workers} workers"),
        }
    }
}

#[test]
fn solver_threads_do_not_change_results() {
    let sequential = tempfile::tempdir().unwrap();
    let threaded = tempfile::tempdir().unwrap();
    let one = run_local(&base(sequential.path(), 9), 2).unwrap();
    let config = RunConfig {
        threads: 3,
        batch_per_thread: 7,
        ..base(threaded.path(), 9)
    };
    let many = run_local(&config, 2).unwrap();
    assert_eq!(rows(&one), rows(&many));
    assert_eq!(one.summary(), many.summary());
}

#[test]
fn extremes_of_four_slots() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_local(&base(dir.path(), 4), 2).unwrap();
    let rows = rows(&report);
    assert_eq!(rows.len(), 16);
    assert_eq!(rows[0b1111], (0b1111, "0.00".to_owned(), "yes".to_owned()));
    assert_eq!(rows[0], (0, "20.00".to_owned(), "yes".to_owned()));

    let summary = report.summary();
    assert_eq!(summary.valid, 16);
    assert_eq!(summary.best.map(|best| best.scenario), Some(0b1111));
    assert_eq!(summary.worst.map(|worst| worst.cost), Some(20.0));
    assert_eq!(summary.critical, 1);
    assert_eq!(summary.optimal, 1);
}

#[test]
fn stitched_fragments_match_direct_solves() {
    let machine = Arc::new(StateMachineConfig::standard());
    let mut cached = ScenarioSolver::new(DpSolver::new(machine.clone()));
    let mut direct = DpSolver::new(machine);
    let mut cache = PatternCache::new(CacheConfig::default());
    for id in 0..1 << 10 {
        let scenario = Scenario::new(id, 10);
        let solved = cached.solve(&scenario, &mut cache);
        for fresh in solved.fresh {
            cache.insert_fresh(fresh);
        }
        let expected = direct.solve(&scenario.flags());
        assert_eq!(solved.result.is_valid, expected.is_valid, "{scenario}");
        assert_eq!(solved.result.total_cost, expected.total_cost, "{scenario}");
    }
    assert!(cached.stats().hits > 0);
}

#[test]
fn metrics_are_reduced_at_the_coordinator() {
    let dir = tempfile::tempdir().unwrap();
    let report = run_local(&base(dir.path(), 8), 3).unwrap();
    let global = report.global().expect("small runs reduce metrics");
    assert_eq!(global.totals.workers, 3);
    assert_eq!(global.totals.processed, 256);
    assert_eq!(global.totals.summary.valid, 256);
    assert!((0.0..=1.0).contains(&global.load_balance_ratio));

    let outputs = ArtifactDir::new(dir.path(), dir.path().join("fallback"));
    let path = outputs.locate(&global_metrics_name(RUN_ID)).unwrap();
    let table = MetricsTable::parse(&fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(table.get("global", "processed"), Some("256"));
    assert_eq!(table.get("global", "workers"), Some("3"));
    for rank in 0..3 {
        assert!(outputs.locate(&worker_metrics_name(RUN_ID, rank)).is_some());
    }

    let checkpoints: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("checkpoint_"))
        .collect();
    for stage in ["INIT", "PROGRESS", "COMPLETED"] {
        let written = checkpoints.iter().filter(|name| name.contains(stage)).count();
        assert!(written >= 3, "{stage}: {written}");
    }
    assert!(!checkpoints.iter().any(|name| name.contains("ABORTED")));
}

#[test]
fn large_runs_summarise_from_worker_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        reduction_threshold: 100,
        ..base(dir.path(), 8)
    };
    let report = run_local(&config, 2).unwrap();
    assert!(report.global().is_none());

    let coordinator = report.coordinator().unwrap();
    let summary = coordinator.summary.as_ref().unwrap();
    assert_eq!((summary.found, summary.workers), (2, 2));
    let text = fs::read_to_string(dir.path().join(summary_metrics_name(RUN_ID))).unwrap();
    let table = MetricsTable::parse(&text).unwrap();
    assert_eq!(table.get("global", "processed"), Some("256"));
    assert_eq!(table.get("global", "status"), Some("complete"));
}

#[test]
fn exhausted_budget_stops_every_worker() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        time_budget: Some(Duration::ZERO),
        exchange: ExchangeConfig::builder().interval(10).build(),
        ..base(dir.path(), 8)
    };
    let report = run_local(&config, 3).unwrap();
    assert_eq!(report.processed(), 0);
    for worker in &report.workers {
        assert!(worker.snapshot.timed_out);
        // one early round carrying the stop vote, then the final one
        assert_eq!(worker.snapshot.exchange.rounds, 2);
    }
    assert!(rows(&report).is_empty());
}

#[test]
fn nothing_is_pending_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig {
        exchange: ExchangeConfig::builder()
            .interval(100)
            .share_every(1)
            .poll_interval(1_000_000)
            .build(),
        ..base(dir.path(), 10)
    };
    let report = run_local(&config, 4).unwrap();
    let sent: u64 = report
        .workers
        .iter()
        .map(|w| w.snapshot.exchange.discoveries_sent)
        .sum();
    assert!(sent > 0);
    for worker in &report.workers {
        assert!(worker.shutdown.clean(), "rank {}", worker.rank);
        assert_eq!(worker.shutdown.residual, 0);
    }
}

#[test]
fn pushed_ranges_match_computed_ones() {
    let computed = tempfile::tempdir().unwrap();
    let pushed = tempfile::tempdir().unwrap();
    let one = run_local(&base(computed.path(), 7), 3).unwrap();
    let config = RunConfig {
        distribution: RangeDistribution::Pushed,
        ..base(pushed.path(), 7)
    };
    let other = run_local(&config, 3).unwrap();
    let ranges = |report: &RunReport| report.workers.iter().map(|w| w.range).collect::<Vec<_>>();
    assert_eq!(ranges(&one), ranges(&other));
    assert_eq!(ranges(&one)[0].len(), 43);
}

#[test]
fn unusable_artifact_directories_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, b"not a directory").unwrap();
    let config = RunConfig {
        artifacts: ArtifactConfig::builder()
            .output_dir(blocker.join("out"))
            .fallback_dir(blocker.join("fallback"))
            .build(),
        abort_timeout: Duration::from_secs(5),
        ..base(dir.path(), 6)
    };
    let err = run_local(&config, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn unwritable_results_target_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, b"not a directory").unwrap();
    let config = base(dir.path(), 6);
    let config = RunConfig {
        artifacts: ArtifactConfig {
            results_path: Some(blocker.join("all.csv")),
            ..config.artifacts.clone()
        },
        ..config
    };
    let report = run_local(&config, 2).unwrap();

    let merged = report.coordinator().unwrap().results.as_ref().unwrap();
    assert_eq!(merged.path, dir.path().join("fallback").join("all.csv"));
    assert_eq!(merged.rows, 64);
    assert_eq!(rows(&report).len(), 64);
}
