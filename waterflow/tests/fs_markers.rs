//! Loop invocations against real marker files, operator log, and metrics file.

use std::fs::{self, File};
use std::time::{Duration, SystemTime};

use chrono::{TimeDelta, Utc};

use waterflow::controller::{LoopContext, NeverSkip, run_loop};
use waterflow::core::types::LoopOutcome;
use waterflow::io::config::load_config;
use waterflow::io::lock::{ExecutionLock, LockAcquire};
use waterflow::io::metrics::JsonlMetrics;
use waterflow::io::oplog::{FileOperatorLog, OperatorLog};
use waterflow::io::state::{FORCE_KEY, LAST_PROGRAM_KEY, LOCK_KEY, StateStore};
use waterflow::io::store::{FsMarkerStore, MarkerStore};
use waterflow::io::valve::SimulatedValveDriver;
use waterflow::operator::status;
use waterflow::test_support::{ScriptedPacer, TestHome, at, sample_config};

fn backdate(store: &FsMarkerStore, key: &str, by: Duration) {
    let file = File::options()
        .write(true)
        .open(store.path(key))
        .expect("open marker");
    file.set_modified(SystemTime::now() - by)
        .expect("set mtime");
}

#[test]
fn lock_file_age_decides_between_busy_and_reclaimed() {
    let home = TestHome::new();
    let store = home.store();
    let lock = ExecutionLock::new(&store, TimeDelta::minutes(10));

    assert_eq!(lock.acquire().expect("acquire"), LockAcquire::Acquired);

    backdate(&store, LOCK_KEY, Duration::from_secs(5 * 60));
    assert_eq!(lock.acquire().expect("acquire"), LockAcquire::Busy);

    backdate(&store, LOCK_KEY, Duration::from_secs(11 * 60));
    assert!(matches!(
        lock.acquire().expect("acquire"),
        LockAcquire::Reclaimed { .. }
    ));

    lock.release().expect("release");
    assert!(!store.exists(LOCK_KEY).expect("exists"));
}

#[test]
fn forced_program_writes_log_metrics_and_markers() {
    let mut config = sample_config();
    config.metrics = true;
    config.programs[0].valves_times = vec![0, 1];
    let home = TestHome::with_config(&config);
    let config = load_config(&home.paths.config_path).expect("load config");
    let store = home.store();
    let log = FileOperatorLog::new(home.paths.oplog_path.clone());
    let metrics = JsonlMetrics::new(home.paths.metrics_path.clone());
    let driver = SimulatedValveDriver::default();
    let pacer = ScriptedPacer::new();
    store
        .write(FORCE_KEY, r#"{"type":"program","value":0}"#)
        .expect("write force");

    let ctx = LoopContext {
        config: &config,
        store: &store,
        driver: &driver,
        log: &log,
        metrics: &metrics,
        pacer: &pacer,
        skip: &NeverSkip,
    };
    let now = at("2023-04-27T12:00:00Z");
    let outcome = run_loop(&ctx, &now).expect("loop");

    assert!(matches!(outcome, LoopOutcome::ForcedExecuted { .. }));
    assert!(!store.exists(FORCE_KEY).expect("exists"));
    assert!(!store.exists(LOCK_KEY).expect("exists"));

    let state = StateStore::new(&store);
    assert_eq!(state.peek_last_execution().expect("peek"), Some(now));
    let raw = fs::read_to_string(store.path(LAST_PROGRAM_KEY)).expect("read marker");
    assert!(raw.contains("\"last_execution\""));

    let contents = log.contents().expect("log");
    assert!(contents.contains("INFO: Valve 0 Skipped."));
    assert!(contents.contains("INFO: Valve 1 ON."));
    assert_eq!(
        log.last_message().expect("last").as_deref(),
        Some("Next program: 2023-04-27 23:30:00 (first).")
    );

    let metrics_raw = fs::read_to_string(&home.paths.metrics_path).expect("metrics");
    assert_eq!(metrics_raw.lines().count(), 1);
    assert!(metrics_raw.contains("prog_first"));

    for pin in config.output_pins() {
        assert_eq!(
            driver.level(pin),
            Some(embedded_hal::digital::PinState::Low),
            "pin {pin}"
        );
    }

    let report = status(&config, &state, &Utc::now()).expect("status");
    assert!(report.looping_correctly);
    assert_eq!(report.forced, None);
}
