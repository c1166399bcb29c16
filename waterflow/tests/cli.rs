//! CLI tests for the `waterflow` binary.
//!
//! Spawns the binary against a temporary config and state directory and
//! checks exit codes and the files each command leaves behind.

use std::process::{Command, Output};

use waterflow::exit_codes;
use waterflow::io::state::{FORCE_KEY, STOP_KEY};
use waterflow::io::store::MarkerStore;
use waterflow::test_support::TestHome;

fn waterflow(home: &TestHome, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_waterflow"))
        .current_dir(home.root())
        .env("WATERFLOW_CONFIG", &home.paths.config_path)
        .env("WATERFLOW_STATE_DIR", &home.paths.state_dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("spawn waterflow")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let home = TestHome::new();

    assert_eq!(waterflow(&home, &["init"]).status.code(), Some(exit_codes::OK));
    assert!(home.paths.config_path.exists());
    assert!(home.paths.state_dir.is_dir());

    let again = waterflow(&home, &["init"]);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&again.stderr).contains("--force"));

    assert_eq!(
        waterflow(&home, &["init", "--force"]).status.code(),
        Some(exit_codes::OK)
    );
}

#[test]
fn status_reports_stalled_until_loop_runs() {
    let home = TestHome::new();
    waterflow(&home, &["init"]);

    let before = waterflow(&home, &["status"]);
    assert_eq!(before.status.code(), Some(exit_codes::STALLED));
    assert!(stdout(&before).contains("STALLED"));

    let looped = waterflow(&home, &["loop"]);
    assert_eq!(looped.status.code(), Some(exit_codes::OK));
    assert!(stdout(&looped).contains("no active program"));

    let after = waterflow(&home, &["status"]);
    assert_eq!(after.status.code(), Some(exit_codes::OK));

    let log = waterflow(&home, &["log"]);
    assert!(stdout(&log).contains("NO active program!"));
}

#[test]
fn edited_program_runs_once_due() {
    let home = TestHome::new();
    waterflow(&home, &["init"]);

    let edited = waterflow(
        &home,
        &["program", "first", "--time", "05:06", "--enable", "--valves", "0,0"],
    );
    assert_eq!(edited.status.code(), Some(exit_codes::OK));
    assert!(stdout(&edited).contains("first 05:06:00 enabled [0, 0]"));

    // The first invocation only records where the schedule starts.
    let waiting = waterflow(&home, &["loop", "--now", "2023-04-27T05:00:00+00:00"]);
    assert!(stdout(&waiting).contains("waiting for first"));

    let executed = waterflow(&home, &["loop", "--now", "2023-04-27T05:06:30+00:00"]);
    assert_eq!(executed.status.code(), Some(exit_codes::OK));
    assert!(stdout(&executed).contains("executed first"));

    let log = stdout(&waterflow(&home, &["log"]));
    assert!(log.contains("Executing program first."));
    assert!(log.contains("Valve 0 Skipped."));
    assert!(log.contains("Valve 1 Skipped."));
}

#[test]
fn force_and_stop_write_markers_consumed_by_loop() {
    let home = TestHome::new();
    waterflow(&home, &["init"]);
    let store = home.store();

    let rejected = waterflow(&home, &["force", "valve", "5"]);
    assert_eq!(rejected.status.code(), Some(exit_codes::INVALID));
    assert!(!store.exists(FORCE_KEY).expect("exists"));

    assert_eq!(
        waterflow(&home, &["force", "valve", "1"]).status.code(),
        Some(exit_codes::OK)
    );
    assert_eq!(
        store.read(FORCE_KEY).expect("read").as_deref(),
        Some(r#"{"type":"valve","value":1}"#)
    );

    assert_eq!(waterflow(&home, &["stop"]).status.code(), Some(exit_codes::OK));
    assert!(store.exists(STOP_KEY).expect("exists"));

    let looped = waterflow(&home, &["loop"]);
    assert!(stdout(&looped).contains("stopped"));
    assert!(!store.exists(STOP_KEY).expect("exists"));
    assert!(!store.exists(FORCE_KEY).expect("exists"));
}

#[test]
fn program_edit_rejects_unknown_name() {
    let home = TestHome::new();
    waterflow(&home, &["init"]);

    let output = waterflow(&home, &["program", "third", "--enable"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown program 'third'"));
}
