//! Lifecycle misuse tests: the double-call matrix.
//!
//! A command runs at most once and produces at most one result; every
//! invalid transition has a dedicated diagnostic error.

use std::sync::Arc;

use cmdrig::{Command, ExecError, Signal};

#[tokio::test]
async fn run_twice_reports_already_started() {
    let mut cmd = Command::new("sleep");
    cmd.with_args(["1"]);

    cmd.run().expect("first run");
    let err = cmd.run().expect_err("second run");
    assert!(matches!(err, ExecError::AlreadyStarted));

    cmd.wait().await.expect("wait sleep");
}

#[tokio::test]
async fn finished_command_rejects_every_operation() {
    let mut cmd = Command::new("printf");
    cmd.with_args(["x"]);

    cmd.run().expect("run printf");
    let first = cmd.wait().await.expect("wait printf");

    let err = cmd.run().expect_err("run after wait");
    assert!(matches!(err, ExecError::AlreadyFinished));

    let err = cmd.wait().await.expect_err("wait after wait");
    assert!(matches!(err, ExecError::AlreadyFinished));

    // The stored result is still the one produced by the first wait.
    let stored = cmd.result().expect("stored result");
    assert_eq!(stored.stdout, first.stdout);
    assert_eq!(stored.exit_code, first.exit_code);

    let err = cmd.signal(Signal::SIGTERM).expect_err("signal after wait");
    assert!(matches!(err, ExecError::FailedSendingSignal(_)));
}

#[tokio::test]
async fn failed_start_is_sticky() {
    let mut cmd = Command::new("does-not-exist");

    let err = cmd.run().expect_err("missing binary");
    assert!(matches!(err, ExecError::FailedStarting(_)));

    let err = cmd.run().expect_err("run after failed start");
    assert!(matches!(err, ExecError::AlreadyFinished));

    let first = cmd.wait().await.expect_err("wait after failed start");
    let second = cmd.wait().await.expect_err("wait is repeatable");
    match (first, second) {
        (ExecError::FailedStarting(a), ExecError::FailedStarting(b)) => {
            // The very same sticky error, not a re-derived one.
            assert!(Arc::ptr_eq(&a, &b));
        }
        (a, b) => panic!("expected sticky FailedStarting, got {a:?} / {b:?}"),
    }

    let err = cmd
        .signal(Signal::SIGTERM)
        .expect_err("signal after failed start");
    assert!(matches!(err, ExecError::FailedSendingSignal(_)));

    let result = cmd.result().expect("placeholder result");
    assert_eq!(result.exit_code, -1);
}

#[tokio::test]
async fn operations_before_run_report_not_started() {
    let mut cmd = Command::new("printf");

    let err = cmd.wait().await.expect_err("wait before run");
    assert!(matches!(err, ExecError::NotStarted));

    let err = cmd.signal(Signal::SIGTERM).expect_err("signal before run");
    assert!(matches!(err, ExecError::NotStarted));
}

#[tokio::test]
async fn clone_of_a_finished_command_runs_fresh() {
    let mut cmd = Command::new("printf");
    cmd.with_args(["again"]);

    cmd.run().expect("run original");
    cmd.wait().await.expect("wait original");

    let mut copy = cmd.clone();
    copy.run().expect("run clone");
    let result = copy.wait().await.expect("wait clone");
    assert_eq!(result.stdout, "again");
}
