//! BDD step definitions for the reconcile workflow.

use hoist::reconcile::ReconcileError;
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{
    ReconcileWorld, WorldError, parse_cluster_status, parse_record_status,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a cluster with an operating install")]
fn operating_install(reconcile_world: &ReconcileWorld) -> Result<(), StepError> {
    reconcile_world.seed_install()?;
    Ok(())
}

#[given("the exit-code marker reads \"{code}\"")]
fn marker_reads(reconcile_world: &ReconcileWorld, code: String) {
    reconcile_world
        .connector
        .push_exec(0, &format!("{code}\r\n"), "");
}

#[given("the exit-code marker is missing")]
fn marker_missing(reconcile_world: &ReconcileWorld) {
    reconcile_world
        .connector
        .push_exec(1, "", "cat: /tmp/1: No such file or directory");
}

#[given("the agent install fails with \"{message}\"")]
fn agent_fails(reconcile_world: &ReconcileWorld, message: String) {
    // Helm bootstrap succeeds first.
    reconcile_world.connector.push_exec(0, "", "");
    reconcile_world.connector.push_exec(1, "", &message);
}

#[when("the reconciler sweeps")]
fn reconciler_sweeps(reconcile_world: &ReconcileWorld) -> Result<(), StepError> {
    let report = reconcile_world.reconciler.sweep()?;
    *reconcile_world.report.lock() = Some(report);
    Ok(())
}

#[then("the record status is \"{status}\"")]
fn record_status(reconcile_world: &ReconcileWorld, status: String) -> Result<(), StepError> {
    let expected = parse_record_status(&status)?;
    let record = reconcile_world.record()?;
    if record.status == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected record status {expected:?}, got {:?}",
            record.status
        )))
    }
}

#[then("the cluster status is \"{status}\"")]
fn cluster_status(reconcile_world: &ReconcileWorld, status: String) -> Result<(), StepError> {
    let expected = parse_cluster_status(&status)?;
    let actual = reconcile_world.cluster_status()?;
    if actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected cluster status {expected:?}, got {actual:?}"
        )))
    }
}

#[then("the record error mentions \"{text}\"")]
fn record_error_mentions(reconcile_world: &ReconcileWorld, text: String) -> Result<(), StepError> {
    let record = reconcile_world.record()?;
    if record.error_msg.contains(&text) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected error containing {text:?}, got {:?}",
            record.error_msg
        )))
    }
}

#[then("no agent install is attempted")]
fn no_agent_install(reconcile_world: &ReconcileWorld) -> Result<(), StepError> {
    let commands = reconcile_world.connector.commands();
    if commands.len() == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only the marker read, got {commands:?}"
        )))
    }
}

#[then("the sweep lock is released")]
fn sweep_lock_released(reconcile_world: &ReconcileWorld) -> Result<(), StepError> {
    let acquired = reconcile_world
        .report
        .lock()
        .as_ref()
        .is_some_and(|report| report.acquired);
    if !acquired {
        return Err(StepError::Assertion(String::from(
            "sweep should have held the lock",
        )));
    }
    if reconcile_world.kv.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "sweep lock key should be deleted",
        )))
    }
}
