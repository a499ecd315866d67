//! BDD scenarios for the reconcile workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ReconcileWorld, reconcile_world};

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "A failed install marks the cluster failed"
)]
fn scenario_failed_install(reconcile_world: ReconcileWorld) {
    drop(reconcile_world);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "A finished install hands the cluster to the agent"
)]
fn scenario_finished_install(reconcile_world: ReconcileWorld) {
    drop(reconcile_world);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "An unfinished install is left running"
)]
fn scenario_unfinished_install(reconcile_world: ReconcileWorld) {
    drop(reconcile_world);
}
