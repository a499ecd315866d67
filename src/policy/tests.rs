//! Unit tests for the role policy.

use super::*;
use crate::model::{MembershipType, NodeRole, RoleKind};
use crate::store::{MemoryRecordStore, RecordStore};
use crate::test_support::node_spec;
use rstest::rstest;

const fn counts(master: u64, etcd: u64, worker: u64) -> RoleCounts {
    RoleCounts {
        master,
        etcd,
        worker,
    }
}

#[rstest]
#[case::lone_master(NodeRole::Master, counts(1, 3, 3), Err(PolicyError::MasterNodeOnlyOne))]
#[case::lone_worker(NodeRole::Worker, counts(3, 3, 1), Err(PolicyError::WorkerNodeOnlyOne))]
#[case::lone_etcd(NodeRole::Etcd, counts(3, 1, 3), Err(PolicyError::EtcdNodeOnlyOne))]
#[case::master_checked_first(NodeRole::MasterEtcdWorker, counts(1, 1, 1), Err(PolicyError::MasterNodeOnlyOne))]
#[case::worker_before_etcd(NodeRole::EtcdWorker, counts(3, 1, 1), Err(PolicyError::WorkerNodeOnlyOne))]
#[case::etcd_counts_etcd_holders(NodeRole::Etcd, counts(3, 2, 0), Ok(()))]
#[case::two_masters(NodeRole::Master, counts(2, 0, 0), Ok(()))]
#[case::unrelated_roles_ignored(NodeRole::Worker, counts(0, 0, 2), Ok(()))]
fn assert_deletable_checks_each_held_role(
    #[case] role: NodeRole,
    #[case] role_counts: RoleCounts,
    #[case] expected: Result<(), PolicyError>,
) {
    assert_eq!(assert_deletable(role, role_counts), expected);
}

#[rstest]
#[case::master_etcd_drops_etcd(NodeRole::MasterEtcd, RoleKind::Etcd, counts(3, 3, 3), true)]
#[case::etcd_only_keeps_etcd(NodeRole::Etcd, RoleKind::Etcd, counts(3, 3, 3), false)]
#[case::etcd_worker_drops_etcd(NodeRole::EtcdWorker, RoleKind::Etcd, counts(3, 3, 3), true)]
#[case::all_roles_drop_etcd(NodeRole::MasterEtcdWorker, RoleKind::Etcd, counts(3, 3, 3), true)]
#[case::master_worker_has_no_etcd(NodeRole::MasterWorker, RoleKind::Etcd, counts(3, 3, 3), false)]
#[case::master_drops_master(NodeRole::Master, RoleKind::Master, counts(3, 3, 3), true)]
#[case::master_worker_drops_master(NodeRole::MasterWorker, RoleKind::Master, counts(3, 3, 3), true)]
#[case::master_etcd_drops_master(NodeRole::MasterEtcd, RoleKind::Master, counts(3, 3, 3), true)]
#[case::etcd_worker_has_no_master(NodeRole::EtcdWorker, RoleKind::Master, counts(3, 3, 3), false)]
#[case::worker_never_removed(NodeRole::MasterEtcdWorker, RoleKind::Worker, counts(3, 3, 3), false)]
#[case::worker_only_never_removed(NodeRole::Worker, RoleKind::Worker, counts(3, 3, 3), false)]
#[case::last_master_kept(NodeRole::MasterEtcd, RoleKind::Master, counts(1, 3, 3), false)]
#[case::last_etcd_kept(NodeRole::MasterEtcd, RoleKind::Etcd, counts(3, 1, 3), false)]
fn assert_role_deletable_applies_allow_lists(
    #[case] role: NodeRole,
    #[case] remove: RoleKind,
    #[case] role_counts: RoleCounts,
    #[case] allowed: bool,
) {
    let result = assert_role_deletable(role, remove, role_counts);
    if allowed {
        assert_eq!(result, Ok(()));
    } else {
        assert_eq!(result, Err(PolicyError::DeleteNodeRoleFailed));
    }
}

#[rstest]
#[case(NodeRole::Master, counts(3, 0, 0), true, true, true)]
#[case(NodeRole::Master, counts(2, 0, 0), false, true, true)]
#[case(NodeRole::EtcdWorker, counts(0, 2, 3), true, true, false)]
#[case(NodeRole::MasterEtcdWorker, counts(3, 3, 2), true, false, true)]
fn can_delete_node_counts_other_holders(
    #[case] role: NodeRole,
    #[case] role_counts: RoleCounts,
    #[case] master: bool,
    #[case] worker: bool,
    #[case] etcd: bool,
) {
    assert_eq!(
        can_delete_node(role, role_counts),
        DeleteCheck {
            enable_delete_master: master,
            enable_delete_worker: worker,
            enable_delete_etcd: etcd,
        }
    );
}

#[rstest]
fn error_codes_are_stable() {
    assert_eq!(PolicyError::MasterNodeOnlyOne.code(), "error.master.node.only.one");
    assert_eq!(
        PolicyError::DeleteNodeRoleFailed.to_string(),
        "error.delete.node.role.failed"
    );
}

#[rstest]
fn role_counts_load_from_store() {
    let store = MemoryRecordStore::new();
    let nodes = [
        node_spec("a", NodeRole::MasterEtcd, "10.0.0.1"),
        node_spec("b", NodeRole::EtcdWorker, "10.0.0.2"),
        node_spec("c", NodeRole::Worker, "10.0.0.3"),
    ];
    for spec in nodes {
        store
            .insert_node(1, 7, spec)
            .unwrap_or_else(|err| panic!("insert: {err}"));
    }
    let mut outer = node_spec("ctl", NodeRole::Master, "10.0.0.9");
    outer.membership = MembershipType::Outer;
    store
        .insert_node(1, 7, outer)
        .unwrap_or_else(|err| panic!("insert: {err}"));

    let loaded = RoleCounts::load(&store, 7).unwrap_or_else(|err| panic!("load: {err}"));

    assert_eq!(loaded, counts(2, 2, 2));
}

#[rstest]
fn outer_master_keeps_inner_master_deletable() {
    let store = MemoryRecordStore::new();
    let inner = store
        .insert_node(1, 3, node_spec("m1", NodeRole::Master, "10.0.0.1"))
        .unwrap_or_else(|err| panic!("insert: {err}"));
    let mut outer = node_spec("ctl", NodeRole::Master, "10.0.0.9");
    outer.membership = MembershipType::Outer;
    store
        .insert_node(1, 3, outer)
        .unwrap_or_else(|err| panic!("insert: {err}"));

    let loaded = RoleCounts::load(&store, 3).unwrap_or_else(|err| panic!("load: {err}"));

    assert_eq!(loaded.master, 2);
    assert_eq!(assert_deletable(inner.spec.role, loaded), Ok(()));
    assert!(can_delete_node(inner.spec.role, loaded).enable_delete_master);
}
