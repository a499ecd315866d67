//! Unit tests for the in-memory record store.

use super::*;
use crate::test_support::{node_spec, outer_node_spec};
use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

#[fixture]
fn store() -> MemoryRecordStore {
    MemoryRecordStore::new()
}

fn draft(code: &str) -> ClusterDraft {
    ClusterDraft {
        code: code.to_owned(),
        name: format!("{code} cluster"),
    }
}

#[rstest]
fn insert_nodes_is_all_or_nothing(store: MemoryRecordStore) {
    store
        .insert_node(1, 5, node_spec("node-a", NodeRole::Master, "10.0.0.1"))
        .unwrap_or_else(|err| panic!("insert: {err}"));

    let err = store
        .insert_nodes(
            1,
            5,
            vec![
                node_spec("node-b", NodeRole::Worker, "10.0.0.2"),
                node_spec("node-a", NodeRole::Worker, "10.0.0.3"),
            ],
        )
        .expect_err("duplicate name should be rejected");

    assert!(matches!(err, StoreError::NotStored { entity: "node", .. }));
    let nodes = store
        .list_nodes(&NodeFilter::cluster(5))
        .unwrap_or_else(|err| panic!("list: {err}"));
    assert_eq!(nodes.len(), 1, "no node of the batch should be stored");
}

#[rstest]
fn duplicate_names_within_a_batch_are_rejected(store: MemoryRecordStore) {
    let result = store.insert_nodes(
        1,
        5,
        vec![
            node_spec("twin", NodeRole::Master, "10.0.0.1"),
            node_spec("twin", NodeRole::Worker, "10.0.0.2"),
        ],
    );
    assert!(result.is_err());
}

#[rstest]
fn same_name_is_allowed_in_another_cluster(store: MemoryRecordStore) {
    store
        .insert_node(1, 5, node_spec("node-a", NodeRole::Master, "10.0.0.1"))
        .unwrap_or_else(|err| panic!("insert: {err}"));
    store
        .insert_node(1, 6, node_spec("node-a", NodeRole::Master, "10.0.1.1"))
        .unwrap_or_else(|err| panic!("insert in second cluster: {err}"));
}

#[rstest]
fn node_filter_selects_by_name_and_membership(store: MemoryRecordStore) {
    store
        .insert_nodes(
            1,
            5,
            vec![
                node_spec("node-a", NodeRole::Master, "10.0.0.1"),
                outer_node_spec("bastion", "10.0.0.9"),
            ],
        )
        .unwrap_or_else(|err| panic!("insert: {err}"));

    let outer = store
        .list_nodes(&NodeFilter::cluster(5).membership(MembershipType::Outer))
        .unwrap_or_else(|err| panic!("list: {err}"));
    let named = store
        .list_nodes(&NodeFilter::cluster(5).named("node-a"))
        .unwrap_or_else(|err| panic!("list: {err}"));

    assert_eq!(
        outer.iter().map(|node| node.spec.name.as_str()).collect::<Vec<_>>(),
        ["bastion"]
    );
    assert_eq!(named.len(), 1);
}

#[rstest]
fn node_patch_updates_selected_fields(store: MemoryRecordStore) {
    let node = store
        .insert_node(1, 5, node_spec("node-a", NodeRole::MasterEtcd, "10.0.0.1"))
        .unwrap_or_else(|err| panic!("insert: {err}"));

    store
        .update_node(
            node.id,
            &NodePatch {
                operating_status: Some(NodeStatus::Failed),
                error_msg: Some(String::from("boom")),
                ..NodePatch::default()
            },
        )
        .unwrap_or_else(|err| panic!("update: {err}"));
    store
        .update_node(
            node.id,
            &NodePatch {
                role: Some(NodeRole::Master),
                error_msg: Some(String::new()),
                ..NodePatch::default()
            },
        )
        .unwrap_or_else(|err| panic!("update: {err}"));

    let stored = store
        .get_node(node.id)
        .unwrap_or_else(|err| panic!("get: {err}"))
        .unwrap_or_else(|| panic!("node should exist"));
    assert_eq!(stored.spec.role, NodeRole::Master);
    assert_eq!(stored.operating_status, Some(NodeStatus::Failed));
    assert_eq!(stored.error_msg, None);
}

#[rstest]
fn updates_on_missing_rows_report_not_found(store: MemoryRecordStore) {
    assert_eq!(
        store.update_cluster(42, &ClusterPatch::status(ClusterStatus::Failed)),
        Err(StoreError::NotFound {
            entity: "cluster",
            id: 42
        })
    );
    assert!(matches!(
        store.update_record(42, &RecordPatch::failed("x")),
        Err(StoreError::NotFound { entity: "record", .. })
    ));
}

#[rstest]
fn record_errors_accumulate(store: MemoryRecordStore) {
    let record = store
        .insert_record(NewRecord::new(5, OperationType::InstallK8s))
        .unwrap_or_else(|err| panic!("insert: {err}"));
    assert_eq!(record.status, OperationStatus::Operating);
    assert!(record.error_msg.is_empty());

    store
        .update_record(record.id, &RecordPatch::failed("first"))
        .unwrap_or_else(|err| panic!("update: {err}"));
    store
        .update_record(
            record.id,
            &RecordPatch {
                status: None,
                append_error: Some(String::from("second")),
            },
        )
        .unwrap_or_else(|err| panic!("update: {err}"));

    let stored = store
        .get_record(record.id)
        .unwrap_or_else(|err| panic!("get: {err}"))
        .unwrap_or_else(|| panic!("record should exist"));
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(stored.error_msg, "first\nsecond");
}

#[rstest]
fn record_filter_selects_operating_records(store: MemoryRecordStore) {
    let running = store
        .insert_record(NewRecord::new(5, OperationType::AddNode).node(3))
        .unwrap_or_else(|err| panic!("insert: {err}"));
    let finished = store
        .insert_record(NewRecord::new(6, OperationType::InstallK8s))
        .unwrap_or_else(|err| panic!("insert: {err}"));
    store
        .update_record(finished.id, &RecordPatch::status(OperationStatus::Success))
        .unwrap_or_else(|err| panic!("update: {err}"));

    let operating = store
        .list_records(&RecordFilter::with_status(OperationStatus::Operating))
        .unwrap_or_else(|err| panic!("list: {err}"));

    assert_eq!(operating.len(), 1);
    assert_eq!(operating.first().map(|record| record.id), Some(running.id));
}

#[rstest]
fn snapshot_round_trips_through_disk(store: MemoryRecordStore) {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("state/records.json"))
        .unwrap_or_else(|_| panic!("temp path should be utf8"));
    let cluster = store
        .insert_cluster(1, &draft("alpha"), ClusterStatus::Created)
        .unwrap_or_else(|err| panic!("insert cluster: {err}"));
    store
        .insert_node(1, cluster.id, node_spec("node-a", NodeRole::Master, "10.0.0.1"))
        .unwrap_or_else(|err| panic!("insert node: {err}"));
    store.save(&path).unwrap_or_else(|err| panic!("save: {err}"));

    let loaded = MemoryRecordStore::load(&path).unwrap_or_else(|err| panic!("load: {err}"));
    let next = loaded
        .insert_record(NewRecord::new(cluster.id, OperationType::InstallK8s))
        .unwrap_or_else(|err| panic!("insert record: {err}"));

    assert_eq!(
        loaded
            .get_cluster(cluster.id)
            .unwrap_or_else(|err| panic!("get: {err}")),
        Some(cluster)
    );
    assert!(next.id > 2, "ids must not be reused after reload");
}

#[rstest]
fn loading_a_missing_snapshot_yields_an_empty_store() {
    let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(tmp.path().join("absent/records.json"))
        .unwrap_or_else(|_| panic!("temp path should be utf8"));

    let loaded = MemoryRecordStore::load(&path).unwrap_or_else(|err| panic!("load: {err}"));

    assert_eq!(
        loaded
            .list_nodes(&NodeFilter::default())
            .unwrap_or_else(|err| panic!("list: {err}")),
        Vec::new()
    );
}

#[rstest]
fn duplicate_cluster_codes_are_rejected(store: MemoryRecordStore) {
    store
        .insert_cluster(1, &draft("alpha"), ClusterStatus::Created)
        .unwrap_or_else(|err| panic!("insert: {err}"));
    assert!(
        store
            .insert_cluster(1, &draft("alpha"), ClusterStatus::Created)
            .is_err()
    );
}

#[rstest]
fn control_node_prefers_outer_hosts(store: MemoryRecordStore) {
    store
        .insert_nodes(
            1,
            5,
            vec![
                node_spec("node-a", NodeRole::Master, "10.0.0.1"),
                outer_node_spec("bastion", "10.0.0.9"),
            ],
        )
        .unwrap_or_else(|err| panic!("insert: {err}"));
    store
        .insert_node(1, 6, node_spec("node-b", NodeRole::Master, "10.0.1.1"))
        .unwrap_or_else(|err| panic!("insert: {err}"));

    let picked = |cluster_id| {
        control_node(&store, cluster_id)
            .unwrap_or_else(|err| panic!("control node: {err}"))
            .map(|node| node.spec.name)
    };

    assert_eq!(picked(5).as_deref(), Some("bastion"));
    assert_eq!(picked(6).as_deref(), Some("node-b"));
    assert_eq!(picked(7), None);
}
