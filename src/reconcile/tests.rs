//! Unit tests for the status reconciler.

use std::time::Duration;

use parking_lot::Mutex;
use rstest::{fixture, rstest};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::kv::MemoryKvStore;
use crate::lock::lock_key;
use crate::model::{ClusterDraft, NewRecord, NodeRole, RecordId, RoleKind};
use crate::store::MemoryRecordStore;
use crate::test_support::{ScriptedConnector, node_spec, outer_node_spec, test_config};

type TestReconciler =
    StatusReconciler<ScriptedConnector, MemoryKvStore, MemoryRecordStore, TemplateAgentCommands>;

struct Harness {
    connector: ScriptedConnector,
    kv: MemoryKvStore,
    store: MemoryRecordStore,
    reconciler: TestReconciler,
    cluster: Cluster,
}

#[fixture]
fn harness() -> Harness {
    let connector = ScriptedConnector::new();
    let kv = MemoryKvStore::new();
    let store = MemoryRecordStore::new();
    let config = Arc::new(test_config("/tmp/hoist-test"));
    let cluster = store
        .insert_cluster(
            1,
            &ClusterDraft {
                code: String::from("alpha"),
                name: String::from("Alpha"),
            },
            ClusterStatus::Operating,
        )
        .unwrap_or_else(|err| panic!("insert cluster: {err}"));
    store
        .insert_nodes(
            1,
            cluster.id,
            vec![
                node_spec("m1", NodeRole::MasterEtcdWorker, "10.0.0.1"),
                outer_node_spec("bastion", "10.0.0.9"),
                node_spec("m2", NodeRole::Master, "10.0.0.2"),
            ],
        )
        .unwrap_or_else(|err| panic!("insert nodes: {err}"));
    let reconciler = StatusReconciler::new(
        Arc::clone(&config),
        connector.clone(),
        kv.clone(),
        store.clone(),
        TemplateAgentCommands::from_config(&config),
    );
    Harness {
        connector,
        kv,
        store,
        reconciler,
        cluster,
    }
}

impl Harness {
    fn record(&self, new: NewRecord) -> OperationRecord {
        self.store
            .insert_record(new)
            .unwrap_or_else(|err| panic!("insert record: {err}"))
    }

    fn stored_record(&self, id: RecordId) -> Option<OperationRecord> {
        self.store
            .get_record(id)
            .unwrap_or_else(|err| panic!("get record: {err}"))
    }

    fn cluster_status(&self) -> ClusterStatus {
        self.store
            .get_cluster(self.cluster.id)
            .unwrap_or_else(|err| panic!("get cluster: {err}"))
            .map(|cluster| cluster.status)
            .unwrap_or_else(|| panic!("cluster should exist"))
    }

    fn node(&self, name: &str) -> Option<Node> {
        self.store
            .list_nodes(&crate::store::NodeFilter::cluster(self.cluster.id).named(name))
            .unwrap_or_else(|err| panic!("list nodes: {err}"))
            .pop()
    }

    fn hold_cluster_lock(&self) {
        let held = self
            .kv
            .set_if_absent(&lock_key(self.cluster.id), "holder", Duration::from_secs(60))
            .unwrap_or_else(|err| panic!("lock: {err}"));
        assert!(held);
    }

    fn sweep(&self) -> SweepReport {
        self.reconciler
            .sweep()
            .unwrap_or_else(|err| panic!("sweep: {err}"))
    }
}

#[rstest]
fn missing_marker_means_still_running(harness: Harness) {
    let record = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    harness.connector.push_exec(
        1,
        "",
        &format!("cat: /tmp/{}: No such file or directory", record.id),
    );

    let report = harness.sweep();

    assert_eq!(report.running, 1);
    assert_eq!(harness.connector.connects(), ["10.0.0.9"]);
    assert_eq!(
        harness.connector.commands(),
        [(String::from("10.0.0.9"), format!("cat /tmp/{}", record.id))]
    );
    let stored = harness
        .stored_record(record.id)
        .unwrap_or_else(|| panic!("record should remain"));
    assert_eq!(stored.status, OperationStatus::Operating);
    assert_eq!(harness.cluster_status(), ClusterStatus::Operating);
    assert!(harness.kv.is_empty(), "sweep lock must be released");
}

#[rstest]
fn failed_install_marks_record_and_cluster_without_agent(harness: Harness) {
    let record = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    harness.connector.push_exec(0, "1\n", "");

    let report = harness.sweep();

    assert_eq!(report.finalized, 1);
    let stored = harness
        .stored_record(record.id)
        .unwrap_or_else(|| panic!("record should remain"));
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(
        stored.error_msg,
        "login node [ 10.0.0.9 ] and cat /tmp/install.log for more info"
    );
    assert_eq!(harness.cluster_status(), ClusterStatus::Failed);
    assert_eq!(harness.connector.commands().len(), 1, "no agent install");
}

#[rstest]
fn successful_install_disconnects_and_installs_agent(harness: Harness) {
    let record = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    harness.connector.push_exec(0, "0\r\n", "");

    harness.sweep();

    let commands: Vec<String> = harness
        .connector
        .commands()
        .into_iter()
        .map(|(_, command)| command)
        .collect();
    let [_, helm, agent] = commands.as_slice() else {
        panic!("expected cat, helm, and agent commands, got {commands:?}");
    };
    assert!(helm.contains("https://get.helm.sh/helm-v3.14.0-linux-amd64.tar.gz"), "{helm}");
    assert_eq!(
        agent,
        &format!("helm install agent-alpha --set clusterId={}", harness.cluster.id)
    );
    let stored = harness
        .stored_record(record.id)
        .unwrap_or_else(|| panic!("record should remain"));
    assert_eq!(stored.status, OperationStatus::Success);
    assert!(stored.error_msg.is_empty());
    assert_eq!(harness.cluster_status(), ClusterStatus::Disconnect);
}

#[rstest]
fn agent_failure_is_appended_but_install_stays_successful(harness: Harness) {
    let record = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    harness.connector.push_exec(0, "0", "");
    harness.connector.push_exec(0, "", "");
    harness.connector.push_exec(1, "release failed", "chart not found");

    harness.sweep();

    let stored = harness
        .stored_record(record.id)
        .unwrap_or_else(|| panic!("record should remain"));
    assert_eq!(stored.status, OperationStatus::Success);
    assert_eq!(stored.error_msg, "release failed\nchart not found");
    assert_eq!(harness.cluster_status(), ClusterStatus::Disconnect);
}

#[rstest]
fn unreadable_marker_fails_with_stderr(harness: Harness) {
    let record = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    harness.connector.push_exec(1, "", "cat: /tmp/7: Permission denied");

    harness.sweep();

    let stored = harness
        .stored_record(record.id)
        .unwrap_or_else(|| panic!("record should remain"));
    assert_eq!(stored.status, OperationStatus::Failed);
    assert_eq!(stored.error_msg, "cat: /tmp/7: Permission denied");
    assert_eq!(harness.cluster_status(), ClusterStatus::Failed);
}

#[rstest]
#[case::failed(ClusterStatus::Failed, OperationStatus::Failed)]
#[case::running(ClusterStatus::Running, OperationStatus::Success)]
#[case::disconnect(ClusterStatus::Disconnect, OperationStatus::Success)]
fn settled_cluster_resolves_record_without_connecting(
    harness: Harness,
    #[case] cluster_status: ClusterStatus,
    #[case] expected: OperationStatus,
) {
    let record = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    harness
        .store
        .update_cluster(harness.cluster.id, &ClusterPatch::status(cluster_status))
        .unwrap_or_else(|err| panic!("update cluster: {err}"));

    harness.sweep();

    let stored = harness
        .stored_record(record.id)
        .unwrap_or_else(|| panic!("record should remain"));
    assert_eq!(stored.status, expected);
    assert!(harness.connector.is_untouched());
}

#[rstest]
fn record_of_missing_cluster_is_pruned() {
    let store = MemoryRecordStore::new();
    let config = Arc::new(test_config("/tmp/hoist-test"));
    let connector = ScriptedConnector::new();
    let reconciler = StatusReconciler::new(
        Arc::clone(&config),
        connector.clone(),
        MemoryKvStore::new(),
        store.clone(),
        TemplateAgentCommands::default(),
    );
    let record = store
        .insert_record(NewRecord::new(42, OperationType::InstallK8s))
        .unwrap_or_else(|err| panic!("insert record: {err}"));
    let mut events = reconciler.subscribe();

    let report = reconciler
        .sweep()
        .unwrap_or_else(|err| panic!("sweep: {err}"));

    assert_eq!(report.pruned, 1);
    assert!(
        store
            .get_record(record.id)
            .unwrap_or_else(|err| panic!("get record: {err}"))
            .is_none()
    );
    assert_eq!(
        events.try_recv().ok(),
        Some(Completion {
            record_id: record.id,
            cluster_id: 42,
            outcome: Outcome::Pruned,
        })
    );
    assert!(connector.is_untouched());
}

#[rstest]
fn added_node_becomes_ready_and_lease_is_finished(harness: Harness) {
    let node = harness
        .store
        .insert_node(1, harness.cluster.id, node_spec("w1", NodeRole::Worker, "10.0.0.4"))
        .unwrap_or_else(|err| panic!("insert node: {err}"));
    harness
        .store
        .update_node(
            node.id,
            &NodePatch {
                operating_status: Some(NodeStatus::Failed),
                error_msg: Some(String::from("earlier failure")),
                ..NodePatch::default()
            },
        )
        .unwrap_or_else(|err| panic!("update node: {err}"));
    let record =
        harness.record(NewRecord::new(harness.cluster.id, OperationType::AddNode).node(node.id));
    harness.hold_cluster_lock();
    harness.connector.push_exec(0, "0\n", "");

    harness.sweep();

    let ready = harness
        .node("w1")
        .unwrap_or_else(|| panic!("node should remain"));
    assert_eq!(ready.operating_status, Some(NodeStatus::Ready));
    assert_eq!(ready.error_msg, None);
    assert_eq!(harness.cluster_status(), ClusterStatus::Running);
    assert_eq!(
        harness
            .stored_record(record.id)
            .map(|stored| stored.status),
        Some(OperationStatus::Success)
    );
    assert!(
        harness
            .kv
            .get(&lock_key(harness.cluster.id))
            .unwrap_or_else(|err| panic!("kv: {err}"))
            .is_none()
    );
    let snapshot = DistributedLock::new(harness.kv.clone())
        .read_snapshot(harness.cluster.id)
        .unwrap_or_else(|err| panic!("snapshot: {err}"))
        .unwrap_or_else(|| panic!("snapshot should be written"));
    assert_eq!(snapshot.status, OperationStatus::Success);
    assert_eq!(snapshot.operating, OperationType::AddNode);
}

#[rstest]
fn failed_add_marks_the_new_node(harness: Harness) {
    let node = harness
        .store
        .insert_node(1, harness.cluster.id, node_spec("w1", NodeRole::Worker, "10.0.0.4"))
        .unwrap_or_else(|err| panic!("insert node: {err}"));
    harness.record(NewRecord::new(harness.cluster.id, OperationType::AddNode).node(node.id));
    harness.hold_cluster_lock();
    harness.connector.push_exec(0, "2", "");

    harness.sweep();

    let failed = harness
        .node("w1")
        .unwrap_or_else(|| panic!("node should remain"));
    assert_eq!(failed.operating_status, Some(NodeStatus::Failed));
    assert_eq!(
        failed.error_msg.as_deref(),
        Some("login node [ 10.0.0.9 ] and cat /tmp/install.log for more info")
    );
    assert!(
        harness
            .kv
            .get(&lock_key(harness.cluster.id))
            .unwrap_or_else(|err| panic!("kv: {err}"))
            .is_none()
    );
}

#[rstest]
fn deleted_node_row_is_removed(harness: Harness) {
    let target = harness
        .node("m1")
        .unwrap_or_else(|| panic!("m1 should exist"));
    harness.record(NewRecord::new(harness.cluster.id, OperationType::DeleteNode).node(target.id));
    harness.connector.push_exec(0, "0", "");

    harness.sweep();

    assert!(harness.node("m1").is_none());
    assert_eq!(harness.cluster_status(), ClusterStatus::Running);
}

#[rstest]
#[case::keeps_remaining_roles("m1", RoleKind::Etcd, Some(NodeRole::MasterWorker))]
#[case::last_role_deletes_node("m2", RoleKind::Master, None)]
fn removed_role_is_subtracted(
    harness: Harness,
    #[case] name: &str,
    #[case] kind: RoleKind,
    #[case] expected: Option<NodeRole>,
) {
    let target = harness
        .node(name)
        .unwrap_or_else(|| panic!("{name} should exist"));
    harness.record(
        NewRecord::new(harness.cluster.id, OperationType::DeleteNodeRole)
            .node(target.id)
            .removed_role(kind),
    );
    harness.connector.push_exec(0, "0", "");

    harness.sweep();

    assert_eq!(harness.node(name).map(|node| node.spec.role), expected);
}

#[rstest]
fn held_sweep_lock_skips_the_sweep(harness: Harness) {
    harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    let held = harness
        .kv
        .set_if_absent(SWEEP_LOCK_KEY, "other", Duration::from_secs(60))
        .unwrap_or_else(|err| panic!("lock: {err}"));
    assert!(held);

    let report = harness.sweep();

    assert_eq!(report, SweepReport::skipped());
    assert!(harness.connector.is_untouched());
    assert!(
        harness
            .kv
            .get(SWEEP_LOCK_KEY)
            .unwrap_or_else(|err| panic!("kv: {err}"))
            .is_some(),
        "a skipped sweep must not release another holder's lock"
    );
}

#[derive(Clone, Default)]
struct CollectingHook {
    seen: Arc<Mutex<Vec<(RecordId, ReconcileError)>>>,
}

impl SweepErrorHook for CollectingHook {
    fn on_record_error(&self, record: &OperationRecord, error: &ReconcileError) {
        self.seen.lock().push((record.id, error.clone()));
    }
}

#[rstest]
fn record_errors_reach_the_hook_and_sweep_continues(harness: Harness) {
    let hook = CollectingHook::default();
    let Harness {
        connector,
        store,
        reconciler,
        cluster,
        ..
    } = harness;
    let reconciler = reconciler.with_error_hook(hook.clone());
    connector.refuse_host("10.0.0.9");
    let first = store
        .insert_record(NewRecord::new(cluster.id, OperationType::InstallK8s))
        .unwrap_or_else(|err| panic!("insert record: {err}"));
    let orphan = store
        .insert_record(NewRecord::new(404, OperationType::InstallK8s))
        .unwrap_or_else(|err| panic!("insert record: {err}"));

    let report = reconciler
        .sweep()
        .unwrap_or_else(|err| panic!("sweep: {err}"));

    assert_eq!(report.errors, 1);
    assert_eq!(report.pruned, 1);
    let seen = hook.seen.lock().clone();
    let [(record_id, error)] = seen.as_slice() else {
        panic!("expected one hooked error, got {seen:?}");
    };
    assert_eq!(*record_id, first.id);
    assert_eq!(error.to_string(), "Failed to connect to host: [ 10.0.0.9 ] by ssh");
    assert!(
        store
            .get_record(orphan.id)
            .unwrap_or_else(|err| panic!("get record: {err}"))
            .is_none()
    );
}

#[rstest]
#[tokio::test]
async fn handle_waits_for_its_completion(harness: Harness) {
    let other = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    let record = harness.record(NewRecord::new(harness.cluster.id, OperationType::InstallK8s));
    harness.connector.push_exec(1, "", "No such file or directory");
    harness.connector.push_exec(0, "0", "");
    let handle = OperationHandle {
        record_id: record.id,
        cluster_id: harness.cluster.id,
    };
    let mut events = harness.reconciler.subscribe();

    harness.sweep();

    let completion = handle
        .wait(&mut events)
        .await
        .unwrap_or_else(|err| panic!("wait: {err}"));
    assert_eq!(completion.outcome, Outcome::Succeeded);
    assert_ne!(completion.record_id, other.id);
}

#[rstest]
fn agent_template_rejects_unsafe_codes() {
    let agent = TemplateAgentCommands::new(Some(String::from("install {{cluster-code}}")));
    let cluster = Cluster {
        id: 3,
        project_id: 1,
        code: String::from("a; rm -rf /"),
        name: String::from("Alpha"),
        status: ClusterStatus::Operating,
    };

    let err = agent
        .install_command(&cluster)
        .expect_err("unsafe code should be rejected");

    assert_eq!(
        err,
        AgentError::UnsafeValue {
            field: "code",
            value: String::from("a; rm -rf /"),
        }
    );
}

#[rstest]
fn agent_template_quotes_names() {
    let agent = TemplateAgentCommands::new(Some(String::from(
        "install {{cluster-code}} --name {{cluster-name}} --id {{cluster-id}}",
    )));
    let cluster = Cluster {
        id: 3,
        project_id: 1,
        code: String::from("alpha"),
        name: String::from("Alpha Prod"),
        status: ClusterStatus::Operating,
    };

    let command = agent
        .install_command(&cluster)
        .unwrap_or_else(|err| panic!("render: {err}"));

    assert_eq!(
        command.as_deref(),
        Some("install alpha --name 'Alpha Prod' --id 3")
    );
}

struct CancellingSweep {
    calls: Mutex<u64>,
    token: CancellationToken,
}

impl Sweep for CancellingSweep {
    fn sweep(&self) -> Result<SweepReport, ReconcileError> {
        *self.calls.lock() += 1;
        self.token.cancel();
        Ok(SweepReport::skipped())
    }
}

#[rstest]
#[tokio::test]
async fn loop_sweeps_immediately_and_stops_on_cancel() {
    let token = CancellationToken::new();
    let sweeper = Arc::new(CancellingSweep {
        calls: Mutex::new(0),
        token: token.clone(),
    });
    let driver = ReconcileLoop::new(Arc::clone(&sweeper), Duration::from_secs(3600));

    let passes = driver.run(&token).await;

    assert_eq!(passes, 1);
    assert_eq!(*sweeper.calls.lock(), 1);
}

#[rstest]
#[tokio::test]
async fn cancelled_loop_never_sweeps() {
    let token = CancellationToken::new();
    token.cancel();
    let sweeper = Arc::new(CancellingSweep {
        calls: Mutex::new(0),
        token: token.clone(),
    });
    let driver = ReconcileLoop::new(Arc::clone(&sweeper), Duration::from_secs(3600));

    assert_eq!(driver.run(&token).await, 0);
    assert_eq!(*sweeper.calls.lock(), 0);
}
