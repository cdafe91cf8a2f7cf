//! End-to-end tests for the maintainer.
//!
//! Each test stores a real cascade tree through the builder, then drives it
//! with explicit pass times against a scripted broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use super::Maintainer;
use crate::broker::{BrokerError, LastOperationState};
use crate::cascade::{BuildOutcome, CascadeOptions, TreeBuilder};
use crate::config::CascadeConfig;
use crate::store::{MemoryRepository, Query, Repository};
use crate::test_utils::{
    BrokerCall, ScriptedBroker, Step, TENANT_SCENARIO_OPERATIONS, binding, broker_with_plans,
    instance, platform, seed, seed_tenant_scenario, t0,
};
use crate::types::{Operation, OperationErrors, OperationId, OperationState, ResourceType};

const MAX_PASSES: usize = 100;

// ─── Test Helpers ───

fn test_config() -> CascadeConfig {
    CascadeConfig {
        action_timeout: Duration::from_secs(30),
        maintainer_retry_interval: Duration::from_secs(60),
        polling_interval: Duration::from_secs(10),
        poll_cascade_interval: Duration::from_secs(10),
        cleanup_interval: Duration::from_secs(3600),
        lifespan: Duration::from_secs(3600),
        reconciliation_operation_timeout: Duration::from_secs(3600),
        cascade_orphan_mitigation_timeout: Duration::from_secs(1800),
        ..CascadeConfig::new()
    }
}

struct Harness {
    repo: Arc<MemoryRepository>,
    broker: Arc<ScriptedBroker>,
    maintainer: Maintainer<MemoryRepository, ScriptedBroker>,
}

impl Harness {
    fn new(config: CascadeConfig) -> Self {
        Self::with_repo(Arc::new(MemoryRepository::new()), config)
    }

    fn with_repo(repo: Arc<MemoryRepository>, config: CascadeConfig) -> Self {
        let broker = Arc::new(ScriptedBroker::new());
        let maintainer = Maintainer::new(repo.clone(), broker.clone(), config);
        Harness {
            repo,
            broker,
            maintainer,
        }
    }

    async fn cascade(&self, resource_type: ResourceType, id: &str, force: bool) -> OperationId {
        let builder = TreeBuilder::new(self.repo.clone(), self.maintainer.config());
        let options = CascadeOptions {
            force,
            ..CascadeOptions::default()
        };
        match builder
            .start_cascade(resource_type, id.into(), &options, t0())
            .await
            .unwrap()
        {
            BuildOutcome::Created { root_id, .. } => root_id,
            other => panic!("expected a new tree, got {other:?}"),
        }
    }

    /// Runs a pass every polling interval, starting at `t0`, until `root`
    /// settles. Returns the time of the last pass.
    async fn drive(&self, root: OperationId) -> DateTime<Utc> {
        let step = TimeDelta::from_std(self.maintainer.config().polling_interval).unwrap();
        let mut now = t0();
        for _ in 0..MAX_PASSES {
            self.maintainer.run_pass(now).await.unwrap();
            if self.op(root).await.is_settled() {
                return now;
            }
            now += step;
        }
        panic!("cascade {root} did not settle after {MAX_PASSES} passes");
    }

    async fn op(&self, id: OperationId) -> Operation {
        self.repo.get_operation(&id).await.unwrap().unwrap()
    }

    async fn tree(&self, root: OperationId) -> Vec<Operation> {
        self.repo.list_operations(&Query::tree(root)).await.unwrap()
    }

    async fn exists(&self, resource_type: ResourceType, id: &str) -> bool {
        self.repo
            .get_resource(resource_type, &id.into())
            .await
            .unwrap()
            .is_some()
    }
}

fn ops_for<'a>(ops: &'a [Operation], resource_id: &str) -> Vec<&'a Operation> {
    ops.iter()
        .filter(|op| op.resource_id.as_str() == resource_id)
        .collect()
}

/// Platform `p1` hosting `i1` (bindings `bd1`, `bd2`) and `i2`, all on
/// broker `b1`.
async fn seed_platform(repo: &MemoryRepository) {
    seed(repo, broker_with_plans("b1", &["pl1"], None)).await;
    seed(
        repo,
        [
            platform("p1", None),
            instance("i1", "pl1", Some("p1"), None),
            instance("i2", "pl1", Some("p1"), None),
            binding("bd1", "i1"),
            binding("bd2", "i1"),
        ],
    )
    .await;
}

fn rejected() -> BrokerError {
    BrokerError::from_status(400, "request rejected")
}

// ─── Happy Path ───

#[tokio::test]
async fn tenant_cascade_deletes_everything_bottom_up() {
    let h = Harness::new(test_config());
    seed_tenant_scenario(h.repo.as_ref()).await;
    let root = h.cascade(ResourceType::Tenant, "t1", false).await;

    h.drive(root).await;

    let ops = h.tree(root).await;
    assert_eq!(ops.len(), TENANT_SCENARIO_OPERATIONS);
    assert!(ops.iter().all(|op| op.state == OperationState::Succeeded));

    let by_id: HashMap<OperationId, &Operation> = ops.iter().map(|op| (op.id, op)).collect();
    for op in &ops {
        assert!(op.updated_at >= op.created_at);
        if let Some(parent) = op.parent_id.and_then(|id| by_id.get(&id)) {
            assert!(
                parent.updated_at >= op.updated_at,
                "{} {} settled before its child {} {}",
                parent.resource_type,
                parent.resource_id,
                op.resource_type,
                op.resource_id
            );
        }
    }

    assert_eq!(
        h.repo
            .count_resources(ResourceType::ServiceInstance, &Query::all())
            .await
            .unwrap(),
        0
    );
    assert!(!h.exists(ResourceType::Platform, "p1").await);
    assert!(!h.exists(ResourceType::ServiceBroker, "b1").await);
    assert!(h.exists(ResourceType::ServiceBroker, "b2").await);
    assert_eq!(h.broker.deletions_of("i-both"), 1, "duplicates never act");
}

#[tokio::test]
async fn accepted_job_is_polled_and_owned_by_one_operation() {
    let h = Harness::new(test_config());
    seed_tenant_scenario(h.repo.as_ref()).await;
    h.broker.accept_delete("i-both", Some("job-1"));
    h.broker.on_poll("i-both", LastOperationState::InProgress);
    let root = h.cascade(ResourceType::Tenant, "t1", false).await;

    h.drive(root).await;

    let ops = h.tree(root).await;
    assert!(ops.iter().all(|op| op.state == OperationState::Succeeded));
    let both = ops_for(&ops, "i-both");
    assert_eq!(both.len(), 2);
    assert_eq!(
        both.iter().filter(|op| op.external_id.is_some()).count(),
        1,
        "at most one operation records the broker job"
    );

    let mut owners: HashMap<&str, usize> = HashMap::new();
    for op in ops.iter().filter(|op| op.external_id.is_some()) {
        *owners.entry(op.resource_id.as_str()).or_default() += 1;
    }
    assert!(owners.values().all(|&n| n == 1));

    let polls: Vec<BrokerCall> = h
        .broker
        .calls()
        .into_iter()
        .filter(|c| matches!(c, BrokerCall::LastOperation(..)))
        .collect();
    assert_eq!(
        polls,
        vec![BrokerCall::LastOperation("i-both".into(), Some("job-1".to_string())); 2]
    );
    assert_eq!(h.broker.deletions_of("i-both"), 1);
}

#[tokio::test]
async fn accepted_job_without_id_polls_without_operation() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    h.broker.accept_delete("bd1", None);
    let root = h.cascade(ResourceType::ServiceInstance, "i1", false).await;

    h.drive(root).await;

    let ops = h.tree(root).await;
    let bd1 = ops_for(&ops, "bd1")[0];
    assert_eq!(bd1.external_id, Some(bd1.id.to_string()));
    assert!(
        h.broker
            .calls()
            .contains(&BrokerCall::LastOperation("bd1".into(), None))
    );
}

// ─── Failure Aggregation ───

#[tokio::test]
async fn force_continues_past_failures_and_collects_them() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    h.broker.fail_delete("bd1", rejected());
    h.broker.fail_delete("bd2", rejected());
    let root = h.cascade(ResourceType::Platform, "p1", true).await;

    h.drive(root).await;

    let ops = h.tree(root).await;
    let i1 = ops_for(&ops, "i1")[0];
    assert_eq!(i1.state, OperationState::Failed);
    assert_eq!(i1.errors.len(), 2);
    for record in i1.errors.iter() {
        assert_eq!(record.resource_type, ResourceType::ServiceBinding);
        assert_eq!(record.parent_type, Some(ResourceType::ServiceInstance));
        assert_eq!(record.parent_id.as_ref().map(|id| id.as_str()), Some("i1"));
    }

    let root_op = h.op(root).await;
    assert_eq!(root_op.state, OperationState::Failed);
    assert_eq!(root_op.errors, i1.errors);

    assert_eq!(h.broker.deletions_of("i1"), 1, "force still deprovisions the parent");
    assert!(!h.exists(ResourceType::Platform, "p1").await);
    assert_eq!(ops_for(&ops, "i2")[0].state, OperationState::Succeeded);
}

#[tokio::test]
async fn failure_stops_ancestors_without_force() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    h.broker.fail_delete("bd1", rejected());
    let root = h.cascade(ResourceType::Platform, "p1", false).await;

    h.drive(root).await;

    let ops = h.tree(root).await;
    assert_eq!(ops_for(&ops, "bd2")[0].state, OperationState::Succeeded);
    assert_eq!(ops_for(&ops, "i2")[0].state, OperationState::Succeeded);
    assert_eq!(ops_for(&ops, "i1")[0].state, OperationState::Failed);

    let root_op = h.op(root).await;
    assert_eq!(root_op.state, OperationState::Failed);
    assert_eq!(root_op.errors.len(), 1);
    let record = root_op.errors.first().unwrap();
    assert_eq!(record.resource_id.as_str(), "bd1");
    assert_eq!(record.parent_id.as_ref().map(|id| id.as_str()), Some("i1"));

    assert_eq!(h.broker.deletions_of("i1"), 0);
    assert!(h.exists(ResourceType::ServiceInstance, "i1").await);
    assert!(h.exists(ResourceType::Platform, "p1").await);
    assert!(!h.exists(ResourceType::ServiceInstance, "i2").await);
}

#[tokio::test]
async fn duplicate_mirrors_primary_in_another_tree() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    h.broker.fail_delete("i2", rejected());
    let first = h.cascade(ResourceType::ServiceInstance, "i2", false).await;
    let second = h.cascade(ResourceType::Platform, "p1", false).await;

    h.drive(second).await;

    let primary = h.op(first).await;
    let ops = h.tree(second).await;
    let dup = ops_for(&ops, "i2")[0];
    assert_eq!(dup.primary_id, Some(first));
    assert_eq!(primary.state, OperationState::Failed);
    assert_eq!(dup.state, OperationState::Failed);
    assert_eq!(dup.errors, primary.errors);
    assert!(dup.external_id.is_none());
    assert_eq!(h.broker.deletions_of("i2"), 1);
    assert_eq!(h.op(second).await.state, OperationState::Failed);
}

/// Cascades `i2` on its own, then `p1`, so `p1`'s tree holds a duplicate of
/// the first tree's root. Returns both roots.
async fn duplicate_setup(h: &Harness) -> (OperationId, OperationId) {
    seed_platform(h.repo.as_ref()).await;
    let first = h.cascade(ResourceType::ServiceInstance, "i2", false).await;
    let second = h.cascade(ResourceType::Platform, "p1", false).await;
    (first, second)
}

async fn duplicate_in(h: &Harness, root: OperationId, resource_id: &str) -> Operation {
    let ops = h.tree(root).await;
    let dup = ops_for(&ops, resource_id)
        .into_iter()
        .find(|op| op.is_duplicate())
        .cloned();
    dup.unwrap()
}

#[tokio::test]
async fn duplicate_fails_when_primary_is_gone() {
    let h = Harness::new(test_config());
    let (first, second) = duplicate_setup(&h).await;
    assert_eq!(h.repo.delete_operations(&[first]).await.unwrap(), 1);

    h.drive(second).await;

    let dup = duplicate_in(&h, second, "i2").await;
    assert_eq!(dup.state, OperationState::Failed);
    let message = &dup.errors.first().unwrap().message;
    assert!(message.contains("no longer exists"), "{message}");
    assert_eq!(h.broker.deletions_of("i2"), 0);
    assert!(h.exists(ResourceType::ServiceInstance, "i2").await);
    assert_eq!(h.op(second).await.state, OperationState::Failed);
}

#[tokio::test]
async fn duplicate_of_primary_failed_without_errors_gets_a_record() {
    let h = Harness::new(test_config());
    let (first, second) = duplicate_setup(&h).await;
    let mut primary = h.op(first).await;
    primary.fail(OperationErrors::new(), t0()).unwrap();
    h.repo.update_operation(&primary).await.unwrap();

    h.drive(second).await;

    let dup = duplicate_in(&h, second, "i2").await;
    assert_eq!(dup.state, OperationState::Failed);
    let records: Vec<_> = dup.errors.iter().collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].message, "primary deletion failed");
    assert_eq!(records[0].resource_id.as_str(), "i2");
    assert_eq!(records[0].parent_id.as_ref().map(|id| id.as_str()), Some("p1"));
    assert_eq!(h.broker.deletions_of("i2"), 0);
}

#[tokio::test]
async fn duplicate_of_unsettled_primary_times_out() {
    let config = CascadeConfig {
        reconciliation_operation_timeout: Duration::from_secs(120),
        ..test_config()
    };
    let h = Harness::new(config);
    let (first, second) = duplicate_setup(&h).await;
    let mut primary = h.op(first).await;
    primary.ready = false;
    h.repo.update_operation(&primary).await.unwrap();

    let done = h.drive(second).await;

    assert!(done >= t0() + TimeDelta::seconds(120), "waits for the deadline");
    let dup = duplicate_in(&h, second, "i2").await;
    assert_eq!(dup.state, OperationState::Failed);
    assert_eq!(
        dup.errors.first().unwrap().message,
        "reconciliation timeout exceeded"
    );
    assert_eq!(h.op(first).await.state, OperationState::Pending);
    assert_eq!(h.broker.deletions_of("i2"), 0);
    assert!(!h.exists(ResourceType::ServiceInstance, "i1").await);
}

// ─── Retries ───

#[tokio::test]
async fn transient_failure_is_retried() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    h.broker
        .fail_delete("i2", BrokerError::from_status(503, "unavailable"));
    let root = h.cascade(ResourceType::ServiceInstance, "i2", false).await;

    let done = h.drive(root).await;

    assert_eq!(h.op(root).await.state, OperationState::Succeeded);
    assert_eq!(h.broker.deletions_of("i2"), 2);
    assert!(done >= t0() + TimeDelta::seconds(60), "retry waits for the retry interval");
}

#[tokio::test]
async fn transient_failures_give_up_at_reconciliation_timeout() {
    let config = CascadeConfig {
        reconciliation_operation_timeout: Duration::from_secs(120),
        ..test_config()
    };
    let h = Harness::new(config);
    seed_platform(h.repo.as_ref()).await;
    for _ in 0..10 {
        h.broker
            .fail_delete("i2", BrokerError::from_status(503, "unavailable"));
    }
    let root = h.cascade(ResourceType::ServiceInstance, "i2", false).await;

    h.drive(root).await;

    let root_op = h.op(root).await;
    assert_eq!(root_op.state, OperationState::Failed);
    assert!(
        root_op
            .errors
            .iter()
            .any(|r| r.message.contains("reconciliation timeout"))
    );
    assert_eq!(h.broker.deletions_of("i2"), 3);
    assert!(h.exists(ResourceType::ServiceInstance, "i2").await);
}

#[tokio::test(start_paused = true)]
async fn ambiguous_failure_is_retried_by_orphan_mitigation() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    h.broker.on_delete("i2", Step::Hang);
    let root = h.cascade(ResourceType::ServiceInstance, "i2", false).await;

    h.maintainer.run_pass(t0()).await.unwrap();
    let mitigating = h.op(root).await;
    assert_eq!(mitigating.state, OperationState::Failed);
    assert_eq!(mitigating.deletion_scheduled, Some(t0()));
    assert!(!mitigating.is_settled());

    h.drive(root).await;

    let root_op = h.op(root).await;
    assert_eq!(root_op.state, OperationState::Succeeded);
    assert!(root_op.deletion_scheduled.is_none());
    assert!(root_op.errors.is_empty());
    assert_eq!(h.broker.deletions_of("i2"), 2);
}

#[tokio::test(start_paused = true)]
async fn orphan_mitigation_gives_up_when_window_closes() {
    let config = CascadeConfig {
        cascade_orphan_mitigation_timeout: Duration::from_secs(300),
        ..test_config()
    };
    let h = Harness::new(config);
    seed_platform(h.repo.as_ref()).await;
    for _ in 0..10 {
        h.broker.on_delete("i2", Step::Hang);
    }
    let root = h.cascade(ResourceType::ServiceInstance, "i2", false).await;

    let done = h.drive(root).await;

    let root_op = h.op(root).await;
    assert_eq!(root_op.state, OperationState::Failed);
    assert!(root_op.deletion_scheduled.is_none());
    assert!(
        root_op
            .errors
            .iter()
            .any(|r| r.message.contains("orphan mitigation"))
    );
    assert!(h.broker.deletions_of("i2") >= 2);
    assert!(done > t0() + TimeDelta::seconds(300));
}

#[tokio::test(start_paused = true)]
async fn parent_waits_for_orphan_mitigation_of_child() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    h.broker.on_delete("i2", Step::Hang);
    let root = h.cascade(ResourceType::Platform, "p1", false).await;

    for secs in [0, 10, 20, 30] {
        h.maintainer
            .run_pass(t0() + TimeDelta::seconds(secs))
            .await
            .unwrap();
    }
    assert_eq!(h.op(root).await.state, OperationState::Pending);

    h.drive(root).await;
    assert_eq!(h.op(root).await.state, OperationState::Succeeded);
}

// ─── Robustness ───

#[tokio::test]
async fn malformed_tree_does_not_stall_the_pass() {
    let h = Harness::new(test_config());
    seed(h.repo.as_ref(), [platform("p1", None)]).await;
    let phantom = Operation::cascade_root(ResourceType::Platform, "ghost".into(), t0());
    let stray = Operation::child_of(&phantom, ResourceType::ServiceInstance, "stray".into(), t0());
    h.repo.create_operation(&stray).await.unwrap();
    let root = h.cascade(ResourceType::Platform, "p1", false).await;

    let report = h.maintainer.run_pass(t0()).await.unwrap();

    assert_eq!(report.errors, 1);
    assert_eq!(report.trees, 1);
    assert_eq!(h.op(root).await.state, OperationState::Succeeded);
}

#[tokio::test]
async fn restarted_maintainer_resumes_from_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    let root = {
        let h = Harness::with_repo(
            Arc::new(MemoryRepository::open(path.clone()).unwrap()),
            test_config(),
        );
        seed_platform(h.repo.as_ref()).await;
        h.broker.accept_delete("i2", Some("job-9"));
        let root = h.cascade(ResourceType::ServiceInstance, "i2", false).await;
        h.maintainer.run_pass(t0()).await.unwrap();
        root
    };

    let h = Harness::with_repo(
        Arc::new(MemoryRepository::open(path).unwrap()),
        test_config(),
    );
    assert_eq!(h.op(root).await.external_id.as_deref(), Some("job-9"));

    h.drive(root).await;

    assert_eq!(h.op(root).await.state, OperationState::Succeeded);
    assert_eq!(
        h.broker.calls(),
        [BrokerCall::LastOperation("i2".into(), Some("job-9".to_string()))]
    );
}

// ─── Cleanup ───

#[tokio::test]
async fn cleanup_removes_tree_but_keeps_resource_history() {
    let h = Harness::new(test_config());
    seed_tenant_scenario(h.repo.as_ref()).await;
    let root = h.cascade(ResourceType::Tenant, "t1", false).await;
    let done = h.drive(root).await;
    let ops = h.tree(root).await;

    let early = h.maintainer.cleanup(done + TimeDelta::minutes(30)).await.unwrap();
    assert!(early.is_empty());
    assert_eq!(h.tree(root).await.len(), TENANT_SCENARIO_OPERATIONS);

    let report = h.maintainer.cleanup(done + TimeDelta::hours(2)).await.unwrap();
    assert_eq!(report.trees, 1);
    assert_eq!(
        h.repo.count_operations(&Query::tree(root)).await.unwrap(),
        0
    );
    for op in &ops {
        let history = h
            .repo
            .count_operations(&Query::for_resource(op.resource_type, &op.resource_id))
            .await
            .unwrap();
        assert!(history >= 1, "{} {} lost its history", op.resource_type, op.resource_id);
    }
}

// ─── Run Loop ───

#[tokio::test(start_paused = true)]
async fn run_loop_drives_cascade_until_shutdown() {
    let h = Harness::new(test_config());
    seed_platform(h.repo.as_ref()).await;
    let builder = TreeBuilder::new(h.repo.clone(), h.maintainer.config());
    let root = builder
        .start_cascade(
            ResourceType::Platform,
            "p1".into(),
            &CascadeOptions::default(),
            Utc::now(),
        )
        .await
        .unwrap()
        .operation_id();

    let shutdown = CancellationToken::new();
    let driver = async {
        for _ in 0..MAX_PASSES {
            tokio::time::sleep(h.maintainer.config().polling_interval).await;
            if h.op(root).await.is_settled() {
                break;
            }
        }
        shutdown.cancel();
    };
    tokio::join!(h.maintainer.run(shutdown.clone()), driver);

    assert_eq!(h.op(root).await.state, OperationState::Succeeded);
    assert!(!h.exists(ResourceType::Platform, "p1").await);
}
