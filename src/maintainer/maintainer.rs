//! The maintainer pass and its run loop.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::actions::{ActionOutcome, ActionRunner, FailureKind};
use super::poll::{has_elapsed, has_exceeded};
use super::reaper::{CleanupReport, Reaper};
use crate::broker::BrokerClient;
use crate::config::CascadeConfig;
use crate::state::{CascadeTree, TreeError, first_child_failure, merged_child_failures, own_failure};
use crate::store::{Criterion, Query, Repository, StoreError, fields};
use crate::types::{Operation, OperationErrors, OperationId, OperationState, TransitionError};

#[derive(Debug, Error)]
pub enum MaintainerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("malformed cascade tree: {0}")]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

pub type Result<T> = std::result::Result<T, MaintainerError>;

/// Summary of one maintainer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Trees advanced without error.
    pub trees: usize,
    /// Operations written during the pass.
    pub updates: usize,
    /// Trees that could not be advanced.
    pub errors: usize,
}

/// Drives stored cascade trees to completion.
///
/// Each pass loads every tree with outstanding work and advances each of its
/// operations by at most one step, using only persisted state. A restarted
/// maintainer picks up exactly where the previous one stopped.
pub struct Maintainer<R, B> {
    repo: Arc<R>,
    broker: Arc<B>,
    config: CascadeConfig,
    reaper: Reaper<R>,
}

impl<R: Repository, B: BrokerClient> Maintainer<R, B> {
    pub fn new(repo: Arc<R>, broker: Arc<B>, config: CascadeConfig) -> Self {
        let reaper = Reaper::new(repo.clone(), config.lifespan);
        Maintainer {
            repo,
            broker,
            config,
            reaper,
        }
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Runs passes every `polling_interval` and cleanups every
    /// `cleanup_interval` until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            polling_interval = ?self.config.polling_interval,
            cleanup_interval = ?self.config.cleanup_interval,
            "Maintainer started"
        );

        let mut passes = tokio::time::interval(self.config.polling_interval);
        passes.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanups = tokio::time::interval(self.config.cleanup_interval);
        cleanups.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping maintainer");
                    break;
                }

                _ = passes.tick() => {
                    if let Err(e) = self.run_pass(Utc::now()).await {
                        error!(error = %e, "Error during maintainer pass");
                    }
                }

                _ = cleanups.tick() => {
                    if let Err(e) = self.cleanup(Utc::now()).await {
                        error!(error = %e, "Error during cleanup");
                    }
                }
            }
        }

        info!("Maintainer stopped");
    }

    /// Removes finished trees older than the configured lifespan.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> std::result::Result<CleanupReport, StoreError> {
        self.reaper.cleanup(now).await
    }

    /// Advances every tree with outstanding work by one step.
    ///
    /// A tree that fails to advance is logged and skipped so it cannot stall
    /// the others.
    #[instrument(skip(self))]
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut report = PassReport::default();
        for root_id in self.active_roots().await? {
            match self.advance_tree(root_id, now).await {
                Ok(updates) => {
                    report.trees += 1;
                    report.updates += updates;
                }
                Err(e) => {
                    report.errors += 1;
                    error!(%root_id, error = %e, "Error advancing cascade tree");
                }
            }
        }
        if report.updates > 0 {
            debug!(trees = report.trees, updates = report.updates, "Maintainer pass done");
        }
        Ok(report)
    }

    /// Roots of trees with a ready unfinished operation or a pending orphan
    /// mitigation.
    async fn active_roots(&self) -> Result<Vec<OperationId>> {
        let unfinished = Query::all()
            .with(Criterion::field_eq(fields::READY, "true"))
            .with(Criterion::field_in(
                fields::STATE,
                [
                    OperationState::Pending.as_str(),
                    OperationState::InProgress.as_str(),
                ],
            ));
        let mitigating = Query::all().with(Criterion::field_ne(fields::DELETION_SCHEDULED, ""));

        let mut seen = HashSet::new();
        let mut roots = Vec::new();
        for query in [unfinished, mitigating] {
            for op in self.repo.list_operations(&query).await? {
                if let Some(root) = op.cascade_root_id
                    && seen.insert(root)
                {
                    roots.push(root);
                }
            }
        }
        Ok(roots)
    }

    async fn advance_tree(&self, root_id: OperationId, now: DateTime<Utc>) -> Result<usize> {
        let tree = CascadeTree::new(self.repo.list_operations(&Query::tree(root_id)).await?)?;
        let mut updates = 0;
        for op in tree.iter() {
            if self.advance(&tree, op, now).await? {
                updates += 1;
            }
        }
        Ok(updates)
    }

    /// Moves one operation forward. Returns true if it was written.
    async fn advance(&self, tree: &CascadeTree, op: &Operation, now: DateTime<Utc>) -> Result<bool> {
        if !op.ready || op.is_settled() {
            return Ok(false);
        }
        if op.is_duplicate() {
            return self.mirror_primary(tree, op, now).await;
        }
        if let Some(since) = op.deletion_scheduled
            && has_exceeded(since, self.config.cascade_orphan_mitigation_timeout, now)
        {
            return self.close_orphan_window(tree, op.clone(), now).await;
        }

        match op.state {
            OperationState::Pending if tree.children_settled(&op.id) => self.start(tree, op, now).await,
            OperationState::Pending | OperationState::Succeeded => Ok(false),
            OperationState::InProgress if op.external_id.is_some() => {
                self.poll_external(tree, op, now).await
            }
            OperationState::InProgress | OperationState::Failed => self.retry_action(tree, op, now).await,
        }
    }

    /// First execution of an operation whose children are all settled.
    async fn start(&self, tree: &CascadeTree, op: &Operation, now: DateTime<Utc>) -> Result<bool> {
        let mut op = op.clone();
        if !tree.is_force()
            && let Some(record) = first_child_failure(tree, &op.id)
        {
            op.fail(OperationErrors::single(record), now)?;
            debug!(operation_id = %op.id, resource_id = %op.resource_id, "Child deletion failed, failing parent");
            self.save(&op).await?;
            return Ok(true);
        }
        if op.is_virtual() {
            return self.finish_success(tree, op, now).await;
        }
        if self.past_deadline(tree, now) {
            return self
                .finish_failure(tree, op, "reconciliation timeout exceeded", now)
                .await;
        }
        self.execute(tree, op, now).await
    }

    /// Re-runs the action of a transiently failed or orphan-mitigated
    /// operation once the retry interval has passed.
    async fn retry_action(&self, tree: &CascadeTree, op: &Operation, now: DateTime<Utc>) -> Result<bool> {
        if !has_elapsed(op.updated_at, self.config.maintainer_retry_interval, now) {
            return Ok(false);
        }
        let op = op.clone();
        if !op.in_orphan_mitigation() && self.past_deadline(tree, now) {
            return self
                .finish_failure(tree, op, "reconciliation timeout exceeded", now)
                .await;
        }
        debug!(operation_id = %op.id, resource_id = %op.resource_id, "Retrying deletion");
        self.execute(tree, op, now).await
    }

    async fn execute(&self, tree: &CascadeTree, mut op: Operation, now: DateTime<Utc>) -> Result<bool> {
        op.claim(now)?;
        self.save(&op).await?;
        let outcome = self.runner().execute(&op).await?;
        self.apply(tree, op, outcome, now).await
    }

    /// Polls an accepted broker job once the poll interval has passed.
    async fn poll_external(&self, tree: &CascadeTree, op: &Operation, now: DateTime<Utc>) -> Result<bool> {
        if !has_elapsed(op.updated_at, self.config.poll_cascade_interval, now) {
            return Ok(false);
        }
        let mut op = op.clone();
        if !op.in_orphan_mitigation() && self.past_deadline(tree, now) {
            // The broker may still finish the job; keep retrying it.
            let message = "reconciliation timeout exceeded while the broker job was running";
            return self.mitigate(tree, op, message, now).await;
        }

        match self.runner().poll(&op).await? {
            ActionOutcome::Running { .. } => {
                op.touch(now);
                self.save(&op).await?;
                Ok(true)
            }
            outcome => self.apply(tree, op, outcome, now).await,
        }
    }

    /// Duplicates copy the state and errors of their primary.
    async fn mirror_primary(&self, tree: &CascadeTree, op: &Operation, now: DateTime<Utc>) -> Result<bool> {
        let Some(primary_id) = op.primary_id else {
            return Ok(false);
        };
        let mut op = op.clone();
        let Some(primary) = self.repo.get_operation(&primary_id).await? else {
            let record = own_failure(&op, tree.parent(&op), format!("primary operation {primary_id} no longer exists"));
            op.fail(OperationErrors::single(record), now)?;
            self.save(&op).await?;
            return Ok(true);
        };

        match primary.state {
            OperationState::Succeeded if primary.is_settled() => op.succeed(now)?,
            OperationState::Failed if primary.is_settled() => {
                let errors = if primary.errors.is_empty() {
                    OperationErrors::single(own_failure(&op, tree.parent(&op), "primary deletion failed"))
                } else {
                    primary.errors.clone()
                };
                op.fail(errors, now)?;
            }
            _ if self.past_deadline(tree, now) => {
                let record = own_failure(&op, tree.parent(&op), "reconciliation timeout exceeded");
                op.fail(OperationErrors::single(record), now)?;
            }
            OperationState::InProgress if op.state == OperationState::Pending => op.claim(now)?,
            _ => return Ok(false),
        }
        self.save(&op).await?;
        Ok(true)
    }

    async fn apply(
        &self,
        tree: &CascadeTree,
        mut op: Operation,
        outcome: ActionOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match outcome {
            ActionOutcome::Completed => self.finish_success(tree, op, now).await,
            ActionOutcome::Running { operation } => {
                let external_id = operation.unwrap_or_else(|| op.id.to_string());
                op.accept_async(external_id, now)?;
                debug!(operation_id = %op.id, resource_id = %op.resource_id, "Broker accepted deletion");
                self.save(&op).await?;
                Ok(true)
            }
            ActionOutcome::Failed {
                kind: FailureKind::Permanent,
                message,
            } => self.finish_failure(tree, op, message, now).await,
            ActionOutcome::Failed {
                kind: FailureKind::Ambiguous,
                message,
            } => self.mitigate(tree, op, message, now).await,
            ActionOutcome::Failed {
                kind: FailureKind::Transient,
                message,
            } => {
                if !op.in_orphan_mitigation() && self.past_deadline(tree, now) {
                    let message = format!("{message} (reconciliation timeout exceeded)");
                    return self.finish_failure(tree, op, message, now).await;
                }
                debug!(operation_id = %op.id, resource_id = %op.resource_id, error = %message, "Transient failure, retrying later");
                op.touch(now);
                self.save(&op).await?;
                Ok(true)
            }
        }
    }

    /// Settles an operation whose own action succeeded. Under force, failed
    /// children still fail the parent.
    async fn finish_success(&self, tree: &CascadeTree, mut op: Operation, now: DateTime<Utc>) -> Result<bool> {
        let errors = self.inherited_errors(tree, &op);
        if errors.is_empty() {
            op.succeed(now)?;
        } else {
            op.fail(errors, now)?;
        }
        self.save(&op).await?;
        if op.is_root() {
            info!(root_id = %op.id, state = %op.state, resource_id = %op.resource_id, "Cascade finished");
        }
        Ok(true)
    }

    async fn finish_failure(
        &self,
        tree: &CascadeTree,
        mut op: Operation,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut errors = self.inherited_errors(tree, &op);
        errors.push_capped(own_failure(&op, tree.parent(&op), message), self.config.max_error_records);
        op.fail(errors, now)?;
        warn!(operation_id = %op.id, resource_type = %op.resource_type, resource_id = %op.resource_id, "Deletion failed");
        self.save(&op).await?;
        if op.is_root() {
            info!(root_id = %op.id, state = %op.state, resource_id = %op.resource_id, "Cascade finished");
        }
        Ok(true)
    }

    /// Fails an operation whose outcome is unknown and schedules it for
    /// retry until the orphan mitigation window closes.
    async fn mitigate(
        &self,
        tree: &CascadeTree,
        mut op: Operation,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut errors = self.inherited_errors(tree, &op);
        errors.push_capped(own_failure(&op, tree.parent(&op), message), self.config.max_error_records);
        op.fail_for_orphan_mitigation(errors, now)?;
        warn!(operation_id = %op.id, resource_id = %op.resource_id, "Deletion outcome unknown, scheduling orphan mitigation");
        self.save(&op).await?;
        Ok(true)
    }

    async fn close_orphan_window(&self, tree: &CascadeTree, mut op: Operation, now: DateTime<Utc>) -> Result<bool> {
        let mut errors = op.errors.clone();
        errors.push_capped(
            own_failure(&op, tree.parent(&op), "orphan mitigation timeout exceeded"),
            self.config.max_error_records,
        );
        op.fail(errors, now)?;
        warn!(operation_id = %op.id, resource_id = %op.resource_id, "Orphan mitigation gave up");
        self.save(&op).await?;
        Ok(true)
    }

    /// Child failures carried into a parent's own errors under force.
    fn inherited_errors(&self, tree: &CascadeTree, op: &Operation) -> OperationErrors {
        if tree.is_force() {
            merged_child_failures(tree, &op.id, self.config.max_error_records)
        } else {
            OperationErrors::new()
        }
    }

    fn past_deadline(&self, tree: &CascadeTree, now: DateTime<Utc>) -> bool {
        has_exceeded(
            tree.root().created_at,
            self.config.reconciliation_operation_timeout,
            now,
        )
    }

    fn runner(&self) -> ActionRunner<'_, R, B> {
        ActionRunner::new(
            self.repo.as_ref(),
            self.broker.as_ref(),
            self.config.action_timeout,
        )
    }

    async fn save(&self, op: &Operation) -> std::result::Result<(), StoreError> {
        self.repo.update_operation(op).await?;
        debug!(operation_id = %op.id, resource_id = %op.resource_id, state = %op.state, "Saved operation");
        Ok(())
    }
}
