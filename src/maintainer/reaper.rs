//! Cleanup of finished cascade trees.
//!
//! # Retention Policy
//!
//! | Operation | Retention |
//! |-----------|-----------|
//! | In an unfinished tree | Always keep |
//! | In a tree finished less than `lifespan` ago | Keep |
//! | In an older tree, newest operation for its resource | Keep, detached from the tree |
//! | In an older tree, otherwise | Delete |
//! | Outside any tree, newest for its resource | Always keep |
//! | Outside any tree, superseded and older than `lifespan` | Delete |
//!
//! Detaching clears `cascade_root_id` and `parent_id`, so the tree is gone
//! while every resource it touched still has an operation recording its
//! last known state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use super::poll::has_exceeded;
use crate::store::{Criterion, Direction, OrderField, Query, Repository, StoreError, fields};
use crate::types::{Operation, OperationId, OperationState, ResourceId, ResourceType};

/// What one cleanup run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Trees removed.
    pub trees: usize,
    /// Tree operations deleted.
    pub deleted: usize,
    /// Tree operations kept as the newest record of their resource.
    pub retained: usize,
    /// Superseded non-cascade operations deleted.
    pub superseded: usize,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == CleanupReport::default()
    }
}

type ResourceKey = (ResourceType, ResourceId);

pub struct Reaper<R> {
    repo: Arc<R>,
    lifespan: Duration,
}

impl<R: Repository> Reaper<R> {
    pub fn new(repo: Arc<R>, lifespan: Duration) -> Self {
        Reaper { repo, lifespan }
    }

    /// Removes trees whose root finished more than `lifespan` before `now`,
    /// then superseded standalone operations.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport, StoreError> {
        let finished = Query::all()
            .with(Criterion::field_in(
                fields::STATE,
                [
                    OperationState::Succeeded.as_str(),
                    OperationState::Failed.as_str(),
                ],
            ))
            .with(Criterion::field_eq(fields::DELETION_SCHEDULED, ""));

        let mut report = CleanupReport::default();
        for root in self.repo.list_operations(&finished).await? {
            if root.is_root() && has_exceeded(root.updated_at, self.lifespan, now) {
                self.remove_tree(&root, &mut report).await?;
            }
        }
        report.superseded = self.remove_superseded(now).await?;

        if !report.is_empty() {
            info!(
                trees = report.trees,
                deleted = report.deleted,
                retained = report.retained,
                superseded = report.superseded,
                "Cleaned up finished operations"
            );
        }
        Ok(report)
    }

    async fn remove_tree(&self, root: &Operation, report: &mut CleanupReport) -> Result<(), StoreError> {
        let ops = self.repo.list_operations(&Query::tree(root.id)).await?;
        if ops.iter().any(|op| !op.is_settled()) {
            debug!(root_id = %root.id, "Tree still has unsettled operations, keeping it");
            return Ok(());
        }

        let mut by_resource: HashMap<ResourceKey, Vec<Operation>> = HashMap::new();
        for op in ops {
            by_resource
                .entry((op.resource_type, op.resource_id.clone()))
                .or_default()
                .push(op);
        }

        let mut doomed: Vec<OperationId> = Vec::new();
        for ((resource_type, resource_id), group) in by_resource {
            let newest = self
                .repo
                .list_operations(
                    &Query::for_resource(resource_type, &resource_id)
                        .order_by(OrderField::CreatedAt, Direction::Desc)
                        .limit(1),
                )
                .await?
                .into_iter()
                .next()
                .filter(|op| op.cascade_root_id == Some(root.id));

            for mut op in group {
                if newest.as_ref().is_some_and(|n| n.id == op.id) {
                    op.cascade_root_id = None;
                    op.parent_id = None;
                    self.repo.update_operation(&op).await?;
                    report.retained += 1;
                } else {
                    doomed.push(op.id);
                }
            }
        }

        report.deleted += self.repo.delete_operations(&doomed).await?;
        report.trees += 1;
        debug!(root_id = %root.id, deleted = doomed.len(), "Removed finished cascade tree");
        Ok(())
    }

    /// Deletes standalone operations that have a newer operation for the
    /// same resource and finished more than `lifespan` ago.
    async fn remove_superseded(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let standalone = Query::all()
            .with(Criterion::field_eq(fields::CASCADE_ROOT_ID, ""))
            .order_by(OrderField::CreatedAt, Direction::Desc);

        let mut newest_seen: HashMap<ResourceKey, OperationId> = HashMap::new();
        let mut doomed = Vec::new();
        for op in self.repo.list_operations(&standalone).await? {
            let key = (op.resource_type, op.resource_id.clone());
            if !newest_seen.contains_key(&key) {
                newest_seen.insert(key, op.id);
                continue;
            }
            if op.is_settled() && has_exceeded(op.updated_at, self.lifespan, now) {
                doomed.push(op.id);
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }
        self.repo.delete_operations(&doomed).await
    }
}
