//! The persisted operation entity and its state machine.
//!
//! An operation is the unit of work of a cascade. Operations that share a
//! `cascade_root_id` form one tree through `parent_id`; there is no in-memory
//! graph, every structural question is answered from these two columns.
//!
//! # State machine
//!
//! ```text
//! PENDING ──claim──> IN_PROGRESS ──┬──> SUCCEEDED
//!    │                  │  ^       └──> FAILED ──(orphan mitigation)──┐
//!    │                  └──┘ poll                                      │
//!    └──(settled without own action)──> SUCCEEDED | FAILED             │
//!                       IN_PROGRESS <─────────────────────────────────┘
//! ```
//!
//! A terminal state is only left again while `deletion_scheduled` is set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::failure::OperationErrors;
use super::ids::{OperationId, ResourceId};
use super::resource::{Labels, ResourceType};

/// Label on a cascade root requesting force-delete semantics.
pub const FORCE_LABEL: &str = "force";

/// The kind of change an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl OperationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InProgress => "in_progress",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::Succeeded | OperationState::Failed)
    }

    /// Checks if a transition from this state to `target` is legal.
    ///
    /// `orphan_mitigation` is true while the operation has a pending
    /// `deletion_scheduled`; only then may a FAILED operation move again.
    pub fn can_transition_to(&self, target: OperationState, orphan_mitigation: bool) -> bool {
        use OperationState::*;
        match (self, target) {
            (Pending, _) => true,
            (InProgress, Pending) => false,
            (InProgress, _) => true,
            (Failed, InProgress | Failed | Succeeded) => orphan_mitigation,
            _ => false,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An illegal state change was requested.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("operation {operation} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub operation: OperationId,
    pub from: OperationState,
    pub to: OperationState,
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,

    /// ID of the tree's root. Equal to `id` for the root itself; `None` for
    /// operations that are not part of a cascade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cascade_root_id: Option<OperationId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OperationId>,

    pub resource_type: ResourceType,

    pub resource_id: ResourceId,

    #[serde(rename = "type")]
    pub op_type: OperationType,

    pub state: OperationState,

    /// Execution may start. Only ready operations are picked up by the
    /// maintainer.
    pub ready: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Set while orphan mitigation is retrying an ambiguous failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_scheduled: Option<DateTime<Utc>>,

    /// Identifier returned by the broker for an accepted asynchronous job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    /// For duplicates: the operation whose outcome this one mirrors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_id: Option<OperationId>,

    #[serde(default)]
    pub errors: OperationErrors,

    #[serde(default)]
    pub labels: Labels,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Operation {
    /// Creates a standalone (non-cascade) operation.
    pub fn new(
        op_type: OperationType,
        resource_type: ResourceType,
        resource_id: ResourceId,
        now: DateTime<Utc>,
    ) -> Self {
        Operation {
            id: OperationId::new(),
            cascade_root_id: None,
            parent_id: None,
            resource_type,
            resource_id,
            op_type,
            state: OperationState::Pending,
            ready: false,
            created_at: now,
            updated_at: now,
            deletion_scheduled: None,
            external_id: None,
            primary_id: None,
            errors: OperationErrors::new(),
            labels: Labels::new(),
            correlation_id: None,
        }
    }

    /// Creates the root operation of a new cascade deleting the given resource.
    pub fn cascade_root(
        resource_type: ResourceType,
        resource_id: ResourceId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut op = Operation::new(OperationType::Delete, resource_type, resource_id, now);
        op.cascade_root_id = Some(op.id);
        op.ready = true;
        op
    }

    /// Creates a child deletion below `parent` in the same tree.
    pub fn child_of(
        parent: &Operation,
        resource_type: ResourceType,
        resource_id: ResourceId,
        now: DateTime<Utc>,
    ) -> Self {
        let mut op = Operation::new(OperationType::Delete, resource_type, resource_id, now);
        op.cascade_root_id = parent.cascade_root_id;
        op.parent_id = Some(parent.id);
        op.ready = true;
        op.correlation_id = parent.correlation_id.clone();
        op
    }

    /// Creates a duplicate below `parent` that mirrors `primary`'s outcome.
    pub fn duplicate_of(parent: &Operation, primary: &Operation, now: DateTime<Utc>) -> Self {
        let mut op = Operation::child_of(parent, primary.resource_type, primary.resource_id.clone(), now);
        op.primary_id = Some(primary.id);
        op
    }

    /// Marks this (root) operation as a force delete.
    pub fn with_force(mut self, force: bool) -> Self {
        if force {
            self.labels.insert(FORCE_LABEL, "true");
        }
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn is_force(&self) -> bool {
        self.labels.contains(FORCE_LABEL, "true")
    }

    pub fn is_cascade(&self) -> bool {
        self.cascade_root_id.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.cascade_root_id == Some(self.id) && self.parent_id.is_none()
    }

    pub fn is_duplicate(&self) -> bool {
        self.primary_id.is_some()
    }

    /// Virtual operations have no action of their own.
    pub fn is_virtual(&self) -> bool {
        self.resource_type.is_virtual()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn in_orphan_mitigation(&self) -> bool {
        self.deletion_scheduled.is_some()
    }

    /// Terminal and not subject to any further retry. Parents wait until all
    /// of their children are settled.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() && !self.in_orphan_mitigation()
    }

    fn transition(&mut self, to: OperationState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to, self.in_orphan_mitigation()) {
            return Err(TransitionError {
                operation: self.id,
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.touch(now);
        Ok(())
    }

    /// Refreshes `updated_at` without changing state.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Moves the operation to IN_PROGRESS before its action runs.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(OperationState::InProgress, now)
    }

    /// Records an accepted asynchronous broker job.
    pub fn accept_async(
        &mut self,
        external_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(OperationState::InProgress, now)?;
        self.external_id = Some(external_id.into());
        Ok(())
    }

    /// Completes the operation successfully, ending any orphan mitigation
    /// and dropping the errors of earlier attempts.
    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(OperationState::Succeeded, now)?;
        self.deletion_scheduled = None;
        self.errors = OperationErrors::new();
        Ok(())
    }

    /// Fails the operation permanently with the given errors, ending any
    /// orphan mitigation.
    pub fn fail(&mut self, errors: OperationErrors, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(OperationState::Failed, now)?;
        self.errors = errors;
        self.deletion_scheduled = None;
        Ok(())
    }

    /// Fails the operation but keeps it eligible for retry until the orphan
    /// mitigation window closes. The window opens on the first ambiguous
    /// failure and is not extended by later ones.
    pub fn fail_for_orphan_mitigation(
        &mut self,
        errors: OperationErrors,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(OperationState::Failed, now)?;
        self.errors = errors;
        self.external_id = None;
        if self.deletion_scheduled.is_none() {
            self.deletion_scheduled = Some(now);
        }
        Ok(())
    }
}
