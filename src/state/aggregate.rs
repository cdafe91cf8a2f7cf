//! Failure aggregation across a cascade tree.
//!
//! Without force, the first failed child blocks its parent and the parent
//! inherits that child's first record, so the root ends up carrying the
//! deepest failure. With force, parents merge the records of every failed
//! child, and the root ends up with the flattened set of all distinct
//! failures in the tree, capped per operation.

use crate::types::{FailureRecord, Operation, OperationErrors, OperationId};

use super::tree::CascadeTree;

/// The record describing `op`'s own failure, tagged with its parent.
pub fn own_failure(op: &Operation, parent: Option<&Operation>, message: impl Into<String>) -> FailureRecord {
    let record = FailureRecord::new(op.resource_type, op.resource_id.clone(), message);
    match parent {
        Some(parent) => record.with_parent(parent.resource_type, parent.resource_id.clone()),
        None => record,
    }
}

/// The records a failed child contributes. A child that failed without
/// recording anything is described by a generic record of its own.
fn child_records(tree: &CascadeTree, child: &Operation) -> OperationErrors {
    if !child.errors.is_empty() {
        return child.errors.clone();
    }
    OperationErrors::single(own_failure(
        child,
        tree.parent(child),
        format!("deletion of {} {} failed", child.resource_type, child.resource_id),
    ))
}

/// Merges the records of every failed child of `parent`, up to `cap`.
pub fn merged_child_failures(tree: &CascadeTree, parent: &OperationId, cap: usize) -> OperationErrors {
    let mut merged = OperationErrors::new();
    for child in tree.failed_children(parent) {
        merged.merge_capped(&child_records(tree, child), cap);
    }
    merged
}

/// The first record of the first failed child of `parent`, if any child
/// failed.
pub fn first_child_failure(tree: &CascadeTree, parent: &OperationId) -> Option<FailureRecord> {
    let child = tree.failed_children(parent).next()?;
    child_records(tree, child).first().cloned()
}
