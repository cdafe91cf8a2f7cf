//! Arena view over one cascade tree.
//!
//! The store only knows flat operation rows linked by `parent_id`. A
//! [`CascadeTree`] indexes one tree's rows by ID and by parent so the
//! maintainer can ask structural questions without another query. It is a
//! read-only snapshot, rebuilt every pass.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{Operation, OperationId, OperationState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("cascade tree has no root operation")]
    MissingRoot,

    #[error("cascade tree has {0} root operations")]
    MultipleRoots(usize),
}

#[derive(Debug, Clone)]
pub struct CascadeTree {
    root: OperationId,
    nodes: HashMap<OperationId, Operation>,
    /// Child IDs per parent, in insertion order.
    children: HashMap<OperationId, Vec<OperationId>>,
}

impl CascadeTree {
    /// Indexes the operations of one tree.
    pub fn new(operations: Vec<Operation>) -> Result<Self, TreeError> {
        let roots: Vec<OperationId> = operations
            .iter()
            .filter(|op| op.is_root())
            .map(|op| op.id)
            .collect();
        let root = match roots.as_slice() {
            [] => return Err(TreeError::MissingRoot),
            [root] => *root,
            many => return Err(TreeError::MultipleRoots(many.len())),
        };

        let mut children: HashMap<OperationId, Vec<OperationId>> = HashMap::new();
        for op in &operations {
            if let Some(parent) = op.parent_id {
                children.entry(parent).or_default().push(op.id);
            }
        }
        let nodes = operations.into_iter().map(|op| (op.id, op)).collect();

        Ok(CascadeTree {
            root,
            nodes,
            children,
        })
    }

    pub fn root(&self) -> &Operation {
        &self.nodes[&self.root]
    }

    pub fn get(&self, id: &OperationId) -> Option<&Operation> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Force semantics are decided by the root's label.
    pub fn is_force(&self) -> bool {
        self.root().is_force()
    }

    pub fn parent(&self, op: &Operation) -> Option<&Operation> {
        op.parent_id.and_then(|id| self.nodes.get(&id))
    }

    pub fn children(&self, id: &OperationId) -> impl Iterator<Item = &Operation> {
        self.children
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|child| self.nodes.get(child))
    }

    /// True once every child is terminal and out of orphan mitigation.
    pub fn children_settled(&self, id: &OperationId) -> bool {
        self.children(id).all(Operation::is_settled)
    }

    pub fn failed_children(&self, id: &OperationId) -> impl Iterator<Item = &Operation> {
        self.children(id)
            .filter(|child| child.state == OperationState::Failed)
    }

    /// Operations in breadth-first order from the root.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut next = vec![self.root];
        while !next.is_empty() {
            let mut level = Vec::new();
            for id in next {
                order.push(id);
                level.extend(self.children.get(&id).into_iter().flatten().copied());
            }
            next = level;
        }
        order.into_iter().filter_map(|id| self.nodes.get(&id))
    }

    /// True when the root is settled.
    pub fn is_finished(&self) -> bool {
        self.root().is_settled()
    }
}
