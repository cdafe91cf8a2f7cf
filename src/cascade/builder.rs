//! Cascade tree construction.
//!
//! [`TreeBuilder::create`] validates a new root operation and expands it into
//! the full tree of child deletions, breadth first. The first operation
//! created for a resource in a tree is its primary; later sightings of the
//! same resource become duplicates that mirror the primary's outcome instead
//! of deleting a second time. A resource already being deleted by another
//! tree is treated the same way, with the foreign operation as primary.
//!
//! The tree is assembled in memory and inserted with a single
//! [`Repository::create_operations`] call, so either the whole tree exists
//! or none of it does. The insert refuses a second primary for a resource,
//! which settles races between concurrent cascades: losing on the root
//! returns the winner's operation, and losing on a descendant rebuilds the
//! tree so that descendant becomes a duplicate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

use super::resolver::{ResolveError, ResolverContext, resolve_children};
use crate::config::CascadeConfig;
use crate::store::{Query, Repository, StoreError};
use crate::types::{
    Operation, OperationId, OperationType, Resource, ResourceId, ResourceType, Tenant,
};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("root operation {id} must have cascade_root_id equal to its id, got {cascade_root_id}")]
    RootMismatch {
        id: OperationId,
        cascade_root_id: OperationId,
    },

    #[error("root operation {0} must not have a parent")]
    RootHasParent(OperationId),

    #[error("{resource_type} {resource_id} not found")]
    ResourceNotFound {
        resource_type: ResourceType,
        resource_id: ResourceId,
    },

    #[error("resolving children failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Per-request options of a cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeOptions {
    /// Keep deleting past failures and aggregate them instead of stopping.
    pub force: bool,

    /// Label key linking contained instances to their container.
    pub container_label_key: Option<String>,
}

/// What [`TreeBuilder::create`] did with the requested root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A new tree was inserted.
    Created {
        root_id: OperationId,
        operations: usize,
    },

    /// The resource is already being deleted; this is the operation to
    /// follow instead.
    Existing(OperationId),

    /// The operation is not a cascade and was stored as is.
    Plain(OperationId),
}

impl BuildOutcome {
    /// The operation callers should poll.
    pub fn operation_id(&self) -> OperationId {
        match self {
            BuildOutcome::Created { root_id, .. } => *root_id,
            BuildOutcome::Existing(id) | BuildOutcome::Plain(id) => *id,
        }
    }
}

/// Insert attempts before giving up on a tree whose descendants keep being
/// claimed by concurrent cascades.
const MAX_BUILD_ATTEMPTS: u32 = 3;

type ResourceKey = (ResourceType, ResourceId);

/// A node still to be expanded: its index in the tree under construction,
/// its resource, and the resources on the path from the root to it.
struct Frontier {
    index: usize,
    resource: Resource,
    ancestors: Vec<ResourceKey>,
}

/// Builds cascade trees from root operations.
pub struct TreeBuilder<R> {
    repo: Arc<R>,
    tenant_label_key: String,
}

impl<R: Repository> TreeBuilder<R> {
    pub fn new(repo: Arc<R>, config: &CascadeConfig) -> Self {
        TreeBuilder {
            repo,
            tenant_label_key: config.tenant_label_key.clone(),
        }
    }

    /// Starts a cascade deleting the given resource.
    pub async fn start_cascade(
        &self,
        resource_type: ResourceType,
        resource_id: ResourceId,
        options: &CascadeOptions,
        now: DateTime<Utc>,
    ) -> Result<BuildOutcome> {
        let root = Operation::cascade_root(resource_type, resource_id, now);
        self.create(root, options, now).await
    }

    /// Validates `root` and stores it, expanding it into a tree when it is a
    /// cascade delete.
    #[instrument(skip(self, root, options), fields(operation_id = %root.id, resource_type = %root.resource_type, resource_id = %root.resource_id))]
    pub async fn create(
        &self,
        mut root: Operation,
        options: &CascadeOptions,
        now: DateTime<Utc>,
    ) -> Result<BuildOutcome> {
        let Some(cascade_root_id) = root.cascade_root_id else {
            self.repo.create_operation(&root).await?;
            return Ok(BuildOutcome::Plain(root.id));
        };
        if cascade_root_id != root.id {
            return Err(BuildError::RootMismatch {
                id: root.id,
                cascade_root_id,
            });
        }
        if root.parent_id.is_some() {
            return Err(BuildError::RootHasParent(root.id));
        }

        let resource = self
            .load_resource(root.resource_type, &root.resource_id)
            .await?
            .ok_or_else(|| BuildError::ResourceNotFound {
                resource_type: root.resource_type,
                resource_id: root.resource_id.clone(),
            })?;

        if root.op_type != OperationType::Delete {
            root.cascade_root_id = None;
            self.repo.create_operation(&root).await?;
            return Ok(BuildOutcome::Plain(root.id));
        }

        let root = root.with_force(options.force);
        let ctx = ResolverContext {
            tenant_label_key: self.tenant_label_key.clone(),
            container_label_key: options.container_label_key.clone(),
        };

        let mut attempt = 1;
        loop {
            if let Some(existing) = self
                .active_operation(root.resource_type, &root.resource_id)
                .await?
            {
                let id = existing.primary_id.unwrap_or(existing.id);
                info!(existing = %id, "Resource already being deleted, returning existing operation");
                return Ok(BuildOutcome::Existing(id));
            }

            let tree = self.expand(root.clone(), resource.clone(), &ctx, now).await?;
            match self.repo.create_operations(&tree).await {
                Ok(()) => {
                    info!(operations = tree.len(), "Created cascade tree");
                    return Ok(BuildOutcome::Created {
                        root_id: root.id,
                        operations: tree.len(),
                    });
                }
                Err(StoreError::OperationInProgress {
                    resource_type,
                    resource_id,
                    operation,
                }) if resource_type == root.resource_type && resource_id == root.resource_id => {
                    info!(existing = %operation, "Lost the race for the root, returning existing operation");
                    return Ok(BuildOutcome::Existing(operation));
                }
                Err(StoreError::OperationInProgress {
                    resource_type,
                    resource_id,
                    operation,
                }) if attempt < MAX_BUILD_ATTEMPTS => {
                    debug!(
                        attempt,
                        %resource_type,
                        %resource_id,
                        existing = %operation,
                        "Descendant claimed by another tree, rebuilding"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn expand(
        &self,
        root: Operation,
        resource: Resource,
        ctx: &ResolverContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<Operation>> {
        let mut primaries: HashMap<ResourceKey, usize> = HashMap::new();
        primaries.insert((root.resource_type, root.resource_id.clone()), 0);
        let mut tree = vec![root];
        let mut frontier = VecDeque::from([Frontier {
            index: 0,
            resource,
            ancestors: Vec::new(),
        }]);

        while let Some(node) = frontier.pop_front() {
            let children = resolve_children(self.repo.as_ref(), &node.resource, ctx).await?;
            let parent_key = (tree[node.index].resource_type, tree[node.index].resource_id.clone());
            let mut ancestors = node.ancestors;
            ancestors.push(parent_key);

            for child in children.into_values().flatten() {
                let key = (child.resource_type(), child.id().clone());
                if ancestors.contains(&key) {
                    trace!(resource_id = %key.1, "Skipping resource already on its ancestor path");
                    continue;
                }

                let parent = &tree[node.index];
                if let Some(&primary) = primaries.get(&key) {
                    let duplicate = Operation::duplicate_of(parent, &tree[primary], now);
                    debug!(resource_id = %key.1, primary = %tree[primary].id, "Adding duplicate");
                    tree.push(duplicate);
                    continue;
                }

                if let Some(foreign) = self.active_operation(key.0, &key.1).await? {
                    let mut duplicate = Operation::child_of(parent, key.0, key.1.clone(), now);
                    let primary = foreign.primary_id.unwrap_or(foreign.id);
                    duplicate.primary_id = Some(primary);
                    debug!(resource_id = %key.1, %primary, "Adding duplicate of another tree's operation");
                    tree.push(duplicate);
                    continue;
                }

                let op = Operation::child_of(parent, key.0, key.1.clone(), now);
                primaries.insert(key, tree.len());
                frontier.push_back(Frontier {
                    index: tree.len(),
                    resource: child,
                    ancestors: ancestors.clone(),
                });
                tree.push(op);
            }
        }

        Ok(tree)
    }

    async fn load_resource(
        &self,
        resource_type: ResourceType,
        resource_id: &ResourceId,
    ) -> Result<Option<Resource>> {
        if resource_type == ResourceType::Tenant {
            return Ok(Some(Resource::Tenant(Tenant {
                id: resource_id.clone(),
            })));
        }
        Ok(self.repo.get_resource(resource_type, resource_id).await?)
    }

    /// Finds an unsettled operation targeting the resource, oldest first.
    async fn active_operation(
        &self,
        resource_type: ResourceType,
        resource_id: &ResourceId,
    ) -> Result<Option<Operation>> {
        let ops = self
            .repo
            .list_operations(&Query::for_resource(resource_type, resource_id))
            .await?;
        Ok(ops.into_iter().find(|op| !op.is_settled()))
    }
}
