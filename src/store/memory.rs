//! In-memory repository.
//!
//! [`MemoryRepository`] keeps every table behind one `RwLock`, which makes
//! each trait method a transaction. Deleting a resource cascades to the rows
//! it owns the way foreign keys with `ON DELETE CASCADE` would, and refuses
//! to orphan service instances.
//!
//! When opened with a snapshot path, every mutation is applied to a copy of
//! the tables, the copy is written out atomically, and only then does it
//! replace the live tables. A failed write leaves both the file and the
//! in-memory state as they were, so a restarted process resumes from exactly
//! what callers were told succeeded.
//!
//! Inserting cascade operations is conditional: a new primary for a resource
//! that already has an unsettled operation is refused with
//! [`StoreError::OperationInProgress`], so concurrent cascades over the same
//! resource cannot both become its primary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use tracing::{debug, trace};

use super::criteria::Query;
use super::snapshot::{RepositorySnapshot, save_snapshot_atomic, try_load_snapshot};
use super::{Repository, Result, StoreError};
use crate::types::{Operation, OperationId, Resource, ResourceId, ResourceType};

#[derive(Debug, Clone, Default)]
struct Tables {
    resources: BTreeMap<ResourceType, BTreeMap<ResourceId, Resource>>,
    /// Kept in insertion order.
    operations: Vec<Operation>,
}

impl Tables {
    fn table(&self, resource_type: ResourceType) -> impl Iterator<Item = &Resource> {
        self.resources
            .get(&resource_type)
            .into_iter()
            .flat_map(|t| t.values())
    }

    fn remove(&mut self, resource_type: ResourceType, ids: &HashSet<ResourceId>) {
        if let Some(table) = self.resources.get_mut(&resource_type) {
            table.retain(|id, _| !ids.contains(id));
        }
    }

    fn instances_using_plans(&self, plans: &HashSet<ResourceId>) -> Vec<ResourceId> {
        self.table(ResourceType::ServiceInstance)
            .filter_map(|r| match r {
                Resource::ServiceInstance(i) if plans.contains(&i.service_plan_id) => {
                    Some(i.id.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn plans_of_offerings(&self, offerings: &HashSet<ResourceId>) -> HashSet<ResourceId> {
        self.table(ResourceType::ServicePlan)
            .filter_map(|r| match r {
                Resource::ServicePlan(p) if offerings.contains(&p.service_offering_id) => {
                    Some(p.id.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn visibilities_where(&self, pred: impl Fn(&crate::types::Visibility) -> bool) -> HashSet<ResourceId> {
        self.table(ResourceType::Visibility)
            .filter_map(|r| match r {
                Resource::Visibility(v) if pred(v) => Some(v.id.clone()),
                _ => None,
            })
            .collect()
    }

    fn conflict(resource_type: ResourceType, id: &ResourceId, users: Vec<ResourceId>) -> StoreError {
        let listed: Vec<&str> = users.iter().map(ResourceId::as_str).collect();
        StoreError::Conflict {
            resource_type,
            resource_id: id.clone(),
            reason: format!("still referenced by service instances [{}]", listed.join(", ")),
        }
    }

    /// Removes the plans in `plans` after checking no instance uses them,
    /// together with their visibilities.
    fn remove_plans(
        &mut self,
        owner_type: ResourceType,
        owner_id: &ResourceId,
        plans: &HashSet<ResourceId>,
    ) -> Result<()> {
        let users = self.instances_using_plans(plans);
        if !users.is_empty() {
            return Err(Self::conflict(owner_type, owner_id, users));
        }
        let visibilities = self.visibilities_where(|v| plans.contains(&v.service_plan_id));
        self.remove(ResourceType::Visibility, &visibilities);
        self.remove(ResourceType::ServicePlan, plans);
        Ok(())
    }

    fn delete(&mut self, resource_type: ResourceType, id: &ResourceId) -> Result<bool> {
        if resource_type.is_virtual() {
            return Err(StoreError::NotStorable(resource_type));
        }
        let exists = self
            .resources
            .get(&resource_type)
            .is_some_and(|t| t.contains_key(id));
        if !exists {
            return Ok(false);
        }

        let just = |id: &ResourceId| HashSet::from([id.clone()]);

        match resource_type {
            ResourceType::Platform => {
                let users: Vec<ResourceId> = self
                    .table(ResourceType::ServiceInstance)
                    .filter_map(|r| match r {
                        Resource::ServiceInstance(i) if i.platform_id.as_ref() == Some(id) => {
                            Some(i.id.clone())
                        }
                        _ => None,
                    })
                    .collect();
                if !users.is_empty() {
                    return Err(Self::conflict(resource_type, id, users));
                }
                let visibilities = self.visibilities_where(|v| v.platform_id.as_ref() == Some(id));
                self.remove(ResourceType::Visibility, &visibilities);
            }
            ResourceType::ServiceBroker => {
                let offerings: HashSet<ResourceId> = self
                    .table(ResourceType::ServiceOffering)
                    .filter_map(|r| match r {
                        Resource::ServiceOffering(o) if &o.broker_id == id => Some(o.id.clone()),
                        _ => None,
                    })
                    .collect();
                let plans = self.plans_of_offerings(&offerings);
                self.remove_plans(resource_type, id, &plans)?;
                self.remove(ResourceType::ServiceOffering, &offerings);
            }
            ResourceType::ServiceOffering => {
                let plans = self.plans_of_offerings(&just(id));
                self.remove_plans(resource_type, id, &plans)?;
            }
            ResourceType::ServicePlan => {
                self.remove_plans(resource_type, id, &just(id))?;
            }
            ResourceType::ServiceInstance => {
                let bindings: HashSet<ResourceId> = self
                    .table(ResourceType::ServiceBinding)
                    .filter_map(|r| match r {
                        Resource::ServiceBinding(b) if &b.service_instance_id == id => {
                            Some(b.id.clone())
                        }
                        _ => None,
                    })
                    .collect();
                self.remove(ResourceType::ServiceBinding, &bindings);
            }
            ResourceType::ServiceBinding | ResourceType::Visibility | ResourceType::Tenant => {}
        }

        self.remove(resource_type, &just(id));
        Ok(true)
    }

    /// The unsettled operation already covering the resource, if any.
    fn active_operation(&self, resource_type: ResourceType, id: &ResourceId) -> Option<&Operation> {
        self.operations.iter().find(|op| {
            op.resource_type == resource_type && &op.resource_id == id && !op.is_settled()
        })
    }

    fn to_snapshot(&self) -> RepositorySnapshot {
        let resources = self
            .resources
            .values()
            .flat_map(|t| t.values().cloned())
            .collect();
        RepositorySnapshot::new(resources, self.operations.clone())
    }
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Poisoned
}

/// Thread-safe in-memory implementation of [`Repository`].
#[derive(Debug, Default)]
pub struct MemoryRepository {
    tables: RwLock<Tables>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryRepository {
    /// Creates an empty, non-durable repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a durable repository backed by the snapshot at `path`, loading
    /// its contents if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let tables = match try_load_snapshot(&path)? {
            Some(snapshot) => {
                debug!(
                    path = %path.display(),
                    resources = snapshot.resources.len(),
                    operations = snapshot.operations.len(),
                    "Loaded repository snapshot"
                );
                Self::tables_from(snapshot)
            }
            None => Tables::default(),
        };
        Ok(MemoryRepository {
            tables: RwLock::new(tables),
            snapshot_path: Some(path),
        })
    }

    /// Builds a non-durable repository from a snapshot.
    pub fn from_snapshot(snapshot: RepositorySnapshot) -> Self {
        MemoryRepository {
            tables: RwLock::new(Self::tables_from(snapshot)),
            snapshot_path: None,
        }
    }

    fn tables_from(snapshot: RepositorySnapshot) -> Tables {
        let mut tables = Tables::default();
        for resource in snapshot.resources {
            tables
                .resources
                .entry(resource.resource_type())
                .or_default()
                .insert(resource.id().clone(), resource);
        }
        tables.operations = snapshot.operations;
        tables
    }

    /// Returns the snapshot path, if the repository is durable.
    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// Captures the current contents.
    pub fn snapshot(&self) -> Result<RepositorySnapshot> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.to_snapshot())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(poison_err)
    }

    /// Runs `change` as one transaction. A durable repository applies it to a
    /// copy and swaps the copy in once its snapshot is on disk; an error from
    /// either step leaves the live tables untouched.
    ///
    /// `change` returns whether it modified anything, so no-ops skip the write.
    fn transact<T>(&self, change: impl FnOnce(&mut Tables) -> Result<(T, bool)>) -> Result<T> {
        let mut tables = self.write()?;
        let Some(path) = &self.snapshot_path else {
            return change(&mut *tables).map(|(out, _)| out);
        };

        let mut next = tables.clone();
        let (out, changed) = change(&mut next)?;
        if changed {
            save_snapshot_atomic(path, &next.to_snapshot())?;
            trace!(path = %path.display(), "Committed repository snapshot");
            *tables = next;
        }
        Ok(out)
    }
}

impl Repository for MemoryRepository {
    async fn create_resource(&self, resource: Resource) -> Result<()> {
        let resource_type = resource.resource_type();
        if resource_type.is_virtual() {
            return Err(StoreError::NotStorable(resource_type));
        }
        self.transact(|tables| {
            let table = tables.resources.entry(resource_type).or_default();
            if table.contains_key(resource.id()) {
                return Err(StoreError::AlreadyExists {
                    kind: resource_type.to_string(),
                    id: resource.id().to_string(),
                });
            }
            table.insert(resource.id().clone(), resource);
            Ok(((), true))
        })
    }

    async fn get_resource(
        &self,
        resource_type: ResourceType,
        id: &ResourceId,
    ) -> Result<Option<Resource>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables
            .resources
            .get(&resource_type)
            .and_then(|t| t.get(id))
            .cloned())
    }

    async fn list_resources(
        &self,
        resource_type: ResourceType,
        query: &Query,
    ) -> Result<Vec<Resource>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(query.apply(tables.table(resource_type).cloned()))
    }

    async fn count_resources(&self, resource_type: ResourceType, query: &Query) -> Result<usize> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables
            .table(resource_type)
            .filter(|r| query.matches(*r))
            .count())
    }

    async fn delete_resource(&self, resource_type: ResourceType, id: &ResourceId) -> Result<bool> {
        self.transact(|tables| {
            let deleted = tables.delete(resource_type, id)?;
            Ok((deleted, deleted))
        })
    }

    async fn create_operations(&self, operations: &[Operation]) -> Result<()> {
        self.transact(|tables| {
            let mut seen: HashSet<OperationId> = tables.operations.iter().map(|op| op.id).collect();
            for op in operations {
                if !seen.insert(op.id) {
                    return Err(StoreError::AlreadyExists {
                        kind: "operation".to_string(),
                        id: op.id.to_string(),
                    });
                }
            }

            let mut claimed: HashMap<(ResourceType, &ResourceId), OperationId> = HashMap::new();
            for op in operations.iter().filter(|op| op.is_cascade() && !op.is_duplicate()) {
                let holder = tables
                    .active_operation(op.resource_type, &op.resource_id)
                    .map(|active| active.primary_id.unwrap_or(active.id))
                    .or_else(|| claimed.get(&(op.resource_type, &op.resource_id)).copied());
                if let Some(holder) = holder {
                    debug!(
                        resource_type = %op.resource_type,
                        resource_id = %op.resource_id,
                        %holder,
                        "Refusing second primary operation"
                    );
                    return Err(StoreError::OperationInProgress {
                        resource_type: op.resource_type,
                        resource_id: op.resource_id.clone(),
                        operation: holder,
                    });
                }
                claimed.insert((op.resource_type, &op.resource_id), op.id);
            }

            tables.operations.extend(operations.iter().cloned());
            Ok(((), true))
        })
    }

    async fn get_operation(&self, id: &OperationId) -> Result<Option<Operation>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.operations.iter().find(|op| &op.id == id).cloned())
    }

    async fn list_operations(&self, query: &Query) -> Result<Vec<Operation>> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(query.apply(tables.operations.iter().cloned()))
    }

    async fn count_operations(&self, query: &Query) -> Result<usize> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.operations.iter().filter(|op| query.matches(*op)).count())
    }

    async fn update_operation(&self, operation: &Operation) -> Result<()> {
        self.transact(|tables| {
            let slot = tables
                .operations
                .iter_mut()
                .find(|op| op.id == operation.id)
                .ok_or_else(|| StoreError::operation_not_found(operation.id))?;
            *slot = operation.clone();
            Ok(((), true))
        })
    }

    async fn delete_operations(&self, ids: &[OperationId]) -> Result<usize> {
        let ids: HashSet<&OperationId> = ids.iter().collect();
        self.transact(|tables| {
            let before = tables.operations.len();
            tables.operations.retain(|op| !ids.contains(&op.id));
            let removed = before - tables.operations.len();
            Ok((removed, removed > 0))
        })
    }
}
