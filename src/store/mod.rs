//! Storage for resources and operations.
//!
//! The cascade core consumes storage through the narrow [`Repository`]
//! trait: typed CRUD over resources and operations, selected by
//! [`Query`] criteria. [`MemoryRepository`] is the bundled implementation,
//! optionally made durable with atomic JSON snapshots.
//!
//! # Transactions
//!
//! The only multi-record write the core needs is inserting a whole cascade
//! tree. [`Repository::create_operations`] is therefore all-or-nothing: if
//! any operation in the batch cannot be inserted, none are. The insert is
//! also where concurrent cascades are serialised: a non-duplicate cascade
//! operation for a resource that already has an unsettled operation is
//! refused with [`StoreError::OperationInProgress`], and the first writer
//! wins.

use std::future::Future;

use thiserror::Error;

use crate::types::{
    Operation, OperationId, Resource, ResourceId, ResourceType, ServiceBroker, ServiceOffering,
};

pub mod criteria;
pub mod memory;
pub mod snapshot;

pub use criteria::{Criterion, Direction, OrderField, Query, Queryable, fields};
pub use memory::MemoryRepository;
pub use snapshot::{RepositorySnapshot, SnapshotError};

/// Errors returned by a repository.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The record does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: String, id: String },

    /// A record with the same identity already exists.
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: String, id: String },

    /// The record is still referenced by other records.
    #[error("cannot delete {resource_type} {resource_id}: {reason}")]
    Conflict {
        resource_type: ResourceType,
        resource_id: ResourceId,
        reason: String,
    },

    /// A cascade operation would become a second primary for a resource
    /// that `operation` is still deleting.
    #[error("{resource_type} {resource_id} is already being deleted by operation {operation}")]
    OperationInProgress {
        resource_type: ResourceType,
        resource_id: ResourceId,
        operation: OperationId,
    },

    /// Tenants have no stored representation.
    #[error("{0} resources are not stored")]
    NotStorable(ResourceType),

    /// Persisting the repository snapshot failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// An internal lock was poisoned by a panicking writer.
    #[error("repository lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn operation_not_found(id: OperationId) -> Self {
        StoreError::NotFound {
            kind: "operation".to_string(),
            id: id.to_string(),
        }
    }

    /// Returns true if the error is a referential conflict rather than a
    /// storage failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Transactional CRUD over resources and operations.
///
/// Implementations must be safe to share between the tree builder and any
/// number of maintainer workers.
pub trait Repository: Send + Sync {
    /// Inserts a resource. Fails with `AlreadyExists` on an ID collision.
    fn create_resource(&self, resource: Resource) -> impl Future<Output = Result<()>> + Send;

    fn get_resource(
        &self,
        resource_type: ResourceType,
        id: &ResourceId,
    ) -> impl Future<Output = Result<Option<Resource>>> + Send;

    fn list_resources(
        &self,
        resource_type: ResourceType,
        query: &Query,
    ) -> impl Future<Output = Result<Vec<Resource>>> + Send;

    fn count_resources(
        &self,
        resource_type: ResourceType,
        query: &Query,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Deletes a resource together with the rows it owns. Returns false if
    /// the resource did not exist.
    fn delete_resource(
        &self,
        resource_type: ResourceType,
        id: &ResourceId,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Inserts a batch of operations atomically. Fails with
    /// `OperationInProgress` if a non-duplicate cascade operation in the batch
    /// targets a resource that already has an unsettled operation.
    fn create_operations(&self, operations: &[Operation]) -> impl Future<Output = Result<()>> + Send;

    fn create_operation(&self, operation: &Operation) -> impl Future<Output = Result<()>> + Send {
        self.create_operations(std::slice::from_ref(operation))
    }

    fn get_operation(
        &self,
        id: &OperationId,
    ) -> impl Future<Output = Result<Option<Operation>>> + Send;

    fn list_operations(&self, query: &Query) -> impl Future<Output = Result<Vec<Operation>>> + Send;

    fn count_operations(&self, query: &Query) -> impl Future<Output = Result<usize>> + Send;

    /// Replaces a stored operation. Fails with `NotFound` if it is missing.
    fn update_operation(&self, operation: &Operation) -> impl Future<Output = Result<()>> + Send;

    /// Deletes the given operations, returning how many existed.
    fn delete_operations(&self, ids: &[OperationId]) -> impl Future<Output = Result<usize>> + Send;
}

/// Loads a broker's catalog (offerings and their plans) into `broker.services`.
pub async fn enrich_broker<R: Repository>(repo: &R, broker: &mut ServiceBroker) -> Result<()> {
    let offering_query =
        Query::all().with(Criterion::field_eq(fields::BROKER_ID, broker.id.as_str()));
    let mut services = Vec::new();

    for resource in repo
        .list_resources(ResourceType::ServiceOffering, &offering_query)
        .await?
    {
        let Resource::ServiceOffering(mut offering) = resource else {
            continue;
        };
        let plan_query = Query::all().with(Criterion::field_eq(
            fields::SERVICE_OFFERING_ID,
            offering.id.as_str(),
        ));
        offering.plans = repo
            .list_resources(ResourceType::ServicePlan, &plan_query)
            .await?
            .into_iter()
            .filter_map(|r| match r {
                Resource::ServicePlan(plan) => Some(plan),
                _ => None,
            })
            .collect();
        services.push(offering);
    }

    broker.services = Some(services);
    Ok(())
}

/// Finds the broker that offers the given plan.
pub async fn broker_for_plan<R: Repository>(
    repo: &R,
    plan_id: &ResourceId,
) -> Result<Option<(ServiceOffering, ServiceBroker)>> {
    let Some(Resource::ServicePlan(plan)) =
        repo.get_resource(ResourceType::ServicePlan, plan_id).await?
    else {
        return Ok(None);
    };
    let Some(Resource::ServiceOffering(offering)) = repo
        .get_resource(ResourceType::ServiceOffering, &plan.service_offering_id)
        .await?
    else {
        return Ok(None);
    };
    let Some(Resource::ServiceBroker(broker)) = repo
        .get_resource(ResourceType::ServiceBroker, &offering.broker_id)
        .await?
    else {
        return Ok(None);
    };
    Ok(Some((offering, broker)))
}
