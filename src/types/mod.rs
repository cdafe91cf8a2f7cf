//! Core domain types for the cascade orchestrator.
//!
//! This module contains the fundamental types used throughout the crate,
//! designed to encode invariants via the type system.

pub mod failure;
pub mod ids;
pub mod operation;
pub mod resource;

// Re-export commonly used types at the module level
pub use failure::{DEFAULT_MAX_ERROR_RECORDS, FailureRecord, OperationErrors};
pub use ids::{OperationId, ResourceId};
pub use operation::{
    FORCE_LABEL, Operation, OperationState, OperationType, TransitionError,
};
pub use resource::{
    Labels, Platform, Resource, ResourceType, ServiceBinding, ServiceBroker, ServiceInstance,
    ServiceOffering, ServicePlan, Tenant, Visibility,
};
