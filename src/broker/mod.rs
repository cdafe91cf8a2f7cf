//! The broker client seam.
//!
//! Deleting a service instance or binding means asking the broker that
//! provisioned it to deprovision or unbind. Brokers may answer synchronously
//! or accept the request as an asynchronous job, whose progress is then
//! polled through `last_operation`. The wire protocol lives behind
//! [`BrokerClient`]; the maintainer only sees these request and response
//! shapes plus a classified [`BrokerError`].

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::types::ResourceId;

pub mod error;
pub mod logging;

pub use error::{BrokerError, BrokerErrorKind};
pub use logging::LoggingBrokerClient;

/// Where to reach a broker and which catalog entry a request refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerTarget {
    pub broker_id: ResourceId,
    pub broker_url: String,
    pub service_id: ResourceId,
    pub plan_id: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    pub target: BrokerTarget,
    pub instance_id: ResourceId,
    /// Always true: the maintainer can follow asynchronous jobs.
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbindRequest {
    pub target: BrokerTarget,
    pub instance_id: ResourceId,
    pub binding_id: ResourceId,
    pub accepts_incomplete: bool,
}

/// What a `last_operation` poll asks about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollSubject {
    Instance {
        instance_id: ResourceId,
    },
    Binding {
        instance_id: ResourceId,
        binding_id: ResourceId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOperationRequest {
    pub target: BrokerTarget,
    pub subject: PollSubject,
    /// The job identifier returned when the request was accepted.
    pub operation: Option<String>,
}

/// A broker's answer to a deprovision or unbind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerResponse {
    /// The resource is gone.
    Completed,

    /// The broker started an asynchronous job. Brokers are not required to
    /// name the job.
    Accepted { operation: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastOperationState {
    InProgress,
    Succeeded,
    Failed,
}

/// Status of an asynchronous broker job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastOperation {
    pub state: LastOperationState,
    pub description: Option<String>,
}

impl LastOperation {
    pub fn new(state: LastOperationState) -> Self {
        LastOperation {
            state,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Calls brokers on behalf of the maintainer.
///
/// Implementations do not apply their own timeout; the maintainer bounds
/// every call by the configured action timeout.
pub trait BrokerClient: Send + Sync {
    fn deprovision(
        &self,
        request: DeprovisionRequest,
    ) -> impl Future<Output = Result<BrokerResponse, BrokerError>> + Send;

    fn unbind(
        &self,
        request: UnbindRequest,
    ) -> impl Future<Output = Result<BrokerResponse, BrokerError>> + Send;

    fn last_operation(
        &self,
        request: LastOperationRequest,
    ) -> impl Future<Output = Result<LastOperation, BrokerError>> + Send;
}
