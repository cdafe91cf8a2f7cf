//! Deletion actions.
//!
//! Each resource kind is deleted in its own way:
//!
//! | Kind | Action |
//! |------|--------|
//! | Tenant | nothing |
//! | ServiceInstance | broker deprovision, then repository delete |
//! | ServiceBinding | broker unbind, then repository delete |
//! | everything else | repository delete |
//!
//! A resource that is already gone counts as deleted. Broker calls are
//! bounded by the action timeout; a call that runs out of time may still
//! have taken effect, so it is reported as ambiguous.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::broker::{
    BrokerClient, BrokerError, BrokerErrorKind, BrokerResponse, BrokerTarget,
    DeprovisionRequest, LastOperationRequest, LastOperationState, PollSubject, UnbindRequest,
};
use crate::store::{Repository, StoreError, broker_for_plan};
use crate::types::{Operation, Resource, ResourceId, ResourceType, ServiceBinding, ServiceInstance};

/// How a failed action should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
    Ambiguous,
}

/// Result of running or polling a deletion action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The resource is gone.
    Completed,

    /// A broker job is still running. `operation` is the job identifier
    /// when a new job was just accepted.
    Running { operation: Option<String> },

    Failed { kind: FailureKind, message: String },
}

impl ActionOutcome {
    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        ActionOutcome::Failed {
            kind,
            message: message.into(),
        }
    }
}

/// Where the status of a running broker job can be asked for.
enum PollTarget {
    /// The resource record is already gone.
    Gone,

    /// The record exists but no broker serves it any more.
    NoBroker,

    Broker(BrokerTarget, PollSubject),
}

/// Runs deletion actions against the repository and the broker.
pub struct ActionRunner<'a, R, B> {
    repo: &'a R,
    broker: &'a B,
    timeout: Duration,
}

impl<'a, R: Repository, B: BrokerClient> ActionRunner<'a, R, B> {
    pub fn new(repo: &'a R, broker: &'a B, timeout: Duration) -> Self {
        ActionRunner {
            repo,
            broker,
            timeout,
        }
    }

    /// Starts (or restarts) the deletion of `op`'s resource.
    pub async fn execute(&self, op: &Operation) -> Result<ActionOutcome, StoreError> {
        match op.resource_type {
            ResourceType::Tenant => Ok(ActionOutcome::Completed),
            ResourceType::ServiceInstance => self.deprovision(&op.resource_id).await,
            ResourceType::ServiceBinding => self.unbind(&op.resource_id).await,
            other => self.delete_record(other, &op.resource_id).await,
        }
    }

    /// Polls the broker job started for `op`.
    pub async fn poll(&self, op: &Operation) -> Result<ActionOutcome, StoreError> {
        let (target, subject) = match self.poll_target(op).await? {
            PollTarget::Gone => {
                debug!(resource_id = %op.resource_id, "Resource vanished while its deletion was running");
                return Ok(ActionOutcome::Completed);
            }
            PollTarget::NoBroker => {
                warn!(resource_id = %op.resource_id, "No broker left to poll, deleting record only");
                return self.delete_record(op.resource_type, &op.resource_id).await;
            }
            PollTarget::Broker(target, subject) => (target, subject),
        };

        let own_id = op.id.to_string();
        let request = LastOperationRequest {
            target,
            subject,
            operation: op.external_id.clone().filter(|ext| *ext != own_id),
        };

        let state = match self.bounded(self.broker.last_operation(request)).await {
            Ok(last) => last,
            Err(e) if e.kind == BrokerErrorKind::Gone => {
                return self.delete_record(op.resource_type, &op.resource_id).await;
            }
            Err(e) if e.kind == BrokerErrorKind::Permanent => {
                return Ok(ActionOutcome::failed(FailureKind::Permanent, e.to_string()));
            }
            Err(e) => {
                debug!(resource_id = %op.resource_id, error = %e, "Status poll failed, polling again later");
                return Ok(ActionOutcome::Running { operation: None });
            }
        };

        match state.state {
            LastOperationState::InProgress => Ok(ActionOutcome::Running { operation: None }),
            LastOperationState::Succeeded => {
                self.delete_record(op.resource_type, &op.resource_id).await
            }
            LastOperationState::Failed => Ok(ActionOutcome::failed(
                FailureKind::Permanent,
                state
                    .description
                    .unwrap_or_else(|| "broker reported the deletion as failed".to_string()),
            )),
        }
    }

    async fn deprovision(&self, instance_id: &ResourceId) -> Result<ActionOutcome, StoreError> {
        let Some(instance) = self.instance(instance_id).await? else {
            return Ok(ActionOutcome::Completed);
        };
        let Some(target) = self.target_for_plan(&instance.service_plan_id).await? else {
            warn!(%instance_id, plan_id = %instance.service_plan_id, "No broker offers the instance's plan, deleting record only");
            return self.delete_record(ResourceType::ServiceInstance, instance_id).await;
        };

        let request = DeprovisionRequest {
            target,
            instance_id: instance_id.clone(),
            accepts_incomplete: true,
        };
        let response = self.bounded(self.broker.deprovision(request)).await;
        self.after_broker(response, ResourceType::ServiceInstance, instance_id)
            .await
    }

    async fn unbind(&self, binding_id: &ResourceId) -> Result<ActionOutcome, StoreError> {
        let Some(binding) = self.binding(binding_id).await? else {
            return Ok(ActionOutcome::Completed);
        };
        let target = match self.instance(&binding.service_instance_id).await? {
            Some(instance) => self.target_for_plan(&instance.service_plan_id).await?,
            None => None,
        };
        let Some(target) = target else {
            warn!(%binding_id, "No broker found for the binding's instance, deleting record only");
            return self.delete_record(ResourceType::ServiceBinding, binding_id).await;
        };

        let request = UnbindRequest {
            target,
            instance_id: binding.service_instance_id.clone(),
            binding_id: binding_id.clone(),
            accepts_incomplete: true,
        };
        let response = self.bounded(self.broker.unbind(request)).await;
        self.after_broker(response, ResourceType::ServiceBinding, binding_id)
            .await
    }

    async fn after_broker(
        &self,
        response: Result<BrokerResponse, BrokerError>,
        resource_type: ResourceType,
        resource_id: &ResourceId,
    ) -> Result<ActionOutcome, StoreError> {
        match response {
            Ok(BrokerResponse::Completed) => self.delete_record(resource_type, resource_id).await,
            Ok(BrokerResponse::Accepted { operation }) => Ok(ActionOutcome::Running { operation }),
            Err(e) => {
                let kind = match e.kind {
                    BrokerErrorKind::Gone => {
                        return self.delete_record(resource_type, resource_id).await;
                    }
                    BrokerErrorKind::Transient => FailureKind::Transient,
                    BrokerErrorKind::Permanent => FailureKind::Permanent,
                    BrokerErrorKind::Ambiguous => FailureKind::Ambiguous,
                };
                Ok(ActionOutcome::failed(kind, e.to_string()))
            }
        }
    }

    /// Deletes the stored record. A record still referenced elsewhere is a
    /// permanent failure of this node.
    async fn delete_record(
        &self,
        resource_type: ResourceType,
        resource_id: &ResourceId,
    ) -> Result<ActionOutcome, StoreError> {
        match self.repo.delete_resource(resource_type, resource_id).await {
            Ok(existed) => {
                if !existed {
                    debug!(%resource_type, %resource_id, "Resource already absent");
                }
                Ok(ActionOutcome::Completed)
            }
            Err(e) if e.is_conflict() => Ok(ActionOutcome::failed(FailureKind::Permanent, e.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Bounds a broker call by the action timeout.
    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::timed_out(self.timeout)),
        }
    }

    async fn poll_target(&self, op: &Operation) -> Result<PollTarget, StoreError> {
        let (instance, subject) = match op.resource_type {
            ResourceType::ServiceInstance => {
                let Some(instance) = self.instance(&op.resource_id).await? else {
                    return Ok(PollTarget::Gone);
                };
                let subject = PollSubject::Instance {
                    instance_id: instance.id.clone(),
                };
                (instance, subject)
            }
            ResourceType::ServiceBinding => {
                let Some(binding) = self.binding(&op.resource_id).await? else {
                    return Ok(PollTarget::Gone);
                };
                let Some(instance) = self.instance(&binding.service_instance_id).await? else {
                    return Ok(PollTarget::NoBroker);
                };
                let subject = PollSubject::Binding {
                    instance_id: instance.id.clone(),
                    binding_id: binding.id,
                };
                (instance, subject)
            }
            _ => return Ok(PollTarget::Gone),
        };

        Ok(match self.target_for_plan(&instance.service_plan_id).await? {
            Some(target) => PollTarget::Broker(target, subject),
            None => PollTarget::NoBroker,
        })
    }

    async fn target_for_plan(&self, plan_id: &ResourceId) -> Result<Option<BrokerTarget>, StoreError> {
        Ok(broker_for_plan(self.repo, plan_id)
            .await?
            .map(|(offering, broker)| BrokerTarget {
                broker_id: broker.id,
                broker_url: broker.broker_url,
                service_id: offering.id,
                plan_id: plan_id.clone(),
            }))
    }

    async fn instance(&self, id: &ResourceId) -> Result<Option<ServiceInstance>, StoreError> {
        match self.repo.get_resource(ResourceType::ServiceInstance, id).await? {
            Some(Resource::ServiceInstance(instance)) => Ok(Some(instance)),
            _ => Ok(None),
        }
    }

    async fn binding(&self, id: &ResourceId) -> Result<Option<ServiceBinding>, StoreError> {
        match self.repo.get_resource(ResourceType::ServiceBinding, id).await? {
            Some(Resource::ServiceBinding(binding)) => Ok(Some(binding)),
            _ => Ok(None),
        }
    }
}
