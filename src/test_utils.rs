//! Shared test fixtures: resource builders, a scripted broker client, and
//! arbitrary generators for property-based testing.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use crate::broker::{
    BrokerClient, BrokerError, BrokerResponse, DeprovisionRequest, LastOperation,
    LastOperationRequest, LastOperationState, PollSubject, UnbindRequest,
};
use crate::store::Repository;
use crate::types::{
    FailureRecord, Labels, Platform, Resource, ResourceId, ResourceType, ServiceBinding,
    ServiceBroker, ServiceInstance, ServiceOffering, ServicePlan,
};

pub const TENANT_KEY: &str = "tenant";

pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn tenant_labels(tenant: Option<&str>) -> Labels {
    let mut labels = Labels::new();
    if let Some(t) = tenant {
        labels.insert(TENANT_KEY, t);
    }
    labels
}

pub fn platform(id: &str, tenant: Option<&str>) -> Resource {
    Resource::Platform(Platform {
        id: id.into(),
        name: format!("platform-{id}"),
        labels: tenant_labels(tenant),
    })
}

/// A broker with one offering (`<id>-svc`) carrying the given plans. The
/// broker record is returned without its catalog loaded.
pub fn broker_with_plans(id: &str, plans: &[&str], tenant: Option<&str>) -> Vec<Resource> {
    let offering_id = format!("{id}-svc");
    let mut resources = vec![
        Resource::ServiceBroker(ServiceBroker {
            id: id.into(),
            name: format!("broker-{id}"),
            broker_url: format!("https://{id}.brokers.example"),
            labels: tenant_labels(tenant),
            services: None,
        }),
        Resource::ServiceOffering(ServiceOffering {
            id: offering_id.as_str().into(),
            name: format!("service-{id}"),
            broker_id: id.into(),
            plans: Vec::new(),
        }),
    ];
    resources.extend(plans.iter().map(|plan| {
        Resource::ServicePlan(ServicePlan {
            id: (*plan).into(),
            name: format!("plan-{plan}"),
            service_offering_id: offering_id.as_str().into(),
        })
    }));
    resources
}

pub fn instance(id: &str, plan: &str, platform: Option<&str>, tenant: Option<&str>) -> Resource {
    Resource::ServiceInstance(ServiceInstance {
        id: id.into(),
        name: format!("instance-{id}"),
        service_plan_id: plan.into(),
        platform_id: platform.map(ResourceId::from),
        labels: tenant_labels(tenant),
    })
}

/// An instance nested under `container` through the `key` label.
pub fn contained_instance(id: &str, plan: &str, key: &str, container: &str) -> Resource {
    Resource::ServiceInstance(ServiceInstance {
        id: id.into(),
        name: format!("instance-{id}"),
        service_plan_id: plan.into(),
        platform_id: None,
        labels: Labels::new().with(key, container),
    })
}

pub fn binding(id: &str, instance_id: &str) -> Resource {
    Resource::ServiceBinding(ServiceBinding {
        id: id.into(),
        name: format!("binding-{id}"),
        service_instance_id: instance_id.into(),
        labels: Labels::new(),
    })
}

pub async fn seed<R: Repository>(repo: &R, resources: impl IntoIterator<Item = Resource>) {
    for resource in resources {
        repo.create_resource(resource).await.unwrap();
    }
}

/// Seeds tenant `t1` with:
///
/// - platform `p1` and broker `b1` (plans `b1-plan-1`, `b1-plan-2`), both
///   tenant-scoped, plus an unscoped broker `b2` with plan `b2-plan`
/// - `i-both` on `p1` with a `b1` plan, reachable through both
/// - `i-p1`..`i-p3` on `p1` with the `b2` plan
/// - `i-b1`..`i-b3` on no platform with a `b1` plan
/// - `i-direct` reachable only through the tenant label, with bindings
///   `bd1` and `bd2`
///
/// Deleting the tenant yields 14 operations.
pub async fn seed_tenant_scenario<R: Repository>(repo: &R) {
    let t = Some("t1");
    let mut resources = vec![platform("p1", t)];
    resources.extend(broker_with_plans("b1", &["b1-plan-1", "b1-plan-2"], t));
    resources.extend(broker_with_plans("b2", &["b2-plan"], None));
    resources.push(instance("i-both", "b1-plan-1", Some("p1"), t));
    for i in 1..=3 {
        resources.push(instance(&format!("i-p{i}"), "b2-plan", Some("p1"), t));
        resources.push(instance(&format!("i-b{i}"), "b1-plan-2", None, t));
    }
    resources.push(instance("i-direct", "b2-plan", None, t));
    resources.push(binding("bd1", "i-direct"));
    resources.push(binding("bd2", "i-direct"));
    seed(repo, resources).await;
}

pub const TENANT_SCENARIO_OPERATIONS: usize = 14;

// ─── Scripted Broker ──────────────────────────────────────────────────────────

/// A broker call observed by [`ScriptedBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Deprovision(ResourceId),
    Unbind(ResourceId),
    LastOperation(ResourceId, Option<String>),
}

impl BrokerCall {
    pub fn resource_id(&self) -> &ResourceId {
        match self {
            BrokerCall::Deprovision(id) | BrokerCall::Unbind(id) => id,
            BrokerCall::LastOperation(id, _) => id,
        }
    }
}

/// What the scripted broker does for one call.
#[derive(Debug, Clone)]
pub enum Step<T> {
    Respond(Result<T, BrokerError>),
    /// Never answers; the maintainer's action timeout must fire.
    Hang,
}

/// Broker client whose answers are scripted per resource ID.
///
/// Unscripted deletions complete synchronously and unscripted polls report
/// success. Every call is recorded in order.
#[derive(Debug, Default)]
pub struct ScriptedBroker {
    deletions: Mutex<HashMap<ResourceId, VecDeque<Step<BrokerResponse>>>>,
    polls: Mutex<HashMap<ResourceId, VecDeque<Step<LastOperation>>>>,
    calls: Mutex<Vec<BrokerCall>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the answer to the next deprovision/unbind of `resource`.
    pub fn on_delete(&self, resource: &str, step: Step<BrokerResponse>) -> &Self {
        self.deletions
            .lock()
            .unwrap()
            .entry(resource.into())
            .or_default()
            .push_back(step);
        self
    }

    pub fn fail_delete(&self, resource: &str, error: BrokerError) -> &Self {
        self.on_delete(resource, Step::Respond(Err(error)))
    }

    pub fn accept_delete(&self, resource: &str, operation: Option<&str>) -> &Self {
        self.on_delete(
            resource,
            Step::Respond(Ok(BrokerResponse::Accepted {
                operation: operation.map(str::to_string),
            })),
        )
    }

    /// Queues the answer to the next `last_operation` poll of `resource`.
    pub fn on_poll(&self, resource: &str, state: LastOperationState) -> &Self {
        self.polls
            .lock()
            .unwrap()
            .entry(resource.into())
            .or_default()
            .push_back(Step::Respond(Ok(LastOperation::new(state))));
        self
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of deprovision/unbind calls made for `resource`.
    pub fn deletions_of(&self, resource: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| {
                matches!(c, BrokerCall::Deprovision(_) | BrokerCall::Unbind(_))
                    && c.resource_id().as_str() == resource
            })
            .count()
    }

    fn record(&self, call: BrokerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_deletion(&self, resource: &ResourceId) -> Step<BrokerResponse> {
        self.deletions
            .lock()
            .unwrap()
            .get_mut(resource)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Respond(Ok(BrokerResponse::Completed)))
    }

    fn next_poll(&self, resource: &ResourceId) -> Step<LastOperation> {
        self.polls
            .lock()
            .unwrap()
            .get_mut(resource)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Respond(Ok(LastOperation::new(
                LastOperationState::Succeeded,
            ))))
    }
}

async fn play<T>(step: Step<T>) -> Result<T, BrokerError> {
    match step {
        Step::Respond(result) => result,
        Step::Hang => std::future::pending().await,
    }
}

impl BrokerClient for ScriptedBroker {
    fn deprovision(
        &self,
        request: DeprovisionRequest,
    ) -> impl Future<Output = Result<BrokerResponse, BrokerError>> + Send {
        self.record(BrokerCall::Deprovision(request.instance_id.clone()));
        play(self.next_deletion(&request.instance_id))
    }

    fn unbind(
        &self,
        request: UnbindRequest,
    ) -> impl Future<Output = Result<BrokerResponse, BrokerError>> + Send {
        self.record(BrokerCall::Unbind(request.binding_id.clone()));
        play(self.next_deletion(&request.binding_id))
    }

    fn last_operation(
        &self,
        request: LastOperationRequest,
    ) -> impl Future<Output = Result<LastOperation, BrokerError>> + Send {
        let resource = match &request.subject {
            PollSubject::Instance { instance_id } => instance_id.clone(),
            PollSubject::Binding { binding_id, .. } => binding_id.clone(),
        };
        self.record(BrokerCall::LastOperation(
            resource.clone(),
            request.operation.clone(),
        ));
        play(self.next_poll(&resource))
    }
}

// ─── Strategies ───────────────────────────────────────────────────────────────

pub fn arb_resource_type() -> impl Strategy<Value = ResourceType> {
    prop::sample::select(ResourceType::ALL.to_vec())
}

pub fn arb_resource_id() -> impl Strategy<Value = ResourceId> {
    "[a-z][a-z0-9-]{0,12}".prop_map(ResourceId::from)
}

pub fn arb_failure_record() -> impl Strategy<Value = FailureRecord> {
    (
        arb_resource_type(),
        arb_resource_id(),
        proptest::option::of((arb_resource_type(), arb_resource_id())),
        "[a-zA-Z0-9 ]{1,40}",
    )
        .prop_map(|(rtype, rid, parent, message)| {
            let record = FailureRecord::new(rtype, rid, message);
            match parent {
                Some((ptype, pid)) => record.with_parent(ptype, pid),
                None => record,
            }
        })
}
