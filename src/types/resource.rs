//! Managed resource records.
//!
//! These are the rows the control plane keeps for brokers, platforms and the
//! instances/bindings provisioned through them. The cascade core only reads
//! them (to discover children and to address broker calls) and deletes them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::ResourceId;

/// The kind of a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Tenant,
    Platform,
    ServiceBroker,
    ServiceOffering,
    ServicePlan,
    ServiceInstance,
    ServiceBinding,
    Visibility,
}

impl ResourceType {
    /// All resource kinds, in a stable order.
    pub const ALL: [ResourceType; 8] = [
        ResourceType::Tenant,
        ResourceType::Platform,
        ResourceType::ServiceBroker,
        ResourceType::ServiceOffering,
        ResourceType::ServicePlan,
        ResourceType::ServiceInstance,
        ResourceType::ServiceBinding,
        ResourceType::Visibility,
    ];

    /// Returns the snake_case name used in criteria and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Tenant => "tenant",
            ResourceType::Platform => "platform",
            ResourceType::ServiceBroker => "service_broker",
            ResourceType::ServiceOffering => "service_offering",
            ResourceType::ServicePlan => "service_plan",
            ResourceType::ServiceInstance => "service_instance",
            ResourceType::ServiceBinding => "service_binding",
            ResourceType::Visibility => "visibility",
        }
    }

    /// Returns true for kinds that have no stored record and no deletion
    /// action of their own. Their operations only gate and aggregate children.
    pub fn is_virtual(&self) -> bool {
        matches!(self, ResourceType::Tenant)
    }

    /// Returns true if deleting this kind goes through a broker call.
    pub fn is_broker_managed(&self) -> bool {
        matches!(
            self,
            ResourceType::ServiceInstance | ResourceType::ServiceBinding
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multi-valued labels attached to a resource or operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, Vec<String>>);

impl Labels {
    pub fn new() -> Self {
        Labels(BTreeMap::new())
    }

    /// Builder-style helper that adds a single value under `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds `value` under `key` unless it is already present.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let values = self.0.entry(key.into()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Returns the values stored under `key` (empty if absent).
    pub fn values(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the first value stored under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.values(key).first().map(String::as_str)
    }

    /// Returns true if `key` carries `value`.
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.values(key).iter().any(|v| v == value)
    }
}

/// A platform (e.g. a Cloud Foundry or Kubernetes installation) registered
/// with the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub id: ResourceId,
    pub name: String,
    #[serde(default)]
    pub labels: Labels,
}

/// A service broker registered with the control plane.
///
/// `services` holds the broker's catalog. It is `None` until the broker has
/// been enriched from the repository (see `store::enrich_broker`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBroker {
    pub id: ResourceId,
    pub name: String,
    pub broker_url: String,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceOffering>>,
}

impl ServiceBroker {
    /// Returns the IDs of every plan in the loaded catalog, or `None` if the
    /// catalog has not been loaded.
    pub fn plan_ids(&self) -> Option<Vec<ResourceId>> {
        self.services.as_ref().map(|services| {
            services
                .iter()
                .flat_map(|offering| offering.plans.iter().map(|plan| plan.id.clone()))
                .collect()
        })
    }
}

/// A service offered by a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: ResourceId,
    pub name: String,
    pub broker_id: ResourceId,
    /// Populated only when loaded as part of a broker catalog.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<ServicePlan>,
}

/// A plan of a service offering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePlan {
    pub id: ResourceId,
    pub name: String,
    pub service_offering_id: ResourceId,
}

/// A service instance provisioned through a broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: ResourceId,
    pub name: String,
    pub service_plan_id: ResourceId,
    /// The platform the instance was provisioned from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<ResourceId>,
    #[serde(default)]
    pub labels: Labels,
}

/// A binding to a service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBinding {
    pub id: ResourceId,
    pub name: String,
    pub service_instance_id: ResourceId,
    #[serde(default)]
    pub labels: Labels,
}

/// Grants a platform access to a plan (or every platform, when
/// `platform_id` is `None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visibility {
    pub id: ResourceId,
    pub service_plan_id: ResourceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<ResourceId>,
    #[serde(default)]
    pub labels: Labels,
}

/// A tenant. Tenants are not stored; a tenant is the set of resources that
/// carry its ID under the tenant label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: ResourceId,
}

/// Any resource the cascade core can reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resource_type", rename_all = "snake_case")]
pub enum Resource {
    Tenant(Tenant),
    Platform(Platform),
    ServiceBroker(ServiceBroker),
    ServiceOffering(ServiceOffering),
    ServicePlan(ServicePlan),
    ServiceInstance(ServiceInstance),
    ServiceBinding(ServiceBinding),
    Visibility(Visibility),
}

impl Resource {
    pub fn id(&self) -> &ResourceId {
        match self {
            Resource::Tenant(r) => &r.id,
            Resource::Platform(r) => &r.id,
            Resource::ServiceBroker(r) => &r.id,
            Resource::ServiceOffering(r) => &r.id,
            Resource::ServicePlan(r) => &r.id,
            Resource::ServiceInstance(r) => &r.id,
            Resource::ServiceBinding(r) => &r.id,
            Resource::Visibility(r) => &r.id,
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self {
            Resource::Tenant(_) => ResourceType::Tenant,
            Resource::Platform(_) => ResourceType::Platform,
            Resource::ServiceBroker(_) => ResourceType::ServiceBroker,
            Resource::ServiceOffering(_) => ResourceType::ServiceOffering,
            Resource::ServicePlan(_) => ResourceType::ServicePlan,
            Resource::ServiceInstance(_) => ResourceType::ServiceInstance,
            Resource::ServiceBinding(_) => ResourceType::ServiceBinding,
            Resource::Visibility(_) => ResourceType::Visibility,
        }
    }

    /// Returns the resource's labels. Offerings, plans and tenants carry none.
    pub fn labels(&self) -> Option<&Labels> {
        match self {
            Resource::Platform(r) => Some(&r.labels),
            Resource::ServiceBroker(r) => Some(&r.labels),
            Resource::ServiceInstance(r) => Some(&r.labels),
            Resource::ServiceBinding(r) => Some(&r.labels),
            Resource::Visibility(r) => Some(&r.labels),
            Resource::Tenant(_) | Resource::ServiceOffering(_) | Resource::ServicePlan(_) => None,
        }
    }
}
