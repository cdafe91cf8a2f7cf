//! Child discovery for cascading deletes.
//!
//! Only four resource kinds own children. Each produces, per child kind, a
//! list of queries whose union selects the children; the resolver runs them
//! against the repository. Everything else is a leaf.
//!
//! | Parent | Children |
//! |--------|----------|
//! | Tenant | platforms, brokers and instances labelled with the tenant |
//! | Platform | instances on the platform |
//! | ServiceBroker | instances of any plan in the broker's catalog |
//! | ServiceInstance | its bindings, plus instances contained via a label |

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::trace;

use crate::store::{Criterion, Query, Repository, StoreError, enrich_broker, fields};
use crate::types::{
    Platform, Resource, ResourceId, ResourceType, ServiceBroker, ServiceInstance, Tenant,
};

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The broker must be enriched with its catalog before its children can
    /// be selected.
    #[error("catalog of service broker {0} is not loaded")]
    CatalogNotLoaded(ResourceId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Per-kind child selectors. Each kind maps to queries combined by union.
pub type ChildSelectors = BTreeMap<ResourceType, Vec<Query>>;

/// Resolved children grouped by kind, in selection order and without
/// repeats.
pub type Children = BTreeMap<ResourceType, Vec<Resource>>;

/// Request-scoped inputs to child selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverContext {
    /// Label key marking tenant membership.
    pub tenant_label_key: String,

    /// Label key under which an instance names its containing instance.
    /// Containment is not followed when `None`.
    pub container_label_key: Option<String>,
}

impl ResolverContext {
    pub fn new(tenant_label_key: impl Into<String>) -> Self {
        ResolverContext {
            tenant_label_key: tenant_label_key.into(),
            container_label_key: None,
        }
    }

    pub fn with_container_label_key(mut self, key: impl Into<String>) -> Self {
        self.container_label_key = Some(key.into());
        self
    }
}

/// A resource that can own children in a cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeResource {
    Tenant(Tenant),
    Platform(Platform),
    ServiceBroker(ServiceBroker),
    ServiceInstance(ServiceInstance),
}

impl CascadeResource {
    /// Returns `None` for leaf kinds.
    pub fn from_resource(resource: Resource) -> Option<Self> {
        match resource {
            Resource::Tenant(t) => Some(CascadeResource::Tenant(t)),
            Resource::Platform(p) => Some(CascadeResource::Platform(p)),
            Resource::ServiceBroker(b) => Some(CascadeResource::ServiceBroker(b)),
            Resource::ServiceInstance(i) => Some(CascadeResource::ServiceInstance(i)),
            Resource::ServiceOffering(_)
            | Resource::ServicePlan(_)
            | Resource::ServiceBinding(_)
            | Resource::Visibility(_) => None,
        }
    }

    pub fn id(&self) -> &ResourceId {
        match self {
            CascadeResource::Tenant(t) => &t.id,
            CascadeResource::Platform(p) => &p.id,
            CascadeResource::ServiceBroker(b) => &b.id,
            CascadeResource::ServiceInstance(i) => &i.id,
        }
    }

    /// Builds the selectors for this resource's children.
    pub fn child_selectors(&self, ctx: &ResolverContext) -> Result<ChildSelectors> {
        let mut selectors = ChildSelectors::new();
        match self {
            CascadeResource::Tenant(tenant) => {
                let by_label = Query::all().with(Criterion::label_eq(
                    ctx.tenant_label_key.as_str(),
                    tenant.id.as_str(),
                ));
                for kind in [
                    ResourceType::Platform,
                    ResourceType::ServiceBroker,
                    ResourceType::ServiceInstance,
                ] {
                    selectors.insert(kind, vec![by_label.clone()]);
                }
            }
            CascadeResource::Platform(platform) => {
                selectors.insert(
                    ResourceType::ServiceInstance,
                    vec![Query::all().with(Criterion::field_eq(
                        fields::PLATFORM_ID,
                        platform.id.as_str(),
                    ))],
                );
            }
            CascadeResource::ServiceBroker(broker) => {
                let plans = broker
                    .plan_ids()
                    .ok_or_else(|| ResolveError::CatalogNotLoaded(broker.id.clone()))?;
                selectors.insert(
                    ResourceType::ServiceInstance,
                    vec![Query::all().with(Criterion::field_in(
                        fields::SERVICE_PLAN_ID,
                        plans.iter().map(ResourceId::as_str),
                    ))],
                );
            }
            CascadeResource::ServiceInstance(instance) => {
                selectors.insert(
                    ResourceType::ServiceBinding,
                    vec![Query::all().with(Criterion::field_eq(
                        fields::SERVICE_INSTANCE_ID,
                        instance.id.as_str(),
                    ))],
                );
                if let Some(key) = &ctx.container_label_key {
                    selectors.insert(
                        ResourceType::ServiceInstance,
                        vec![
                            Query::all()
                                .with(Criterion::label_eq(key.as_str(), instance.id.as_str()))
                                .with(Criterion::field_ne(fields::ID, instance.id.as_str())),
                        ],
                    );
                }
            }
        }
        Ok(selectors)
    }
}

/// Runs `resource`'s child selectors without any post-processing.
pub async fn children_of<R: Repository>(
    repo: &R,
    resource: &CascadeResource,
    ctx: &ResolverContext,
) -> Result<Children> {
    let mut children = Children::new();
    for (kind, queries) in resource.child_selectors(ctx)? {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for query in &queries {
            for child in repo.list_resources(kind, query).await? {
                if seen.insert(child.id().clone()) {
                    found.push(child);
                }
            }
        }
        children.insert(kind, found);
    }
    Ok(children)
}

/// Resolves the children a cascade creates operations for.
///
/// Brokers are enriched with their catalog first. For tenants, instances that
/// will also be reached through one of the tenant's platforms or brokers are
/// dropped from the direct instance list.
pub async fn resolve_children<R: Repository>(
    repo: &R,
    resource: &Resource,
    ctx: &ResolverContext,
) -> Result<Children> {
    let Some(mut parent) = CascadeResource::from_resource(resource.clone()) else {
        return Ok(Children::new());
    };
    if let CascadeResource::ServiceBroker(broker) = &mut parent
        && broker.services.is_none()
    {
        enrich_broker(repo, broker).await?;
    }

    let mut children = children_of(repo, &parent, ctx).await?;
    if matches!(parent, CascadeResource::Tenant(_)) {
        suppress_tenant_duplicates(repo, &mut children).await?;
    }

    trace!(
        resource_type = %resource.resource_type(),
        resource_id = %resource.id(),
        children = children.values().map(Vec::len).sum::<usize>(),
        "Resolved cascade children"
    );
    Ok(children)
}

/// Removes directly selected instances whose plan belongs to a selected
/// broker or whose platform is a selected platform.
async fn suppress_tenant_duplicates<R: Repository>(
    repo: &R,
    children: &mut Children,
) -> Result<()> {
    let platforms: HashSet<ResourceId> = children
        .get(&ResourceType::Platform)
        .into_iter()
        .flatten()
        .map(|p| p.id().clone())
        .collect();

    let mut plans = HashSet::new();
    for resource in children.get_mut(&ResourceType::ServiceBroker).into_iter().flatten() {
        if let Resource::ServiceBroker(broker) = resource {
            if broker.services.is_none() {
                enrich_broker(repo, broker).await?;
            }
            plans.extend(broker.plan_ids().unwrap_or_default());
        }
    }

    if let Some(instances) = children.get_mut(&ResourceType::ServiceInstance) {
        instances.retain(|resource| match resource {
            Resource::ServiceInstance(i) => {
                !plans.contains(&i.service_plan_id)
                    && !i.platform_id.as_ref().is_some_and(|p| platforms.contains(p))
            }
            _ => true,
        });
    }
    Ok(())
}
