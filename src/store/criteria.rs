//! Selection criteria over stored records.
//!
//! A [`Query`] is a conjunction of [`Criterion`] values plus optional
//! ordering and limit. Criteria compare a named field or a label against one
//! or more string values; records expose their fields through [`Queryable`].
//! Absent optional fields compare as the empty string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Labels, Operation, OperationId, Resource, ResourceId, ResourceType};

/// Field names understood by [`Queryable::field`].
pub mod fields {
    pub const ID: &str = "id";
    pub const NAME: &str = "name";
    pub const CASCADE_ROOT_ID: &str = "cascade_root_id";
    pub const PARENT_ID: &str = "parent_id";
    pub const RESOURCE_ID: &str = "resource_id";
    pub const RESOURCE_TYPE: &str = "resource_type";
    pub const TYPE: &str = "type";
    pub const STATE: &str = "state";
    pub const READY: &str = "ready";
    pub const EXTERNAL_ID: &str = "external_id";
    pub const PRIMARY_ID: &str = "primary_id";
    pub const DELETION_SCHEDULED: &str = "deletion_scheduled";
    pub const PLATFORM_ID: &str = "platform_id";
    pub const SERVICE_PLAN_ID: &str = "service_plan_id";
    pub const SERVICE_INSTANCE_ID: &str = "service_instance_id";
    pub const SERVICE_OFFERING_ID: &str = "service_offering_id";
    pub const BROKER_ID: &str = "broker_id";
}

/// What a criterion compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    Field,
    Label,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
}

/// A single predicate over a field or a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub kind: CriterionKind,
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Criterion {
    fn new(
        kind: CriterionKind,
        key: impl Into<String>,
        operator: Operator,
        values: Vec<String>,
    ) -> Self {
        Criterion {
            kind,
            key: key.into(),
            operator,
            values,
        }
    }

    pub fn field_eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(CriterionKind::Field, key, Operator::Equals, vec![value.into()])
    }

    pub fn field_ne(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(CriterionKind::Field, key, Operator::NotEquals, vec![value.into()])
    }

    pub fn field_in<I, V>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::new(
            CriterionKind::Field,
            key,
            Operator::In,
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn field_not_in<I, V>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::new(
            CriterionKind::Field,
            key,
            Operator::NotIn,
            values.into_iter().map(Into::into).collect(),
        )
    }

    pub fn label_eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(CriterionKind::Label, key, Operator::Equals, vec![value.into()])
    }

    pub fn label_in<I, V>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::new(
            CriterionKind::Label,
            key,
            Operator::In,
            values.into_iter().map(Into::into).collect(),
        )
    }

    /// Evaluates the criterion against a record.
    pub fn matches<T: Queryable + ?Sized>(&self, item: &T) -> bool {
        match self.kind {
            CriterionKind::Field => {
                let actual = item.field(&self.key).unwrap_or_default();
                let hit = self.values.iter().any(|v| *v == actual);
                match self.operator {
                    Operator::Equals | Operator::In => hit,
                    Operator::NotEquals | Operator::NotIn => !hit,
                }
            }
            CriterionKind::Label => {
                let empty = Labels::new();
                let labels = item.labels().unwrap_or(&empty);
                let hit = self.values.iter().any(|v| labels.contains(&self.key, v));
                match self.operator {
                    Operator::Equals | Operator::In => hit,
                    Operator::NotEquals | Operator::NotIn => !hit,
                }
            }
        }
    }
}

/// Timestamp columns a query can order by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderField {
    CreatedAt,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}

/// A conjunction of criteria with optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub criteria: Vec<Criterion>,
    pub order: Option<(OrderField, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    /// A query matching every record.
    pub fn all() -> Self {
        Query::default()
    }

    pub fn with(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn order_by(mut self, field: OrderField, direction: Direction) -> Self {
        self.order = Some((field, direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// All operations of the tree rooted at `root`.
    pub fn tree(root: OperationId) -> Self {
        Query::all().with(Criterion::field_eq(
            fields::CASCADE_ROOT_ID,
            root.to_string(),
        ))
    }

    /// All operations targeting the given resource, oldest first.
    pub fn for_resource(resource_type: ResourceType, resource_id: &ResourceId) -> Self {
        Query::all()
            .with(Criterion::field_eq(fields::RESOURCE_TYPE, resource_type.as_str()))
            .with(Criterion::field_eq(fields::RESOURCE_ID, resource_id.as_str()))
            .order_by(OrderField::CreatedAt, Direction::Asc)
    }

    pub fn matches<T: Queryable + ?Sized>(&self, item: &T) -> bool {
        self.criteria.iter().all(|c| c.matches(item))
    }

    /// Filters, orders and truncates `items` according to this query.
    ///
    /// Ordering is stable, so records with equal timestamps keep their
    /// input order.
    pub fn apply<T: Queryable>(&self, items: impl IntoIterator<Item = T>) -> Vec<T> {
        let mut selected: Vec<T> = items.into_iter().filter(|item| self.matches(item)).collect();
        if let Some((field, direction)) = self.order {
            selected.sort_by(|a, b| {
                let ordering = a.timestamp(field).cmp(&b.timestamp(field));
                match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// A record that criteria can be evaluated against.
pub trait Queryable {
    /// Returns the string form of a field, or `None` if the record has no
    /// such field or the field is unset.
    fn field(&self, name: &str) -> Option<String>;

    fn labels(&self) -> Option<&Labels>;

    fn timestamp(&self, field: OrderField) -> Option<DateTime<Utc>>;
}

impl Queryable for Operation {
    fn field(&self, name: &str) -> Option<String> {
        match name {
            fields::ID => Some(self.id.to_string()),
            fields::CASCADE_ROOT_ID => self.cascade_root_id.map(|id| id.to_string()),
            fields::PARENT_ID => self.parent_id.map(|id| id.to_string()),
            fields::RESOURCE_ID => Some(self.resource_id.to_string()),
            fields::RESOURCE_TYPE => Some(self.resource_type.as_str().to_string()),
            fields::TYPE => Some(self.op_type.as_str().to_string()),
            fields::STATE => Some(self.state.as_str().to_string()),
            fields::READY => Some(self.ready.to_string()),
            fields::EXTERNAL_ID => self.external_id.clone(),
            fields::PRIMARY_ID => self.primary_id.map(|id| id.to_string()),
            fields::DELETION_SCHEDULED => self.deletion_scheduled.map(|t| t.to_rfc3339()),
            _ => None,
        }
    }

    fn labels(&self) -> Option<&Labels> {
        Some(&self.labels)
    }

    fn timestamp(&self, field: OrderField) -> Option<DateTime<Utc>> {
        match field {
            OrderField::CreatedAt => Some(self.created_at),
            OrderField::UpdatedAt => Some(self.updated_at),
        }
    }
}

impl Queryable for Resource {
    fn field(&self, name: &str) -> Option<String> {
        match (self, name) {
            (_, fields::ID) => Some(self.id().to_string()),
            (_, fields::RESOURCE_TYPE) => Some(self.resource_type().as_str().to_string()),
            (Resource::Platform(p), fields::NAME) => Some(p.name.clone()),
            (Resource::ServiceBroker(b), fields::NAME) => Some(b.name.clone()),
            (Resource::ServiceOffering(o), fields::NAME) => Some(o.name.clone()),
            (Resource::ServiceOffering(o), fields::BROKER_ID) => Some(o.broker_id.to_string()),
            (Resource::ServicePlan(p), fields::NAME) => Some(p.name.clone()),
            (Resource::ServicePlan(p), fields::SERVICE_OFFERING_ID) => {
                Some(p.service_offering_id.to_string())
            }
            (Resource::ServiceInstance(i), fields::NAME) => Some(i.name.clone()),
            (Resource::ServiceInstance(i), fields::SERVICE_PLAN_ID) => {
                Some(i.service_plan_id.to_string())
            }
            (Resource::ServiceInstance(i), fields::PLATFORM_ID) => {
                i.platform_id.as_ref().map(ToString::to_string)
            }
            (Resource::ServiceBinding(b), fields::NAME) => Some(b.name.clone()),
            (Resource::ServiceBinding(b), fields::SERVICE_INSTANCE_ID) => {
                Some(b.service_instance_id.to_string())
            }
            (Resource::Visibility(v), fields::SERVICE_PLAN_ID) => {
                Some(v.service_plan_id.to_string())
            }
            (Resource::Visibility(v), fields::PLATFORM_ID) => {
                v.platform_id.as_ref().map(ToString::to_string)
            }
            _ => None,
        }
    }

    fn labels(&self) -> Option<&Labels> {
        Resource::labels(self)
    }

    fn timestamp(&self, _field: OrderField) -> Option<DateTime<Utc>> {
        None
    }
}
