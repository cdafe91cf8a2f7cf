//! Structured failure records carried by operations.
//!
//! Each record names the resource whose deletion failed and the resource
//! directly above it in the cascade tree, so a caller reading the root's
//! errors can reconstruct where every failure happened.

use serde::{Deserialize, Serialize};

use super::ids::ResourceId;
use super::resource::ResourceType;

/// Default cap on the number of records one operation keeps.
pub const DEFAULT_MAX_ERROR_RECORDS: usize = 50;

/// One failed deletion somewhere in a cascade tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Resource of the parent operation. `None` when the failing operation
    /// is the root of its tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ResourceId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<ResourceType>,

    pub resource_id: ResourceId,

    pub resource_type: ResourceType,

    pub message: String,
}

impl FailureRecord {
    pub fn new(
        resource_type: ResourceType,
        resource_id: ResourceId,
        message: impl Into<String>,
    ) -> Self {
        FailureRecord {
            parent_id: None,
            parent_type: None,
            resource_id,
            resource_type,
            message: message.into(),
        }
    }

    pub fn with_parent(mut self, parent_type: ResourceType, parent_id: ResourceId) -> Self {
        self.parent_type = Some(parent_type);
        self.parent_id = Some(parent_id);
        self
    }
}

/// The ordered, deduplicated list of failure records of one operation.
///
/// Serialized as a plain JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationErrors(Vec<FailureRecord>);

impl OperationErrors {
    pub fn new() -> Self {
        OperationErrors(Vec::new())
    }

    pub fn single(record: FailureRecord) -> Self {
        OperationErrors(vec![record])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailureRecord> {
        self.0.iter()
    }

    pub fn first(&self) -> Option<&FailureRecord> {
        self.0.first()
    }

    /// Appends `record` unless an identical one is already present or the
    /// list already holds `cap` records. Returns true if it was added.
    pub fn push_capped(&mut self, record: FailureRecord, cap: usize) -> bool {
        if self.0.len() >= cap || self.0.contains(&record) {
            return false;
        }
        self.0.push(record);
        true
    }

    /// Merges every record of `other` into `self`, preserving order and the
    /// cap. Existing records are never replaced.
    pub fn merge_capped(&mut self, other: &OperationErrors, cap: usize) {
        for record in &other.0 {
            if self.0.len() >= cap {
                break;
            }
            self.push_capped(record.clone(), cap);
        }
    }
}

impl FromIterator<FailureRecord> for OperationErrors {
    fn from_iter<I: IntoIterator<Item = FailureRecord>>(iter: I) -> Self {
        let mut errors = OperationErrors::new();
        for record in iter {
            errors.push_capped(record, usize::MAX);
        }
        errors
    }
}
