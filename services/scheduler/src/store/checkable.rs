//! Checkables and the resource types they depend on.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lookout_id::{PipelineId, ResourceId, ResourceTypeId};
use lookout_model::{CheckEvery, CheckableKind, CheckableRef, ResourceTypeConfig, Version};
use thiserror::Error;

use super::StoreError;

/// A pipeline resource or custom resource type that can be checked for new
/// versions.
#[async_trait]
pub trait Checkable: Send + Sync + fmt::Debug {
    /// Typed identifier, unique per kind.
    fn id(&self) -> CheckableRef;

    fn kind(&self) -> CheckableKind {
        self.id().kind()
    }

    /// Name, unique within the pipeline.
    fn name(&self) -> &str;

    /// Base type, or the name of a custom resource type in the same pipeline.
    fn type_name(&self) -> &str;

    fn pipeline_id(&self) -> PipelineId;

    fn pipeline_name(&self) -> &str;

    fn check_every(&self) -> &CheckEvery;

    fn has_webhook(&self) -> bool;

    /// When the last check finished. The Unix epoch if never checked.
    fn last_check_end_time(&self) -> DateTime<Utc>;

    fn current_pinned_version(&self) -> Option<Version>;

    /// Opaque configuration handed to the check.
    fn source(&self) -> &serde_json::Value;

    /// Record why scheduling a check failed, or clear it with `None`.
    async fn set_check_setup_error(&self, error: Option<String>) -> Result<(), StoreError>;
}

// =============================================================================
// Stored checkables
// =============================================================================

/// Snapshot of a checkable as loaded from a store.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckableRecord {
    pub id: CheckableRef,
    pub name: String,
    pub type_name: String,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub check_every: CheckEvery,
    pub has_webhook: bool,
    pub last_check_end_time: DateTime<Utc>,
    pub pinned_version: Option<Version>,
    pub source: serde_json::Value,
    /// Latest version of a resource type's own image.
    pub version: Option<Version>,
}

impl CheckableRecord {
    /// A never-checked resource.
    pub fn resource(
        pipeline_id: PipelineId,
        pipeline_name: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self::new(
            CheckableRef::Resource(ResourceId::new()),
            pipeline_id,
            pipeline_name.into(),
            name.into(),
            type_name.into(),
        )
    }

    /// A never-checked custom resource type.
    pub fn resource_type(
        pipeline_id: PipelineId,
        pipeline_name: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self::new(
            CheckableRef::ResourceType(ResourceTypeId::new()),
            pipeline_id,
            pipeline_name.into(),
            name.into(),
            type_name.into(),
        )
    }

    fn new(
        id: CheckableRef,
        pipeline_id: PipelineId,
        pipeline_name: String,
        name: String,
        type_name: String,
    ) -> Self {
        Self {
            id,
            name,
            type_name,
            pipeline_id,
            pipeline_name,
            check_every: CheckEvery::unset(),
            has_webhook: false,
            last_check_end_time: DateTime::<Utc>::UNIX_EPOCH,
            pinned_version: None,
            source: serde_json::Value::Object(Default::default()),
            version: None,
        }
    }

    pub fn with_check_every(mut self, check_every: impl Into<CheckEvery>) -> Self {
        self.check_every = check_every.into();
        self
    }

    pub fn with_webhook(mut self) -> Self {
        self.has_webhook = true;
        self
    }

    pub fn with_last_check_end_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_check_end_time = at;
        self
    }

    pub fn with_pinned_version(mut self, version: Version) -> Self {
        self.pinned_version = Some(version);
        self
    }

    pub fn with_source(mut self, source: serde_json::Value) -> Self {
        self.source = source;
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }
}

/// Where a [`StoredCheckable`] writes its setup error.
#[async_trait]
pub(crate) trait SetupErrorWriter: Send + Sync {
    async fn write_setup_error(
        &self,
        checkable: CheckableRef,
        error: Option<String>,
    ) -> Result<(), StoreError>;
}

/// A [`CheckableRecord`] bound to the store it was loaded from.
pub struct StoredCheckable {
    record: CheckableRecord,
    writer: Arc<dyn SetupErrorWriter>,
}

impl StoredCheckable {
    pub(crate) fn new(record: CheckableRecord, writer: Arc<dyn SetupErrorWriter>) -> Self {
        Self { record, writer }
    }

    pub fn record(&self) -> &CheckableRecord {
        &self.record
    }
}

impl fmt::Debug for StoredCheckable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCheckable")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Checkable for StoredCheckable {
    fn id(&self) -> CheckableRef {
        self.record.id
    }

    fn name(&self) -> &str {
        &self.record.name
    }

    fn type_name(&self) -> &str {
        &self.record.type_name
    }

    fn pipeline_id(&self) -> PipelineId {
        self.record.pipeline_id
    }

    fn pipeline_name(&self) -> &str {
        &self.record.pipeline_name
    }

    fn check_every(&self) -> &CheckEvery {
        &self.record.check_every
    }

    fn has_webhook(&self) -> bool {
        self.record.has_webhook
    }

    fn last_check_end_time(&self) -> DateTime<Utc> {
        self.record.last_check_end_time
    }

    fn current_pinned_version(&self) -> Option<Version> {
        self.record.pinned_version.clone()
    }

    fn source(&self) -> &serde_json::Value {
        &self.record.source
    }

    async fn set_check_setup_error(&self, error: Option<String>) -> Result<(), StoreError> {
        self.writer.write_setup_error(self.record.id, error).await
    }
}

// =============================================================================
// Resource types
// =============================================================================

/// A custom resource type and the latest version of its image.
#[derive(Debug, Clone)]
pub struct ResourceType {
    pub checkable: Arc<dyn Checkable>,
    pub version: Option<Version>,
}

impl ResourceType {
    fn config(&self) -> ResourceTypeConfig {
        ResourceTypeConfig {
            name: self.checkable.name().to_string(),
            type_name: self.checkable.type_name().to_string(),
            source: self.checkable.source().clone(),
            check_every: self.checkable.check_every().clone(),
            version: self.version.clone(),
        }
    }
}

/// The parent chain of a checkable loops back on itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("resource type cycle: {}", path.join(" -> "))]
pub struct CycleError {
    /// Names along the chain, starting at the checkable and ending at the
    /// repeated type.
    pub path: Vec<String>,
}

/// All custom resource types visible to one scan pass.
#[derive(Debug, Clone, Default)]
pub struct ResourceTypeSet {
    types: Vec<ResourceType>,
}

impl ResourceTypeSet {
    pub fn new(types: Vec<ResourceType>) -> Self {
        Self { types }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceType> {
        self.types.iter()
    }

    /// The type in the same pipeline named after `checkable`'s type, never
    /// `checkable` itself.
    pub fn parent(&self, checkable: &dyn Checkable) -> Option<&ResourceType> {
        let id = checkable.id();
        let pipeline_id = checkable.pipeline_id();
        let type_name = checkable.type_name();

        self.types.iter().find(|t| {
            t.checkable.pipeline_id() == pipeline_id
                && t.checkable.name() == type_name
                && t.checkable.id() != id
        })
    }

    /// Parent chain of `checkable`, nearest first.
    pub fn ancestry(&self, checkable: &dyn Checkable) -> Result<Vec<&ResourceType>, CycleError> {
        let mut seen = HashSet::from([checkable.id()]);
        let mut path = vec![checkable.name().to_string()];
        let mut chain = Vec::new();

        let mut current = self.parent(checkable);
        while let Some(parent) = current {
            path.push(parent.checkable.name().to_string());
            if !seen.insert(parent.checkable.id()) {
                return Err(CycleError { path });
            }
            chain.push(parent);
            current = self.parent(parent.checkable.as_ref());
        }

        Ok(chain)
    }

    /// Snapshot of the parent chain for a check plan.
    pub fn filter(&self, checkable: &dyn Checkable) -> Result<Vec<ResourceTypeConfig>, CycleError> {
        Ok(self
            .ancestry(checkable)?
            .into_iter()
            .map(ResourceType::config)
            .collect())
    }
}
