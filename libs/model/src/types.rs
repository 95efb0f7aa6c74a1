//! Status enums, versions, and check interval configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use lookout_id::{ResourceId, ResourceTypeId};
use serde::{Deserialize, Serialize};

use crate::ModelError;

// =============================================================================
// Checkables
// =============================================================================

/// Which kind of entity a checkable is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckableKind {
    Resource,
    ResourceType,
}

impl CheckableKind {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::ResourceType => "resource_type",
        }
    }
}

impl fmt::Display for CheckableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckableKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource" => Ok(Self::Resource),
            "resource_type" => Ok(Self::ResourceType),
            other => Err(ModelError::UnknownCheckableKind(other.to_string())),
        }
    }
}

/// Typed reference to a checkable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CheckableRef {
    Resource(ResourceId),
    ResourceType(ResourceTypeId),
}

impl CheckableRef {
    /// Returns the kind of the referenced checkable.
    pub fn kind(&self) -> CheckableKind {
        match self {
            Self::Resource(_) => CheckableKind::Resource,
            Self::ResourceType(_) => CheckableKind::ResourceType,
        }
    }

    /// Parses a reference from its stored `(kind, id)` pair.
    pub fn from_parts(kind: &str, id: &str) -> Result<Self, ModelError> {
        match kind.parse::<CheckableKind>()? {
            CheckableKind::Resource => Ok(Self::Resource(id.parse()?)),
            CheckableKind::ResourceType => Ok(Self::ResourceType(id.parse()?)),
        }
    }
}

impl fmt::Display for CheckableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(id) => write!(f, "{id}"),
            Self::ResourceType(id) => write!(f, "{id}"),
        }
    }
}

// =============================================================================
// Checks
// =============================================================================

/// Lifecycle state of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Created,
    Started,
    Succeeded,
    Errored,
}

impl CheckState {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Errored => "errored",
        }
    }

    /// Returns true once the check can no longer run.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Errored)
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "errored" => Ok(Self::Errored),
            other => Err(ModelError::UnknownCheckState(other.to_string())),
        }
    }
}

/// A version of a resource, as reported by its check implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub BTreeMap<String, String>);

impl Version {
    /// Builds a version from key/value pairs.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// =============================================================================
// Check interval
// =============================================================================

/// Raw `check_every` value as configured on a checkable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckEvery(Option<String>);

/// Interpreted `check_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInterval {
    /// Not configured; the scheduler default applies.
    Default,
    /// The checkable is never checked periodically.
    Never,
    /// Explicit interval.
    Every(Duration),
}

impl CheckEvery {
    /// Value that disables periodic checking.
    pub const NEVER: &'static str = "never";

    /// Unset `check_every`.
    pub fn unset() -> Self {
        Self(None)
    }

    /// Wraps a configured value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(Some(value.into()))
    }

    /// The raw configured value, if any.
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Interprets the configured value.
    pub fn interval(&self) -> Result<CheckInterval, ModelError> {
        let Some(raw) = self.0.as_deref().map(str::trim) else {
            return Ok(CheckInterval::Default);
        };

        if raw.is_empty() {
            return Ok(CheckInterval::Default);
        }

        if raw == Self::NEVER {
            return Ok(CheckInterval::Never);
        }

        let duration = humantime::parse_duration(raw).map_err(|e| ModelError::InvalidCheckEvery {
            value: raw.to_string(),
            reason: e.to_string(),
        })?;

        if duration.is_zero() {
            return Err(ModelError::InvalidCheckEvery {
                value: raw.to_string(),
                reason: "interval must be greater than zero".to_string(),
            });
        }

        Ok(CheckInterval::Every(duration))
    }
}

impl From<Option<String>> for CheckEvery {
    fn from(value: Option<String>) -> Self {
        Self(value)
    }
}

impl From<&str> for CheckEvery {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
