//! Check plans handed to the execution engine.

use std::time::Duration;

use lookout_id::PipelineId;
use serde::{Deserialize, Serialize};

use crate::{CheckEvery, CheckableRef, Version};

/// Snapshot of one custom resource type a checkable depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub source: serde_json::Value,
    #[serde(default)]
    pub check_every: CheckEvery,
    /// Latest known version of the type's image, if it has been checked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

/// Time limit for one check when none is configured.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

fn default_check_timeout() -> Duration {
    DEFAULT_CHECK_TIMEOUT
}

/// Everything the execution engine needs to run one check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPlan {
    pub checkable: CheckableRef,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub pipeline_id: PipelineId,
    #[serde(default)]
    pub source: serde_json::Value,
    /// Version the check starts from; set when the checkable is pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_version: Option<Version>,
    /// Parent types, nearest first.
    #[serde(default)]
    pub resource_types: Vec<ResourceTypeConfig>,
    /// How long the check may run before it is abandoned.
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_id::ResourceId;

    #[test]
    fn test_plan_json_shape() {
        let pipeline_id = PipelineId::new();
        let resource_id = ResourceId::new();
        let plan = CheckPlan {
            checkable: CheckableRef::Resource(resource_id),
            name: "repo".to_string(),
            type_name: "git-fork".to_string(),
            pipeline_id,
            source: serde_json::json!({"uri": "https://example.com/repo.git"}),
            from_version: None,
            resource_types: vec![ResourceTypeConfig {
                name: "git-fork".to_string(),
                type_name: "registry-image".to_string(),
                source: serde_json::json!({"repository": "example/git-fork"}),
                check_every: CheckEvery::unset(),
                version: None,
            }],
            timeout: Duration::from_secs(600),
        };

        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["checkable"]["kind"], "resource");
        assert_eq!(json["checkable"]["id"], resource_id.to_string());
        assert_eq!(json["type"], "git-fork");
        assert_eq!(json["resource_types"][0]["type"], "registry-image");
        assert!(json.get("from_version").is_none());
        assert!(json["resource_types"][0]["check_every"].is_null());
        assert_eq!(json["timeout"], "10m");
    }

    #[test]
    fn test_plan_keeps_pinned_version() {
        let plan = CheckPlan {
            checkable: CheckableRef::Resource(ResourceId::new()),
            name: "repo".to_string(),
            type_name: "git".to_string(),
            pipeline_id: PipelineId::new(),
            source: serde_json::Value::Null,
            from_version: Some(Version::from_pairs([("ref", "v1")])),
            resource_types: Vec::new(),
            timeout: DEFAULT_CHECK_TIMEOUT,
        };

        let json = serde_json::to_string(&plan).unwrap();
        let parsed: CheckPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.from_version, plan.from_version);
        assert_eq!(parsed.timeout, DEFAULT_CHECK_TIMEOUT);
    }

    #[test]
    fn test_plan_without_timeout_gets_default() {
        let json = serde_json::json!({
            "checkable": {"kind": "resource", "id": ResourceId::new().to_string()},
            "name": "repo",
            "type": "git",
            "pipeline_id": PipelineId::new().to_string(),
        });

        let plan: CheckPlan = serde_json::from_value(json).unwrap();
        assert_eq!(plan.timeout, DEFAULT_CHECK_TIMEOUT);
        assert!(plan.resource_types.is_empty());
    }
}
