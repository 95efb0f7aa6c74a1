use crate::define_id;

// =============================================================================
// Pipeline configuration
// =============================================================================

define_id!(PipelineId, "pipe", "pipeline");
define_id!(ResourceId, "res", "resource");
define_id!(ResourceTypeId, "rtype", "resource type");

// =============================================================================
// Scheduled work
// =============================================================================

define_id!(CheckId, "chk", "check");
