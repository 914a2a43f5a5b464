//! Pipeline tool parameter definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `pipeline_create` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PipelineCreateParams {
    /// Pipeline definition: `{name, steps: [{name, step_type?, tier?,
    /// executor?, prompt?, depends_on?, depends_on_all?, max_retries?}]}`.
    /// `depends_on` entries are parent names or `{step, when}` objects.
    #[schemars(
        description = "Pipeline definition: {name, steps: [{name, step_type?, tier?, executor?, prompt?, depends_on?, depends_on_all?, max_retries?}]}. depends_on entries are parent step names or {step, when} objects with when = {output_contains} or {output_match}."
    )]
    pub pipeline: serde_json::Value,
}

/// Parameters for the `pipeline_start` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PipelineStartParams {
    /// Pipeline id to start.
    #[schemars(description = "Pipeline id to start")]
    pub pipeline_id: String,
}

/// Parameters for the `pipeline_status` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PipelineStatusParams {
    /// Pipeline id; omit for all non-terminal pipelines.
    #[schemars(description = "Pipeline id; omit for all non-terminal pipelines")]
    pub pipeline_id: Option<String>,
}

/// Parameters for the `pipeline_advance` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PipelineAdvanceParams {
    /// Step id to advance.
    #[schemars(description = "Step id to advance")]
    pub step_id: String,

    /// Whether the step succeeded (default true).
    #[schemars(description = "Whether the step succeeded (default true)")]
    pub success: Option<bool>,

    /// Step output artifact.
    #[schemars(description = "Step output artifact")]
    pub output: Option<String>,

    /// Error message when the step failed.
    #[schemars(description = "Error message when the step failed")]
    pub error: Option<String>,
}

/// Parameters for the `pipeline_cancel` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PipelineCancelParams {
    /// Pipeline id to cancel.
    #[schemars(description = "Pipeline id to cancel")]
    pub pipeline_id: String,
}

/// Parameters for the `pipeline_schedule` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PipelineScheduleParams {
    /// Pipeline id to schedule.
    #[schemars(description = "Pipeline id to schedule")]
    pub pipeline_id: String,

    /// 5-field cron expression, e.g. '0 5 * * *'.
    #[schemars(description = "5-field cron expression, e.g. '0 5 * * *'")]
    pub schedule: String,

    /// IANA timezone (default UTC).
    #[schemars(description = "IANA timezone (default UTC)")]
    pub timezone: Option<String>,
}

/// Parameters for the `pipeline_tick` tool (none).
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PipelineTickParams {}
