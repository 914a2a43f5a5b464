//! Pipeline domain types and row loaders.

use crate::graph::{self, Condition, EdgeDef, StepNode, StepStatus, StepType};
use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown pipeline status: {s}")),
        }
    }
}

/// A `pipelines` table row.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRow {
    pub id: String,
    pub name: String,
    pub status: PipelineStatus,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_by: String,
    pub trigger_message: Option<String>,
    pub summary: Option<String>,
    pub error: Option<String>,
}

/// A `pipeline_steps` table row.
#[derive(Debug, Clone, Serialize)]
pub struct StepRow {
    pub id: String,
    pub pipeline_id: String,
    pub name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub tier: Option<String>,
    pub executor: Option<String>,
    pub prompt: Option<String>,
    pub depends_on_all: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
}

/// A `pipeline_edges` table row with its parsed condition.
#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub parent_step_id: String,
    pub child_step_id: String,
    pub condition: Condition,
}

/// A `pipeline_triggers` table row.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerRow {
    pub id: String,
    pub pipeline_id: String,
    pub schedule: String,
    pub timezone: String,
    pub enabled: bool,
    pub last_fired: Option<String>,
    pub next_fire: Option<String>,
}

// ── Creation input ────────────────────────────────────────────────────────────

/// A dependency reference inside a step spec: either a bare parent name
/// (unconditional) or a conditional `{step, when}` object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    Name(String),
    Conditional {
        step: String,
        when: serde_json::Value,
    },
}

/// One step of a pipeline creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(default = "default_step_type")]
    pub step_type: String,
    pub tier: Option<String>,
    pub executor: Option<String>,
    pub prompt: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
    /// 1 (default) = AND-join, 0 = OR-join.
    pub depends_on_all: Option<bool>,
    #[serde(default)]
    pub max_retries: u32,
    pub input: Option<String>,
}

fn default_step_type() -> String {
    "task".to_string()
}

/// A pipeline creation request.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub steps: Vec<StepSpec>,
    pub trigger_message: Option<String>,
    pub config: Option<serde_json::Value>,
}

// ── Row loaders ───────────────────────────────────────────────────────────────

pub fn load_pipeline(conn: &Connection, id: &str) -> Result<Option<PipelineRow>> {
    use rusqlite::OptionalExtension;
    let row = conn
        .query_row(
            "SELECT id, name, status, created_at, updated_at, started_at, completed_at, \
                    created_by, trigger_message, summary, error \
             FROM pipelines WHERE id = ?1",
            [id],
            map_pipeline,
        )
        .optional()?;
    Ok(row)
}

pub fn load_pipelines_by_status(conn: &Connection, statuses: &[&str]) -> Result<Vec<PipelineRow>> {
    let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, name, status, created_at, updated_at, started_at, completed_at, \
                created_by, trigger_message, summary, error \
         FROM pipelines WHERE status IN ({}) ORDER BY created_at",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        statuses.iter().map(|s| s as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(params.as_slice(), map_pipeline)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn map_pipeline(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRow> {
    let status: String = row.get(2)?;
    Ok(PipelineRow {
        id: row.get(0)?,
        name: row.get(1)?,
        status: status.parse().unwrap_or(PipelineStatus::Pending),
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        created_by: row.get(7)?,
        trigger_message: row.get(8)?,
        summary: row.get(9)?,
        error: row.get(10)?,
    })
}

pub fn load_steps(conn: &Connection, pipeline_id: &str) -> Result<Vec<StepRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, pipeline_id, name, step_type, status, tier, executor, prompt, \
                depends_on_all, retry_count, max_retries, started_at, input, output, \
                result_summary, error \
         FROM pipeline_steps WHERE pipeline_id = ?1 ORDER BY created_at, id",
    )?;
    let rows = stmt
        .query_map([pipeline_id], map_step)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_step(conn: &Connection, step_id: &str) -> Result<Option<StepRow>> {
    use rusqlite::OptionalExtension;
    let row = conn
        .query_row(
            "SELECT id, pipeline_id, name, step_type, status, tier, executor, prompt, \
                    depends_on_all, retry_count, max_retries, started_at, input, output, \
                    result_summary, error \
             FROM pipeline_steps WHERE id = ?1",
            [step_id],
            map_step,
        )
        .optional()?;
    Ok(row)
}

fn map_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<StepRow> {
    let step_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(StepRow {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        name: row.get(2)?,
        step_type: step_type.parse().unwrap_or(StepType::Task),
        status: status.parse().unwrap_or(StepStatus::Pending),
        tier: row.get(5)?,
        executor: row.get(6)?,
        prompt: row.get(7)?,
        depends_on_all: row.get::<_, i64>(8)? != 0,
        retry_count: row.get::<_, i64>(9)? as u32,
        max_retries: row.get::<_, i64>(10)? as u32,
        started_at: row.get(11)?,
        input: row.get(12)?,
        output: row.get(13)?,
        result_summary: row.get(14)?,
        error: row.get(15)?,
    })
}

pub fn load_edges(conn: &Connection, pipeline_id: &str) -> Result<Vec<EdgeRow>> {
    let mut stmt = conn.prepare(
        "SELECT parent_step_id, child_step_id, condition \
         FROM pipeline_edges WHERE pipeline_id = ?1",
    )?;
    let rows = stmt
        .query_map([pipeline_id], |row| {
            let condition_text: Option<String> = row.get(2)?;
            let payload = condition_text.and_then(|t| serde_json::from_str(&t).ok());
            Ok(EdgeRow {
                parent_step_id: row.get(0)?,
                child_step_id: row.get(1)?,
                condition: Condition::parse(payload.as_ref()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Build the in-memory DAG for a pipeline from its persisted rows.
pub fn load_graph(conn: &Connection, pipeline_id: &str) -> Result<graph::Dag> {
    let steps = load_steps(conn, pipeline_id)?;
    let edges = load_edges(conn, pipeline_id)?;

    let nodes: Vec<StepNode> = steps
        .into_iter()
        .map(|s| StepNode {
            id: s.id,
            name: s.name,
            step_type: s.step_type,
            status: s.status,
            depends_on_all: s.depends_on_all,
            output: s.output,
        })
        .collect();
    let edge_defs: Vec<EdgeDef> = edges
        .into_iter()
        .map(|e| EdgeDef {
            parent: e.parent_step_id,
            child: e.child_step_id,
            condition: e.condition,
        })
        .collect();

    Ok(graph::build(nodes, &edge_defs))
}

pub fn load_triggers(conn: &Connection, enabled_only: bool) -> Result<Vec<TriggerRow>> {
    let sql = if enabled_only {
        "SELECT id, pipeline_id, schedule, timezone, enabled, last_fired, next_fire \
         FROM pipeline_triggers WHERE enabled = 1"
    } else {
        "SELECT id, pipeline_id, schedule, timezone, enabled, last_fired, next_fire \
         FROM pipeline_triggers"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TriggerRow {
                id: row.get(0)?,
                pipeline_id: row.get(1)?,
                schedule: row.get(2)?,
                timezone: row.get(3)?,
                enabled: row.get::<_, i64>(4)? != 0,
                last_fired: row.get(5)?,
                next_fire: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
