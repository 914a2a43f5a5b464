//! Pipeline engine — create, start, status, advance, cancel, schedule, tick.
//!
//! Contract failures (bad cron, duplicate step name, unknown dependency,
//! cycle, oversize pipeline) surface synchronously with no writes. Every
//! multi-row mutation — creation, the advance completion cascade,
//! cancellation — runs inside one transaction so a concurrent reader never
//! sees a partially written pipeline.

use crate::graph::{self, StepStatus, StepType};
use crate::pipeline::types::*;
use crate::scheduler::cron::CronExpr;
use anyhow::{bail, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;

/// Step outputs are persisted up to this many chars.
const MAX_OUTPUT_LEN: usize = 65_536;
const OUTPUT_TRUNCATION_MARK: &str = "…[truncated]";

/// Per-parent context shown to a dispatched child.
const PARENT_CONTEXT_LEN: usize = 500;

/// Result reported back for an executed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// What an advance did to the graph.
#[derive(Debug, Serialize)]
pub struct AdvanceOutcome {
    pub step_status: StepStatus,
    /// Names of steps now eligible for dispatch.
    pub ready: Vec<String>,
    /// Names of steps newly short-circuited as skipped.
    pub skipped: Vec<String>,
    pub pipeline_status: PipelineStatus,
    pub finished: bool,
}

// ── create ────────────────────────────────────────────────────────────────────

/// Validate a creation request, build and check its DAG, and insert the
/// pipeline with all steps and edges in one transaction. Returns the new
/// pipeline id.
pub fn create(conn: &mut Connection, spec: &PipelineSpec, created_by: &str) -> Result<String> {
    if spec.name.trim().is_empty() {
        bail!("pipeline name must not be empty");
    }
    if spec.steps.is_empty() {
        bail!("pipeline must have at least one step");
    }

    // Assign ids and index by name, rejecting duplicates
    let mut ids_by_name: HashMap<&str, String> = HashMap::new();
    for step in &spec.steps {
        if step.name.trim().is_empty() {
            bail!("step name must not be empty");
        }
        if ids_by_name
            .insert(step.name.as_str(), uuid::Uuid::now_v7().to_string())
            .is_some()
        {
            bail!("duplicate step name: {}", step.name);
        }
    }

    // Resolve depends_on references into edges
    struct PendingEdge {
        parent_id: String,
        child_id: String,
        condition_json: Option<String>,
        condition: graph::Condition,
    }
    let mut edges: Vec<PendingEdge> = Vec::new();
    for step in &spec.steps {
        let child_id = ids_by_name[step.name.as_str()].clone();
        for dep in &step.depends_on {
            let (parent_name, condition_json, condition) = match dep {
                DependsOn::Name(name) => (name.as_str(), None, graph::Condition::Unconditional),
                DependsOn::Conditional { step: parent, when } => (
                    parent.as_str(),
                    Some(when.to_string()),
                    graph::Condition::parse(Some(when)),
                ),
            };
            let Some(parent_id) = ids_by_name.get(parent_name) else {
                bail!("step '{}' depends on unknown step '{}'", step.name, parent_name);
            };
            edges.push(PendingEdge {
                parent_id: parent_id.clone(),
                child_id: child_id.clone(),
                condition_json,
                condition,
            });
        }
    }

    // Structural validation on the would-be graph
    let nodes: Vec<graph::StepNode> = spec
        .steps
        .iter()
        .map(|s| graph::StepNode {
            id: ids_by_name[s.name.as_str()].clone(),
            name: s.name.clone(),
            step_type: s.step_type.parse().unwrap_or(StepType::Task),
            status: StepStatus::Pending,
            depends_on_all: s.depends_on_all.unwrap_or(true),
            output: None,
        })
        .collect();
    let edge_defs: Vec<graph::EdgeDef> = edges
        .iter()
        .map(|e| graph::EdgeDef {
            parent: e.parent_id.clone(),
            child: e.child_id.clone(),
            condition: e.condition.clone(),
        })
        .collect();
    let dag = graph::build(nodes, &edge_defs);
    let validation = graph::validate(&dag, graph::DEFAULT_MAX_STEPS);
    if !validation.ok {
        bail!("invalid pipeline: {}", validation.errors.join("; "));
    }

    // Single transaction for pipeline + steps + edges
    let pipeline_id = uuid::Uuid::now_v7().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO pipelines (id, name, status, created_at, updated_at, created_by, trigger_message, config) \
         VALUES (?1, ?2, 'pending', ?3, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            pipeline_id,
            spec.name.trim(),
            now,
            created_by,
            spec.trigger_message,
            spec.config.as_ref().map(|c| c.to_string()),
        ],
    )?;
    for step in &spec.steps {
        let step_type: StepType = step.step_type.parse().unwrap_or(StepType::Task);
        tx.execute(
            "INSERT INTO pipeline_steps \
             (id, pipeline_id, name, step_type, status, tier, executor, prompt, depends_on_all, \
              retry_count, max_retries, created_at, input) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11)",
            rusqlite::params![
                ids_by_name[step.name.as_str()],
                pipeline_id,
                step.name,
                step_type.as_str(),
                step.tier,
                step.executor,
                step.prompt,
                step.depends_on_all.unwrap_or(true) as i64,
                step.max_retries,
                now,
                step.input,
            ],
        )?;
    }
    for edge in &edges {
        tx.execute(
            "INSERT INTO pipeline_edges (pipeline_id, parent_step_id, child_step_id, condition) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![pipeline_id, edge.parent_id, edge.child_id, edge.condition_json],
        )?;
    }
    tx.commit()?;

    tracing::info!(pipeline = %pipeline_id, name = %spec.name, steps = spec.steps.len(), "pipeline created");
    Ok(pipeline_id)
}

// ── start ─────────────────────────────────────────────────────────────────────

/// Transition pending → running.
pub fn start(conn: &Connection, id: &str) -> Result<()> {
    let Some(pipeline) = load_pipeline(conn, id)? else {
        bail!("pipeline not found: {id}");
    };
    if pipeline.status != PipelineStatus::Pending {
        bail!("pipeline {} is {}, not pending", id, pipeline.status.as_str());
    }
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE pipelines SET status = 'running', started_at = ?1, updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now, id],
    )?;
    Ok(())
}

// ── status ────────────────────────────────────────────────────────────────────

/// Detailed view of one pipeline.
#[derive(Debug, Serialize)]
pub struct PipelineDetail {
    pub pipeline: PipelineRow,
    pub steps: Vec<StepRow>,
    pub ready: Vec<String>,
    pub completion: String,
}

/// Aggregate view of one non-terminal pipeline.
#[derive(Debug, Serialize)]
pub struct PipelineSummary {
    pub pipeline: PipelineRow,
    pub total_steps: usize,
    pub steps_by_status: HashMap<String, usize>,
}

/// Either one pipeline in full or all non-terminal pipelines in aggregate.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum StatusReport {
    Single(Box<PipelineDetail>),
    All(Vec<PipelineSummary>),
}

pub fn status(conn: &Connection, id: Option<&str>) -> Result<StatusReport> {
    if let Some(id) = id {
        let Some(pipeline) = load_pipeline(conn, id)? else {
            bail!("pipeline not found: {id}");
        };
        let steps = load_steps(conn, id)?;
        let dag = load_graph(conn, id)?;
        let ready = graph::ready_set(&dag)
            .into_iter()
            .map(|s| dag.step(s).name.clone())
            .collect();
        let completion = match graph::completion(&dag) {
            graph::Completion::Running => "running",
            graph::Completion::Complete => "complete",
            graph::Completion::Failed => "failed",
        };
        return Ok(StatusReport::Single(Box::new(PipelineDetail {
            pipeline,
            steps,
            ready,
            completion: completion.to_string(),
        })));
    }

    let pipelines = load_pipelines_by_status(conn, &["pending", "running", "paused"])?;
    let mut summaries = Vec::with_capacity(pipelines.len());
    for pipeline in pipelines {
        let steps = load_steps(conn, &pipeline.id)?;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        for step in &steps {
            *by_status.entry(step.status.as_str().to_string()).or_insert(0) += 1;
        }
        summaries.push(PipelineSummary {
            total_steps: steps.len(),
            steps_by_status: by_status,
            pipeline,
        });
    }
    Ok(StatusReport::All(summaries))
}

// ── advance ───────────────────────────────────────────────────────────────────

/// Record a step result and cascade: retry-or-fail on failure, mark newly
/// skippable steps, and persist the pipeline status once every step is
/// terminal. The whole cascade is one transaction.
pub fn advance(conn: &mut Connection, step_id: &str, outcome: &StepOutcome) -> Result<AdvanceOutcome> {
    let tx = conn.transaction()?;

    let Some(step) = load_step(&tx, step_id)? else {
        bail!("step not found: {step_id}");
    };
    if step.status.is_terminal() {
        bail!("step {} is already {}", step.name, step.status.as_str());
    }

    let now = chrono::Utc::now().to_rfc3339();
    let output = outcome.output.as_deref().map(truncate_output);

    let step_status = if outcome.success {
        tx.execute(
            "UPDATE pipeline_steps SET status = 'complete', output = ?1, error = NULL, completed_at = ?2 \
             WHERE id = ?3",
            rusqlite::params![output, now, step_id],
        )?;
        StepStatus::Complete
    } else if step.retry_count < step.max_retries {
        tx.execute(
            "UPDATE pipeline_steps SET status = 'pending', retry_count = retry_count + 1, \
             error = ?1, started_at = NULL WHERE id = ?2",
            rusqlite::params![outcome.error, step_id],
        )?;
        StepStatus::Pending
    } else {
        tx.execute(
            "UPDATE pipeline_steps SET status = 'failed', error = ?1, output = ?2, completed_at = ?3 \
             WHERE id = ?4",
            rusqlite::params![outcome.error, output, now, step_id],
        )?;
        StepStatus::Failed
    };

    // Short-circuit steps that can no longer run
    let dag = load_graph(&tx, &step.pipeline_id)?;
    let mut skipped = Vec::new();
    for id in graph::skip_set(&dag) {
        let node = dag.step(id);
        tx.execute(
            "UPDATE pipeline_steps SET status = 'skipped', completed_at = ?1 WHERE id = ?2",
            rusqlite::params![now, node.id],
        )?;
        skipped.push(node.name.clone());
    }

    // Fresh view for ready set and completion
    let dag = load_graph(&tx, &step.pipeline_id)?;
    let ready: Vec<String> = graph::ready_set(&dag)
        .into_iter()
        .map(|s| dag.step(s).name.clone())
        .collect();

    let completion = graph::completion(&dag);
    let pipeline_status = match completion {
        graph::Completion::Running => PipelineStatus::Running,
        graph::Completion::Complete => PipelineStatus::Complete,
        graph::Completion::Failed => PipelineStatus::Failed,
    };
    let finished = completion != graph::Completion::Running;
    if finished {
        let failed_error: Option<String> = dag
            .steps()
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .map(|s| format!("step '{}' failed", s.name));
        let summary = summarize(&dag);
        tx.execute(
            "UPDATE pipelines SET status = ?1, completed_at = ?2, updated_at = ?2, summary = ?3, error = ?4 \
             WHERE id = ?5",
            rusqlite::params![
                pipeline_status.as_str(),
                now,
                summary,
                failed_error,
                step.pipeline_id
            ],
        )?;
    } else {
        tx.execute(
            "UPDATE pipelines SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![now, step.pipeline_id],
        )?;
    }

    tx.commit()?;

    tracing::debug!(
        step = %step.name,
        status = step_status.as_str(),
        ready = ready.len(),
        skipped = skipped.len(),
        "step advanced"
    );
    Ok(AdvanceOutcome {
        step_status,
        ready,
        skipped,
        pipeline_status,
        finished,
    })
}

fn truncate_output(output: &str) -> String {
    if output.chars().count() <= MAX_OUTPUT_LEN {
        output.to_string()
    } else {
        let cut: String = output.chars().take(MAX_OUTPUT_LEN).collect();
        format!("{cut}{OUTPUT_TRUNCATION_MARK}")
    }
}

fn summarize(dag: &graph::Dag) -> String {
    let mut complete = 0;
    let mut failed = 0;
    let mut skipped = 0;
    let mut cancelled = 0;
    for step in dag.steps() {
        match step.status {
            StepStatus::Complete => complete += 1,
            StepStatus::Failed => failed += 1,
            StepStatus::Skipped => skipped += 1,
            StepStatus::Cancelled => cancelled += 1,
            _ => {}
        }
    }
    format!("{complete} complete, {failed} failed, {skipped} skipped, {cancelled} cancelled")
}

/// Persist the pipeline status when every step is terminal. Used by the
/// scheduler's sweep, which reaches completion without an `advance` (e.g.
/// when the last live step was skipped). Returns whether the pipeline
/// finished.
pub fn finalize_if_terminal(conn: &Connection, pipeline_id: &str) -> Result<bool> {
    let dag = load_graph(conn, pipeline_id)?;
    let completion = graph::completion(&dag);
    if completion == graph::Completion::Running {
        return Ok(false);
    }
    let status = match completion {
        graph::Completion::Failed => PipelineStatus::Failed,
        _ => PipelineStatus::Complete,
    };
    let failed_error: Option<String> = dag
        .steps()
        .iter()
        .find(|s| s.status == StepStatus::Failed)
        .map(|s| format!("step '{}' failed", s.name));
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE pipelines SET status = ?1, completed_at = ?2, updated_at = ?2, summary = ?3, error = ?4 \
         WHERE id = ?5 AND status NOT IN ('complete','failed','cancelled')",
        rusqlite::params![status.as_str(), now, summarize(&dag), failed_error, pipeline_id],
    )?;
    Ok(true)
}

// ── cancel ────────────────────────────────────────────────────────────────────

/// Cancel a non-terminal pipeline: mark its live steps cancelled, the
/// pipeline cancelled, and disable its triggers. Returns the number of steps
/// cancelled.
pub fn cancel(conn: &mut Connection, id: &str) -> Result<usize> {
    let tx = conn.transaction()?;
    let Some(pipeline) = load_pipeline(&tx, id)? else {
        bail!("pipeline not found: {id}");
    };
    if pipeline.status.is_terminal() {
        bail!("pipeline {} is already {}", id, pipeline.status.as_str());
    }

    let now = chrono::Utc::now().to_rfc3339();
    let cancelled = tx.execute(
        "UPDATE pipeline_steps SET status = 'cancelled', completed_at = ?1 \
         WHERE pipeline_id = ?2 AND status IN ('pending','ready','running','paused')",
        rusqlite::params![now, id],
    )?;
    tx.execute(
        "UPDATE pipelines SET status = 'cancelled', completed_at = ?1, updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now, id],
    )?;
    tx.execute(
        "UPDATE pipeline_triggers SET enabled = 0 WHERE pipeline_id = ?1",
        [id],
    )?;
    tx.commit()?;

    tracing::info!(pipeline = %id, steps = cancelled, "pipeline cancelled");
    Ok(cancelled)
}

// ── schedule ──────────────────────────────────────────────────────────────────

/// Attach a cron trigger to a pipeline. The expression is parsed (and
/// rejected) here, once, at insertion.
pub fn schedule(conn: &Connection, pipeline_id: &str, schedule: &str, timezone: &str) -> Result<String> {
    if load_pipeline(conn, pipeline_id)?.is_none() {
        bail!("pipeline not found: {pipeline_id}");
    }
    let expr = CronExpr::parse(schedule)?;
    let tz: chrono_tz::Tz = timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown timezone: {timezone}"))?;

    let id = uuid::Uuid::now_v7().to_string();
    let next_fire = expr.next_fire(chrono::Utc::now(), tz).map(|t| t.to_rfc3339());
    conn.execute(
        "INSERT INTO pipeline_triggers (id, pipeline_id, schedule, timezone, enabled, next_fire, created_at) \
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
        rusqlite::params![
            id,
            pipeline_id,
            schedule.trim(),
            timezone,
            next_fire,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    Ok(id)
}

// ── tick (work enumeration) ───────────────────────────────────────────────────

/// One dispatchable unit of work.
#[derive(Debug, Serialize)]
pub struct WorkItem {
    pub pipeline_id: String,
    pub pipeline_name: String,
    pub step_id: String,
    pub step_name: String,
    pub step_type: String,
    pub tier: Option<String>,
    pub executor: Option<String>,
    pub prompt: Option<String>,
    /// Completed parents' summaries, 500 chars per parent.
    pub parent_context: String,
}

/// Work and paused-step listing for one synchronous tick.
#[derive(Debug, Serialize)]
pub struct TickReport {
    pub work: Vec<WorkItem>,
    /// (pipeline name, step name) pairs awaiting external input.
    pub paused: Vec<(String, String)>,
}

/// Enumerate ready steps across all running pipelines, with the context
/// block each would be dispatched with.
pub fn tick_work(conn: &Connection) -> Result<TickReport> {
    let mut report = TickReport {
        work: Vec::new(),
        paused: Vec::new(),
    };

    for pipeline in load_pipelines_by_status(conn, &["running"])? {
        let steps = load_steps(conn, &pipeline.id)?;
        let by_id: HashMap<&str, &StepRow> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let dag = load_graph(conn, &pipeline.id)?;

        for step in &steps {
            if step.status == StepStatus::Paused {
                report.paused.push((pipeline.name.clone(), step.name.clone()));
            }
        }

        for ready_id in graph::ready_set(&dag) {
            let node = dag.step(ready_id);
            let Some(step) = by_id.get(node.id.as_str()) else {
                continue;
            };
            let parent_context = parent_context(&dag, ready_id, &by_id);
            report.work.push(WorkItem {
                pipeline_id: pipeline.id.clone(),
                pipeline_name: pipeline.name.clone(),
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                step_type: step.step_type.as_str().to_string(),
                tier: step.tier.clone(),
                executor: step.executor.clone(),
                prompt: step.prompt.clone(),
                parent_context,
            });
        }
    }
    Ok(report)
}

/// Render completed parents as `[name]: summary` blocks.
pub fn parent_context(
    dag: &graph::Dag,
    step: graph::StepId,
    by_id: &HashMap<&str, &StepRow>,
) -> String {
    let mut blocks = Vec::new();
    for &parent in dag.parents(step) {
        let node = dag.step(parent);
        if node.status != StepStatus::Complete {
            continue;
        }
        let Some(row) = by_id.get(node.id.as_str()) else {
            continue;
        };
        let text = row
            .result_summary
            .as_deref()
            .or(row.output.as_deref())
            .unwrap_or("");
        let clipped: String = text.chars().take(PARENT_CONTEXT_LEN).collect();
        blocks.push(format!("[{}]: {}", node.name, clipped));
    }
    blocks.join("\n\n")
}
