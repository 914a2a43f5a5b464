//! Background scheduler tick.
//!
//! Runs as its own process (`lily tick`, invoked by the platform's cron
//! facility once per minute) and shares nothing with the host adapter but
//! the store. One tick: fire due triggers, sweep skippable steps, persist
//! completed pipelines, dispatch ready steps to their executors, and fail
//! anything stuck in `running` past the deadline.

pub mod cron;
pub mod executor;

use crate::config::LilyConfig;
use crate::db::Store;
use crate::graph::{self, StepStatus};
use crate::pipeline::engine::{self, StepOutcome};
use crate::pipeline::types::*;
use anyhow::Result;
use chrono::{DateTime, Utc};
use cron::CronExpr;
use executor::{ExecutorClient, Route};
use rusqlite::Connection;
use std::collections::HashMap;

/// Steps running longer than this are failed by the stuck detector.
const STUCK_AFTER_MINUTES: i64 = 30;
const STUCK_ERROR: &str = "Step timed out (running > 30 minutes)";

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub fired: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub stuck_failed: usize,
}

/// A step pulled out for dispatch while the lock was held.
struct Dispatchable {
    step_id: String,
    step_name: String,
    route: Route,
    prompt: String,
}

/// Run one scheduler tick.
pub async fn run_tick(store: &Store, config: &LilyConfig) -> Result<TickSummary> {
    let mut summary = TickSummary::default();
    let now = Utc::now();

    {
        let mut conn = store.lock()?;
        summary.fired = fire_triggers(&mut conn, now)?;
    }

    // Sweep, finalize, and collect dispatchable work under one lock; the
    // HTTP calls happen after it is released.
    let client = ExecutorClient::new(&config.ollama_url, &config.local_model);
    let work = {
        let mut conn = store.lock()?;
        collect_work(&mut conn, &client, &mut summary)?
    };

    for item in work {
        let result = client.dispatch(&item.route, &item.prompt).await;
        let mut conn = store.lock()?;

        // Cooperative cancellation: a result for a step that is no longer
        // running is simply ignored.
        match load_step(&conn, &item.step_id)? {
            Some(step) if step.status == StepStatus::Running => {}
            _ => {
                tracing::info!(step = %item.step_name, "dropping result for non-running step");
                continue;
            }
        }

        let outcome = StepOutcome {
            success: result.success,
            output: result.output,
            error: result.error,
        };
        match engine::advance(&mut conn, &item.step_id, &outcome) {
            Ok(out) => {
                summary.dispatched += 1;
                if out.finished {
                    summary.completed += 1;
                }
            }
            Err(e) => tracing::warn!(step = %item.step_name, error = %e, "advance failed"),
        }
    }

    {
        let mut conn = store.lock()?;
        summary.stuck_failed = fail_stuck_steps(&mut conn, now)?;
    }

    tracing::info!(
        fired = summary.fired,
        dispatched = summary.dispatched,
        completed = summary.completed,
        stuck = summary.stuck_failed,
        "scheduler tick finished"
    );
    Ok(summary)
}

// ── Trigger firing ────────────────────────────────────────────────────────────

/// Fire every enabled trigger whose cron expression matches `now` in its
/// own timezone. Firing clones the source pipeline under fresh ids into a
/// new running instance; a second match within the same minute is
/// suppressed via `last_fired`.
pub fn fire_triggers(conn: &mut Connection, now: DateTime<Utc>) -> Result<usize> {
    let mut fired = 0;

    for trigger in load_triggers(conn, true)? {
        let expr = match CronExpr::parse(&trigger.schedule) {
            Ok(expr) => expr,
            Err(e) => {
                tracing::warn!(trigger = %trigger.id, error = %e, "unparseable trigger schedule");
                continue;
            }
        };
        let tz: chrono_tz::Tz = trigger.timezone.parse().unwrap_or(chrono_tz::UTC);
        if !expr.matches(now, tz) {
            continue;
        }

        let minute_key = now.with_timezone(&tz).format("%Y-%m-%dT%H:%M").to_string();
        if trigger.last_fired.as_deref() == Some(minute_key.as_str()) {
            continue; // already fired this minute
        }

        let Some(source) = load_pipeline(conn, &trigger.pipeline_id)? else {
            tracing::warn!(trigger = %trigger.id, "trigger points at a missing pipeline");
            continue;
        };

        // A live instance of the same pipeline means this firing is skipped
        let live: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pipelines \
             WHERE name = ?1 AND id != ?2 AND status IN ('pending','running','paused')",
            rusqlite::params![source.name, source.id],
            |row| row.get(0),
        )?;
        if live > 0 {
            tracing::info!(pipeline = %source.name, "skipping trigger: instance still live");
            continue;
        }

        let tx = conn.transaction()?;
        let instance_id = clone_pipeline(&tx, &source, &trigger)?;
        let next_fire = expr.next_fire(now, tz).map(|t| t.to_rfc3339());
        tx.execute(
            "UPDATE pipeline_triggers SET last_fired = ?1, next_fire = ?2 WHERE id = ?3",
            rusqlite::params![minute_key, next_fire, trigger.id],
        )?;
        tx.commit()?;

        tracing::info!(pipeline = %source.name, instance = %instance_id, "trigger fired");
        fired += 1;
    }
    Ok(fired)
}

/// Clone a source pipeline's steps and edges under fresh ids into a new
/// instance marked running.
fn clone_pipeline(conn: &Connection, source: &PipelineRow, trigger: &TriggerRow) -> Result<String> {
    let now = chrono::Utc::now().to_rfc3339();
    let instance_id = uuid::Uuid::now_v7().to_string();

    conn.execute(
        "INSERT INTO pipelines (id, name, status, created_at, updated_at, started_at, created_by, trigger_message) \
         VALUES (?1, ?2, 'running', ?3, ?3, ?3, 'scheduler', ?4)",
        rusqlite::params![
            instance_id,
            source.name,
            now,
            format!("cron: {}", trigger.schedule),
        ],
    )?;

    let steps = load_steps(conn, &source.id)?;
    let mut id_map: HashMap<String, String> = HashMap::new();
    for step in &steps {
        id_map.insert(step.id.clone(), uuid::Uuid::now_v7().to_string());
    }
    for step in &steps {
        conn.execute(
            "INSERT INTO pipeline_steps \
             (id, pipeline_id, name, step_type, status, tier, executor, prompt, depends_on_all, \
              retry_count, max_retries, created_at, input) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, 0, ?9, ?10, ?11)",
            rusqlite::params![
                id_map[&step.id],
                instance_id,
                step.name,
                step.step_type.as_str(),
                step.tier,
                step.executor,
                step.prompt,
                step.depends_on_all as i64,
                step.max_retries,
                now,
                step.input,
            ],
        )?;
    }

    let mut stmt = conn.prepare(
        "SELECT parent_step_id, child_step_id, condition FROM pipeline_edges WHERE pipeline_id = ?1",
    )?;
    let edges: Vec<(String, String, Option<String>)> = stmt
        .query_map([&source.id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (parent, child, condition) in edges {
        let (Some(new_parent), Some(new_child)) = (id_map.get(&parent), id_map.get(&child)) else {
            continue;
        };
        conn.execute(
            "INSERT INTO pipeline_edges (pipeline_id, parent_step_id, child_step_id, condition) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![instance_id, new_parent, new_child, condition],
        )?;
    }

    Ok(instance_id)
}

// ── Sweep + dispatch collection ───────────────────────────────────────────────

/// For every running pipeline: mark skippable steps, persist terminal
/// pipelines, and mark-and-collect ready steps for dispatch. Each
/// pipeline's sweep runs in its own transaction so a reader never sees
/// skipped steps without the matching pipeline status.
fn collect_work(
    conn: &mut Connection,
    client: &ExecutorClient,
    summary: &mut TickSummary,
) -> Result<Vec<Dispatchable>> {
    let mut work = Vec::new();
    let now = chrono::Utc::now().to_rfc3339();

    for pipeline in load_pipelines_by_status(conn, &["running"])? {
        let tx = conn.transaction()?;

        // Skip sweep
        let dag = load_graph(&tx, &pipeline.id)?;
        let skips = graph::skip_set(&dag);
        for id in &skips {
            tx.execute(
                "UPDATE pipeline_steps SET status = 'skipped', completed_at = ?1 WHERE id = ?2",
                rusqlite::params![now, dag.step(*id).id],
            )?;
        }

        // Completion check (reload when the sweep changed anything)
        if engine::finalize_if_terminal(&tx, &pipeline.id)? {
            summary.completed += 1;
            tx.commit()?;
            continue;
        }

        let steps = load_steps(&tx, &pipeline.id)?;
        let by_id: HashMap<&str, &StepRow> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let dag = load_graph(&tx, &pipeline.id)?;

        for ready in graph::ready_set(&dag) {
            let node = dag.step(ready);
            let Some(step) = by_id.get(node.id.as_str()) else {
                continue;
            };
            let marked = tx.execute(
                "UPDATE pipeline_steps SET status = 'running', started_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                rusqlite::params![now, step.id],
            )?;
            if marked == 0 {
                continue;
            }

            let parent_context = engine::parent_context(&dag, ready, &by_id);
            let prompt = executor::render_prompt(step.prompt.as_deref(), &parent_context);
            let route = executor::route(
                step.tier.as_deref(),
                step.executor.as_deref(),
                client.default_local_model(),
            );
            work.push(Dispatchable {
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                route,
                prompt,
            });
        }
        tx.commit()?;
    }
    Ok(work)
}

// ── Stuck detection ───────────────────────────────────────────────────────────

/// Fail any step running past the deadline. The failure feeds the normal
/// retry path.
pub fn fail_stuck_steps(conn: &mut Connection, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = (now - chrono::Duration::minutes(STUCK_AFTER_MINUTES)).to_rfc3339();
    let stuck: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM pipeline_steps \
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?1",
        )?;
        let collected = stmt
            .query_map([&cutoff], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };

    let mut failed = 0;
    for step_id in stuck {
        let outcome = StepOutcome {
            success: false,
            output: None,
            error: Some(STUCK_ERROR.to_string()),
        };
        match engine::advance(conn, &step_id, &outcome) {
            Ok(_) => {
                tracing::warn!(step = %step_id, "stuck step failed by watchdog");
                failed += 1;
            }
            Err(e) => tracing::warn!(step = %step_id, error = %e, "stuck advance failed"),
        }
    }
    Ok(failed)
}
