//! MCP tool surface.
//!
//! Exposes the memory and pipeline tools over the `rmcp` router. Results
//! are rendered as markdown and hard-capped at 4,000 chars; failures come
//! back as human-readable error strings, never panics.

pub mod memory;
pub mod pipeline;

use memory::*;
use pipeline::*;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::tool::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use std::future::Future;
use std::sync::Arc;

use crate::hooks::HostAdapter;
use crate::memory::capture::{self, NewFact};
use crate::memory::types::TtlClass;
use crate::pipeline::engine::{self, StatusReport, StepOutcome};
use crate::pipeline::types::PipelineSpec;
use crate::security;

/// Hard cap on any tool result.
const MAX_TOOL_RESULT: usize = 4_000;
const TRUNCATION_SUFFIX: &str = " …(truncated)";

/// Stored values through `memory_store` are capped here.
const MAX_STORED_VALUE: usize = 200;

/// Clip a rendered result to the tool cap.
fn clip(text: String) -> String {
    if text.chars().count() <= MAX_TOOL_RESULT {
        text
    } else {
        let keep = MAX_TOOL_RESULT - TRUNCATION_SUFFIX.chars().count();
        let cut: String = text.chars().take(keep).collect();
        format!("{cut}{TRUNCATION_SUFFIX}")
    }
}

/// The Lily MCP tool handler. Holds the shared host adapter (store,
/// embedding client, entity registry) and exposes all tools via the
/// `#[tool_router]` macro.
#[derive(Clone)]
pub struct LilyTools {
    tool_router: ToolRouter<Self>,
    adapter: Arc<HostAdapter>,
}

#[tool_router]
impl LilyTools {
    pub fn new(adapter: Arc<HostAdapter>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            adapter,
        }
    }

    /// Full-text search over stored facts.
    #[tool(description = "Search stored memories by keyword. Returns matching facts ranked by relevance.")]
    async fn memory_search(
        &self,
        Parameters(params): Parameters<MemorySearchParams>,
    ) -> Result<String, String> {
        let limit = params.limit.unwrap_or(10).min(100);
        tracing::info!(query = %params.query, limit, "memory_search called");

        let hits = {
            let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
            let keywords = crate::memory::recall::derive_keywords(&params.query);
            crate::memory::recall::fts_query(&conn, &keywords, limit)
        };

        if hits.is_empty() {
            return Ok("No matching memories.".into());
        }
        let mut out = format!("{} matching memories:\n", hits.len());
        for hit in hits {
            out.push_str(&format!("- {} `{}`\n", hit.description, hit.id));
        }
        Ok(clip(out))
    }

    /// Store a fact explicitly.
    #[tool(description = "Store a fact as entity/key/value. TTL classes: permanent, stable, active, session. Status-like keys always land in session.")]
    async fn memory_store(
        &self,
        Parameters(params): Parameters<MemoryStoreParams>,
    ) -> Result<String, String> {
        if params.entity.trim().is_empty() || params.key.trim().is_empty() {
            return Err("entity and key must not be empty".into());
        }
        let requested: TtlClass = params
            .ttl
            .as_deref()
            .unwrap_or("active")
            .parse()
            .map_err(|e: String| e)?;
        let ttl = capture::derive_ttl(&params.key, requested);
        let importance = params.importance.unwrap_or(0.7);
        if !(0.0..=1.0).contains(&importance) {
            return Err("importance must be between 0.0 and 1.0".into());
        }
        let value: String = params.value.chars().take(MAX_STORED_VALUE).collect();

        tracing::info!(entity = %params.entity, key = %params.key, ttl = %ttl, "memory_store called");

        let adapter = Arc::clone(&self.adapter);
        let entity = params.entity.clone();
        let key = params.key.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = adapter
                .store()
                .lock()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            capture::upsert_fact(
                &conn,
                NewFact {
                    entity: &entity,
                    key: &key,
                    value: &value,
                    ttl,
                    importance,
                    session_id: None,
                    tags: None,
                },
            )
        })
        .await
        .map_err(|e| format!("store task failed: {e}"))?
        .map_err(|e| format!("store failed: {e}"))?;

        // Vector enrichment for new rows
        if self.adapter.config().vector_search && !result.updated {
            let description = format!("{}.{}: {}", params.entity, params.key, params.value);
            self.adapter
                .embedding()
                .store_vector(self.adapter.store(), &result.id, &description)
                .await;
        }

        let verb = if result.updated { "Updated" } else { "Stored" };
        Ok(format!(
            "{verb} {}.{} ({}) `{}`",
            params.entity,
            params.key,
            ttl.as_str(),
            result.id
        ))
    }

    /// List facts for one entity.
    #[tool(description = "List all live facts recorded for an entity.")]
    async fn memory_entity(
        &self,
        Parameters(params): Parameters<MemoryEntityParams>,
    ) -> Result<String, String> {
        let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT fact_key, fact_value, ttl_class, importance FROM decisions \
                 WHERE entity = ?1 AND (expires_at IS NULL OR expires_at > ?2) \
                 ORDER BY importance DESC",
            )
            .map_err(|e| e.to_string())?;
        let rows: Vec<(Option<String>, Option<String>, String, f64)> = stmt
            .query_map(
                rusqlite::params![params.entity.to_lowercase(), chrono::Utc::now().to_rfc3339()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;

        if rows.is_empty() {
            return Ok(format!("No facts recorded for '{}'.", params.entity));
        }
        let mut out = format!("Facts for {}:\n", params.entity);
        for (key, value, ttl, importance) in rows {
            out.push_str(&format!(
                "- {}: {} ({ttl}, importance {importance:.2})\n",
                key.unwrap_or_default(),
                value.unwrap_or_default(),
            ));
        }
        Ok(clip(out))
    }

    /// Semantic search over stored vectors.
    #[tool(description = "Search memories by meaning using embeddings. Returns the closest stored facts with similarity scores.")]
    async fn memory_semantic_search(
        &self,
        Parameters(params): Parameters<SemanticSearchParams>,
    ) -> Result<String, String> {
        let limit = params.limit.unwrap_or(5).min(50);
        let threshold = params.threshold.unwrap_or(0.5);
        tracing::info!(query = %params.query, limit, threshold, "memory_semantic_search called");

        let hits = self
            .adapter
            .embedding()
            .search(self.adapter.store(), &params.query, limit, threshold)
            .await;
        if hits.is_empty() {
            return Ok("No semantic matches (or the embedding service is unavailable).".into());
        }
        let mut out = format!("{} semantic matches:\n", hits.len());
        for hit in hits {
            out.push_str(&format!(
                "- ({:.2}) {} `{}`\n",
                hit.similarity, hit.content, hit.decision_id
            ));
        }
        Ok(clip(out))
    }

    /// Allow-list a new entity.
    #[tool(description = "Add an entity to the allow-list so facts about it can be captured.")]
    async fn memory_add_entity(
        &self,
        Parameters(params): Parameters<AddEntityParams>,
    ) -> Result<String, String> {
        if params.name.trim().is_empty() {
            return Err("entity name must not be empty".into());
        }
        let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let mut entities = self
            .adapter
            .entities()
            .lock()
            .map_err(|_| "entity registry poisoned".to_string())?;
        entities
            .add(&conn, &params.name, "tool")
            .map_err(|e| format!("add failed: {e}"))?;
        Ok(format!("Entity '{}' allow-listed.", params.name))
    }

    /// Recent security events.
    #[tool(description = "Show recent security events: blocked captures, injection patterns, protected-entity hits.")]
    async fn memory_security_log(
        &self,
        Parameters(params): Parameters<SecurityLogParams>,
    ) -> Result<String, String> {
        let limit = params.limit.unwrap_or(20).min(100);
        let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let events = security::recent_events(&conn, limit).map_err(|e| e.to_string())?;
        if events.is_empty() {
            return Ok("No security events recorded.".into());
        }
        let mut out = format!("{} security events (newest first):\n", events.len());
        for event in events {
            out.push_str(&format!(
                "- {} {} entity={} pattern={} — {}\n",
                event.ts,
                event.event_type,
                event.entity.unwrap_or_default(),
                event.pattern.unwrap_or_else(|| "-".into()),
                event.snippet.unwrap_or_default(),
            ));
        }
        Ok(clip(out))
    }

    /// Create a pipeline from a JSON definition.
    #[tool(description = "Create a workflow pipeline (a DAG of steps). Validates the graph and returns the pipeline id.")]
    async fn pipeline_create(
        &self,
        Parameters(params): Parameters<PipelineCreateParams>,
    ) -> Result<String, String> {
        let spec: PipelineSpec = serde_json::from_value(params.pipeline)
            .map_err(|e| format!("invalid pipeline definition: {e}"))?;

        let adapter = Arc::clone(&self.adapter);
        let id = tokio::task::spawn_blocking(move || {
            let mut conn = adapter
                .store()
                .lock()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            engine::create(&mut conn, &spec, "user")
        })
        .await
        .map_err(|e| format!("create task failed: {e}"))?
        .map_err(|e| e.to_string())?;

        Ok(format!("Pipeline created: `{id}`. Start it with pipeline_start."))
    }

    /// Start a pending pipeline.
    #[tool(description = "Start a pending pipeline.")]
    async fn pipeline_start(
        &self,
        Parameters(params): Parameters<PipelineStartParams>,
    ) -> Result<String, String> {
        let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        engine::start(&conn, &params.pipeline_id).map_err(|e| e.to_string())?;
        Ok(format!("Pipeline `{}` is running.", params.pipeline_id))
    }

    /// Pipeline status.
    #[tool(description = "Show one pipeline in detail (steps, ready set) or all non-terminal pipelines.")]
    async fn pipeline_status(
        &self,
        Parameters(params): Parameters<PipelineStatusParams>,
    ) -> Result<String, String> {
        let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let report =
            engine::status(&conn, params.pipeline_id.as_deref()).map_err(|e| e.to_string())?;
        Ok(clip(render_status(&report)))
    }

    /// Report a step result.
    #[tool(description = "Report a step result: success with output, or failure with an error. Advances the pipeline graph.")]
    async fn pipeline_advance(
        &self,
        Parameters(params): Parameters<PipelineAdvanceParams>,
    ) -> Result<String, String> {
        let outcome = StepOutcome {
            success: params.success.unwrap_or(true),
            output: params.output,
            error: params.error,
        };
        let mut conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let result = engine::advance(&mut conn, &params.step_id, &outcome)
            .map_err(|e| e.to_string())?;

        let mut out = format!(
            "Step is {}. Pipeline is {}.",
            result.step_status.as_str(),
            result.pipeline_status.as_str()
        );
        if !result.ready.is_empty() {
            out.push_str(&format!(" Ready next: {}.", result.ready.join(", ")));
        }
        if !result.skipped.is_empty() {
            out.push_str(&format!(" Skipped: {}.", result.skipped.join(", ")));
        }
        Ok(out)
    }

    /// Cancel a pipeline.
    #[tool(description = "Cancel a non-terminal pipeline, its live steps, and its triggers.")]
    async fn pipeline_cancel(
        &self,
        Parameters(params): Parameters<PipelineCancelParams>,
    ) -> Result<String, String> {
        let mut conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let cancelled =
            engine::cancel(&mut conn, &params.pipeline_id).map_err(|e| e.to_string())?;
        Ok(format!(
            "Pipeline `{}` cancelled ({cancelled} steps).",
            params.pipeline_id
        ))
    }

    /// Attach a cron trigger.
    #[tool(description = "Schedule a pipeline on a 5-field cron expression in an IANA timezone.")]
    async fn pipeline_schedule(
        &self,
        Parameters(params): Parameters<PipelineScheduleParams>,
    ) -> Result<String, String> {
        let timezone = params.timezone.as_deref().unwrap_or("UTC");
        let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let trigger_id =
            engine::schedule(&conn, &params.pipeline_id, &params.schedule, timezone)
                .map_err(|e| e.to_string())?;
        Ok(format!(
            "Trigger `{trigger_id}` attached: '{}' ({timezone}).",
            params.schedule
        ))
    }

    /// Enumerate dispatchable work.
    #[tool(description = "List ready steps across running pipelines with the context each would be dispatched with.")]
    async fn pipeline_tick(
        &self,
        Parameters(_params): Parameters<PipelineTickParams>,
    ) -> Result<String, String> {
        let conn = self.adapter.store().lock().map_err(|e| e.to_string())?;
        let report = engine::tick_work(&conn).map_err(|e| e.to_string())?;

        if report.work.is_empty() && report.paused.is_empty() {
            return Ok("No ready or paused steps.".into());
        }
        let mut out = String::new();
        if !report.work.is_empty() {
            out.push_str(&format!("{} ready steps:\n", report.work.len()));
            for item in &report.work {
                out.push_str(&format!(
                    "- {} / {} ({}) tier={} executor={} `{}`\n",
                    item.pipeline_name,
                    item.step_name,
                    item.step_type,
                    item.tier.as_deref().unwrap_or("-"),
                    item.executor.as_deref().unwrap_or("-"),
                    item.step_id,
                ));
            }
        }
        if !report.paused.is_empty() {
            out.push_str("Paused (awaiting input):\n");
            for (pipeline, step) in &report.paused {
                out.push_str(&format!("- {pipeline} / {step}\n"));
            }
        }
        Ok(clip(out))
    }
}

fn render_status(report: &StatusReport) -> String {
    match report {
        StatusReport::Single(detail) => {
            let mut out = format!(
                "**{}** `{}` — {} (created by {})\n",
                detail.pipeline.name,
                detail.pipeline.id,
                detail.pipeline.status.as_str(),
                detail.pipeline.created_by,
            );
            out.push_str(&format!("Graph state: {}\n\nSteps:\n", detail.completion));
            for step in &detail.steps {
                out.push_str(&format!(
                    "- {} [{}] {}{} `{}`\n",
                    step.name,
                    step.status.as_str(),
                    step.step_type.as_str(),
                    step.error
                        .as_deref()
                        .map(|e| format!(" — {e}"))
                        .unwrap_or_default(),
                    step.id,
                ));
            }
            if !detail.ready.is_empty() {
                out.push_str(&format!("\nReady: {}\n", detail.ready.join(", ")));
            }
            out
        }
        StatusReport::All(summaries) => {
            if summaries.is_empty() {
                return "No active pipelines.".into();
            }
            let mut out = format!("{} active pipelines:\n", summaries.len());
            for summary in summaries {
                let mut counts: Vec<String> = summary
                    .steps_by_status
                    .iter()
                    .map(|(status, count)| format!("{count} {status}"))
                    .collect();
                counts.sort();
                out.push_str(&format!(
                    "- **{}** `{}` — {} ({} steps: {})\n",
                    summary.pipeline.name,
                    summary.pipeline.id,
                    summary.pipeline.status.as_str(),
                    summary.total_steps,
                    counts.join(", "),
                ));
            }
            out
        }
    }
}

#[tool_handler]
impl ServerHandler for LilyTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Lily is a memory and workflow companion. Use memory_store/memory_search to \
                 manage facts, memory_semantic_search for meaning-based recall, and the \
                 pipeline_* tools to build, run, and schedule step DAGs."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_respects_the_hard_cap() {
        assert_eq!(clip("short".into()), "short");
        let long = "x".repeat(10_000);
        let clipped = clip(long);
        assert_eq!(clipped.chars().count(), MAX_TOOL_RESULT);
        assert!(clipped.ends_with(TRUNCATION_SUFFIX));
    }
}
