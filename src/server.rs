//! MCP server initialization.
//!
//! Wires the store, embedding client, and host adapter into a running stdio
//! server, after the start-of-service maintenance passes: consolidation,
//! the session overflow guard, and (when the embedding service is healthy)
//! vector backfill.

use crate::config::LilyConfig;
use crate::db::Store;
use crate::hooks::HostAdapter;
use crate::memory::{consolidate, session};
use crate::tools::LilyTools;
use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;

/// Cap on vectors written by one start-of-service backfill.
const BACKFILL_LIMIT: usize = 100;

/// Open the store and build the shared host adapter, running the
/// start-of-service maintenance passes.
pub async fn setup_shared_state(config: LilyConfig) -> Result<Arc<HostAdapter>> {
    let store = Store::open(&config.db_path)?;
    tracing::info!(db = %store.path().display(), "store ready");

    if config.consolidation {
        let mut conn = store.lock()?;
        consolidate::consolidate(&mut conn)?;
    }

    match session::guard_sessions(
        &config.sessions_manifest_path(),
        config.session_overflow_threshold,
        config.context_token_cap,
    ) {
        Ok(report) if !report.flagged.is_empty() => {
            tracing::warn!(flagged = report.flagged.len(), "oversized sessions quarantined");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "session overflow guard failed"),
    }

    let config = Arc::new(config);
    let adapter = Arc::new(HostAdapter::new(Arc::clone(&store), Arc::clone(&config))?);

    if config.vector_search {
        let health = adapter.embedding().health().await;
        if health.available {
            adapter.embedding().backfill(&store, BACKFILL_LIMIT).await?;
        } else {
            tracing::warn!(
                reason = health.reason.as_deref().unwrap_or("unknown"),
                "embedding service unavailable — recall degrades to keyword search"
            );
        }
    }

    Ok(adapter)
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: LilyConfig) -> Result<()> {
    tracing::info!("starting Lily MCP server on stdio");

    let adapter = setup_shared_state(config).await?;
    let tools = LilyTools::new(adapter);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running — waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    crate::db::close_all();
    Ok(())
}
