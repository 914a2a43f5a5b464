//! Consolidation — collapse duplicate facts and sweep debris.
//!
//! Runs at service start (and via `lily consolidate`). Live rows sharing an
//! (entity, fact_key) pair are collapsed to the most recently accessed one,
//! whose importance is boosted; siblings and their vectors are deleted.
//! Expired rows and orphaned vectors are swept in the same pass.

use crate::memory::capture::{CONSOLIDATION_BOOST, IMPORTANCE_CAP};
use anyhow::Result;
use rusqlite::Connection;

/// What a consolidation pass removed.
#[derive(Debug, Default, serde::Serialize)]
pub struct ConsolidationReport {
    pub merged_groups: usize,
    pub removed_duplicates: usize,
    pub expired: usize,
    pub orphan_vectors: usize,
}

/// Run a full consolidation pass inside one transaction.
pub fn consolidate(conn: &mut Connection) -> Result<ConsolidationReport> {
    let tx = conn.transaction()?;
    let mut report = ConsolidationReport::default();
    let now = chrono::Utc::now().to_rfc3339();

    // 1. Expired rows are dead weight; remove them with their vectors.
    tx.execute(
        "DELETE FROM vectors WHERE decision_id IN \
         (SELECT id FROM decisions WHERE expires_at IS NOT NULL AND expires_at <= ?1)",
        [&now],
    )?;
    report.expired = tx.execute(
        "DELETE FROM decisions WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        [&now],
    )?;

    // 2. Collapse duplicate (entity, key) groups.
    let groups: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT entity, fact_key FROM decisions \
             WHERE entity IS NOT NULL AND fact_key IS NOT NULL \
             GROUP BY entity, fact_key HAVING COUNT(*) > 1",
        )?;
        let collected = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        collected
    };

    for (entity, key) in &groups {
        let keeper: String = tx.query_row(
            "SELECT id FROM decisions WHERE entity = ?1 AND fact_key = ?2 \
             ORDER BY COALESCE(last_accessed, ts) DESC LIMIT 1",
            rusqlite::params![entity, key],
            |row| row.get(0),
        )?;

        tx.execute(
            "UPDATE decisions SET importance = MIN(importance + ?1, ?2) WHERE id = ?3",
            rusqlite::params![CONSOLIDATION_BOOST, IMPORTANCE_CAP, keeper],
        )?;

        tx.execute(
            "DELETE FROM vectors WHERE decision_id IN \
             (SELECT id FROM decisions WHERE entity = ?1 AND fact_key = ?2 AND id != ?3)",
            rusqlite::params![entity, key, keeper],
        )?;
        report.removed_duplicates += tx.execute(
            "DELETE FROM decisions WHERE entity = ?1 AND fact_key = ?2 AND id != ?3",
            rusqlite::params![entity, key, keeper],
        )?;
        report.merged_groups += 1;
    }

    // 3. Orphaned vectors (decision deleted by any other path).
    report.orphan_vectors = tx.execute(
        "DELETE FROM vectors WHERE decision_id NOT IN (SELECT id FROM decisions)",
        [],
    )?;

    tx.commit()?;

    if report.merged_groups > 0 || report.expired > 0 || report.orphan_vectors > 0 {
        tracing::info!(
            merged = report.merged_groups,
            removed = report.removed_duplicates,
            expired = report.expired,
            orphans = report.orphan_vectors,
            "consolidation finished"
        );
    }
    Ok(report)
}
