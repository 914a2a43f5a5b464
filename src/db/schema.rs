//! SQL DDL for all Lily tables.
//!
//! Defines `decisions`, `decisions_fts` (FTS5 mirror maintained by triggers),
//! `vectors`, `entities`, `security_events`, the pipeline tables
//! (`pipelines`, `pipeline_steps`, `pipeline_edges`, `pipeline_triggers`),
//! and `schema_version`. All DDL uses `IF NOT EXISTS` for idempotent
//! initialization.

use rusqlite::Connection;

/// All schema DDL statements for Lily's core tables.
const SCHEMA_SQL: &str = r#"
-- Memory facts
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    session_id TEXT,
    ts TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'fact',
    description TEXT NOT NULL,
    rationale TEXT,
    classification TEXT,
    importance REAL NOT NULL DEFAULT 0.5 CHECK(importance >= 0.0 AND importance <= 1.0),
    ttl_class TEXT NOT NULL DEFAULT 'active' CHECK(ttl_class IN ('permanent','stable','active','session')),
    expires_at TEXT,
    last_accessed TEXT,
    entity TEXT,
    fact_key TEXT,
    fact_value TEXT,
    tags TEXT
);

CREATE INDEX IF NOT EXISTS idx_decisions_ttl ON decisions(ttl_class);
CREATE INDEX IF NOT EXISTS idx_decisions_expires ON decisions(expires_at);
CREATE INDEX IF NOT EXISTS idx_decisions_entity ON decisions(entity);
CREATE INDEX IF NOT EXISTS idx_decisions_entity_key ON decisions(entity, fact_key);
CREATE INDEX IF NOT EXISTS idx_decisions_importance ON decisions(importance DESC);
CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions(ts);

-- Full-text mirror over the searchable decision columns
CREATE VIRTUAL TABLE IF NOT EXISTS decisions_fts USING fts5(
    description,
    rationale,
    entity,
    fact_key,
    fact_value,
    tags,
    content='decisions',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS decisions_ai AFTER INSERT ON decisions BEGIN
    INSERT INTO decisions_fts(rowid, description, rationale, entity, fact_key, fact_value, tags)
    VALUES (new.rowid, new.description, new.rationale, new.entity, new.fact_key, new.fact_value, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS decisions_ad AFTER DELETE ON decisions BEGIN
    INSERT INTO decisions_fts(decisions_fts, rowid, description, rationale, entity, fact_key, fact_value, tags)
    VALUES ('delete', old.rowid, old.description, old.rationale, old.entity, old.fact_key, old.fact_value, old.tags);
END;

CREATE TRIGGER IF NOT EXISTS decisions_au AFTER UPDATE ON decisions BEGIN
    INSERT INTO decisions_fts(decisions_fts, rowid, description, rationale, entity, fact_key, fact_value, tags)
    VALUES ('delete', old.rowid, old.description, old.rationale, old.entity, old.fact_key, old.fact_value, old.tags);
    INSERT INTO decisions_fts(rowid, description, rationale, entity, fact_key, fact_value, tags)
    VALUES (new.rowid, new.description, new.rationale, new.entity, new.fact_key, new.fact_value, new.tags);
END;

-- Embedding sidecar. No foreign key: orphans are swept by consolidation.
CREATE TABLE IF NOT EXISTS vectors (
    decision_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    embedding BLOB NOT NULL,
    model TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Known entities (seeds the runtime allow-list)
CREATE TABLE IF NOT EXISTS entities (
    name TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    source TEXT NOT NULL DEFAULT 'user',
    added_at TEXT NOT NULL
);

-- Security audit trail
CREATE TABLE IF NOT EXISTS security_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    event_type TEXT NOT NULL,
    source_role TEXT,
    entity TEXT,
    fact_key TEXT,
    fact_value TEXT,
    pattern TEXT,
    snippet TEXT
);

CREATE INDEX IF NOT EXISTS idx_security_ts ON security_events(ts);

-- Workflow pipelines
CREATE TABLE IF NOT EXISTS pipelines (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','running','paused','complete','failed','cancelled')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    created_by TEXT NOT NULL DEFAULT 'user',
    trigger_message TEXT,
    config TEXT,
    summary TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_pipelines_status ON pipelines(status);

CREATE TABLE IF NOT EXISTS pipeline_steps (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    step_type TEXT NOT NULL DEFAULT 'task' CHECK(step_type IN ('task','decision','notify')),
    status TEXT NOT NULL DEFAULT 'pending' CHECK(status IN ('pending','ready','running','complete','failed','skipped','cancelled','paused')),
    tier TEXT,
    executor TEXT,
    prompt TEXT,
    depends_on_all INTEGER NOT NULL DEFAULT 1,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    input TEXT,
    output TEXT,
    result_summary TEXT,
    error TEXT,
    UNIQUE(pipeline_id, name)
);

CREATE INDEX IF NOT EXISTS idx_steps_pipeline ON pipeline_steps(pipeline_id);
CREATE INDEX IF NOT EXISTS idx_steps_status ON pipeline_steps(pipeline_id, status);

CREATE TABLE IF NOT EXISTS pipeline_edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    parent_step_id TEXT NOT NULL,
    child_step_id TEXT NOT NULL,
    condition TEXT,
    UNIQUE(pipeline_id, parent_step_id, child_step_id)
);

CREATE INDEX IF NOT EXISTS idx_edges_pipeline ON pipeline_edges(pipeline_id);

CREATE TABLE IF NOT EXISTS pipeline_triggers (
    id TEXT PRIMARY KEY,
    pipeline_id TEXT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    schedule TEXT NOT NULL,
    timezone TEXT NOT NULL DEFAULT 'UTC',
    enabled INTEGER NOT NULL DEFAULT 1,
    last_fired TEXT,
    next_fire TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_triggers_enabled ON pipeline_triggers(enabled);

-- Migration history (current version = MAX(version))
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"#;

/// Initialize all schema tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    // Record the baseline version if this is a fresh database
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, description, applied_at) \
         VALUES (1, 'baseline schema', ?1)",
        [chrono::Utc::now().to_rfc3339()],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "decisions",
            "vectors",
            "entities",
            "security_events",
            "pipelines",
            "pipeline_steps",
            "pipeline_edges",
            "pipeline_triggers",
            "schema_version",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // second call should not error
    }

    #[test]
    fn fts_triggers_mirror_inserts_and_deletes() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO decisions (id, ts, description, entity, fact_key, fact_value) \
             VALUES ('d1', '2026-01-01T00:00:00+00:00', 'Kevin prefers TypeScript', 'kevin', 'prefers', 'TypeScript')",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM decisions_fts WHERE decisions_fts MATCH 'typescript'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        conn.execute("DELETE FROM decisions WHERE id = 'd1'", []).unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM decisions_fts WHERE decisions_fts MATCH 'typescript'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn fts_trigger_tracks_updates() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO decisions (id, ts, description) \
             VALUES ('d1', '2026-01-01T00:00:00+00:00', 'original text about rust')",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE decisions SET description = 'replacement text about python' WHERE id = 'd1'",
            [],
        )
        .unwrap();

        let old_hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM decisions_fts WHERE decisions_fts MATCH 'rust'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(old_hits, 0);

        let new_hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM decisions_fts WHERE decisions_fts MATCH 'python'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(new_hits, 1);
    }
}
