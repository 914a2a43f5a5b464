//! Forward-only schema migration framework.
//!
//! Each migration is recorded as a row in `schema_version` with its
//! description and applied-at timestamp; the current version is the highest
//! recorded one. Migrations run transactionally in version order.

use anyhow::{Context, Result};
use rusqlite::Connection;

/// The schema version that the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Get the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0).map(|v| v as u32),
    )
}

/// Record a completed migration.
fn record_migration(conn: &Connection, version: u32, description: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, description, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Run any pending forward-only migrations. Each migration plus its version
/// record executes inside one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let mut version = get_schema_version(conn)?;
    tracing::debug!(schema_version = version, target = CURRENT_SCHEMA_VERSION, "checking migrations");

    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "running migration");

        let tx = conn.transaction()?;
        match next {
            1 => record_migration(&tx, 1, "baseline schema")?,
            2 => {
                migrate_v1_to_v2(&tx)?;
                record_migration(&tx, 2, "seed built-in protected entities")?;
            }
            _ => {
                anyhow::bail!("unknown migration target: {next}");
            }
        }
        tx.commit().with_context(|| format!("migration to v{next} failed"))?;

        version = next;
    }

    Ok(())
}

/// Migration v1 → v2: seed the built-in protected entities so a fresh
/// database exposes them through the entities table.
fn migrate_v1_to_v2(conn: &Connection) -> rusqlite::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    for name in ["config", "system", "note"] {
        conn.execute(
            "INSERT OR IGNORE INTO entities (name, display_name, source, added_at) \
             VALUES (?1, ?1, 'builtin', ?2)",
            rusqlite::params![name, now],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn fresh_db_starts_at_version_1() {
        let conn = test_db();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn run_migrations_upgrades_to_current() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn migrations_record_description_and_timestamp() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();

        let (desc, applied): (String, String) = conn
            .query_row(
                "SELECT description, applied_at FROM schema_version WHERE version = 2",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(desc.contains("protected entities"));
        assert!(!applied.is_empty());
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap(); // second call should not error
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn v2_seeds_protected_entities() {
        let mut conn = test_db();
        run_migrations(&mut conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entities WHERE source = 'builtin'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }
}
