//! Store: SQLite persistence shared by the memory and pipeline engines.
//!
//! One [`Store`] exists per absolute database path (the scheduler process and
//! the host adapter each open their own, coordinated through SQLite's WAL).
//! Paths must resolve under the fixed memory root `~/.openclaw/memory/`;
//! anything else is rejected as path traversal before any file is touched.
//!
//! Parameter binding is the sole SQL-injection defense. Never build SQL by
//! string interpolation of values.

pub mod migrations;
pub mod schema;

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

/// Maximum length of any sanitized value headed for the store.
const MAX_VALUE_LEN: usize = 10_000;

/// Process-wide registry: one open store per absolute path.
static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Store>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, Arc<Store>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A single open database. Cheap to clone via `Arc`.
pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store at `raw_path`, which must resolve under
    /// the memory root. Returns the existing instance when the same path was
    /// opened before.
    pub fn open(raw_path: &str) -> Result<Arc<Store>> {
        let path = resolve_db_path(raw_path)?;

        let mut reg = registry().lock().map_err(|_| anyhow!("store registry poisoned"))?;
        if let Some(existing) = reg.get(&path) {
            return Ok(Arc::clone(existing));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(&path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        configure(&conn)?;
        schema::init_schema(&conn).context("failed to initialize schema")?;
        migrations::run_migrations(&mut conn).context("failed to run migrations")?;

        tracing::info!(path = %path.display(), "database initialized");

        let store = Arc::new(Store {
            path,
            conn: Mutex::new(conn),
        });
        reg.insert(store.path.clone(), Arc::clone(&store));
        Ok(store)
    }

    /// Open an in-memory store (tests and dry runs). Not registered.
    pub fn open_in_memory() -> Result<Arc<Store>> {
        let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init_schema(&conn).context("failed to initialize schema")?;
        migrations::run_migrations(&mut conn).context("failed to run migrations")?;
        Ok(Arc::new(Store {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        }))
    }

    /// Lock the underlying connection for direct queries.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    /// Execute a statement, logging and swallowing failures. Returns whether
    /// the statement succeeded. Callers that need the error path use
    /// [`Store::lock`] directly.
    pub fn exec(&self, sql: &str, params: &[&dyn rusqlite::types::ToSql]) -> bool {
        match self.lock() {
            Ok(conn) => match conn.execute(sql, params) {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(error = %e, "store exec failed");
                    false
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "store lock failed");
                false
            }
        }
    }

    /// The resolved database path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Close every registered store. Called on service stop.
pub fn close_all() {
    if let Ok(mut reg) = registry().lock() {
        let count = reg.len();
        reg.clear();
        tracing::info!(count, "closed all stores");
    }
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
    // WAL admits one writer and many readers across the two processes
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // Wait up to 5 seconds for a competing writer instead of failing
    conn.pragma_update(None, "busy_timeout", "5000")?;
    Ok(())
}

/// Returns the fixed memory root: `~/.openclaw/memory/`.
pub fn memory_root() -> PathBuf {
    dirs::home_dir()
        .expect("home directory must exist")
        .join(".openclaw")
        .join("memory")
}

/// Resolve a raw database path: expand `~`, normalize away `.`/`..`, and
/// require the result to live under the memory root.
pub fn resolve_db_path(raw: &str) -> Result<PathBuf> {
    let expanded = expand_tilde(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        memory_root().join(expanded)
    };
    let normalized = normalize(&absolute);

    let root = normalize(&memory_root());
    if !normalized.starts_with(&root) {
        anyhow::bail!(
            "path traversal: {} resolves outside the memory root {}",
            raw,
            root.display()
        );
    }
    Ok(normalized)
}

/// Expand a leading `~/` to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .expect("home directory must exist")
            .join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Lexically normalize a path without touching the filesystem (the database
/// file may not exist yet).
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Sanitize a value before insertion: strip NUL bytes and cap the length.
pub fn sanitize(value: &str) -> String {
    let stripped: String = value.chars().filter(|c| *c != '\0').collect();
    truncate_chars(&stripped, MAX_VALUE_LEN)
}

/// Truncate to `max` characters on a char boundary.
pub fn truncate_chars(value: &str, max: usize) -> String {
    if value.chars().count() <= max {
        value.to_string()
    } else {
        value.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde("~/x.db"), home.join("x.db"));
        assert_eq!(expand_tilde("/tmp/x.db"), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn paths_under_root_resolve() {
        let resolved = resolve_db_path("~/.openclaw/memory/lily.db").unwrap();
        assert!(resolved.starts_with(memory_root()));

        // Relative paths are anchored at the root
        let resolved = resolve_db_path("sub/lily.db").unwrap();
        assert_eq!(resolved, memory_root().join("sub").join("lily.db"));
    }

    #[test]
    fn paths_outside_root_fail() {
        for bad in [
            "/tmp/evil.db",
            "~/other/place.db",
            "~/.openclaw/memory/../../etc/passwd",
            "../../../etc/shadow",
        ] {
            let err = resolve_db_path(bad).unwrap_err();
            assert!(
                err.to_string().contains("path traversal"),
                "{bad} should be rejected, got: {err}"
            );
        }
    }

    #[test]
    fn dot_dot_inside_root_still_resolves() {
        let resolved = resolve_db_path("~/.openclaw/memory/a/../lily.db").unwrap();
        assert_eq!(resolved, memory_root().join("lily.db"));
    }

    #[test]
    fn sanitize_strips_nul_and_caps() {
        assert_eq!(sanitize("a\0b"), "ab");
        let long = "x".repeat(20_000);
        assert_eq!(sanitize(&long).chars().count(), 10_000);
    }

    #[test]
    fn parameterized_values_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();

        let hostile = "x' OR '1'='1";
        conn.execute(
            "INSERT INTO decisions (id, ts, description, entity, fact_key, fact_value) \
             VALUES ('d1', ?1, 'test', 'probe', 'payload', ?2)",
            rusqlite::params![chrono::Utc::now().to_rfc3339(), hostile],
        )
        .unwrap();

        // The hostile value round-trips unchanged
        let stored: String = conn
            .query_row(
                "SELECT fact_value FROM decisions WHERE id = 'd1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored, hostile);

        // Querying for a different literal does not false-match
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM decisions WHERE fact_value = ?1",
                ["unrelated"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn exec_swallows_errors() {
        let store = Store::open_in_memory().unwrap();
        assert!(!store.exec("INSERT INTO missing_table VALUES (1)", &[]));
        assert!(store.exec(
            "INSERT INTO entities (name, display_name, source, added_at) VALUES ('x', 'X', 'test', '2026-01-01')",
            &[],
        ));
    }
}
