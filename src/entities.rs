//! Runtime entity registry — which names may anchor a stored fact.
//!
//! The allow-list is seeded from built-in defaults, configuration, and the
//! `entities` table, then grows at runtime through `memory_add_entity`. A
//! protected subset (config/system/note by default) is writable only from
//! agent-originated content or explicit tool calls; enforcement lives in
//! [`crate::security`].

use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

/// Entities every installation knows about.
const BUILTIN_ENTITIES: &[&str] = &["config", "system", "note", "user", "project", "team"];

/// Names that can never anchor a fact, regardless of casing: stopwords,
/// pronouns, and common verbs that the casing heuristic would otherwise let
/// through at sentence starts.
const DENY_WORDS: &[&str] = &[
    "the", "this", "that", "these", "those", "there", "then", "they", "them", "their", "its",
    "it", "he", "she", "we", "you", "i", "me", "my", "our", "your", "who", "what", "when",
    "where", "why", "how", "is", "was", "are", "were", "be", "been", "being", "have", "has",
    "had", "do", "does", "did", "will", "would", "should", "could", "can", "may", "might",
    "must", "shall", "not", "and", "but", "for", "with", "from", "into", "about", "also",
    "just", "very", "really", "always", "never", "sometimes", "maybe", "please", "thanks",
    "thank", "yes", "no", "okay", "ok", "hello", "today", "tomorrow", "yesterday", "now",
    "here", "make", "made", "take", "took", "get", "got", "use", "used", "let", "lets",
];

/// The in-memory entity set. Process-wide state with a clear init (service
/// start) and teardown; injected as an explicit handle.
#[derive(Debug)]
pub struct EntityRegistry {
    allow: HashSet<String>,
    protected: HashSet<String>,
}

impl EntityRegistry {
    /// Build the registry from built-ins, configured extras, and the store.
    pub fn load(conn: &Connection, extra: &[String], protected: &[String]) -> Result<Self> {
        let mut allow: HashSet<String> =
            BUILTIN_ENTITIES.iter().map(|s| s.to_string()).collect();
        allow.extend(extra.iter().map(|s| s.to_lowercase()));

        let mut stmt = conn.prepare("SELECT name FROM entities")?;
        let stored = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        allow.extend(stored.into_iter().map(|s| s.to_lowercase()));

        Ok(Self {
            allow,
            protected: protected.iter().map(|s| s.to_lowercase()).collect(),
        })
    }

    /// Registry with only built-ins; used when the store is unavailable.
    pub fn builtin(protected: &[String]) -> Self {
        Self {
            allow: BUILTIN_ENTITIES.iter().map(|s| s.to_string()).collect(),
            protected: protected.iter().map(|s| s.to_lowercase()).collect(),
        }
    }

    /// The base of an entity name: everything before the first dot,
    /// lowercased. `Config.system` and `config` share the base `config`.
    pub fn base(name: &str) -> String {
        name.split('.').next().unwrap_or(name).to_lowercase()
    }

    /// Whether a candidate entity name is acceptable: 2–60 chars, not a deny
    /// word, and either already known or shaped like a proper noun
    /// (uppercase letter followed by lowercase).
    pub fn accepts(&self, name: &str) -> bool {
        let len = name.chars().count();
        if !(2..=60).contains(&len) {
            return false;
        }
        let base = Self::base(name);
        if DENY_WORDS.contains(&base.as_str()) {
            return false;
        }
        if self.allow.contains(&base) {
            return true;
        }
        let mut chars = name.chars();
        matches!(
            (chars.next(), chars.next()),
            (Some(first), Some(second)) if first.is_uppercase() && second.is_lowercase()
        )
    }

    /// Whether an entity's base is in the protected set.
    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(&Self::base(name))
    }

    /// Register a new entity at runtime and persist it.
    pub fn add(&mut self, conn: &Connection, name: &str, source: &str) -> Result<()> {
        let base = Self::base(name);
        conn.execute(
            "INSERT OR IGNORE INTO entities (name, display_name, source, added_at) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![base, name, source, chrono::Utc::now().to_rfc3339()],
        )?;
        self.allow.insert(base);
        Ok(())
    }

    pub fn known(&self) -> &HashSet<String> {
        &self.allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    fn registry() -> EntityRegistry {
        EntityRegistry::builtin(&["config".into(), "system".into(), "note".into()])
    }

    #[test]
    fn builtin_entities_are_accepted() {
        let reg = registry();
        assert!(reg.accepts("config"));
        assert!(reg.accepts("config.system"));
        assert!(reg.accepts("user"));
    }

    #[test]
    fn proper_nouns_are_accepted() {
        let reg = registry();
        assert!(reg.accepts("Kevin"));
        assert!(reg.accepts("Initech"));
    }

    #[test]
    fn deny_words_rejected_even_with_proper_casing() {
        let reg = registry();
        assert!(!reg.accepts("This"));
        assert!(!reg.accepts("They"));
        assert!(!reg.accepts("Always"));
    }

    #[test]
    fn length_bounds_enforced() {
        let reg = registry();
        assert!(!reg.accepts("K"));
        assert!(!reg.accepts(&"Aa".repeat(40)));
    }

    #[test]
    fn lowercase_unknowns_rejected() {
        let reg = registry();
        assert!(!reg.accepts("widget"));
        assert!(!reg.accepts("kevin2")); // unknown and not uppercase-lowercase
    }

    #[test]
    fn protection_follows_the_base() {
        let reg = registry();
        assert!(reg.is_protected("config"));
        assert!(reg.is_protected("Config.system"));
        assert!(reg.is_protected("note.todo"));
        assert!(!reg.is_protected("Kevin"));
    }

    #[test]
    fn added_entities_persist_and_accept() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let mut reg = registry();

        assert!(!reg.accepts("widget"));
        reg.add(&conn, "widget", "tool").unwrap();
        assert!(reg.accepts("widget"));

        let reloaded = EntityRegistry::load(&conn, &[], &["config".into()]).unwrap();
        assert!(reloaded.accepts("widget"));
    }
}
