//! Capture pipeline — from conversation messages to stored facts.
//!
//! Text blocks are screened (size bounds, context-injection sentinels,
//! capture policy), parsed into fact candidates, reviewed by the security
//! layer, and written under derived TTL and importance. Quotas are enforced
//! before every insert; the permanent class demotes its oldest row to
//! stable instead of refusing.

use crate::db;
use crate::entities::EntityRegistry;
use crate::extract::{self, FactCandidate};
use crate::memory::types::{ChatMessage, TtlClass};
use crate::security::{self, Origin};
use anyhow::Result;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use std::sync::LazyLock;

/// Text blocks outside these bounds are not worth mining.
const MIN_BLOCK_LEN: usize = 30;
const MAX_BLOCK_LEN: usize = 5_000;

/// Payloads we injected ourselves must never be re-captured.
const SENTINELS: &[&str] = &["<lily-memory>", "<relevant-memories>"];

/// Marker required by the `tagged-only` capture policy.
const TRUSTED_MARKER: &str = "<trusted-capture>";

/// Importance boost applied when consolidation keeps a duplicate, capped.
pub const CONSOLIDATION_BOOST: f64 = 0.05;
pub const IMPORTANCE_CAP: f64 = 0.95;

static STATUS_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(status|current|today|tonight|now|temp|tmp|wip|progress|working)(_|$)")
        .expect("status key pattern")
});

/// Which messages the capture pipeline may mine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    All,
    AssistantOnly,
    TaggedOnly,
}

impl std::str::FromStr for CapturePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "assistant-only" => Ok(Self::AssistantOnly),
            "tagged-only" => Ok(Self::TaggedOnly),
            _ => Err(format!("unknown capture policy: {s}")),
        }
    }
}

/// What a capture pass did.
#[derive(Debug, Default)]
pub struct CaptureOutcome {
    pub stored: usize,
    pub updated: usize,
    pub blocked: usize,
    /// Newly inserted (decision id, description) pairs, for vector
    /// enrichment by the caller.
    pub inserted: Vec<(String, String)>,
}

/// A fact ready for the write path.
pub struct NewFact<'a> {
    pub entity: &'a str,
    pub key: &'a str,
    pub value: &'a str,
    pub ttl: TtlClass,
    pub importance: f64,
    pub session_id: Option<&'a str>,
    pub tags: Option<&'a str>,
}

/// Result of [`upsert_fact`].
pub struct UpsertResult {
    pub id: String,
    pub updated: bool,
}

/// Whether a fact key names transient status; such facts always land in the
/// session class regardless of the requested TTL.
pub fn is_status_key(key: &str) -> bool {
    STATUS_KEY_RE.is_match(&key.to_lowercase())
}

/// Apply the status-keyword downgrade to a requested TTL.
pub fn derive_ttl(key: &str, requested: TtlClass) -> TtlClass {
    if is_status_key(key) {
        TtlClass::Session
    } else {
        requested
    }
}

/// Run a capture pass over a message list. At most `max_facts` facts are
/// written per call.
pub fn capture(
    conn: &Connection,
    registry: &EntityRegistry,
    messages: &[ChatMessage],
    policy: CapturePolicy,
    max_facts: usize,
    session_id: Option<&str>,
) -> Result<CaptureOutcome> {
    let mut outcome = CaptureOutcome::default();

    'messages: for message in messages {
        let origin = match message.role.as_str() {
            "user" => Origin::User,
            "assistant" => Origin::Assistant,
            _ => continue,
        };
        if policy == CapturePolicy::AssistantOnly && origin != Origin::Assistant {
            continue;
        }

        for block in message.text_blocks() {
            let len = block.chars().count();
            if !(MIN_BLOCK_LEN..=MAX_BLOCK_LEN).contains(&len) {
                continue;
            }
            if SENTINELS.iter().any(|s| block.contains(s)) {
                continue;
            }
            if policy == CapturePolicy::TaggedOnly && !block.contains(TRUSTED_MARKER) {
                continue;
            }

            for candidate in extract::extract_facts(block) {
                if outcome.stored + outcome.updated >= max_facts {
                    break 'messages;
                }
                if !registry.accepts(&candidate.entity) {
                    continue;
                }
                if security::review_fact(conn, registry, &candidate, origin, block).is_some() {
                    outcome.blocked += 1;
                    continue;
                }

                let ttl = derive_ttl(&candidate.key, TtlClass::Active);
                let importance = match origin {
                    Origin::Assistant => 0.6,
                    _ => 0.5,
                };
                let result = upsert_fact(
                    conn,
                    NewFact {
                        entity: &candidate.entity,
                        key: &candidate.key,
                        value: &candidate.value,
                        ttl,
                        importance,
                        session_id,
                        tags: None,
                    },
                )?;
                if result.updated {
                    outcome.updated += 1;
                } else {
                    outcome.inserted.push((result.id.clone(), describe(&candidate)));
                    outcome.stored += 1;
                }
            }
        }
    }

    tracing::debug!(
        stored = outcome.stored,
        updated = outcome.updated,
        blocked = outcome.blocked,
        "capture pass finished"
    );
    Ok(outcome)
}

fn describe(fact: &FactCandidate) -> String {
    format!("{}.{}: {}", fact.entity, fact.key, fact.value)
}

/// Write a fact: update the live (entity, key) row in place when one exists,
/// otherwise enforce the class quota and insert.
pub fn upsert_fact(conn: &Connection, fact: NewFact<'_>) -> Result<UpsertResult> {
    let now = chrono::Utc::now().to_rfc3339();
    let entity = fact.entity.to_lowercase();
    let value = db::sanitize(fact.value);
    let description = db::sanitize(&format!("{}.{}: {}", fact.entity, fact.key, fact.value));

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM decisions \
             WHERE entity = ?1 AND fact_key = ?2 \
               AND (expires_at IS NULL OR expires_at > ?3)",
            rusqlite::params![entity, fact.key, now],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE decisions SET fact_value = ?1, description = ?2, ts = ?3, last_accessed = ?3 \
             WHERE id = ?4",
            rusqlite::params![value, description, now, id],
        )?;
        return Ok(UpsertResult { id, updated: true });
    }

    enforce_quota(conn, fact.ttl)?;

    let id = uuid::Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO decisions \
         (id, session_id, ts, category, description, importance, ttl_class, expires_at, last_accessed, entity, fact_key, fact_value, tags) \
         VALUES (?1, ?2, ?3, 'fact', ?4, ?5, ?6, ?7, ?3, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            id,
            fact.session_id,
            now,
            description,
            fact.importance.clamp(0.0, 1.0),
            fact.ttl.as_str(),
            fact.ttl.expiry_from_now(),
            entity,
            fact.key,
            value,
            fact.tags,
        ],
    )?;
    Ok(UpsertResult { id, updated: false })
}

/// Count live rows of a class.
pub fn live_count(conn: &Connection, class: TtlClass) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM decisions \
         WHERE ttl_class = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        rusqlite::params![class.as_str(), chrono::Utc::now().to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Make room for one more row of `class`. Permanent overflow demotes the
/// oldest permanent row to stable with a fresh 90-day expiry; other classes
/// evict the lowest-importance, then lowest-timestamp live row and cascade
/// its vector.
fn enforce_quota(conn: &Connection, class: TtlClass) -> Result<()> {
    let Some(cap) = class.quota() else {
        return Ok(());
    };
    if live_count(conn, class)? < cap {
        return Ok(());
    }

    if class == TtlClass::Permanent {
        demote_oldest_permanent(conn)?;
        return Ok(());
    }

    let now = chrono::Utc::now().to_rfc3339();
    let victim: Option<String> = conn
        .query_row(
            "SELECT id FROM decisions \
             WHERE ttl_class = ?1 AND (expires_at IS NULL OR expires_at > ?2) \
             ORDER BY importance ASC, ts ASC LIMIT 1",
            rusqlite::params![class.as_str(), now],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = victim {
        conn.execute("DELETE FROM vectors WHERE decision_id = ?1", [&id])?;
        conn.execute("DELETE FROM decisions WHERE id = ?1", [&id])?;
        tracing::debug!(class = class.as_str(), id = %id, "evicted for quota");
    }
    Ok(())
}

/// Demote the oldest permanent row to stable. Public: the `memory_store`
/// tool runs the same path before a permanent insert.
pub fn demote_oldest_permanent(conn: &Connection) -> Result<()> {
    let oldest: Option<String> = conn
        .query_row(
            "SELECT id FROM decisions WHERE ttl_class = 'permanent' ORDER BY ts ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = oldest {
        conn.execute(
            "UPDATE decisions SET ttl_class = 'stable', expires_at = ?1 WHERE id = ?2",
            rusqlite::params![TtlClass::Stable.expiry_from_now(), id],
        )?;
        tracing::info!(id = %id, "demoted oldest permanent row to stable");
    }
    Ok(())
}
