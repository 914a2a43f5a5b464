//! Retrieval and budgeted context composition.
//!
//! Candidate pools (permanent facts, full-text hits, recent high-importance
//! rows, semantic matches) are fetched separately from allocation: the
//! allocator itself is a pure function over pre-fetched pools, so budget
//! behavior is testable without I/O. Sections fill in priority order —
//! permanent, FTS, recent, vector — with fixed weights; a section that
//! cannot use its share donates the remainder to the ones after it.
//!
//! The assembled markdown is wrapped in `<lily-memory>` tags. A bounded ring
//! of recent payload hashes suppresses injecting the same payload twice in a
//! row; context pressure scales the budget down as the conversation
//! approaches the host's context cap.

use crate::embedding::SemanticHit;
use anyhow::Result;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};

/// Section weights, in fill order. They sum to 1.0.
const WEIGHTS: [f64; 4] = [0.30, 0.30, 0.20, 0.20];

/// Permanent-section line cap.
const PERMANENT_LINE_LEN: usize = 150;
/// Other sections keep lines readable.
const LINE_LEN: usize = 200;

/// FTS and vector sections only run when this much budget remains.
const MIN_SECTION_REMAINING: usize = 100;

/// Prompts shorter than this skip the FTS section.
const MIN_PROMPT_LEN: usize = 5;
/// At most this many keywords feed the FTS query.
const MAX_KEYWORDS: usize = 8;

const WRAP_OPEN: &str = "<lily-memory>\n";
const WRAP_CLOSE: &str = "\n</lily-memory>";

/// Size of the injection-cooldown ring.
const COOLDOWN_SLOTS: usize = 3;

// ── Candidate pools ───────────────────────────────────────────────────────────

/// A renderable fact row.
#[derive(Debug, Clone)]
pub struct FactLine {
    pub id: String,
    pub entity: Option<String>,
    pub fact_key: Option<String>,
    pub fact_value: Option<String>,
    pub description: String,
    pub importance: f64,
}

/// A full-text hit.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub id: String,
    pub description: String,
}

/// Everything the allocator needs, already fetched.
#[derive(Debug, Default)]
pub struct CandidatePools {
    pub permanent: Vec<FactLine>,
    pub fts: Vec<FtsHit>,
    pub recent: Vec<FactLine>,
    pub vector: Vec<SemanticHit>,
}

fn fact_line_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FactLine> {
    Ok(FactLine {
        id: row.get(0)?,
        entity: row.get(1)?,
        fact_key: row.get(2)?,
        fact_value: row.get(3)?,
        description: row.get(4)?,
        importance: row.get(5)?,
    })
}

/// Up to 15 permanent (entity, key) facts, most important first.
pub fn fetch_permanent(conn: &Connection) -> Result<Vec<FactLine>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity, fact_key, fact_value, description, importance \
         FROM decisions \
         WHERE ttl_class = 'permanent' AND entity IS NOT NULL AND fact_key IS NOT NULL \
         ORDER BY importance DESC LIMIT 15",
    )?;
    let rows = stmt
        .query_map([], |row| fact_line_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Highest-timestamp live rows with importance ≥ 0.7 in the stable/active
/// classes, capped at 5.
pub fn fetch_recent(conn: &Connection) -> Result<Vec<FactLine>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity, fact_key, fact_value, description, importance \
         FROM decisions \
         WHERE importance >= 0.7 AND ttl_class IN ('stable', 'active') \
           AND (expires_at IS NULL OR expires_at > ?1) \
         ORDER BY ts DESC LIMIT 5",
    )?;
    let rows = stmt
        .query_map([chrono::Utc::now().to_rfc3339()], |row| fact_line_row(row))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Derive FTS keywords from a prompt: punctuation-stripped tokens of at
/// least 3 chars, first 8.
pub fn derive_keywords(prompt: &str) -> Vec<String> {
    let cleaned: String = prompt
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
        .collect();
    cleaned
        .split_whitespace()
        .filter(|t| t.chars().count() >= 3)
        .take(MAX_KEYWORDS)
        .map(|t| t.to_string())
        .collect()
}

/// Run the FTS query over live decisions. Keywords are OR-joined; a
/// malformed query degrades to no hits.
pub fn fts_query(conn: &Connection, keywords: &[String], limit: usize) -> Vec<FtsHit> {
    if keywords.is_empty() {
        return Vec::new();
    }
    let match_expr = keywords
        .iter()
        .map(|k| format!("\"{}\"", k.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ");

    let result = (|| -> Result<Vec<FtsHit>> {
        let mut stmt = conn.prepare(
            "SELECT d.id, d.description FROM decisions_fts \
             JOIN decisions d ON d.rowid = decisions_fts.rowid \
             WHERE decisions_fts MATCH ?1 \
               AND (d.expires_at IS NULL OR d.expires_at > ?2) \
             ORDER BY rank LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                rusqlite::params![match_expr, chrono::Utc::now().to_rfc3339(), limit as i64],
                |row| {
                    Ok(FtsHit {
                        id: row.get(0)?,
                        description: row.get(1)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })();

    match result {
        Ok(rows) => rows,
        Err(e) => {
            tracing::debug!(error = %e, "fts query failed");
            Vec::new()
        }
    }
}

/// Whether the FTS section should run at all for this prompt.
pub fn wants_fts(prompt: &str) -> bool {
    prompt.chars().count() >= MIN_PROMPT_LEN
}

// ── Allocation ────────────────────────────────────────────────────────────────

/// Render a fact as a single bullet line.
fn render_fact(fact: &FactLine, cap: usize) -> String {
    let body = match (&fact.entity, &fact.fact_key, &fact.fact_value) {
        (Some(entity), Some(key), Some(value)) => format!("{entity}.{key}: {value}"),
        _ => fact.description.clone(),
    };
    format!("- {}", truncate(&body, cap))
}

fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_string()
    } else {
        let cut: String = text.chars().take(cap.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

/// The composed payload plus the FTS ids it already covers.
#[derive(Debug)]
pub struct Composed {
    pub payload: String,
    pub fts_ids: HashSet<String>,
}

/// Pure budget allocator. Returns `None` when nothing fits or nothing is
/// available; otherwise the payload length (wrapper included) never exceeds
/// `budget`.
pub fn compose(pools: &CandidatePools, budget: usize) -> Option<Composed> {
    let wrapper = WRAP_OPEN.chars().count() + WRAP_CLOSE.chars().count();
    let effective = budget.checked_sub(wrapper)?;
    if effective == 0 {
        return None;
    }

    let mut body = String::new();
    let mut used = 0usize;
    let mut carry = 0usize;
    let mut fts_ids: HashSet<String> = HashSet::new();

    let mut push_section = |lines: Vec<String>,
                            header: &str,
                            weight: f64,
                            body: &mut String,
                            used: &mut usize,
                            carry: &mut usize| {
        let allowance = (effective as f64 * weight).floor() as usize + *carry;
        let mut section_used = 0usize;
        let mut wrote_header = false;

        for line in lines {
            let mut cost = line.chars().count() + 1; // newline
            if !wrote_header {
                // header, its newline, and the blank separator before it
                cost += header.chars().count() + 1;
                if !body.is_empty() {
                    cost += 1;
                }
            }
            if section_used + cost > allowance {
                break;
            }
            if !wrote_header {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(header);
                body.push('\n');
                wrote_header = true;
            }
            body.push_str(&line);
            body.push('\n');
            section_used += cost;
        }

        *used += section_used;
        *carry = allowance - section_used;
    };

    // Permanent
    let permanent_lines: Vec<String> = pools
        .permanent
        .iter()
        .map(|f| render_fact(f, PERMANENT_LINE_LEN))
        .collect();
    push_section(permanent_lines, "## Known facts", WEIGHTS[0], &mut body, &mut used, &mut carry);

    // FTS — only with meaningful budget left
    if effective.saturating_sub(used) > MIN_SECTION_REMAINING && !pools.fts.is_empty() {
        let lines: Vec<String> = pools
            .fts
            .iter()
            .map(|h| format!("- {}", truncate(&h.description, LINE_LEN)))
            .collect();
        let before = used;
        push_section(lines, "## Related memories", WEIGHTS[1], &mut body, &mut used, &mut carry);
        if used > before {
            // Only ids that actually rendered matter for dedup, but covering
            // the whole pool keeps the vector section from echoing near-misses.
            fts_ids.extend(pools.fts.iter().map(|h| h.id.clone()));
        }
    } else {
        carry += (effective as f64 * WEIGHTS[1]).floor() as usize;
    }

    // Recent
    let recent_lines: Vec<String> = pools
        .recent
        .iter()
        .map(|f| render_fact(f, LINE_LEN))
        .collect();
    push_section(recent_lines, "## Recent", WEIGHTS[2], &mut body, &mut used, &mut carry);

    // Vector — drop anything the FTS section already covers
    if effective.saturating_sub(used) > MIN_SECTION_REMAINING {
        let lines: Vec<String> = pools
            .vector
            .iter()
            .filter(|h| !fts_ids.contains(&h.decision_id))
            .map(|h| format!("- ({:.2}) {}", h.similarity, truncate(&h.content, LINE_LEN)))
            .collect();
        push_section(lines, "## Semantic matches", WEIGHTS[3], &mut body, &mut used, &mut carry);
    }

    if body.is_empty() {
        return None;
    }
    let payload = format!("{WRAP_OPEN}{}{WRAP_CLOSE}", body.trim_end());
    debug_assert!(payload.chars().count() <= budget);
    Some(Composed { payload, fts_ids })
}

// ── Injection cooldown ────────────────────────────────────────────────────────

/// First 12 hex chars of a SHA-256 digest.
pub fn payload_hash(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..12].to_string()
}

/// Bounded ring of recent payload hashes. A payload whose hash is present
/// is suppressed; the ring is cleared on compaction.
#[derive(Debug, Default)]
pub struct CooldownRing {
    hashes: VecDeque<String>,
}

impl CooldownRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the payload was injected recently and must be
    /// suppressed; otherwise records it.
    pub fn suppress(&mut self, payload: &str) -> bool {
        let hash = payload_hash(payload);
        if self.hashes.contains(&hash) {
            return true;
        }
        self.hashes.push_back(hash);
        while self.hashes.len() > COOLDOWN_SLOTS {
            self.hashes.pop_front();
        }
        false
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
    }
}

// ── Context pressure ──────────────────────────────────────────────────────────

/// Budget scaling driven by how full the host context is.
#[derive(Debug)]
pub struct ContextPressure {
    scale: f64,
}

impl Default for ContextPressure {
    fn default() -> Self {
        Self { scale: 1.0 }
    }
}

impl ContextPressure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a usage percentage to the scale ladder.
    pub fn level_for(pct: f64) -> f64 {
        if pct >= 90.0 {
            0.0
        } else if pct >= 80.0 {
            0.5
        } else if pct >= 60.0 {
            0.75
        } else {
            1.0
        }
    }

    /// Sample current usage against the cap.
    pub fn sample(&mut self, used: usize, cap: usize) {
        if cap == 0 {
            return;
        }
        let pct = used as f64 / cap as f64 * 100.0;
        self.scale = Self::level_for(pct);
        if self.scale < 1.0 {
            tracing::info!(pct = format!("{pct:.0}"), scale = self.scale, "context pressure");
        }
    }

    /// Effective budget for the next recall. A scale of 0 suppresses
    /// injection entirely.
    pub fn effective_budget(&self, base: usize) -> usize {
        (base as f64 * self.scale).floor() as usize
    }

    /// Compaction resets pressure to normal.
    pub fn reset(&mut self) {
        self.scale = 1.0;
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(id: &str, entity: &str, key: &str, value: &str, importance: f64) -> FactLine {
        FactLine {
            id: id.into(),
            entity: Some(entity.into()),
            fact_key: Some(key.into()),
            fact_value: Some(value.into()),
            description: format!("{entity}.{key}: {value}"),
            importance,
        }
    }

    fn pools_with_everything() -> CandidatePools {
        CandidatePools {
            permanent: (0..5)
                .map(|i| fact(&format!("p{i}"), "kevin", &format!("k{i}"), "permanent value", 0.9))
                .collect(),
            fts: (0..5)
                .map(|i| FtsHit {
                    id: format!("f{i}"),
                    description: format!("full text hit number {i} about deployments"),
                })
                .collect(),
            recent: (0..3)
                .map(|i| fact(&format!("r{i}"), "dana", &format!("recent{i}"), "recent value", 0.8))
                .collect(),
            vector: (0..3)
                .map(|i| SemanticHit {
                    decision_id: format!("v{i}"),
                    similarity: 0.8,
                    content: format!("semantic neighbour {i}"),
                })
                .collect(),
        }
    }

    #[test]
    fn payload_never_exceeds_budget() {
        let pools = pools_with_everything();
        for budget in [64, 120, 300, 600, 1200, 4000] {
            if let Some(composed) = compose(&pools, budget) {
                assert!(
                    composed.payload.chars().count() <= budget,
                    "budget {budget} violated: {}",
                    composed.payload.chars().count()
                );
            }
        }
    }

    #[test]
    fn sections_render_in_priority_order() {
        let composed = compose(&pools_with_everything(), 4000).unwrap();
        let payload = &composed.payload;
        let known = payload.find("## Known facts").unwrap();
        let related = payload.find("## Related memories").unwrap();
        let recent = payload.find("## Recent").unwrap();
        let semantic = payload.find("## Semantic matches").unwrap();
        assert!(known < related && related < recent && recent < semantic);
        assert!(payload.starts_with("<lily-memory>"));
        assert!(payload.ends_with("</lily-memory>"));
    }

    #[test]
    fn fts_ids_never_reach_the_vector_section() {
        let mut pools = pools_with_everything();
        pools.vector.push(SemanticHit {
            decision_id: "f0".into(), // same id as an FTS hit
            similarity: 0.99,
            content: "duplicate of the fts hit".into(),
        });
        let composed = compose(&pools, 4000).unwrap();
        assert!(!composed.payload.contains("duplicate of the fts hit"));
        assert!(composed.fts_ids.contains("f0"));
    }

    #[test]
    fn empty_pools_compose_nothing() {
        assert!(compose(&CandidatePools::default(), 4000).is_none());
        // A budget smaller than the wrapper can never inject
        assert!(compose(&pools_with_everything(), 10).is_none());
    }

    #[test]
    fn underfilled_sections_donate_budget() {
        // Permanent pool empty: FTS should be able to use its share too
        let pools = CandidatePools {
            permanent: Vec::new(),
            fts: (0..20)
                .map(|i| FtsHit {
                    id: format!("f{i}"),
                    description: format!("hit {i} with a reasonably long description body"),
                })
                .collect(),
            ..Default::default()
        };
        let budget = 800;
        let composed = compose(&pools, budget).unwrap();
        // With donation the FTS section may exceed its bare 30% share
        let bare_share = (budget as f64 * 0.30) as usize;
        assert!(composed.payload.chars().count() > bare_share);
    }

    #[test]
    fn permanent_lines_are_truncated() {
        let pools = CandidatePools {
            permanent: vec![fact("p", "kevin", "bio", &"x".repeat(500), 0.9)],
            ..Default::default()
        };
        let composed = compose(&pools, 4000).unwrap();
        let line = composed
            .payload
            .lines()
            .find(|l| l.starts_with("- "))
            .unwrap();
        assert!(line.chars().count() <= PERMANENT_LINE_LEN + 2);
    }

    #[test]
    fn keywords_filter_and_cap() {
        let kws = derive_keywords("What language does Kevin like? a b cd efg hij klm nop qrs tuv");
        assert!(kws.len() <= 8);
        assert!(kws.contains(&"kevin".to_string()));
        assert!(!kws.iter().any(|k| k.chars().count() < 3));
    }

    #[test]
    fn cooldown_suppresses_repeat_then_clears() {
        let mut ring = CooldownRing::new();
        assert!(!ring.suppress("payload one"));
        assert!(ring.suppress("payload one"));
        ring.clear();
        assert!(!ring.suppress("payload one"));
    }

    #[test]
    fn cooldown_ring_is_bounded() {
        let mut ring = CooldownRing::new();
        ring.suppress("a");
        ring.suppress("b");
        ring.suppress("c");
        ring.suppress("d"); // evicts "a"
        assert!(!ring.suppress("a"));
    }

    #[test]
    fn pressure_ladder_matches_thresholds() {
        assert_eq!(ContextPressure::level_for(10.0), 1.0);
        assert_eq!(ContextPressure::level_for(59.9), 1.0);
        assert_eq!(ContextPressure::level_for(60.0), 0.75);
        assert_eq!(ContextPressure::level_for(80.0), 0.5);
        assert_eq!(ContextPressure::level_for(90.0), 0.0);

        let mut pressure = ContextPressure::new();
        pressure.sample(95, 100);
        assert_eq!(pressure.effective_budget(2000), 0);
        pressure.reset();
        assert_eq!(pressure.effective_budget(2000), 2000);
    }
}
