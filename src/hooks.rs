//! Host adapter — event hooks around agent turns.
//!
//! The host calls [`HostAdapter::before_agent_start`] to get a context
//! prepend, [`HostAdapter::agent_end`] after each turn to capture facts and
//! sample pressure, and the compaction hooks around its own context
//! compaction. All state here lives in one process; coordination with the
//! scheduler happens only through the store.

use crate::config::LilyConfig;
use crate::db::Store;
use crate::embedding::EmbeddingClient;
use crate::entities::EntityRegistry;
use crate::extract;
use crate::memory::capture::{self, CapturePolicy};
use crate::memory::recall::{self, CandidatePools, ContextPressure, CooldownRing};
use crate::memory::types::ChatMessage;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Pressure is sampled every this many turns.
const PRESSURE_SAMPLE_EVERY: u32 = 10;

/// Identical topic signatures for this many consecutive turns trip the
/// stuck detector.
const STUCK_RUN: usize = 3;
/// Topic history is bounded to this many entries.
const TOPIC_HISTORY_CAP: usize = 20;

/// Cap on hits fed into the vector section of a recall payload.
const VECTOR_RECALL_LIMIT: usize = 5;

/// Persisted stuck-detector state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TopicHistoryFile {
    signatures: Vec<String>,
}

/// Sidecar file tracking recent topic signatures.
#[derive(Debug)]
pub struct TopicHistory {
    path: PathBuf,
    signatures: Vec<String>,
}

impl TopicHistory {
    pub fn load(path: PathBuf) -> Self {
        let signatures = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<TopicHistoryFile>(&raw).ok())
            .map(|f| f.signatures)
            .unwrap_or_default();
        Self { path, signatures }
    }

    /// Record a signature. Returns true when the last [`STUCK_RUN`] entries
    /// are identical.
    pub fn push(&mut self, signature: String) -> bool {
        self.signatures.push(signature);
        if self.signatures.len() > TOPIC_HISTORY_CAP {
            let excess = self.signatures.len() - TOPIC_HISTORY_CAP;
            self.signatures.drain(..excess);
        }
        self.save();

        if self.signatures.len() < STUCK_RUN {
            return false;
        }
        let tail = &self.signatures[self.signatures.len() - STUCK_RUN..];
        tail.windows(2).all(|w| w[0] == w[1])
    }

    pub fn clear(&mut self) {
        self.signatures.clear();
        self.save();
    }

    fn save(&self) {
        let file = TopicHistoryFile {
            signatures: self.signatures.clone(),
        };
        if let Ok(raw) = serde_json::to_string(&file) {
            if let Err(e) = std::fs::write(&self.path, raw) {
                tracing::debug!(error = %e, "failed to persist topic history");
            }
        }
    }
}

/// What [`HostAdapter::agent_end`] did for a turn.
#[derive(Debug, Default)]
pub struct TurnReport {
    pub stored: usize,
    pub updated: usize,
    pub blocked: usize,
    /// Present when the conversation has circled one topic too long.
    pub stuck_nudge: Option<String>,
}

/// Shared per-process state for the host-facing side.
pub struct HostAdapter {
    store: Arc<Store>,
    config: Arc<LilyConfig>,
    embedding: EmbeddingClient,
    entities: Mutex<EntityRegistry>,
    cooldown: Mutex<CooldownRing>,
    pressure: Mutex<ContextPressure>,
    topic: Mutex<TopicHistory>,
    turns: AtomicU32,
    blocked_total: AtomicU32,
}

impl HostAdapter {
    pub fn new(store: Arc<Store>, config: Arc<LilyConfig>) -> Result<Self> {
        let entities = {
            let conn = store.lock()?;
            EntityRegistry::load(&conn, &config.entities, &config.protected_entities)?
        };
        let topic = TopicHistory::load(crate::db::expand_tilde(&config.topic_history_path));
        Ok(Self {
            embedding: EmbeddingClient::new(&config.ollama_url, &config.embedding_model),
            store,
            config,
            entities: Mutex::new(entities),
            cooldown: Mutex::new(CooldownRing::new()),
            pressure: Mutex::new(ContextPressure::new()),
            topic: Mutex::new(topic),
            turns: AtomicU32::new(0),
            blocked_total: AtomicU32::new(0),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &LilyConfig {
        &self.config
    }

    pub fn embedding(&self) -> &EmbeddingClient {
        &self.embedding
    }

    pub fn entities(&self) -> &Mutex<EntityRegistry> {
        &self.entities
    }

    /// Build the context payload for the next agent turn. Returns `None`
    /// when recall is off, pressure suppresses injection, nothing matched,
    /// or the identical payload was injected moments ago.
    pub async fn before_agent_start(&self, prompt: &str) -> Option<String> {
        if !self.config.auto_recall {
            return None;
        }
        let budget = {
            let pressure = self.pressure.lock().ok()?;
            pressure.effective_budget(self.config.injection_budget)
        };
        if budget == 0 {
            return None;
        }

        let mut pools = CandidatePools::default();
        let fts_limit = self.config.max_recall_results.min(10);
        {
            let conn = self.store.lock().ok()?;
            pools.permanent = recall::fetch_permanent(&conn).unwrap_or_default();
            pools.recent = recall::fetch_recent(&conn).unwrap_or_default();
            if recall::wants_fts(prompt) {
                let keywords = recall::derive_keywords(prompt);
                pools.fts = recall::fts_query(&conn, &keywords, fts_limit);
            }
        }
        if self.config.vector_search {
            pools.vector = self
                .embedding
                .search(
                    &self.store,
                    prompt,
                    VECTOR_RECALL_LIMIT,
                    self.config.vector_similarity_threshold,
                )
                .await;
        }

        let composed = recall::compose(&pools, budget)?;
        {
            let mut ring = self.cooldown.lock().ok()?;
            if ring.suppress(&composed.payload) {
                tracing::debug!("recall payload suppressed by cooldown");
                return None;
            }
        }

        // Touch everything we just surfaced
        let ids: Vec<String> = pools
            .permanent
            .iter()
            .chain(pools.recent.iter())
            .map(|f| f.id.clone())
            .collect();
        if let Ok(conn) = self.store.lock() {
            let now = chrono::Utc::now().to_rfc3339();
            for id in ids {
                let _ = conn.execute(
                    "UPDATE decisions SET last_accessed = ?1 WHERE id = ?2",
                    rusqlite::params![now, id],
                );
            }
        }

        Some(composed.payload)
    }

    /// Capture facts from a finished turn; sample context pressure every
    /// tenth turn; run the stuck detector over the last assistant text.
    pub async fn agent_end(&self, messages: &[ChatMessage]) -> Result<TurnReport> {
        let mut report = TurnReport::default();

        if self.config.auto_capture {
            let policy: CapturePolicy = self
                .config
                .capture_policy
                .parse()
                .unwrap_or(CapturePolicy::All);
            let outcome = {
                let conn = self.store.lock()?;
                let entities = self
                    .entities
                    .lock()
                    .map_err(|_| anyhow::anyhow!("entity registry poisoned"))?;
                capture::capture(
                    &conn,
                    &entities,
                    messages,
                    policy,
                    self.config.max_capture_per_turn,
                    None,
                )?
            };
            report.stored = outcome.stored;
            report.updated = outcome.updated;
            report.blocked = outcome.blocked;
            self.blocked_total
                .fetch_add(outcome.blocked as u32, Ordering::Relaxed);

            if self.config.vector_search {
                for (id, description) in &outcome.inserted {
                    self.embedding.store_vector(&self.store, id, description).await;
                }
            }
        }

        let turn = self.turns.fetch_add(1, Ordering::Relaxed) + 1;
        if turn % PRESSURE_SAMPLE_EVERY == 0 {
            let estimate_tokens: usize = messages
                .iter()
                .flat_map(|m| m.text_blocks())
                .map(|t| t.chars().count() / 4)
                .sum();
            if let Ok(mut pressure) = self.pressure.lock() {
                pressure.sample(estimate_tokens, self.config.context_token_cap);
            }
        }

        if self.config.stuck_detection {
            report.stuck_nudge = self.detect_stuck(messages);
        }

        Ok(report)
    }

    fn detect_stuck(&self, messages: &[ChatMessage]) -> Option<String> {
        let last_assistant = messages
            .iter()
            .rev()
            .find(|m| m.role == "assistant")?
            .text_blocks()
            .join("\n");
        let signature = extract::topic_signature(&last_assistant)?;

        let stuck = self.topic.lock().ok()?.push(signature.clone());
        if !stuck {
            return None;
        }
        tracing::info!(signature = %signature, "conversation appears stuck");
        Some(format!(
            "The last {STUCK_RUN} turns have circled the same topic ({signature}). \
             Consider changing approach or asking the user how to proceed."
        ))
    }

    /// Keep permanent rows warm so compaction-driven summaries retain them.
    pub fn before_compaction(&self) {
        if let Ok(conn) = self.store.lock() {
            let now = chrono::Utc::now().to_rfc3339();
            let touched = conn
                .execute(
                    "UPDATE decisions SET last_accessed = ?1 WHERE ttl_class = 'permanent'",
                    [&now],
                )
                .unwrap_or(0);
            tracing::debug!(touched, "permanent rows touched before compaction");
        }
    }

    /// Compaction invalidates the cooldown ring, pressure, and topic
    /// history.
    pub fn after_compaction(&self) {
        if let Ok(mut ring) = self.cooldown.lock() {
            ring.clear();
        }
        if let Ok(mut pressure) = self.pressure.lock() {
            pressure.reset();
        }
        if let Ok(mut topic) = self.topic.lock() {
            topic.clear();
        }
        tracing::debug!("compaction hooks reset recall state");
    }

    /// Facts blocked by the security layer since start, for turn logs.
    pub fn blocked_total(&self) -> u32 {
        self.blocked_total.load(Ordering::Relaxed)
    }
}
