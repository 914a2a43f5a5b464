//! Embedding client and vector search.
//!
//! Embeddings come from an HTTP service (`POST /api/embeddings`); every
//! failure degrades to absence, never an error — capture and recall simply
//! proceed without vectors. Vectors are stored as little-endian f32 bytes in
//! the `vectors` sidecar table and searched by in-process cosine similarity,
//! filtered to the configured model.

use crate::db::Store;
use anyhow::Result;
use serde_json::{json, Value};
use std::time::Duration;

/// Health-probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Per-embedding request timeout.
const EMBED_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between backfill embeddings so the service is not hammered.
const BACKFILL_PACE: Duration = Duration::from_millis(50);

/// Result of a service health probe.
#[derive(Debug)]
pub struct Health {
    pub available: bool,
    pub reason: Option<String>,
}

/// A semantic search hit.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SemanticHit {
    pub decision_id: String,
    pub similarity: f32,
    pub content: String,
}

/// HTTP embedding client bound to one service URL and model.
#[derive(Clone)]
pub struct EmbeddingClient {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl EmbeddingClient {
    pub fn new(url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One short probe against the service.
    pub async fn health(&self) -> Health {
        let url = format!("{}/api/tags", self.url);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => Health {
                available: true,
                reason: None,
            },
            Ok(resp) => Health {
                available: false,
                reason: Some(format!("service returned {}", resp.status())),
            },
            Err(e) => Health {
                available: false,
                reason: Some(format!("unreachable: {e}")),
            },
        }
    }

    /// Embed a text. Absence on any failure; the reason is logged once here
    /// so callers can stay quiet.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.url);
        let body = json!({ "model": self.model, "prompt": text });

        let resp = match self
            .client
            .post(&url)
            .json(&body)
            .timeout(EMBED_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(error = %e, "embedding request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::debug!(status = %resp.status(), "embedding service error");
            return None;
        }

        let value: Value = resp.json().await.ok()?;
        let floats: Vec<f32> = value
            .get("embedding")?
            .as_array()?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();
        if floats.is_empty() {
            return None;
        }
        Some(floats)
    }

    /// Embed `text` and upsert the vector for a decision. Returns whether a
    /// vector was written.
    pub async fn store_vector(&self, store: &Store, decision_id: &str, text: &str) -> bool {
        let Some(embedding) = self.embed(text).await else {
            return false;
        };
        let written = (|| -> Result<()> {
            let conn = store.lock()?;
            conn.execute(
                "INSERT OR REPLACE INTO vectors (decision_id, content, embedding, model, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    decision_id,
                    text,
                    embedding_to_bytes(&embedding),
                    self.model,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })();
        match written {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "vector upsert failed");
                false
            }
        }
    }

    /// Embed every decision that lacks a vector, rate-limited, up to `limit`
    /// rows per run.
    pub async fn backfill(&self, store: &Store, limit: usize) -> Result<usize> {
        let missing: Vec<(String, String)> = {
            let conn = store.lock()?;
            let mut stmt = conn.prepare(
                "SELECT d.id, d.description FROM decisions d \
                 LEFT JOIN vectors v ON v.decision_id = d.id \
                 WHERE v.decision_id IS NULL \
                   AND (d.expires_at IS NULL OR d.expires_at > ?1) \
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(
                    rusqlite::params![chrono::Utc::now().to_rfc3339(), limit as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut written = 0;
        for (id, description) in &missing {
            if self.store_vector(store, id, description).await {
                written += 1;
            }
            tokio::time::sleep(BACKFILL_PACE).await;
        }
        if written > 0 {
            tracing::info!(written, "vector backfill complete");
        }
        Ok(written)
    }

    /// Embed the query and return the top-k live decisions above the
    /// similarity threshold, best first.
    pub async fn search(
        &self,
        store: &Store,
        query: &str,
        k: usize,
        threshold: f32,
    ) -> Vec<SemanticHit> {
        let Some(query_vec) = self.embed(query).await else {
            return Vec::new();
        };
        match scored_candidates(store, &self.model, &query_vec) {
            Ok(mut hits) => {
                hits.retain(|h| h.similarity >= threshold);
                hits.sort_by(|a, b| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                hits.truncate(k);
                hits
            }
            Err(e) => {
                tracing::error!(error = %e, "vector scan failed");
                Vec::new()
            }
        }
    }
}

/// Score every stored vector of `model` against the query vector. Expired
/// decisions are excluded at read time.
fn scored_candidates(store: &Store, model: &str, query_vec: &[f32]) -> Result<Vec<SemanticHit>> {
    let conn = store.lock()?;
    let mut stmt = conn.prepare(
        "SELECT v.decision_id, v.content, v.embedding FROM vectors v \
         JOIN decisions d ON d.id = v.decision_id \
         WHERE v.model = ?1 AND (d.expires_at IS NULL OR d.expires_at > ?2)",
    )?;
    let hits = stmt
        .query_map(
            rusqlite::params![model, chrono::Utc::now().to_rfc3339()],
            |row| {
                let blob: Vec<u8> = row.get(2)?;
                Ok(SemanticHit {
                    decision_id: row.get(0)?,
                    content: row.get(1)?,
                    similarity: cosine(query_vec, &bytes_to_embedding(&blob)),
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}

/// Standard cosine similarity. Mismatched dimensions or a zero-norm vector
/// yield 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Little-endian f32 encoding for the `vectors.embedding` blob.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a stored embedding blob.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("4-byte chunk")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, -0.4, 0.5];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn mismatched_or_zero_vectors_yield_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[test]
    fn bytes_round_trip() {
        let v = vec![1.5f32, -2.25, 0.0, 123.456];
        assert_eq!(bytes_to_embedding(&embedding_to_bytes(&v)), v);
    }

    #[test]
    fn scored_candidates_filter_by_model_and_expiry() {
        let store = crate::db::Store::open_in_memory().unwrap();
        {
            let conn = store.lock().unwrap();
            let now = chrono::Utc::now().to_rfc3339();
            let past = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
            for (id, expires) in [("live", None::<String>), ("dead", Some(past))] {
                conn.execute(
                    "INSERT INTO decisions (id, ts, description, expires_at) VALUES (?1, ?2, 'x', ?3)",
                    rusqlite::params![id, now, expires],
                )
                .unwrap();
            }
            let blob = embedding_to_bytes(&[1.0, 0.0]);
            for (id, model) in [("live", "m1"), ("dead", "m1")] {
                conn.execute(
                    "INSERT INTO vectors (decision_id, content, embedding, model, created_at) \
                     VALUES (?1, 'x', ?2, ?3, ?4)",
                    rusqlite::params![id, blob, model, now],
                )
                .unwrap();
            }
            // A vector under a different model is never scored
            conn.execute(
                "INSERT INTO decisions (id, ts, description) VALUES ('other', ?1, 'y')",
                rusqlite::params![now],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO vectors (decision_id, content, embedding, model, created_at) \
                 VALUES ('other', 'y', ?1, 'm2', ?2)",
                rusqlite::params![blob, now],
            )
            .unwrap();
        }

        let hits = scored_candidates(&store, "m1", &[1.0, 0.0]).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.decision_id.as_str()).collect();
        assert_eq!(ids, vec!["live"]);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }
}
