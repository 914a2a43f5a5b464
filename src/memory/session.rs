//! Session overflow guard.
//!
//! At service start the sessions manifest is scanned; any session whose
//! on-disk transcript implies a token estimate past the configured share of
//! the context cap gets its file renamed aside (`.overflow-<timestamp>.bak`)
//! and its volatile fields dropped from the manifest, so the next host start
//! begins that session fresh instead of failing to load an oversized one.

use anyhow::{Context, Result};
use serde_json::Value;
use std::path::Path;

/// Rough bytes-per-token divisor for transcript files.
const BYTES_PER_TOKEN: u64 = 4;

/// Sessions flagged by a guard pass.
#[derive(Debug, Default)]
pub struct OverflowReport {
    pub flagged: Vec<String>,
}

/// Scan the manifest and quarantine oversized session files. Missing
/// manifest is not an error — there is simply nothing to guard.
pub fn guard_sessions(
    manifest_path: &Path,
    threshold: f64,
    context_token_cap: usize,
) -> Result<OverflowReport> {
    let mut report = OverflowReport::default();
    if !manifest_path.exists() {
        return Ok(report);
    }

    let raw = std::fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let mut manifest: Value = serde_json::from_str(&raw).context("malformed sessions manifest")?;

    let limit = (context_token_cap as f64 * threshold) as u64;
    let mut changed = false;

    let entries = match manifest.get_mut("sessions").and_then(|s| s.as_object_mut()) {
        Some(map) => map,
        None => match manifest.as_object_mut() {
            Some(map) => map,
            None => return Ok(report),
        },
    };

    for (session_id, entry) in entries.iter_mut() {
        let Some(obj) = entry.as_object_mut() else {
            continue;
        };
        let Some(file) = obj.get("sessionFile").and_then(|v| v.as_str()).map(String::from) else {
            continue;
        };
        if !obj.contains_key("contextTokens") {
            continue;
        }

        let Ok(meta) = std::fs::metadata(&file) else {
            continue;
        };
        let estimate = meta.len() / BYTES_PER_TOKEN;
        if estimate <= limit {
            continue;
        }

        let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S");
        let backup = format!("{file}.overflow-{stamp}.bak");
        if let Err(e) = std::fs::rename(&file, &backup) {
            tracing::error!(session = %session_id, error = %e, "failed to quarantine session file");
            continue;
        }

        obj.remove("sessionFile");
        obj.remove("contextTokens");
        changed = true;
        report.flagged.push(session_id.clone());
        tracing::warn!(
            session = %session_id,
            estimate,
            limit,
            backup = %backup,
            "session exceeded the context cap and was quarantined"
        );
    }

    if changed {
        std::fs::write(manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("failed to rewrite {}", manifest_path.display()))?;
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("lily-session-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn missing_manifest_is_quietly_skipped() {
        let dir = temp_dir("missing");
        let report = guard_sessions(&dir.join("sessions.json"), 0.8, 1000).unwrap();
        assert!(report.flagged.is_empty());
    }

    #[test]
    fn oversized_session_is_quarantined() {
        let dir = temp_dir("big");
        let session_file = dir.join("abc.jsonl");
        // 8000 bytes → ~2000 tokens, over 0.8 × 1000
        std::fs::write(&session_file, "x".repeat(8000)).unwrap();

        let manifest_path = dir.join("sessions.json");
        let manifest = serde_json::json!({
            "abc": {
                "sessionFile": session_file.to_string_lossy(),
                "contextTokens": 1999,
                "label": "kept-field"
            }
        });
        std::fs::write(&manifest_path, manifest.to_string()).unwrap();

        let report = guard_sessions(&manifest_path, 0.8, 1000).unwrap();
        assert_eq!(report.flagged, vec!["abc".to_string()]);

        // Original file moved aside
        assert!(!session_file.exists());
        let backups: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".overflow-"))
            .collect();
        assert_eq!(backups.len(), 1);

        // Volatile fields dropped, the rest kept
        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        let entry = &rewritten["abc"];
        assert!(entry.get("sessionFile").is_none());
        assert!(entry.get("contextTokens").is_none());
        assert_eq!(entry["label"], "kept-field");
    }

    #[test]
    fn small_session_is_untouched() {
        let dir = temp_dir("small");
        let session_file = dir.join("abc.jsonl");
        std::fs::write(&session_file, "x".repeat(100)).unwrap();

        let manifest_path = dir.join("sessions.json");
        std::fs::write(
            &manifest_path,
            serde_json::json!({
                "abc": { "sessionFile": session_file.to_string_lossy(), "contextTokens": 25 }
            })
            .to_string(),
        )
        .unwrap();

        let report = guard_sessions(&manifest_path, 0.8, 1000).unwrap();
        assert!(report.flagged.is_empty());
        assert!(session_file.exists());
    }
}
