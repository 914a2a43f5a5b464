//! Configuration: TOML file under the memory root plus environment
//! overrides.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LilyConfig {
    /// Database path; must resolve under `~/.openclaw/memory/`.
    pub db_path: String,
    pub log_level: String,

    /// Inject a context payload before each agent turn.
    pub auto_recall: bool,
    /// Mine facts from each finished turn.
    pub auto_capture: bool,
    pub max_recall_results: usize,
    pub max_capture_per_turn: usize,
    /// Topic-repetition nudge in the host adapter.
    pub stuck_detection: bool,

    pub vector_search: bool,
    pub ollama_url: String,
    pub embedding_model: String,
    pub vector_similarity_threshold: f32,
    /// Default model for local dispatch when the tier names none.
    pub local_model: String,

    pub topic_history_path: String,
    /// Character budget for one injected payload.
    pub injection_budget: usize,
    pub context_token_cap: usize,
    /// `all`, `assistant-only`, or `tagged-only`.
    pub capture_policy: String,
    pub protected_entities: Vec<String>,
    pub session_overflow_threshold: f64,
    /// Extra allow-listed entities.
    pub entities: Vec<String>,
    /// Run consolidation at service start.
    pub consolidation: bool,
}

impl Default for LilyConfig {
    fn default() -> Self {
        let root = crate::db::memory_root();
        Self {
            db_path: root.join("lily.db").to_string_lossy().into_owned(),
            log_level: "info".into(),
            auto_recall: true,
            auto_capture: true,
            max_recall_results: 10,
            max_capture_per_turn: 5,
            stuck_detection: true,
            vector_search: true,
            ollama_url: "http://127.0.0.1:11434".into(),
            embedding_model: "nomic-embed-text".into(),
            vector_similarity_threshold: 0.5,
            local_model: "qwen2.5:7b".into(),
            topic_history_path: root.join("topic-history.json").to_string_lossy().into_owned(),
            injection_budget: 2000,
            context_token_cap: 200_000,
            capture_policy: "all".into(),
            protected_entities: vec!["config".into(), "system".into(), "note".into()],
            session_overflow_threshold: 0.8,
            entities: Vec::new(),
            consolidation: true,
        }
    }
}

/// Default config file path: `~/.openclaw/memory/config.toml`.
pub fn default_config_path() -> PathBuf {
    crate::db::memory_root().join("config.toml")
}

impl LilyConfig {
    /// Load config from the default TOML file (if present) then apply env
    /// overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            LilyConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (LILY_DB, LILY_OLLAMA_URL,
    /// LILY_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LILY_DB") {
            self.db_path = val;
        }
        if let Ok(val) = std::env::var("LILY_OLLAMA_URL") {
            self.ollama_url = val;
        }
        if let Ok(val) = std::env::var("LILY_LOG_LEVEL") {
            self.log_level = val;
        }
    }

    /// The sessions manifest lives next to the database.
    pub fn sessions_manifest_path(&self) -> PathBuf {
        crate::db::memory_root().join("sessions.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = LilyConfig::default();
        assert!(config.db_path.ends_with("lily.db"));
        assert_eq!(config.max_recall_results, 10);
        assert_eq!(config.injection_budget, 2000);
        assert_eq!(config.capture_policy, "all");
        assert_eq!(config.protected_entities.len(), 3);
        assert!((config.session_overflow_threshold - 0.8).abs() < 1e-9);
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
log_level = "debug"
max_capture_per_turn = 3
capture_policy = "assistant-only"
ollama_url = "http://10.0.0.5:11434"
entities = ["initech", "roadmap"]
"#;
        let config: LilyConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_capture_per_turn, 3);
        assert_eq!(config.capture_policy, "assistant-only");
        assert_eq!(config.ollama_url, "http://10.0.0.5:11434");
        assert_eq!(config.entities.len(), 2);
        // defaults still apply for unset fields
        assert_eq!(config.max_recall_results, 10);
        assert!(config.auto_recall);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = LilyConfig::default();
        std::env::set_var("LILY_DB", "~/.openclaw/memory/override.db");
        std::env::set_var("LILY_OLLAMA_URL", "http://other:11434");
        std::env::set_var("LILY_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.db_path, "~/.openclaw/memory/override.db");
        assert_eq!(config.ollama_url, "http://other:11434");
        assert_eq!(config.log_level, "trace");

        std::env::remove_var("LILY_DB");
        std::env::remove_var("LILY_OLLAMA_URL");
        std::env::remove_var("LILY_LOG_LEVEL");
    }
}
