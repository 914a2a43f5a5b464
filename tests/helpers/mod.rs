#![allow(dead_code)]

use lily::config::LilyConfig;
use lily::db::Store;
use lily::hooks::HostAdapter;
use lily::memory::types::ChatMessage;
use lily::pipeline::types::PipelineSpec;
use std::sync::Arc;

/// Open a fresh in-memory store with schema and migrations applied.
pub fn test_store() -> Arc<Store> {
    Store::open_in_memory().unwrap()
}

/// Host adapter over an in-memory store, with the embedding service
/// disabled and a unique topic-history sidecar.
pub fn test_adapter(tag: &str) -> HostAdapter {
    let path = std::env::temp_dir().join(format!(
        "lily-it-topic-{tag}-{}.json",
        std::process::id()
    ));
    let _ = std::fs::remove_file(&path);

    let mut config = LilyConfig::default();
    config.vector_search = false;
    config.topic_history_path = path.to_string_lossy().into_owned();
    HostAdapter::new(test_store(), Arc::new(config)).unwrap()
}

pub fn user_msg(text: &str) -> ChatMessage {
    ChatMessage::text("user", text)
}

pub fn assistant_msg(text: &str) -> ChatMessage {
    ChatMessage::text("assistant", text)
}

/// Deserialize a pipeline spec from inline JSON.
pub fn spec(json: serde_json::Value) -> PipelineSpec {
    serde_json::from_value(json).unwrap()
}
