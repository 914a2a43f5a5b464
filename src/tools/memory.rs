//! Memory tool parameter definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `memory_search` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemorySearchParams {
    /// Natural-language query for the full-text index.
    #[schemars(description = "Natural-language query for the full-text index")]
    pub query: String,

    /// Maximum results (default 10, cap 100).
    #[schemars(description = "Maximum results (default 10, cap 100)")]
    pub limit: Option<usize>,
}

/// Parameters for the `memory_store` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemoryStoreParams {
    /// Entity the fact is about (e.g. 'Kevin', 'config').
    #[schemars(description = "Entity the fact is about, e.g. 'Kevin' or 'config'")]
    pub entity: String,

    /// Fact key (e.g. 'prefers', 'editor').
    #[schemars(description = "Fact key, e.g. 'prefers' or 'editor'")]
    pub key: String,

    /// Fact value; stored values are capped at 200 chars.
    #[schemars(description = "Fact value (capped at 200 chars)")]
    pub value: String,

    /// TTL class: 'permanent', 'stable', 'active' (default), or 'session'.
    #[schemars(description = "TTL class: 'permanent', 'stable', 'active' (default), or 'session'")]
    pub ttl: Option<String>,

    /// Importance in [0.0, 1.0]. Defaults to 0.7.
    #[schemars(description = "Importance 0.0-1.0, defaults to 0.7")]
    pub importance: Option<f64>,
}

/// Parameters for the `memory_entity` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MemoryEntityParams {
    /// Entity name to list facts for.
    #[schemars(description = "Entity name to list facts for")]
    pub entity: String,
}

/// Parameters for the `memory_semantic_search` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SemanticSearchParams {
    /// Query text to embed and match against stored vectors.
    #[schemars(description = "Query text to embed and match against stored vectors")]
    pub query: String,

    /// Maximum results (default 5, cap 50).
    #[schemars(description = "Maximum results (default 5, cap 50)")]
    pub limit: Option<usize>,

    /// Minimum cosine similarity (default 0.5).
    #[schemars(description = "Minimum cosine similarity (default 0.5)")]
    pub threshold: Option<f32>,
}

/// Parameters for the `memory_add_entity` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AddEntityParams {
    /// Entity name to allow-list.
    #[schemars(description = "Entity name to allow-list")]
    pub name: String,
}

/// Parameters for the `memory_security_log` tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SecurityLogParams {
    /// Maximum events (default 20, cap 100).
    #[schemars(description = "Maximum events (default 20, cap 100)")]
    pub limit: Option<usize>,
}
