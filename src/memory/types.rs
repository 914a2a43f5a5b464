//! Core memory type definitions.
//!
//! A [`Decision`] is a single memory row — a free-form description or an
//! (entity, key, value) fact — governed by a [`TtlClass`] that decides its
//! absolute expiry and its per-class quota.

use serde::{Deserialize, Serialize};

/// Time-to-live class of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlClass {
    /// Never expires.
    Permanent,
    /// 90 days.
    Stable,
    /// 14 days.
    Active,
    /// 24 hours — status-like, throwaway facts.
    Session,
}

impl TtlClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent => "permanent",
            Self::Stable => "stable",
            Self::Active => "active",
            Self::Session => "session",
        }
    }

    /// Lifetime of this class, `None` for permanent.
    pub fn lifetime(&self) -> Option<chrono::Duration> {
        match self {
            Self::Permanent => None,
            Self::Stable => Some(chrono::Duration::days(90)),
            Self::Active => Some(chrono::Duration::days(14)),
            Self::Session => Some(chrono::Duration::hours(24)),
        }
    }

    /// Absolute expiry from now, `None` for permanent.
    pub fn expiry_from_now(&self) -> Option<String> {
        self.lifetime()
            .map(|d| (chrono::Utc::now() + d).to_rfc3339())
    }

    /// How many live rows of this class may exist at once. Inserting past
    /// the cap evicts (or, for permanent, demotes) before the write.
    pub fn quota(&self) -> Option<usize> {
        match self {
            Self::Permanent => Some(15),
            Self::Stable => Some(30),
            Self::Active => Some(50),
            Self::Session => None,
        }
    }
}

impl std::fmt::Display for TtlClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TtlClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(Self::Permanent),
            "stable" => Ok(Self::Stable),
            "active" => Ok(Self::Active),
            "session" => Ok(Self::Session),
            _ => Err(format!("unknown TTL class: {s}")),
        }
    }
}

/// A memory row, matching the `decisions` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub session_id: Option<String>,
    /// ISO 8601 creation timestamp.
    pub ts: String,
    pub category: String,
    pub description: String,
    pub rationale: Option<String>,
    pub classification: Option<String>,
    /// Importance in `[0.0, 1.0]`; drives eviction order and recall ranking.
    pub importance: f64,
    pub ttl_class: TtlClass,
    /// Absolute expiry; absent ⇔ permanent.
    pub expires_at: Option<String>,
    pub last_accessed: Option<String>,
    pub entity: Option<String>,
    pub fact_key: Option<String>,
    pub fact_value: Option<String>,
    pub tags: Option<String>,
}

/// A conversation message as the host delivers it. `content` is either a
/// plain string or an array of typed blocks; only text blocks are captured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

impl ChatMessage {
    pub fn text(role: &str, text: &str) -> Self {
        Self {
            role: role.to_string(),
            content: serde_json::Value::String(text.to_string()),
        }
    }

    /// Flatten the content into its text blocks, ignoring anything non-text.
    pub fn text_blocks(&self) -> Vec<&str> {
        match &self.content {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Array(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_lifetimes_and_quotas() {
        assert!(TtlClass::Permanent.lifetime().is_none());
        assert_eq!(TtlClass::Stable.lifetime(), Some(chrono::Duration::days(90)));
        assert_eq!(TtlClass::Active.lifetime(), Some(chrono::Duration::days(14)));
        assert_eq!(TtlClass::Session.lifetime(), Some(chrono::Duration::hours(24)));

        assert_eq!(TtlClass::Active.quota(), Some(50));
        assert_eq!(TtlClass::Stable.quota(), Some(30));
        assert_eq!(TtlClass::Permanent.quota(), Some(15));
    }

    #[test]
    fn ttl_parses_round_trip() {
        for class in [TtlClass::Permanent, TtlClass::Stable, TtlClass::Active, TtlClass::Session] {
            assert_eq!(class.as_str().parse::<TtlClass>().unwrap(), class);
        }
        assert!("eternal".parse::<TtlClass>().is_err());
    }

    #[test]
    fn text_blocks_flatten_strings_and_arrays() {
        let plain = ChatMessage::text("user", "hello there");
        assert_eq!(plain.text_blocks(), vec!["hello there"]);

        let structured = ChatMessage {
            role: "assistant".into(),
            content: serde_json::json!([
                {"type": "text", "text": "first"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "second"},
            ]),
        };
        assert_eq!(structured.text_blocks(), vec!["first", "second"]);

        let odd = ChatMessage {
            role: "user".into(),
            content: serde_json::json!(42),
        };
        assert!(odd.text_blocks().is_empty());
    }
}
