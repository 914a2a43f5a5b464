//! Heuristic fact extraction from free-form conversation text.
//!
//! Two shapes are recognized: dotted assignments (`kevin.editor = helix`,
//! `Project.deadline: Friday`) and preference clauses (`Kevin prefers
//! TypeScript for new services`). Candidates still pass through entity
//! acceptance and the security layer before anything is stored.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Longest value accepted at the extraction layer.
pub const MAX_VALUE_LEN: usize = 200;

/// Inputs shorter than this produce no topic signature.
const MIN_SIGNATURE_INPUT: usize = 30;

/// A candidate fact awaiting entity acceptance and security review.
#[derive(Debug, Clone, PartialEq)]
pub struct FactCandidate {
    pub entity: String,
    pub key: String,
    pub value: String,
}

static DOTTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Za-z][A-Za-z0-9_-]{0,59})\.([A-Za-z][A-Za-z0-9_-]{0,59})\s*[=:]\s*([^\n]+)")
        .expect("dotted fact pattern")
});

static CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b([A-Z][a-z][A-Za-z0-9_-]*)\s+(prefers|likes|dislikes|loves|hates|uses|needs|wants|owns|recommends|works at|works on|lives in)\s+([^\n.;!?]+)",
    )
    .expect("clause fact pattern")
});

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9_]+").expect("word pattern"));

const STOPWORDS: &[&str] = &[
    "the", "and", "that", "this", "with", "from", "have", "has", "had", "was", "were", "will",
    "would", "should", "could", "about", "into", "over", "then", "than", "them", "they", "their",
    "there", "these", "those", "what", "when", "where", "which", "while", "your", "yours", "just",
    "like", "also", "been", "being", "because", "but", "for", "not", "are", "you", "our", "can",
    "may", "might", "must", "does", "did", "doing", "some", "such", "very", "more", "most", "any",
    "all", "its", "it's", "i'm", "we're", "let's", "here", "now", "out", "how", "why", "who",
];

/// Extract fact candidates from one text block. Order of appearance is
/// preserved; dotted assignments win over clause matches on overlap.
pub fn extract_facts(text: &str) -> Vec<FactCandidate> {
    let mut found = Vec::new();
    let mut claimed: Vec<(usize, usize)> = Vec::new();

    for caps in DOTTED_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match 0");
        let value = clean_value(&caps[3]);
        if value.is_empty() || value.chars().count() > MAX_VALUE_LEN {
            continue;
        }
        claimed.push((whole.start(), whole.end()));
        found.push(FactCandidate {
            entity: caps[1].to_string(),
            key: caps[2].to_lowercase(),
            value,
        });
    }

    for caps in CLAUSE_RE.captures_iter(text) {
        let whole = caps.get(0).expect("match 0");
        if claimed.iter().any(|&(s, e)| whole.start() < e && whole.end() > s) {
            continue;
        }
        let value = clean_value(&caps[3]);
        if value.is_empty() || value.chars().count() > MAX_VALUE_LEN {
            continue;
        }
        found.push(FactCandidate {
            entity: caps[1].to_string(),
            key: caps[2].to_lowercase().replace(' ', "_"),
            value,
        });
    }

    found
}

fn clean_value(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(['.', ',', ';'])
        .trim()
        .to_string()
}

/// Compress a text into a topic signature: the five most frequent keywords,
/// sorted lexicographically and comma-joined. Used by the stuck detector to
/// spot conversations circling the same topic. Returns `None` for short
/// inputs.
pub fn topic_signature(text: &str) -> Option<String> {
    if text.chars().count() < MIN_SIGNATURE_INPUT {
        return None;
    }

    let lowered = text.to_lowercase();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for m in WORD_RE.find_iter(&lowered) {
        let token = m.as_str();
        if token.chars().count() <= 3 || STOPWORDS.contains(&token) {
            continue;
        }
        *counts.entry(token).or_insert(0) += 1;
    }
    if counts.is_empty() {
        return None;
    }

    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));

    let mut top: Vec<&str> = ranked.iter().take(5).map(|(t, _)| *t).collect();
    top.sort_unstable();
    Some(top.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_dotted_assignment() {
        let facts = extract_facts("For the record: kevin.editor = helix these days.");
        assert_eq!(
            facts,
            vec![FactCandidate {
                entity: "kevin".into(),
                key: "editor".into(),
                value: "helix these days".into(),
            }]
        );
    }

    #[test]
    fn extracts_preference_clause() {
        let facts = extract_facts("Kevin prefers TypeScript for new services.");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].entity, "Kevin");
        assert_eq!(facts[0].key, "prefers");
        assert_eq!(facts[0].value, "TypeScript for new services");
    }

    #[test]
    fn multi_word_verb_becomes_snake_key() {
        let facts = extract_facts("Dana works at Initech now");
        assert_eq!(facts[0].key, "works_at");
        assert_eq!(facts[0].value, "Initech now");
    }

    #[test]
    fn oversize_values_are_discarded() {
        let text = format!("kevin.notes = {}", "a".repeat(300));
        assert!(extract_facts(&text).is_empty());
    }

    #[test]
    fn dotted_wins_over_clause_on_overlap() {
        let facts = extract_facts("Kevin.prefers = dark roast");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].entity, "Kevin");
        assert_eq!(facts[0].value, "dark roast");
    }

    #[test]
    fn plain_chatter_yields_nothing() {
        assert!(extract_facts("how are you today? all good here.").is_empty());
    }

    #[test]
    fn signature_requires_minimum_input() {
        assert!(topic_signature("too short").is_none());
        assert!(topic_signature(&"deploy the billing service again ".repeat(3)).is_some());
    }

    #[test]
    fn signature_is_sorted_and_capped_at_five() {
        let text = "deploy deploy deploy billing billing service pipeline rollback metrics cache cache cache";
        let sig = topic_signature(text).unwrap();
        let parts: Vec<&str> = sig.split(',').collect();
        assert!(parts.len() <= 5);
        let mut sorted = parts.clone();
        sorted.sort_unstable();
        assert_eq!(parts, sorted);
        assert!(parts.contains(&"deploy"));
        assert!(parts.contains(&"cache"));
    }

    #[test]
    fn signature_drops_stopwords_and_short_tokens() {
        let sig = topic_signature(
            "the cat and the dog ran to the big parking structure yesterday evening",
        )
        .unwrap();
        assert!(!sig.contains("the"));
        assert!(!sig.contains("cat")); // 3 chars, dropped
        assert!(sig.contains("parking"));
    }

    #[test]
    fn identical_text_gives_identical_signature() {
        let text = "investigating the flaky checkout pipeline failures on staging again";
        assert_eq!(topic_signature(text), topic_signature(text));
    }
}
