//! Memory lifecycle properties: consolidation, quotas, TTL downgrade, and
//! the recall budget.

mod helpers;

use helpers::{test_adapter, test_store, user_msg};
use lily::memory::capture::{self, CapturePolicy, NewFact};
use lily::memory::consolidate::consolidate;
use lily::memory::types::TtlClass;
use lily::entities::EntityRegistry;

fn registry() -> EntityRegistry {
    EntityRegistry::builtin(&["config".into(), "system".into(), "note".into()])
}

#[test]
fn consolidation_keeps_one_row_and_boosts_it() {
    let store = test_store();
    let mut conn = store.lock().unwrap();

    // Two live rows for the same (entity, key), inserted directly so the
    // capture-time collision path does not merge them first.
    for (id, importance, accessed) in [
        ("old", 0.5, "2026-01-01T00:00:00+00:00"),
        ("new", 0.6, "2026-06-01T00:00:00+00:00"),
    ] {
        conn.execute(
            "INSERT INTO decisions (id, ts, description, importance, ttl_class, entity, fact_key, fact_value, last_accessed) \
             VALUES (?1, ?2, 'kevin.editor', ?3, 'active', 'kevin', 'editor', 'helix', ?4)",
            rusqlite::params![id, chrono::Utc::now().to_rfc3339(), importance, accessed],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO vectors (decision_id, content, embedding, model, created_at) \
             VALUES (?1, 'c', x'0000803f', 'm', '2026-01-01')",
            [id],
        )
        .unwrap();
    }

    let report = consolidate(&mut conn).unwrap();
    assert_eq!(report.merged_groups, 1);

    let (survivor, importance): (String, f64) = conn
        .query_row(
            "SELECT id, importance FROM decisions WHERE entity = 'kevin'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(survivor, "new");
    // importance ≥ max(inputs) + 0.05, capped at 0.95
    assert!(importance >= 0.65 - 1e-9);

    let orphan_vectors: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM vectors WHERE decision_id = 'old'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(orphan_vectors, 0);
}

#[test]
fn quota_holds_the_active_class_at_its_cap() {
    let store = test_store();
    let conn = store.lock().unwrap();

    for i in 0..51 {
        capture::upsert_fact(
            &conn,
            NewFact {
                entity: &format!("Person{i}"),
                key: "likes",
                value: "things",
                ttl: TtlClass::Active,
                importance: 0.3 + (i as f64) * 0.01,
                session_id: None,
                tags: None,
            },
        )
        .unwrap();
    }

    assert_eq!(capture::live_count(&conn, TtlClass::Active).unwrap(), 50);
    // The lowest-importance row (Person0) was the eviction victim
    let evicted: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM decisions WHERE entity = 'person0'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(evicted, 0);
}

#[test]
fn status_keys_downgrade_even_when_permanent_is_requested() {
    let store = test_store();
    let conn = store.lock().unwrap();

    let ttl = capture::derive_ttl("status_x", TtlClass::Permanent);
    assert_eq!(ttl, TtlClass::Session);

    capture::upsert_fact(
        &conn,
        NewFact {
            entity: "Kevin",
            key: "status_x",
            value: "done",
            ttl,
            importance: 0.7,
            session_id: None,
            tags: None,
        },
    )
    .unwrap();

    let (stored_ttl, expires): (String, Option<String>) = conn
        .query_row(
            "SELECT ttl_class, expires_at FROM decisions WHERE entity = 'kevin'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(stored_ttl, "session");
    assert!(expires.is_some(), "session rows carry an absolute expiry");
}

#[test]
fn expired_rows_are_invisible_to_capture_collisions() {
    let store = test_store();
    let conn = store.lock().unwrap();

    let past = (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    conn.execute(
        "INSERT INTO decisions (id, ts, description, ttl_class, expires_at, entity, fact_key, fact_value) \
         VALUES ('dead', ?1, 'd', 'session', ?2, 'kevin', 'prefers', 'stale value')",
        rusqlite::params![chrono::Utc::now().to_rfc3339(), past],
    )
    .unwrap();

    // A new fact for the same (entity, key) inserts fresh instead of
    // updating the expired row.
    let result = capture::upsert_fact(
        &conn,
        NewFact {
            entity: "Kevin",
            key: "prefers",
            value: "fresh value",
            ttl: TtlClass::Active,
            importance: 0.5,
            session_id: None,
            tags: None,
        },
    )
    .unwrap();
    assert!(!result.updated);

    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM decisions WHERE entity = 'kevin'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn capture_respects_the_per_turn_cap() {
    let store = test_store();
    let conn = store.lock().unwrap();

    let messages = vec![user_msg(
        "Kevin prefers TypeScript for services. Dana uses emacs every day. \
         Priya likes rust tooling. Marco wants faster reviews.",
    )];
    let outcome = capture::capture(&conn, &registry(), &messages, CapturePolicy::All, 3, None).unwrap();
    assert_eq!(outcome.stored, 3);
}

#[tokio::test]
async fn recall_budget_is_respected_end_to_end() {
    let adapter = test_adapter("budget");

    // Seed enough permanent facts to overflow a small budget
    {
        let conn = adapter.store().lock().unwrap();
        for i in 0..15 {
            conn.execute(
                "INSERT INTO decisions (id, ts, description, importance, ttl_class, entity, fact_key, fact_value) \
                 VALUES (?1, ?2, ?3, 0.9, 'permanent', 'kevin', ?4, ?5)",
                rusqlite::params![
                    format!("p{i}"),
                    chrono::Utc::now().to_rfc3339(),
                    format!("kevin.k{i}: value number {i} with some extra words attached"),
                    format!("k{i}"),
                    format!("value number {i} with some extra words attached"),
                ],
            )
            .unwrap();
        }
    }

    let payload = adapter
        .before_agent_start("tell me about kevin and his values")
        .await
        .expect("payload expected");
    assert!(
        payload.chars().count() <= adapter.config().injection_budget,
        "payload must fit the injection budget"
    );
}
