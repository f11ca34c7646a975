//! Runs against a live PostgreSQL when `PERSONA_TEST_DATABASE_URL` is set.
#![cfg(feature = "postgres")]

use persona_identity::Id;
use persona_storage::{
    connect_with_retry, IndexDef, IndexEntry, IndexQuery, KvBackend, PostgresBackend, RetryPolicy,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;

struct Fixture {
    backend: PostgresBackend,
    table: String,
    index: String,
}

async fn fixture(prefix: &str) -> Option<Fixture> {
    let url = std::env::var("PERSONA_TEST_DATABASE_URL").ok()?;
    let pool = connect_with_retry(&RetryPolicy::default(), || {
        PgPoolOptions::new().max_connections(4).connect(&url)
    })
    .await
    .unwrap();

    let suffix = format!("{:08x}", rand::random::<u32>());
    let id = Id::root(prefix).child(&suffix);
    let by_owner = IndexDef::new(id.child("owner"), |value: &Value| {
        value["owner"]
            .as_str()
            .map(|owner| vec![IndexEntry::with_inline(owner, value["size"].clone())])
            .unwrap_or_default()
    });
    let table = id.to_safe_name();
    let index = by_owner.table.clone();
    let backend = PostgresBackend::open(pool, &table, vec![by_owner])
        .await
        .unwrap();
    Some(Fixture {
        backend,
        table,
        index,
    })
}

async fn drop_tables(backend: &PostgresBackend, tables: &[String]) {
    for table in tables {
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{table}" CASCADE"#))
            .execute(backend.pool())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn rows_and_indexes_stay_in_step() {
    let Some(Fixture {
        backend,
        table,
        index,
    }) = fixture("pgtest").await
    else {
        return;
    };

    backend.set("a", json!({ "owner": "ann", "size": 1 })).await.unwrap();
    backend.set("b", json!({ "owner": "bob", "size": 2 })).await.unwrap();
    backend.set("c", json!({ "owner": "ann", "size": 3 })).await.unwrap();

    let hits = backend.lookup(&index, "ann", IndexQuery::INLINE).await.unwrap();
    let keys: Vec<_> = hits.iter().map(|hit| hit.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "c"]);
    assert_eq!(hits[1].inline, Some(json!(3)));
    assert_eq!(hits[1].value, None);

    backend.set("a", json!({ "owner": "bob", "size": 9 })).await.unwrap();
    assert!(backend.del("c").await.unwrap());
    assert!(backend.lookup(&index, "ann", IndexQuery::KEYS).await.unwrap().is_empty());

    let hits = backend.lookup(&index, "bob", IndexQuery::VALUES).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].value.as_ref().unwrap()["size"], 9);

    let next = backend
        .modify(
            "b",
            Box::new(|current: Option<Value>| {
                current.map(|mut v| {
                    v["size"] = json!(v["size"].as_i64().unwrap_or(0) + 1);
                    v
                })
            }),
        )
        .await
        .unwrap();
    assert_eq!(next.unwrap()["size"], 3);

    let first = backend.key_batch(None, 1).await.unwrap();
    assert_eq!(first, vec!["a"]);
    let rest = backend.key_batch(Some("a"), 10).await.unwrap();
    assert_eq!(rest, vec!["b"]);

    drop_tables(&backend, &[index, table]).await;
}

#[tokio::test]
async fn concurrent_modify_creates_a_missing_key_once() {
    let Some(Fixture {
        backend,
        table,
        index,
    }) = fixture("pgcount").await
    else {
        return;
    };

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let backend = backend.clone();
        tasks.push(tokio::spawn(async move {
            backend
                .modify(
                    "counter",
                    Box::new(|current: Option<Value>| {
                        let n = current.map_or(0, |v| v["size"].as_i64().unwrap_or(0));
                        Some(json!({ "owner": "ann", "size": n + 1 }))
                    }),
                )
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(backend.get("counter").await.unwrap().unwrap()["size"], 16);
    let hits = backend.lookup(&index, "ann", IndexQuery::INLINE).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].inline, Some(json!(16)));

    drop_tables(&backend, &[index, table]).await;
}
