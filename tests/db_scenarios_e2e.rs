//! End-to-end scenarios over the in-memory backend.

mod common;

use serde_json::{json, Map, Value};
use std::sync::Arc;

use quiver_db::{
    DbConfig, DbError, ExportOptions, FilterOp, ImportOptions, InsertData, QueryFilter,
    SearchQuery, VectorDb,
};

fn meta(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("metadata must be an object"),
    }
}

fn insert_vec(vector: Vec<f32>, metadata: Value) -> InsertData {
    InsertData::from_vector(vector).with_metadata(meta(metadata))
}

async fn axis_db() -> (VectorDb, Vec<String>) {
    let db = VectorDb::new(DbConfig::in_memory("scenarios", 3)).unwrap();
    db.initialize().await.unwrap();
    let mut ids = Vec::new();
    for (vector, cat) in [
        (vec![1.0, 0.0, 0.0], "A"),
        (vec![0.0, 1.0, 0.0], "B"),
        (vec![0.0, 0.0, 1.0], "A"),
    ] {
        ids.push(
            db.insert(insert_vec(vector, json!({"cat": cat})))
                .await
                .unwrap(),
        );
    }
    (db, ids)
}

#[tokio::test]
async fn s1_basic_insert_search() {
    let (db, ids) = axis_db().await;

    let hits = db
        .search(SearchQuery::from_vector(vec![1.0, 0.0, 0.0]).with_k(2))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, ids[0]);
    assert!((hits[0].score - 1.0).abs() < 1e-5);
    assert_eq!(db.size().await.unwrap(), 3);
}

#[tokio::test]
async fn s2_filtered_search() {
    let (db, ids) = axis_db().await;

    let query = SearchQuery::from_vector(vec![1.0, 0.0, 0.0])
        .with_k(5)
        .with_filter(QueryFilter::eq("cat", "A"));
    let hits = db.search(query).await.unwrap();

    let got: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    assert_eq!(got, vec![ids[0].as_str(), ids[2].as_str()]);
}

#[tokio::test]
async fn s3_compound_filter() {
    let (db, _ids) = axis_db().await;
    let v4 = db
        .insert(insert_vec(
            vec![0.9, 0.1, 0.0],
            json!({"cat": "A", "score": 10}),
        ))
        .await
        .unwrap();
    db.insert(insert_vec(
        vec![0.8, 0.2, 0.0],
        json!({"cat": "A", "score": 5}),
    ))
    .await
    .unwrap();

    let filter = QueryFilter::and(vec![
        QueryFilter::eq("cat", "A"),
        QueryFilter::leaf("score", FilterOp::Gte, 10),
    ]);
    let hits = db
        .search(
            SearchQuery::from_vector(vec![1.0, 0.0, 0.0])
                .with_k(10)
                .with_filter(filter),
        )
        .await
        .unwrap();

    // v1 and v3 carry no `score` field, so the gte clause rejects them.
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, v4);
}

#[tokio::test]
async fn s4_delete_then_search() {
    let db = VectorDb::new(DbConfig::in_memory("s4", 3)).unwrap();
    db.initialize().await.unwrap();
    let id1 = db
        .insert(insert_vec(vec![1.0, 0.0, 0.0], json!({})))
        .await
        .unwrap();
    db.insert(insert_vec(vec![0.0, 1.0, 0.0], json!({})))
        .await
        .unwrap();

    assert!(db.delete(&id1).await.unwrap());
    assert!(!db.delete(&id1).await.unwrap(), "second delete finds nothing");

    let hits = db
        .search(SearchQuery::from_vector(vec![1.0, 0.0, 0.0]).with_k(5))
        .await
        .unwrap();
    assert!(hits.iter().all(|h| h.id != id1));
    assert_eq!(db.size().await.unwrap(), 1);
}

fn rich_metadata(i: usize) -> Value {
    json!({
        "label": format!("record-{i}"),
        "rank": i,
        "tags": ["alpha", "beta", format!("t{}", i % 7)],
        "nested": {
            "flag": i % 2 == 0,
            "weights": [i, i * 2, i * 3],
            "inner": {"path": format!("/data/{i}")}
        }
    })
}

fn spread_vector(i: usize) -> Vec<f32> {
    let angle = i as f32 * 0.37;
    vec![angle.cos(), angle.sin(), (i as f32 * 0.05).tanh()]
}

#[tokio::test]
async fn s5_export_import_roundtrip() {
    let db = VectorDb::new(DbConfig::in_memory("s5", 3)).unwrap();
    db.initialize().await.unwrap();

    let items: Vec<InsertData> = (0..50)
        .map(|i| insert_vec(spread_vector(i), rich_metadata(i)))
        .collect();
    let ids = db.insert_batch(items).await.unwrap();
    assert_eq!(ids.len(), 50);

    let envelope = db.export(ExportOptions::default()).await.unwrap();
    assert_eq!(envelope.metadata.vector_count, 50);
    assert!(!envelope.index.is_empty());

    let original = envelope
        .vectors
        .iter()
        .find(|r| r.id == ids[17])
        .cloned()
        .unwrap();

    db.clear().await.unwrap();
    assert_eq!(db.size().await.unwrap(), 0);

    let imported = db
        .import(
            envelope,
            ImportOptions {
                clear_existing: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(imported, 50);
    assert_eq!(db.size().await.unwrap(), 50);

    // One record field-for-field, hydrated through the search path.
    let hits = db
        .search(
            SearchQuery::from_vector(original.vector.clone())
                .with_k(1)
                .with_vectors(),
        )
        .await
        .unwrap();
    assert_eq!(hits[0].id, original.id);
    assert_eq!(hits[0].metadata, original.metadata);
    assert_eq!(hits[0].vector.as_ref().unwrap(), &original.vector);
}

#[tokio::test]
async fn s6_corrupted_index_recovers_by_rebuild() {
    let db = VectorDb::new(DbConfig::in_memory("s6", 3)).unwrap();
    db.initialize().await.unwrap();
    let items: Vec<InsertData> = (0..20)
        .map(|i| insert_vec(spread_vector(i), json!({"i": i})))
        .collect();
    let ids = db.insert_batch(items).await.unwrap();

    let mut envelope = db.export(ExportOptions::default()).await.unwrap();
    envelope.index = "definitely!not//valid@@base64~~garbage".to_string();

    db.import(
        envelope,
        ImportOptions {
            clear_existing: true,
        },
    )
    .await
    .expect("corrupted index must degrade to a rebuild, not fail");

    assert_eq!(db.size().await.unwrap(), 20);
    let hits = db
        .search(SearchQuery::from_vector(spread_vector(7)).with_k(1))
        .await
        .unwrap();
    assert_eq!(hits[0].id, ids[7]);
}

#[tokio::test]
async fn s7_import_dimension_mismatch_leaves_state_alone() {
    let (db, ids) = axis_db().await;
    let mut envelope = db.export(ExportOptions::default()).await.unwrap();
    envelope.metadata.dimensions = 512;

    let err = db
        .import(envelope, ImportOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DbError::DimensionMismatch {
            expected: 3,
            actual: 512
        }
    ));

    // Nothing moved.
    assert_eq!(db.size().await.unwrap(), 3);
    let hits = db
        .search(SearchQuery::from_vector(vec![0.0, 0.0, 1.0]).with_k(1))
        .await
        .unwrap();
    assert_eq!(hits[0].id, ids[2]);
}

#[tokio::test]
async fn count_consistency_against_reference_model() {
    let db = VectorDb::new(DbConfig::in_memory("counts", 3)).unwrap();
    db.initialize().await.unwrap();
    let mut model: Vec<String> = Vec::new();

    for i in 0..30 {
        let id = db
            .insert(insert_vec(spread_vector(i), json!({"i": i})))
            .await
            .unwrap();
        model.push(id);
    }
    assert_eq!(db.size().await.unwrap(), model.len());

    // Delete every third id.
    for id in model.iter().step_by(3) {
        assert!(db.delete(id).await.unwrap());
    }
    model = model
        .iter()
        .enumerate()
        .filter(|(i, _)| i % 3 != 0)
        .map(|(_, id)| id.clone())
        .collect();
    assert_eq!(db.size().await.unwrap(), model.len());

    db.clear().await.unwrap();
    assert_eq!(db.size().await.unwrap(), 0);

    let id = db
        .insert(insert_vec(vec![1.0, 0.0, 0.0], json!({})))
        .await
        .unwrap();
    assert_eq!(db.size().await.unwrap(), 1);
    assert!(db.delete(&id).await.unwrap());
    assert_eq!(db.size().await.unwrap(), 0);
}

#[tokio::test]
async fn index_storage_agreement_after_mutations() {
    let db = VectorDb::new(DbConfig::in_memory("agreement", 3)).unwrap();
    db.initialize().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..15 {
        ids.push(
            db.insert(insert_vec(spread_vector(i), json!({"i": i})))
                .await
                .unwrap(),
        );
    }
    for id in ids.iter().take(5) {
        db.delete(id).await.unwrap();
    }

    let size = db.size().await.unwrap();
    assert_eq!(size, 10);
    assert_eq!(db.index_stats().vector_count, size);

    // Every surviving record is findable by its own vector.
    for (i, id) in ids.iter().enumerate().skip(5) {
        let hits = db
            .search(SearchQuery::from_vector(spread_vector(i)).with_k(size))
            .await
            .unwrap();
        assert!(
            hits.iter().any(|h| &h.id == id),
            "record {i} must be reachable through the index"
        );
    }
}

#[tokio::test]
async fn filter_correctness_returns_exact_subset() {
    let db = VectorDb::new(DbConfig::in_memory("filters", 3)).unwrap();
    db.initialize().await.unwrap();

    let mut expected = Vec::new();
    for i in 0..40 {
        let id = db
            .insert(insert_vec(
                spread_vector(i),
                json!({"group": if i % 4 == 0 { "keep" } else { "skip" }, "i": i}),
            ))
            .await
            .unwrap();
        if i % 4 == 0 {
            expected.push(id);
        }
    }

    let hits = db
        .search(
            SearchQuery::from_vector(vec![1.0, 0.0, 0.0])
                .with_k(1000)
                .with_filter(QueryFilter::eq("group", "keep")),
        )
        .await
        .unwrap();

    let mut got: Vec<String> = hits.into_iter().map(|h| h.id).collect();
    got.sort();
    expected.sort();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn cache_transparency_cold_vs_warm() {
    let db = VectorDb::new(DbConfig::in_memory("cache", 3)).unwrap();
    db.initialize().await.unwrap();
    for i in 0..10 {
        db.insert(insert_vec(spread_vector(i), json!({"i": i})))
            .await
            .unwrap();
    }

    let query = || {
        SearchQuery::from_vector(vec![0.5, 0.5, 0.0])
            .with_k(10)
            .with_vectors()
    };
    let cold = db.search(query()).await.unwrap();
    let warm = db.search(query()).await.unwrap();

    assert_eq!(cold.len(), warm.len());
    for (c, w) in cold.iter().zip(&warm) {
        assert_eq!(c.id, w.id);
        assert_eq!(c.score, w.score);
        assert_eq!(c.vector, w.vector);
    }
}

#[tokio::test]
async fn update_rewrites_vector_and_merges_metadata() {
    let db = VectorDb::new(DbConfig::in_memory("update", 3)).unwrap();
    db.initialize().await.unwrap();
    let id = db
        .insert(insert_vec(vec![1.0, 0.0, 0.0], json!({"keep": 1, "both": "old"})))
        .await
        .unwrap();

    let patched = db
        .update(
            &id,
            quiver_db::UpdatePatch {
                vector: Some(vec![0.0, 1.0, 0.0]),
                text: None,
                metadata: Some(meta(json!({"both": "new", "added": true}))),
            },
        )
        .await
        .unwrap();
    assert!(patched);

    let hits = db
        .search(SearchQuery::from_vector(vec![0.0, 1.0, 0.0]).with_k(1))
        .await
        .unwrap();
    assert_eq!(hits[0].id, id);
    assert_eq!(hits[0].metadata.get("keep"), Some(&json!(1)));
    assert_eq!(hits[0].metadata.get("both"), Some(&json!("new")));
    assert_eq!(hits[0].metadata.get("added"), Some(&json!(true)));

    assert!(!db.update("missing-id", quiver_db::UpdatePatch::default()).await.unwrap());
}

#[tokio::test]
async fn validation_errors_do_not_mutate() {
    let (db, _) = axis_db().await;

    let err = db
        .insert(InsertData::from_vector(vec![1.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DimensionMismatch { .. }));

    let err = db.insert(InsertData::default()).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInsertData(_)));

    let err = db
        .search(SearchQuery::from_vector(vec![1.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DimensionMismatch { .. }));

    let err = db.search(SearchQuery::default()).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidQuery(_)));

    let err = db
        .insert_batch(vec![
            InsertData::from_vector(vec![1.0, 0.0, 0.0]),
            InsertData::from_vector(vec![1.0]),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::DimensionMismatch { .. }));

    assert_eq!(db.size().await.unwrap(), 3, "nothing was inserted");
}

#[tokio::test]
async fn operations_before_initialize_fail() {
    let db = VectorDb::new(DbConfig::in_memory("uninit", 3)).unwrap();
    let err = db
        .insert(InsertData::from_vector(vec![1.0, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotInitialized));

    let err = db.size().await.unwrap_err();
    assert!(matches!(err, DbError::NotInitialized));
}

#[tokio::test]
async fn text_path_uses_embedder_and_cache() {
    use std::sync::atomic::Ordering;

    let embedder = Arc::new(common::StubEmbedder::new(3));
    let db =
        VectorDb::with_embedder(DbConfig::in_memory("text", 3), embedder.clone()).unwrap();
    db.initialize().await.unwrap();

    let id = db
        .insert(InsertData::from_text("the quick brown fox"))
        .await
        .unwrap();

    // The reserved content field records the original text.
    let hits = db
        .search(SearchQuery::from_text("the quick brown fox").with_k(1))
        .await
        .unwrap();
    assert_eq!(hits[0].id, id);
    assert_eq!(
        hits[0].metadata.get("content"),
        Some(&json!("the quick brown fox"))
    );

    let calls_after_two_ops = embedder.embed_calls.load(Ordering::SeqCst);
    assert_eq!(calls_after_two_ops, 1, "second embedding came from the cache");

    db.search(SearchQuery::from_text("the quick brown fox").with_k(1))
        .await
        .unwrap();
    assert_eq!(
        embedder.embed_calls.load(Ordering::SeqCst),
        calls_after_two_ops,
        "repeat query stays cached"
    );
}

#[tokio::test]
async fn model_load_retries_then_succeeds() {
    let embedder = Arc::new(common::StubEmbedder::failing(3, 2));
    let mut config = DbConfig::in_memory("retry", 3);
    config.embedding.max_retries = 3;
    config.embedding.retry_delay_ms = 1;

    let db = VectorDb::with_embedder(config, embedder).unwrap();
    db.initialize().await.unwrap();
    let id = db.insert(InsertData::from_text("hello")).await.unwrap();
    assert!(!id.is_empty());
}

#[tokio::test]
async fn eager_model_load_failure_cleans_up() {
    let embedder = Arc::new(common::StubEmbedder::failing(3, u32::MAX));
    let mut config = DbConfig::in_memory("eager-fail", 3);
    config.embedding.max_retries = 1;
    config.embedding.retry_delay_ms = 1;

    let db = VectorDb::with_embedder(config, embedder).unwrap();
    let err = db.initialize().await.unwrap_err();
    assert!(matches!(err, DbError::Init(_)));

    // Still not initialized afterwards.
    assert!(matches!(db.size().await.unwrap_err(), DbError::NotInitialized));
}

#[tokio::test]
async fn lazy_model_load_defers_failure_to_first_text_op() {
    let embedder = Arc::new(common::StubEmbedder::failing(3, u32::MAX));
    let mut config = DbConfig::in_memory("lazy", 3);
    config.performance.lazy_load_models = true;
    config.embedding.max_retries = 0;

    let db = VectorDb::with_embedder(config, embedder).unwrap();
    db.initialize().await.unwrap();

    // Vector operations work without the model.
    db.insert(InsertData::from_vector(vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();

    let err = db.insert(InsertData::from_text("needs model")).await.unwrap_err();
    assert!(matches!(err, DbError::ModelLoad(_)));
}

#[tokio::test]
async fn embedder_dimension_mismatch_fails_initialize() {
    let embedder = Arc::new(common::StubEmbedder::new(5));
    let db = VectorDb::with_embedder(DbConfig::in_memory("dims", 3), embedder).unwrap();
    let err = db.initialize().await.unwrap_err();
    let DbError::Init(inner) = err else {
        panic!("expected Init wrapper");
    };
    assert!(matches!(*inner, DbError::DimensionMismatch { expected: 3, actual: 5 }));
}

#[tokio::test]
async fn import_merge_without_clear_keeps_existing_records() {
    let (db, ids) = axis_db().await;
    let envelope = db.export(ExportOptions::default()).await.unwrap();

    let other = VectorDb::new(DbConfig::in_memory("merge", 3)).unwrap();
    other.initialize().await.unwrap();
    let pre = other
        .insert(insert_vec(vec![0.5, 0.5, 0.0], json!({"origin": "local"})))
        .await
        .unwrap();

    other
        .import(envelope, ImportOptions::default())
        .await
        .unwrap();

    assert_eq!(other.size().await.unwrap(), 4);
    let hits = other
        .search(SearchQuery::from_vector(vec![0.5, 0.5, 0.0]).with_k(4))
        .await
        .unwrap();
    assert!(hits.iter().any(|h| h.id == pre), "pre-existing record survives");
    assert!(hits.iter().any(|h| h.id == ids[0]), "imported record searchable");
}

#[tokio::test]
async fn dispose_then_reinitialize() {
    let (db, _) = axis_db().await;
    db.dispose().await.unwrap();
    assert!(matches!(db.size().await.unwrap_err(), DbError::NotInitialized));

    db.initialize().await.unwrap();
    // In-memory backend starts empty again after dispose.
    assert_eq!(db.size().await.unwrap(), 0);
}
