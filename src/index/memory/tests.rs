use super::*;
use crate::index::Metadata;
use serde_json::json;
use std::sync::Arc;

fn record(id: &str, embedding: Vec<f32>, source: &str) -> VectorRecord {
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), json!(source));
    metadata.insert("content".to_string(), json!(format!("content of {}", id)));
    VectorRecord {
        id: id.to_string(),
        embedding,
        metadata,
    }
}

#[tokio::test]
async fn identical_vector_is_top_result_with_zero_distance() {
    let index = InMemoryIndex::new(3, DistanceMetric::Cosine);
    index
        .upsert(&[
            record("a", vec![1.0, 0.0, 0.0], "x"),
            record("b", vec![0.0, 1.0, 0.0], "x"),
            record("c", vec![0.7, 0.7, 0.0], "x"),
        ])
        .await
        .expect("should upsert");

    let results = index
        .search(&[0.0, 1.0, 0.0], 3, None)
        .await
        .expect("should search");

    assert_eq!(results[0].id, "b");
    assert!(results[0].distance.abs() < 1e-6);
}

#[tokio::test]
async fn results_are_bounded_and_sorted() {
    let index = InMemoryIndex::new(2, DistanceMetric::SquaredL2);
    let records: Vec<VectorRecord> = (0..10)
        .map(|i| record(&format!("r{}", i), vec![i as f32, 0.0], "x"))
        .collect();
    index.upsert(&records).await.expect("should upsert");

    let results = index
        .search(&[4.2, 0.0], 4, None)
        .await
        .expect("should search");

    assert_eq!(results.len(), 4);
    assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    assert_eq!(results[0].id, "r4");
    assert!(index.search(&[0.0, 0.0], 0, None).await.expect("should search").is_empty());
}

#[tokio::test]
async fn equal_distances_rank_by_insertion_order() {
    let index = InMemoryIndex::new(2, DistanceMetric::Cosine);
    index
        .upsert(&[
            record("first", vec![1.0, 0.0], "x"),
            record("second", vec![1.0, 0.0], "x"),
        ])
        .await
        .expect("should upsert");
    index
        .upsert(&[record("third", vec![1.0, 0.0], "x")])
        .await
        .expect("should upsert");

    let ids: Vec<String> = index
        .search(&[1.0, 0.0], 3, None)
        .await
        .expect("should search")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec!["first", "second", "third"]);
}

#[tokio::test]
async fn upsert_is_idempotent_and_last_write_wins() {
    let index = InMemoryIndex::new(2, DistanceMetric::Cosine);
    let original = record("doc#0", vec![1.0, 0.0], "old");
    index.upsert(&[original.clone()]).await.expect("should upsert");
    index.upsert(&[original]).await.expect("should upsert");
    assert_eq!(index.count().await.expect("should count"), 1);

    index
        .upsert(&[record("doc#0", vec![0.0, 1.0], "new")])
        .await
        .expect("should upsert");

    assert_eq!(index.count().await.expect("should count"), 1);
    let stored = index.get("doc#0").await.expect("record should exist");
    assert_eq!(stored.embedding, vec![0.0, 1.0]);
    assert_eq!(stored.metadata["source"], "new");
}

#[tokio::test]
async fn dimension_mismatch_writes_nothing() {
    let index = InMemoryIndex::new(768, DistanceMetric::Cosine);
    index
        .upsert(&[record("existing", vec![0.1; 768], "x")])
        .await
        .expect("should upsert");

    let result = index
        .upsert(&[
            record("valid", vec![0.1; 768], "x"),
            record("x", vec![0.1; 512], "x"),
        ])
        .await;

    assert_eq!(
        result,
        Err(IndexError::DimensionMismatch {
            id: "x".to_string(),
            expected: 768,
            actual: 512,
        })
    );
    assert_eq!(index.count().await.expect("should count"), 1);
    assert!(index.get("valid").await.is_none());
}

#[tokio::test]
async fn query_dimension_is_checked() {
    let index = InMemoryIndex::new(4, DistanceMetric::Cosine);
    let result = index.search(&[1.0, 0.0], 1, None).await;
    assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
}

#[tokio::test]
async fn filters_restrict_candidates() {
    let index = InMemoryIndex::new(2, DistanceMetric::Cosine);
    index
        .upsert(&[
            record("a", vec![1.0, 0.0], "faq"),
            record("b", vec![1.0, 0.1], "guide"),
        ])
        .await
        .expect("should upsert");

    let mut filter = SearchFilter::new();
    filter.insert("source".to_string(), json!("guide"));
    let results = index
        .search(&[1.0, 0.0], 5, Some(&filter))
        .await
        .expect("should search");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "b");
}

#[tokio::test]
async fn concurrent_reads_during_writes() {
    let index = Arc::new(InMemoryIndex::new(2, DistanceMetric::Cosine));
    index
        .upsert(&[record("seed", vec![1.0, 0.0], "x")])
        .await
        .expect("should upsert");

    let mut handles = Vec::new();
    for i in 0..8 {
        let index = Arc::clone(&index);
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                index
                    .upsert(&[record(&format!("w{}", i), vec![0.0, 1.0], "x")])
                    .await
                    .map(|()| 0)
            } else {
                index.search(&[1.0, 0.0], 10, None).await.map(|r| r.len())
            }
        }));
    }

    for handle in handles {
        let result = handle.await.expect("task should not panic");
        assert!(result.is_ok());
    }
    assert_eq!(index.count().await.expect("should count"), 5);
}
