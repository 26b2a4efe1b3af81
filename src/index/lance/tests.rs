use super::*;
use serde_json::json;
use tempfile::TempDir;

fn create_test_record(id: &str, vector: Vec<f32>, source: &str, chunk_index: u32) -> VectorRecord {
    let mut metadata = Metadata::new();
    metadata.insert("source".to_string(), json!(source));
    metadata.insert("chunk_index".to_string(), json!(chunk_index));
    metadata.insert(
        "content".to_string(),
        json!(format!("This is test content for chunk {}", id)),
    );
    VectorRecord {
        id: id.to_string(),
        embedding: vector,
        metadata,
    }
}

async fn open_test_index(temp_dir: &TempDir, dimension: usize) -> LanceIndex {
    LanceIndex::open(
        &temp_dir.path().join("vectors"),
        "chunks",
        dimension,
        DistanceMetric::Cosine,
    )
    .await
    .expect("should open index")
}

#[tokio::test]
async fn index_initialization() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 4).await;

    assert_eq!(index.table_name(), "chunks");
    assert_eq!(index.dimension(), 4);
    assert_eq!(index.count().await.expect("should count"), 0);
}

#[tokio::test]
async fn upsert_and_search() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 3).await;

    index
        .upsert(&[
            create_test_record("faq#0", vec![1.0, 0.0, 0.0], "faq", 0),
            create_test_record("faq#1", vec![0.0, 1.0, 0.0], "faq", 1),
            create_test_record("guide#0", vec![0.0, 0.0, 1.0], "guide", 0),
        ])
        .await
        .expect("should upsert");

    let results = index
        .search(&[0.0, 1.0, 0.0], 2, None)
        .await
        .expect("should search");

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "faq#1");
    assert!(results[0].distance.abs() < 1e-4);
    assert!(results[0].distance <= results[1].distance);
    assert_eq!(
        results[0].content(),
        Some("This is test content for chunk faq#1")
    );
    assert_eq!(results[0].source(), Some("faq"));
}

#[tokio::test]
async fn upsert_replaces_existing_id() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 2).await;

    let record = create_test_record("doc#0", vec![1.0, 0.0], "old", 0);
    index.upsert(&[record.clone()]).await.expect("should upsert");
    index.upsert(&[record]).await.expect("should upsert again");
    assert_eq!(index.count().await.expect("should count"), 1);

    index
        .upsert(&[create_test_record("doc#0", vec![0.0, 1.0], "new", 0)])
        .await
        .expect("should replace");

    assert_eq!(index.count().await.expect("should count"), 1);
    let results = index
        .search(&[0.0, 1.0], 1, None)
        .await
        .expect("should search");
    assert_eq!(results[0].source(), Some("new"));
}

#[tokio::test]
async fn duplicate_ids_in_one_batch_keep_the_last() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 2).await;

    index
        .upsert(&[
            create_test_record("dup", vec![1.0, 0.0], "first", 0),
            create_test_record("dup", vec![0.0, 1.0], "second", 0),
        ])
        .await
        .expect("should upsert");

    assert_eq!(index.count().await.expect("should count"), 1);
    let results = index
        .search(&[0.0, 1.0], 1, None)
        .await
        .expect("should search");
    assert_eq!(results[0].source(), Some("second"));
}

#[tokio::test]
async fn dimension_mismatch_rejects_batch() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 4).await;

    let result = index
        .upsert(&[
            create_test_record("ok", vec![0.1; 4], "x", 0),
            create_test_record("bad", vec![0.1; 3], "x", 1),
        ])
        .await;

    assert!(matches!(
        result,
        Err(IndexError::DimensionMismatch { ref id, expected: 4, actual: 3 }) if id == "bad"
    ));
    assert_eq!(index.count().await.expect("should count"), 0);
}

#[tokio::test]
async fn reopening_with_other_dimension_fails() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    {
        let index = open_test_index(&temp_dir, 4).await;
        index
            .upsert(&[create_test_record("a", vec![0.5; 4], "x", 0)])
            .await
            .expect("should upsert");
    }

    let reopened = open_test_index(&temp_dir, 4).await;
    assert_eq!(reopened.count().await.expect("should count"), 1);

    let result = LanceIndex::open(
        &temp_dir.path().join("vectors"),
        "chunks",
        8,
        DistanceMetric::Cosine,
    )
    .await;
    assert!(matches!(
        result,
        Err(IndexError::DimensionMismatch {
            expected: 8,
            actual: 4,
            ..
        })
    ));
}

#[tokio::test]
async fn search_with_source_filter() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 2).await;

    index
        .upsert(&[
            create_test_record("a", vec![1.0, 0.0], "faq", 0),
            create_test_record("b", vec![1.0, 0.1], "it's a guide", 0),
        ])
        .await
        .expect("should upsert");

    let mut filter = SearchFilter::new();
    filter.insert("source".to_string(), json!("it's a guide"));
    let results = index
        .search(&[1.0, 0.0], 5, Some(&filter))
        .await
        .expect("should search");

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "b");
}

#[test]
fn filter_predicate_translation() {
    let mut filter = SearchFilter::new();
    filter.insert("source".to_string(), json!("o'brien"));
    filter.insert("chunk_index".to_string(), json!(3));
    assert_eq!(
        filter_predicate(&filter).expect("should translate"),
        "chunk_index = 3 AND source = 'o''brien'"
    );

    let mut unsupported = SearchFilter::new();
    unsupported.insert("lang".to_string(), json!("en"));
    assert!(matches!(
        filter_predicate(&unsupported),
        Err(IndexError::UnsupportedFilter(_))
    ));
}

#[tokio::test]
async fn query_dimension_is_checked() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 4).await;

    let result = index.search(&[1.0, 0.0], 1, None).await;
    assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    assert!(
        index
            .search(&[0.0; 4], 0, None)
            .await
            .expect("should search")
            .is_empty()
    );
}

#[tokio::test]
async fn upsert_replaces_and_inserts_in_one_call() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let index = open_test_index(&temp_dir, 2).await;
    index
        .upsert(&[create_test_record("doc#0", vec![1.0, 0.0], "old", 0)])
        .await
        .expect("should upsert");

    index
        .upsert(&[
            create_test_record("doc#0", vec![0.0, 1.0], "new", 0),
            create_test_record("doc#1", vec![1.0, 0.0], "new", 1),
        ])
        .await
        .expect("should merge");

    assert_eq!(index.count().await.expect("should count"), 2);
    let results = index
        .search(&[0.0, 1.0], 1, None)
        .await
        .expect("should search");
    assert_eq!(results[0].id, "doc#0");
    assert_eq!(results[0].source(), Some("new"));
}

fn result_batch(distances: Option<Float32Array>) -> RecordBatch {
    let mut fields = vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
    ];
    let mut columns: Vec<Arc<dyn Array>> = vec![
        Arc::new(StringArray::from(vec!["doc#0"])),
        Arc::new(StringArray::from(vec![r#"{"source":"faq"}"#])),
    ];
    if let Some(distances) = distances {
        fields.push(Field::new("_distance", DataType::Float32, true));
        columns.push(Arc::new(distances));
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).expect("should build batch")
}

#[test]
fn missing_distance_column_is_a_backend_error() {
    let result = parse_search_batch(&result_batch(None));

    assert!(matches!(result, Err(IndexError::Backend(_))));
}

#[test]
fn null_distance_is_a_backend_error() {
    let result = parse_search_batch(&result_batch(Some(Float32Array::from(vec![None]))));

    assert!(matches!(result, Err(IndexError::Backend(_))));
}

#[test]
fn distance_column_is_read_per_row() {
    let results = parse_search_batch(&result_batch(Some(Float32Array::from(vec![0.25]))))
        .expect("should parse");

    assert_eq!(results.len(), 1);
    assert!((results[0].distance - 0.25).abs() < f32::EPSILON);
    assert_eq!(results[0].source(), Some("faq"));
}
