// LanceDB vector index
// Persistent table with a vector dimension and distance metric fixed at creation

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use serde_json::Value;
use tracing::{debug, info};

use super::{
    DistanceMetric, IndexError, Metadata, SearchFilter, SearchResult, VectorIndex, VectorRecord,
    check_query_dimension, validate_dimensions,
};

/// Vector index stored in a LanceDB table.
///
/// Records are written with a merge-insert keyed on `id`, so a retried
/// upsert never duplicates rows and a failed one leaves the old rows intact. Equal distances are ordered the way
/// LanceDB returns them.
pub struct LanceIndex {
    table: Table,
    table_name: String,
    dimension: usize,
    metric: DistanceMetric,
}

impl LanceIndex {
    /// Open the table at `db_path`, creating it if missing.
    ///
    /// # Arguments
    /// * `db_path` - Directory holding the LanceDB database
    /// * `table_name` - Table to open or create
    /// * `dimension` - Vector dimension; an existing table must match it
    /// * `metric` - Distance metric used for every search
    #[inline]
    pub async fn open(
        db_path: &Path,
        table_name: &str,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Self, IndexError> {
        debug!("Initializing LanceDB at path: {:?}", db_path);

        std::fs::create_dir_all(db_path).map_err(|e| {
            IndexError::Backend(format!("Failed to create vector database directory: {}", e))
        })?;

        let uri = format!("file://{}", db_path.display());
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| classify("connect to LanceDB", &e))?;

        let table_names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| classify("list tables", &e))?;

        let table = if table_names.iter().any(|name| name == table_name) {
            let table = connection
                .open_table(table_name)
                .execute()
                .await
                .map_err(|e| classify("open table", &e))?;

            let existing = detect_vector_dimension(&table).await?;
            if existing != dimension {
                return Err(IndexError::DimensionMismatch {
                    id: format!("table:{}", table_name),
                    expected: dimension,
                    actual: existing,
                });
            }
            debug!(
                "Opened existing table '{}' with {} dimensions",
                table_name, existing
            );
            table
        } else {
            let table = connection
                .create_empty_table(table_name, create_schema(dimension))
                .execute()
                .await
                .map_err(|e| classify("create table", &e))?;
            info!(
                "Created table '{}' with {} dimensions",
                table_name, dimension
            );
            table
        };

        Ok(Self {
            table,
            table_name: table_name.to_string(),
            dimension,
            metric,
        })
    }

    #[inline]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Create a RecordBatch from vector records
    fn create_record_batch(&self, records: &[&VectorRecord]) -> Result<RecordBatch, IndexError> {
        let len = records.len();
        let mut ids = Vec::with_capacity(len);
        let mut flat_values = Vec::with_capacity(len * self.dimension);
        let mut sources = Vec::with_capacity(len);
        let mut chunk_indices = Vec::with_capacity(len);
        let mut contents = Vec::with_capacity(len);
        let mut metadata_json = Vec::with_capacity(len);

        for record in records {
            ids.push(record.id.as_str());
            flat_values.extend_from_slice(&record.embedding);
            sources.push(record.metadata.get("source").and_then(Value::as_str));
            chunk_indices.push(
                record
                    .metadata
                    .get("chunk_index")
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok()),
            );
            contents.push(record.metadata.get("content").and_then(Value::as_str));
            metadata_json.push(serde_json::to_string(&record.metadata).map_err(|e| {
                IndexError::Backend(format!("Failed to serialize metadata: {}", e))
            })?);
        }

        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vector_array = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| IndexError::Backend(format!("Failed to create vector array: {}", e)))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(vector_array),
            Arc::new(StringArray::from(sources)),
            Arc::new(UInt32Array::from(chunk_indices)),
            Arc::new(StringArray::from(contents)),
            Arc::new(StringArray::from(metadata_json)),
        ];

        RecordBatch::try_new(create_schema(self.dimension), arrays)
            .map_err(|e| IndexError::Backend(format!("Failed to create record batch: {}", e)))
    }
}

/// Schema of the chunk table for the given vector dimension
fn create_schema(dimension: usize) -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, false)),
                dimension as i32,
            ),
            false,
        ),
        Field::new("source", DataType::Utf8, true),
        Field::new("chunk_index", DataType::UInt32, true),
        Field::new("content", DataType::Utf8, true),
        Field::new("metadata", DataType::Utf8, false),
    ]))
}

async fn detect_vector_dimension(table: &Table) -> Result<usize, IndexError> {
    let schema = table
        .schema()
        .await
        .map_err(|e| classify("read table schema", &e))?;

    schema
        .fields()
        .iter()
        .find(|field| field.name() == "vector")
        .and_then(|field| match field.data_type() {
            DataType::FixedSizeList(_, size) => usize::try_from(*size).ok(),
            _ => None,
        })
        .ok_or_else(|| IndexError::Backend("Could not find vector column or its dimension".to_string()))
}

const fn distance_type(metric: DistanceMetric) -> DistanceType {
    match metric {
        DistanceMetric::Cosine => DistanceType::Cosine,
        DistanceMetric::SquaredL2 => DistanceType::L2,
        DistanceMetric::Dot => DistanceType::Dot,
    }
}

/// Map a LanceDB error onto the index taxonomy by inspecting its message
fn classify(operation: &str, error: &lancedb::Error) -> IndexError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        IndexError::Timeout {
            operation: operation.to_string(),
        }
    } else if lower.contains("temporarily") || lower.contains("connection reset") {
        IndexError::Unavailable(format!("Failed to {}: {}", operation, message))
    } else {
        IndexError::Backend(format!("Failed to {}: {}", operation, message))
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Translate an equality filter into a SQL predicate over indexed columns
fn filter_predicate(filter: &SearchFilter) -> Result<String, IndexError> {
    let mut clauses = Vec::with_capacity(filter.len());
    for (key, value) in filter {
        let clause = match (key.as_str(), value) {
            ("source", Value::String(source)) => format!("source = {}", quote(source)),
            ("chunk_index", Value::Number(n)) if n.is_u64() => format!("chunk_index = {}", n),
            _ => {
                return Err(IndexError::UnsupportedFilter(format!(
                    "{} = {}",
                    key, value
                )));
            }
        };
        clauses.push(clause);
    }
    Ok(clauses.join(" AND "))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, IndexError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| IndexError::Backend(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| IndexError::Backend(format!("Invalid {} column type", name)))
}

/// Parse a single record batch from search results
fn parse_search_batch(batch: &RecordBatch) -> Result<Vec<SearchResult>, IndexError> {
    let ids = string_column(batch, "id")?;
    let metadata_json = string_column(batch, "metadata")?;
    let distances = batch
        .column_by_name("_distance")
        .ok_or_else(|| IndexError::Backend("Missing _distance column".to_string()))?
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or_else(|| IndexError::Backend("Invalid _distance column type".to_string()))?;

    let mut results = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let metadata: Metadata = serde_json::from_str(metadata_json.value(row))
            .map_err(|e| IndexError::Backend(format!("Corrupt metadata for row {}: {}", row, e)))?;
        if distances.is_null(row) {
            return Err(IndexError::Backend(format!("Null distance for row {}", row)));
        }
        let distance = distances.value(row);

        results.push(SearchResult {
            id: ids.value(row).to_string(),
            distance,
            metadata,
        });
    }
    Ok(results)
}

#[async_trait]
impl VectorIndex for LanceIndex {
    #[inline]
    fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    #[inline]
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), IndexError> {
        validate_dimensions(self.dimension, records)?;
        if records.is_empty() {
            debug!("No records to upsert");
            return Ok(());
        }

        // Last occurrence of an id within the batch wins
        let mut latest: HashMap<&str, usize> = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            latest.insert(record.id.as_str(), i);
        }
        let unique: Vec<&VectorRecord> = records
            .iter()
            .enumerate()
            .filter(|(i, record)| latest.get(record.id.as_str()) == Some(i))
            .map(|(_, record)| record)
            .collect();

        let record_batch = self.create_record_batch(&unique)?;

        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);

        // One commit replaces matched ids and inserts new ones
        let mut merge = self.table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(|e| classify("merge records", &e))?;

        debug!("Upserted {} records into '{}'", unique.len(), self.table_name);
        Ok(())
    }

    #[inline]
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        check_query_dimension(self.dimension, query)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        debug!("Searching for similar vectors with limit: {}", top_k);

        let mut vector_query = self
            .table
            .vector_search(query)
            .map_err(|e| classify("create vector search", &e))?
            .column("vector")
            .distance_type(distance_type(self.metric))
            .limit(top_k);

        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            vector_query = vector_query.only_if(filter_predicate(filter)?);
        }

        let mut stream = vector_query
            .execute()
            .await
            .map_err(|e| classify("execute search", &e))?;

        let mut results = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| classify("read result stream", &e))?
        {
            results.extend(parse_search_batch(&batch)?);
        }

        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(top_k);
        debug!("Parsed {} search results", results.len());
        Ok(results)
    }

    #[inline]
    async fn count(&self) -> Result<usize, IndexError> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| classify("count rows", &e))
    }
}
