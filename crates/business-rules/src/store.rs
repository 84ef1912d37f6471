/// Persistence of document embeddings in LanceDB.
///
/// At startup the stored rows are reused when every guide's key and content hash still
/// match; otherwise all guides are re-embedded and the table is replaced.
use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::{Array, ArrayRef, FixedSizeListArray, Float32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use tracing::{info, warn};

use rules_common::embedding::TextEmbedder;
use rules_common::error::CommonError;
use rules_common::vectordb::VectorDb;

use crate::error::AppError;
use crate::index::DocumentIndex;
use crate::model::ParsedGuide;
use crate::parser;

const TABLE_NAME: &str = "rule_documents";
/// Upper bound on rows read back; the corpus is tens of documents.
const MAX_STORED_ROWS: usize = 10_000;

/// An embedding row as read back from the table.
#[derive(Debug, Clone, PartialEq)]
struct StoredEmbedding {
    content_hash: String,
    embedding: Vec<f32>,
}

pub struct EmbeddingStore {
    vectordb: VectorDb,
}

impl EmbeddingStore {
    pub fn new(vectordb: VectorDb) -> Self {
        Self { vectordb }
    }

    /// Build the index, reusing stored embeddings when the corpus is unchanged.
    pub async fn load_or_build(
        &self,
        guides: Vec<ParsedGuide>,
        embedder: &dyn TextEmbedder,
    ) -> Result<DocumentIndex, AppError> {
        match self.stored_embeddings().await {
            Ok(stored) => {
                if let Some(embeddings) = reuse(&guides, &stored) {
                    info!(documents = guides.len(), "reusing stored embeddings");
                    return DocumentIndex::from_embeddings(guides, embeddings);
                }
                info!("guide corpus changed, re-embedding");
            }
            Err(e) => warn!(error = %e, "could not read stored embeddings, re-embedding"),
        }

        let texts: Vec<String> = guides.iter().map(parser::compose_embedding_text).collect();
        info!("generating embeddings for {} guides", guides.len());
        let embeddings = embedder.embed_documents(&texts).await?;

        let batch = build_record_batch(&guides, &embeddings)?;
        self.vectordb
            .create_or_replace_table(TABLE_NAME, batch.schema(), vec![batch])
            .await?;

        DocumentIndex::from_embeddings(guides, embeddings)
    }

    async fn stored_embeddings(&self) -> Result<HashMap<String, StoredEmbedding>, CommonError> {
        if !self.vectordb.table_exists(TABLE_NAME).await? {
            return Ok(HashMap::new());
        }
        let batches = self.vectordb.read_all(TABLE_NAME, MAX_STORED_ROWS).await?;
        Ok(extract_embeddings(&batches))
    }
}

/// Stored vectors in guide order, or `None` when any guide is new or changed.
fn reuse(guides: &[ParsedGuide], stored: &HashMap<String, StoredEmbedding>) -> Option<Vec<Vec<f32>>> {
    if guides.is_empty() || stored.len() != guides.len() {
        return None;
    }
    guides
        .iter()
        .map(|g| {
            stored
                .get(&g.key)
                .filter(|s| s.content_hash == g.content_hash && !s.embedding.is_empty())
                .map(|s| s.embedding.clone())
        })
        .collect()
}

fn build_record_batch(guides: &[ParsedGuide], embeddings: &[Vec<f32>]) -> Result<RecordBatch, AppError> {
    let vector_error = |message: String| AppError::Common(CommonError::VectorDb(message));

    if embeddings.len() != guides.len() {
        return Err(vector_error(format!(
            "embedding count mismatch: expected {}, got {}",
            guides.len(),
            embeddings.len()
        )));
    }
    let dim = embeddings.first().map(Vec::len).unwrap_or(0);
    if dim == 0 || embeddings.iter().any(|e| e.len() != dim) {
        return Err(vector_error("embeddings must share a non-zero dimension".to_string()));
    }
    let embedding_dim = i32::try_from(dim)
        .map_err(|_| vector_error(format!("embedding dimension {dim} too large")))?;

    let keys: Vec<&str> = guides.iter().map(|g| g.key.as_str()).collect();
    let titles: Vec<&str> = guides.iter().map(|g| g.title.as_str()).collect();
    let hashes: Vec<&str> = guides.iter().map(|g| g.content_hash.as_str()).collect();
    let texts: Vec<&str> = guides.iter().map(|g| g.text.as_str()).collect();

    let item_field = Arc::new(Field::new("item", DataType::Float32, true));
    let flat_values: Vec<f32> = embeddings.iter().flat_map(|e| e.iter().copied()).collect();
    let embedding_array: ArrayRef = Arc::new(
        FixedSizeListArray::try_new(
            Arc::clone(&item_field),
            embedding_dim,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| vector_error(format!("failed to build embedding array: {e}")))?,
    );

    let schema = Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("content_hash", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(item_field, embedding_dim),
            false,
        ),
    ]));

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(keys)) as ArrayRef,
            Arc::new(StringArray::from(titles)) as ArrayRef,
            Arc::new(StringArray::from(hashes)) as ArrayRef,
            Arc::new(StringArray::from(texts)) as ArrayRef,
            embedding_array,
        ],
    )
    .map_err(|e| vector_error(format!("failed to build record batch: {e}")))
}

/// Expected columns: key (Utf8), content_hash (Utf8), embedding (FixedSizeList<Float32>).
fn extract_embeddings(batches: &[RecordBatch]) -> HashMap<String, StoredEmbedding> {
    let mut stored = HashMap::new();

    for batch in batches {
        let key_col = string_column(batch, "key");
        let hash_col = string_column(batch, "content_hash");
        let embedding_col = batch
            .column_by_name("embedding")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());

        let (Some(key_col), Some(hash_col), Some(embedding_col)) = (key_col, hash_col, embedding_col)
        else {
            warn!("stored embedding batch missing expected columns");
            continue;
        };

        for row in 0..batch.num_rows() {
            let values = embedding_col.value(row);
            let Some(values) = values.as_any().downcast_ref::<Float32Array>() else {
                continue;
            };
            stored.insert(
                key_col.value(row).to_string(),
                StoredEmbedding {
                    content_hash: hash_col.value(row).to_string(),
                    embedding: values.values().to_vec(),
                },
            );
        }
    }
    stored
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch.column_by_name(name)?.as_any().downcast_ref::<StringArray>()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::testing::{sample_guides, StubEmbedder};

    struct OfflineEmbedder;

    #[async_trait]
    impl TextEmbedder for OfflineEmbedder {
        async fn embed_documents(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
            Err(CommonError::Embedding("offline".to_string()))
        }

        async fn embed_query(&self, _query: &str) -> Result<Vec<f32>, CommonError> {
            Err(CommonError::Embedding("offline".to_string()))
        }

        fn model_tag(&self) -> &str {
            "offline"
        }
    }

    fn sample_embeddings(guides: &[ParsedGuide]) -> Vec<Vec<f32>> {
        guides
            .iter()
            .map(|g| StubEmbedder::topic_vector(&g.text).into_iter().chain([0.1]).collect())
            .collect()
    }

    #[test]
    fn record_batch_reads_back_as_the_same_embeddings() {
        let guides = sample_guides();
        let embeddings = sample_embeddings(&guides);
        let batch = build_record_batch(&guides, &embeddings).unwrap();
        assert_eq!(batch.num_rows(), 4);

        let stored = extract_embeddings(&[batch]);
        let reused = reuse(&guides, &stored).unwrap();
        assert_eq!(reused, embeddings);
    }

    #[test]
    fn changed_or_missing_guides_are_not_reused() {
        let guides = sample_guides();
        let embeddings = sample_embeddings(&guides);
        let stored = extract_embeddings(&[build_record_batch(&guides, &embeddings).unwrap()]);

        let mut edited = guides.clone();
        edited[0].content_hash = parser::content_hash("edited");
        assert!(reuse(&edited, &stored).is_none());

        assert!(reuse(&guides[..3], &stored).is_none());
    }

    #[test]
    fn ragged_embeddings_are_rejected() {
        let guides = sample_guides();
        let mut embeddings = sample_embeddings(&guides);
        embeddings[1].pop();
        assert!(build_record_batch(&guides, &embeddings).is_err());
        assert!(build_record_batch(&guides, &embeddings[..2]).is_err());
    }

    #[tokio::test]
    async fn second_load_reuses_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lance");
        let vectordb = VectorDb::connect(path.to_str().unwrap()).await.unwrap();
        let store = EmbeddingStore::new(vectordb);

        let embedder = StubEmbedder::new();
        let first = store.load_or_build(sample_guides(), &embedder).await.unwrap();
        assert_eq!(first.len(), 4);

        let second = store.load_or_build(sample_guides(), &OfflineEmbedder).await.unwrap();
        let keys: Vec<&str> = second.documents().iter().map(|d| d.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "chess_tournaments.md",
                "craft_beer_inventory.md",
                "financial_banking.md",
                "financial_markets.md",
            ]
        );
        assert_eq!(second.documents()[0].embedding, first.documents()[0].embedding);

        let mut edited = sample_guides();
        edited[0] = parser::parse_guide("chess_tournaments.md", "# Chess\n\nRewritten.");
        assert!(store.load_or_build(edited, &OfflineEmbedder).await.is_err());
    }
}
