/// Sentence embeddings for rule documents and search terms.
///
/// fastembed inference is synchronous and CPU-bound, so every call runs on the blocking
/// pool. nomic-embed-text-v1.5 expects a task prefix on each input.
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::error::CommonError;

const MODEL_TAG: &str = "nomic-embed-text-v1.5";
const DOCUMENT_PREFIX: &str = "search_document: ";
const QUERY_PREFIX: &str = "search_query: ";
/// Small batches bound peak memory during ONNX inference.
const DOCUMENT_BATCH: usize = 4;

/// Anything that can turn rule documents and search terms into comparable vectors.
///
/// The document index is built with `embed_documents`; semantic retrieval embeds the
/// incoming search term with `embed_query`. Both sides must come from the same model.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError>;

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError>;

    /// Stable identifier of the underlying model, used to namespace cached vectors.
    fn model_tag(&self) -> &str;
}

pub struct Embedder {
    model: Arc<TextEmbedding>,
}

impl Embedder {
    /// Load the model, downloading it into the fastembed cache on first run.
    pub async fn new() -> Result<Self, CommonError> {
        let model = tokio::task::spawn_blocking(|| {
            TextEmbedding::try_new(
                InitOptions::new(EmbeddingModel::NomicEmbedTextV15).with_show_download_progress(false),
            )
        })
        .await
        .map_err(|e| CommonError::Embedding(format!("embedding task panicked: {e}")))?
        .map_err(|e| CommonError::Embedding(format!("model initialization failed: {e}")))?;

        Ok(Self {
            model: Arc::new(model),
        })
    }

    async fn embed_prefixed<'a, I>(
        &self,
        prefix: &str,
        texts: I,
        batch_size: Option<usize>,
    ) -> Result<Vec<Vec<f32>>, CommonError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let inputs: Vec<String> = texts.into_iter().map(|t| format!("{prefix}{t}")).collect();
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || model.embed(inputs, batch_size))
            .await
            .map_err(|e| CommonError::Embedding(format!("embedding task panicked: {e}")))?
            .map_err(|e| CommonError::Embedding(format!("embedding failed: {e}")))
    }
}

#[async_trait]
impl TextEmbedder for Embedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        self.embed_prefixed(DOCUMENT_PREFIX, texts.iter().map(String::as_str), Some(DOCUMENT_BATCH))
            .await
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
        self.embed_prefixed(QUERY_PREFIX, [query], None)
            .await?
            .pop()
            .ok_or_else(|| CommonError::Embedding("model returned no vector".to_string()))
    }

    fn model_tag(&self) -> &str {
        MODEL_TAG
    }
}

/// Cosine similarity between two vectors.
///
/// Returns 0.0 when the lengths differ or either vector has zero norm, so a malformed
/// vector can never outrank a real match.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut norm_a = 0.0_f32;
    let mut norm_b = 0.0_f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::cosine_similarity;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let sim = cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn mismatched_or_zero_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
