/// Stage 2: embedding similarity against precomputed whole-document vectors.
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use rules_common::embedding::{cosine_similarity, TextEmbedder};

use crate::cache::QueryEmbeddingCache;
use crate::error::StageError;
use crate::model::{RuleDocument, ScoredCandidate, Stage};

pub struct SemanticScorer {
    embedder: Arc<dyn TextEmbedder>,
    cache: Option<Arc<QueryEmbeddingCache>>,
    timeout: Duration,
}

impl SemanticScorer {
    pub fn new(embedder: Arc<dyn TextEmbedder>, timeout: Duration) -> Self {
        Self {
            embedder,
            cache: None,
            timeout,
        }
    }

    pub fn with_cache(mut self, cache: Arc<QueryEmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Rank every document by cosine similarity to the query, descending, ties in index
    /// order. Document vectors are never recomputed here.
    pub async fn score(
        &self,
        query: &str,
        documents: &[Arc<RuleDocument>],
    ) -> Result<Vec<ScoredCandidate>, StageError> {
        let query_vector = self.query_vector(query).await?;

        let mut scored: Vec<ScoredCandidate> = documents
            .iter()
            .map(|doc| ScoredCandidate {
                document: Arc::clone(doc),
                score: cosine_similarity(&query_vector, &doc.embedding),
                stage: Stage::Semantic,
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));

        if let Some(top) = scored.first() {
            debug!(query, top = %top.key(), similarity = top.score, "semantic scoring done");
        }
        Ok(scored)
    }

    async fn query_vector(&self, query: &str) -> Result<Vec<f32>, StageError> {
        let model_tag = self.embedder.model_tag();
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(model_tag, query).await {
                debug!(query, "query embedding cache hit");
                return Ok(cached);
            }
        }

        let vector = tokio::time::timeout(self.timeout, self.embedder.embed_query(query))
            .await
            .map_err(|_| StageError::Timeout(self.timeout))?
            .map_err(|e| StageError::Unavailable(e.to_string()))?;

        if let Some(cache) = &self.cache {
            cache.set(model_tag, query, &vector).await;
        }
        Ok(vector)
    }
}
