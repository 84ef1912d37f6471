use std::sync::Arc;

use rules_common::embedding::TextEmbedder;
use rules_common::error::CommonError;
use tracing::info;

use crate::error::AppError;
use crate::model::{ParsedGuide, RuleDocument};
use crate::parser;

/// The full set of rule documents, sorted by key. Built once at startup, never mutated.
#[derive(Debug, Default)]
pub struct DocumentIndex {
    documents: Vec<Arc<RuleDocument>>,
}

impl DocumentIndex {
    pub fn new(mut documents: Vec<RuleDocument>) -> Self {
        documents.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            documents: documents.into_iter().map(Arc::new).collect(),
        }
    }

    /// Embed every guide and build the index.
    pub async fn build(
        guides: Vec<ParsedGuide>,
        embedder: &dyn TextEmbedder,
    ) -> Result<Self, AppError> {
        let texts: Vec<String> = guides.iter().map(parser::compose_embedding_text).collect();
        let embeddings = embedder.embed_documents(&texts).await?;
        Self::from_embeddings(guides, embeddings)
    }

    pub fn from_embeddings(
        guides: Vec<ParsedGuide>,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<Self, AppError> {
        if embeddings.len() != guides.len() {
            return Err(AppError::Common(CommonError::Embedding(format!(
                "embedding count mismatch: expected {}, got {}",
                guides.len(),
                embeddings.len()
            ))));
        }

        let documents = guides
            .into_iter()
            .zip(embeddings)
            .map(|(guide, embedding)| RuleDocument::new(guide, embedding))
            .collect::<Result<Vec<_>, _>>()?;

        info!(documents = documents.len(), "document index built");
        Ok(Self::new(documents))
    }

    pub fn documents(&self) -> &[Arc<RuleDocument>] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Arc<RuleDocument>> {
        self.documents.iter().find(|d| d.key == key)
    }

    /// Resolve a free-form name (key with or without `.md`, or exact title) to a document.
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<RuleDocument>> {
        let name = name
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`');
        if name.is_empty() {
            return None;
        }
        let stem = name.strip_suffix(".md").unwrap_or(name);
        self.documents.iter().find(|d| {
            let doc_stem = d.key.strip_suffix(".md").unwrap_or(&d.key);
            doc_stem.eq_ignore_ascii_case(stem) || d.title.eq_ignore_ascii_case(name)
        })
    }

    /// Listing of every guide, shown when retrieval cannot pick one confidently.
    pub fn catalog(&self) -> String {
        let mut lines = vec![format!("Available guides ({}):", self.documents.len()), String::new()];
        for doc in &self.documents {
            let stem = doc.key.strip_suffix(".md").unwrap_or(&doc.key);
            if doc.schema_hints.is_empty() {
                lines.push(format!("  - {stem}"));
            } else {
                lines.push(format!("  - {stem}  (schema: {})", doc.schema_hints.join(", ")));
            }
        }
        lines.push(String::new());
        lines.push("Try searching with a schema name or domain keyword.".to_string());
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_guides, sample_index, StubEmbedder};

    #[tokio::test]
    async fn build_sorts_documents_by_key() {
        let mut guides = sample_guides();
        guides.reverse();
        let index = DocumentIndex::build(guides, &StubEmbedder::new()).await.unwrap();
        let keys: Vec<&str> = index.documents().iter().map(|d| d.key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(index.documents().iter().all(|d| !d.embedding.is_empty()));
    }

    #[test]
    fn embedding_count_mismatch_is_an_error() {
        let err = DocumentIndex::from_embeddings(sample_guides(), vec![vec![1.0]]).unwrap_err();
        assert!(err.to_string().contains("embedding count mismatch"));
    }

    #[tokio::test]
    async fn finds_documents_by_key_stem_or_title() {
        let index = sample_index().await;
        assert_eq!(
            index.find_by_name("financial_banking.md").map(|d| d.key.as_str()),
            Some("financial_banking.md")
        );
        assert_eq!(
            index.find_by_name("'CRAFT_BEER_INVENTORY'").map(|d| d.key.as_str()),
            Some("craft_beer_inventory.md")
        );
        assert_eq!(
            index
                .find_by_name("Chess Tournament Rules (chess Database)")
                .map(|d| d.key.as_str()),
            Some("chess_tournaments.md")
        );
        assert!(index.find_by_name("weather").is_none());
        assert!(index.find_by_name("  ").is_none());
    }

    #[tokio::test]
    async fn catalog_lists_every_guide_with_schema() {
        let index = sample_index().await;
        let catalog = index.catalog();
        assert!(catalog.starts_with(&format!("Available guides ({}):", index.len())));
        assert!(catalog.contains("  - financial_banking  (schema: financial"));
        assert!(catalog.contains("  - chess_tournaments  (schema: chess)"));
    }
}
