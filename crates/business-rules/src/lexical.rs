/// Stage 1: deterministic field-weighted keyword scoring.
///
/// Each distinct query token adds the weight of every field of a document that contains
/// it. Tokens are whole words after normalization, so "loan" never matches "loaned" and
/// "cat" never matches "category".
use std::collections::HashSet;
use std::sync::Arc;

use crate::model::{RuleDocument, ScoredCandidate, Stage};
use crate::parser;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldWeights {
    pub filename: f32,
    pub title: f32,
    pub header: f32,
    pub schema_hint: f32,
    pub quoted_term: f32,
    pub body: f32,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            filename: 40.0,
            title: 25.0,
            header: 22.0,
            schema_hint: 20.0,
            quoted_term: 10.0,
            body: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LexicalScorer {
    weights: FieldWeights,
}

impl LexicalScorer {
    pub fn new(weights: FieldWeights) -> Self {
        Self { weights }
    }

    /// Score every document. Only documents with a positive score are returned, sorted
    /// by score descending; ties keep index order.
    pub fn score(&self, query: &str, documents: &[Arc<RuleDocument>]) -> Vec<ScoredCandidate> {
        let tokens = query_tokens(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<ScoredCandidate> = documents
            .iter()
            .filter_map(|doc| {
                let score = self.score_document(&tokens, doc);
                (score > 0.0).then(|| ScoredCandidate {
                    document: Arc::clone(doc),
                    score,
                    stage: Stage::Lexical,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored
    }

    fn score_document(&self, tokens: &[String], doc: &RuleDocument) -> f32 {
        let w = &self.weights;
        let fields = &doc.tokens;
        tokens
            .iter()
            .map(|t| {
                let mut s = 0.0;
                if fields.filename.contains(t) {
                    s += w.filename;
                }
                if fields.title.contains(t) {
                    s += w.title;
                }
                if fields.headers.contains(t) {
                    s += w.header;
                }
                if fields.schema_hints.contains(t) {
                    s += w.schema_hint;
                }
                if fields.quoted_terms.contains(t) {
                    s += w.quoted_term;
                }
                if fields.body.contains(t) {
                    s += w.body;
                }
                s
            })
            .sum()
    }
}

/// Distinct normalized query tokens, in first-seen order.
pub fn query_tokens(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    parser::tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
