use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::parser;

/// A business rules guide as read from disk, before it has an embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedGuide {
    /// File name, e.g. "financial_banking.md". Unique within the corpus.
    pub key: String,
    pub title: String,
    /// H2/H3 headings in document order.
    pub headers: Vec<String>,
    /// Schema or table names the guide declares, e.g. "financial".
    pub schema_hints: Vec<String>,
    /// Short quoted, backticked or double-quoted spans from the body.
    pub quoted_terms: Vec<String>,
    /// Full raw markdown.
    pub text: String,
    /// SHA-256 of `text`, hex encoded.
    pub content_hash: String,
}

/// Normalized token sets per lexical field, computed once at index time.
#[derive(Debug, Clone, Default)]
pub struct FieldTokens {
    pub filename: HashSet<String>,
    pub title: HashSet<String>,
    pub headers: HashSet<String>,
    pub schema_hints: HashSet<String>,
    pub quoted_terms: HashSet<String>,
    pub body: HashSet<String>,
}

/// An indexed rule document. Immutable once built and shared as `Arc<RuleDocument>`.
#[derive(Debug, Clone)]
pub struct RuleDocument {
    pub key: String,
    pub title: String,
    pub headers: Vec<String>,
    pub schema_hints: Vec<String>,
    pub quoted_terms: Vec<String>,
    pub text: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub tokens: FieldTokens,
}

impl RuleDocument {
    /// Attach an embedding to a parsed guide. Rejects empty text or an empty vector.
    pub fn new(parsed: ParsedGuide, embedding: Vec<f32>) -> Result<Self, AppError> {
        if parsed.text.trim().is_empty() {
            return Err(AppError::Index(format!("{} has no text", parsed.key)));
        }
        if embedding.is_empty() {
            return Err(AppError::Index(format!("{} has an empty embedding", parsed.key)));
        }

        let stem = parsed.key.strip_suffix(".md").unwrap_or(&parsed.key);
        let tokens = FieldTokens {
            filename: token_set(stem),
            title: token_set(&parsed.title),
            headers: parsed.headers.iter().flat_map(|h| parser::tokenize(h)).collect(),
            schema_hints: parsed
                .schema_hints
                .iter()
                .flat_map(|h| parser::tokenize(h))
                .collect(),
            quoted_terms: parsed
                .quoted_terms
                .iter()
                .flat_map(|q| parser::tokenize(q))
                .collect(),
            body: token_set(&parsed.text),
        };

        Ok(Self {
            key: parsed.key,
            title: parsed.title,
            headers: parsed.headers,
            schema_hints: parsed.schema_hints,
            quoted_terms: parsed.quoted_terms,
            text: parsed.text,
            content_hash: parsed.content_hash,
            embedding,
            tokens,
        })
    }

    /// One-line description used in catalogs and arbiter prompts.
    pub fn summary_line(&self) -> String {
        if self.schema_hints.is_empty() {
            format!("{} ({})", self.key, self.title)
        } else {
            format!(
                "{} ({}; schema: {})",
                self.key,
                self.title,
                self.schema_hints.join(", ")
            )
        }
    }
}

fn token_set(text: &str) -> HashSet<String> {
    parser::tokenize(text).into_iter().collect()
}

/// Which retrieval stage produced a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Lexical,
    Semantic,
}

/// A document with the score one stage gave it.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub document: Arc<RuleDocument>,
    pub score: f32,
    pub stage: Stage,
}

impl ScoredCandidate {
    pub fn key(&self) -> &str {
        &self.document.key
    }
}

/// Decides whether the runner-up is close enough to the leader to be returned with it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiDocPolicy {
    pub relative: f32,
    pub absolute: f32,
}

impl MultiDocPolicy {
    pub fn includes_runner_up(&self, top: f32, runner_up: f32) -> bool {
        runner_up >= (top * self.relative).max(self.absolute)
    }
}

/// How a `DocumentSet` was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Lexical,
    Semantic,
    Arbitrated,
    Fallback,
    NoConfidentMatch,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Lexical => "lexical",
            Resolution::Semantic => "semantic",
            Resolution::Arbitrated => "arbitrated",
            Resolution::Fallback => "fallback",
            Resolution::NoConfidentMatch => "no_confident_match",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievedRule {
    pub document: Arc<RuleDocument>,
    pub score: f32,
}

/// Result of one retrieval: zero, one or two documents.
#[derive(Debug, Clone)]
pub struct DocumentSet {
    pub entries: Vec<RetrievedRule>,
    pub resolution: Resolution,
    /// Keys of other guides worth a follow-up search.
    pub alternatives: Vec<String>,
}

impl DocumentSet {
    pub const MAX_DOCUMENTS: usize = 2;

    pub fn no_confident_match() -> Self {
        Self {
            entries: Vec::new(),
            resolution: Resolution::NoConfidentMatch,
            alternatives: Vec::new(),
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.document.key.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(key: &str, text: &str) -> ParsedGuide {
        ParsedGuide {
            key: key.to_string(),
            title: "Chess Tournament Rules".to_string(),
            headers: vec!["Opening Classification".to_string()],
            schema_hints: vec!["chess".to_string()],
            quoted_terms: vec!["French Defense".to_string()],
            text: text.to_string(),
            content_hash: String::new(),
        }
    }

    #[test]
    fn rejects_empty_text_and_empty_embedding() {
        assert!(RuleDocument::new(parsed("a.md", "  \n"), vec![1.0]).is_err());
        assert!(RuleDocument::new(parsed("a.md", "# A"), vec![]).is_err());
    }

    #[test]
    fn precomputes_field_tokens() {
        let doc = RuleDocument::new(
            parsed("chess_tournaments.md", "# Chess Tournament Rules\nGames are rated."),
            vec![1.0, 0.0],
        )
        .unwrap();
        assert!(doc.tokens.filename.contains("chess"));
        assert!(doc.tokens.filename.contains("tournament"));
        assert!(doc.tokens.headers.contains("opening"));
        assert!(doc.tokens.quoted_terms.contains("french"));
        assert!(doc.tokens.body.contains("game"));
        assert!(!doc.tokens.title.contains("rule"));
    }

    #[test]
    fn runner_up_needs_relative_and_absolute_margin() {
        let policy = MultiDocPolicy {
            relative: 0.6,
            absolute: 30.0,
        };
        assert!(policy.includes_runner_up(87.0, 67.0));
        assert!(!policy.includes_runner_up(135.0, 67.0));
        assert!(!policy.includes_runner_up(40.0, 29.0));
        assert!(policy.includes_runner_up(40.0, 30.0));
    }
}
