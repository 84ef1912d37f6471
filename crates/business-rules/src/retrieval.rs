/// Retrieval orchestrator: lexical, then semantic, then the arbiter, strictly in sequence.
///
/// Each stage only runs when the previous one was inconclusive. Stage errors are logged
/// and absorbed; `resolve` always returns a `DocumentSet`.
use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::arbiter::{Arbiter, ArbiterDecision};
use crate::config::RetrievalThresholds;
use crate::index::DocumentIndex;
use crate::lexical::LexicalScorer;
use crate::model::{
    DocumentSet, MultiDocPolicy, Resolution, RetrievedRule, ScoredCandidate, Stage,
};
use crate::semantic::SemanticScorer;

/// Lexical candidates below this score are not worth suggesting as alternatives.
const MIN_ALTERNATIVE_SCORE: f32 = 5.0;
const MAX_ALTERNATIVES: usize = 3;
const MAX_LEADING_CANDIDATES: usize = 5;

pub struct RetrievalEngine {
    index: Arc<DocumentIndex>,
    lexical: LexicalScorer,
    semantic: SemanticScorer,
    arbiter: Option<Arbiter>,
    thresholds: RetrievalThresholds,
}

impl RetrievalEngine {
    pub fn new(
        index: Arc<DocumentIndex>,
        semantic: SemanticScorer,
        thresholds: RetrievalThresholds,
    ) -> Self {
        Self {
            index,
            lexical: LexicalScorer::default(),
            semantic,
            arbiter: None,
            thresholds,
        }
    }

    pub fn with_arbiter(mut self, arbiter: Arbiter) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    pub fn index(&self) -> &Arc<DocumentIndex> {
        &self.index
    }

    pub async fn resolve(&self, query: &str) -> DocumentSet {
        let query = query.trim();
        if query.is_empty() || self.index.is_empty() {
            return DocumentSet::no_confident_match();
        }
        let t = &self.thresholds;

        // Stage 1
        let lexical = self.lexical.score(query, self.index.documents());
        if let Some(top) = lexical.first() {
            if top.score >= t.lexical_accept {
                let entries = take_with_runner_up(&lexical, self.lexical_policy());
                let alternatives = lexical_alternatives(&lexical, &entries);
                info!(query, top = %top.key(), score = top.score, "resolved lexically");
                return build(entries, Resolution::Lexical, alternatives);
            }
        }

        // Stage 2
        let semantic = match self.semantic.score(query, self.index.documents()).await {
            Ok(scored) => scored,
            Err(e) => {
                warn!(query, error = %e, "semantic stage failed");
                Vec::new()
            }
        };
        if let Some(top) = semantic.first() {
            let borderline = top.score < t.semantic_accept + t.borderline_margin;
            if top.score >= t.semantic_accept && !(borderline && self.arbiter.is_some()) {
                let entries = take_with_runner_up(&semantic, self.semantic_policy());
                let alternatives = lexical_alternatives(&lexical, &entries);
                info!(query, top = %top.key(), similarity = top.score, "resolved semantically");
                return build(entries, Resolution::Semantic, alternatives);
            }
        }

        // Stage 3
        if let Some(arbiter) = &self.arbiter {
            let leading = leading_candidates(&semantic, &lexical, t);
            match arbiter.confirm(query, &leading, &self.index).await {
                Ok(ArbiterDecision::Confirm) => {
                    if let Some(top) = leading.first() {
                        let entries = vec![top.clone()];
                        let alternatives = lexical_alternatives(&lexical, &entries);
                        info!(query, top = %top.key(), "arbiter confirmed leading candidate");
                        return build(entries, Resolution::Arbitrated, alternatives);
                    }
                }
                Ok(ArbiterDecision::Select(keys)) => {
                    let entries = self.rank_selection(&keys, &semantic, &lexical);
                    let alternatives = lexical_alternatives(&lexical, &entries);
                    info!(query, selected = ?keys, "arbiter selected guides");
                    return build(entries, Resolution::Arbitrated, alternatives);
                }
                Ok(ArbiterDecision::NoMatch) => {
                    info!(query, "arbiter found no matching guide");
                }
                Err(e) => {
                    warn!(query, error = %e, "arbiter stage failed, falling back");
                }
            }
        }

        self.fallback(query, &semantic, &lexical)
    }

    /// Best Stage 2 candidate above the semantic floor, else best Stage 1 candidate above
    /// the lexical floor, else no confident match.
    fn fallback(
        &self,
        query: &str,
        semantic: &[ScoredCandidate],
        lexical: &[ScoredCandidate],
    ) -> DocumentSet {
        let t = &self.thresholds;
        let best = semantic
            .first()
            .filter(|c| c.score >= t.semantic_floor)
            .or_else(|| lexical.first().filter(|c| c.score >= t.lexical_floor));

        match best {
            Some(candidate) => {
                let entries = vec![candidate.clone()];
                let alternatives = lexical_alternatives(lexical, &entries);
                info!(query, top = %candidate.key(), score = candidate.score, "fallback match");
                build(entries, Resolution::Fallback, alternatives)
            }
            None => {
                info!(query, "no confident match");
                DocumentSet::no_confident_match()
            }
        }
    }

    /// Order arbiter selections by their best ranking score and keep the top two.
    fn rank_selection(
        &self,
        keys: &[String],
        semantic: &[ScoredCandidate],
        lexical: &[ScoredCandidate],
    ) -> Vec<ScoredCandidate> {
        let score_of = |ranking: &[ScoredCandidate], key: &str| {
            ranking.iter().find(|c| c.key() == key).map(|c| c.score)
        };

        let mut selected: Vec<ScoredCandidate> = keys
            .iter()
            .filter_map(|key| self.index.get(key))
            .map(|doc| {
                let (score, stage) = match score_of(semantic, &doc.key) {
                    Some(s) => (s, Stage::Semantic),
                    None => (
                        score_of(lexical, &doc.key).unwrap_or(0.0),
                        Stage::Lexical,
                    ),
                };
                ScoredCandidate {
                    document: Arc::clone(doc),
                    score,
                    stage,
                }
            })
            .collect();
        selected.sort_by(|a, b| b.score.total_cmp(&a.score));
        selected.truncate(DocumentSet::MAX_DOCUMENTS);
        selected
    }

    fn lexical_policy(&self) -> MultiDocPolicy {
        MultiDocPolicy {
            relative: self.thresholds.lexical_multi_relative,
            absolute: self.thresholds.lexical_multi_absolute,
        }
    }

    fn semantic_policy(&self) -> MultiDocPolicy {
        MultiDocPolicy {
            relative: self.thresholds.semantic_multi_relative,
            absolute: self.thresholds.semantic_multi_absolute,
        }
    }
}

fn take_with_runner_up(ranked: &[ScoredCandidate], policy: MultiDocPolicy) -> Vec<ScoredCandidate> {
    match ranked {
        [top, runner_up, ..] if policy.includes_runner_up(top.score, runner_up.score) => {
            vec![top.clone(), runner_up.clone()]
        }
        [top, ..] => vec![top.clone()],
        [] => Vec::new(),
    }
}

/// Semantic leaders first, then lexical leaders, deduplicated.
fn leading_candidates(
    semantic: &[ScoredCandidate],
    lexical: &[ScoredCandidate],
    thresholds: &RetrievalThresholds,
) -> Vec<ScoredCandidate> {
    let mut seen = HashSet::new();
    semantic
        .iter()
        .filter(|c| c.score >= thresholds.semantic_floor)
        .take(3)
        .chain(lexical.iter().take(3))
        .filter(|c| seen.insert(c.key().to_string()))
        .take(MAX_LEADING_CANDIDATES)
        .cloned()
        .collect()
}

fn lexical_alternatives(lexical: &[ScoredCandidate], selected: &[ScoredCandidate]) -> Vec<String> {
    lexical
        .iter()
        .filter(|c| c.score >= MIN_ALTERNATIVE_SCORE)
        .filter(|c| !selected.iter().any(|s| s.key() == c.key()))
        .take(MAX_ALTERNATIVES)
        .map(|c| c.key().to_string())
        .collect()
}

fn build(
    mut entries: Vec<ScoredCandidate>,
    resolution: Resolution,
    alternatives: Vec<String>,
) -> DocumentSet {
    entries.truncate(DocumentSet::MAX_DOCUMENTS);
    DocumentSet {
        entries: entries
            .into_iter()
            .map(|c| RetrievedRule {
                document: c.document,
                score: c.score,
            })
            .collect(),
        resolution,
        alternatives,
    }
}

/// Agent-facing text for a retrieval result.
pub fn render(set: &DocumentSet, query: &str, index: &DocumentIndex) -> String {
    if index.is_empty() {
        return "No business rules guides found.".to_string();
    }

    let Some(primary) = set.entries.first() else {
        return format!("No strong match for '{}'.\n{}", query.trim(), index.catalog());
    };

    if set.resolution == Resolution::Fallback {
        return format!(
            "Best match (confidence: moderate):\n\n{}\n\n---\n{}",
            primary.document.text,
            index.catalog()
        );
    }

    let mut out = primary.document.text.clone();
    if let Some(secondary) = set.entries.get(1) {
        out.push_str("\n\n===== ADDITIONAL GUIDE (also relevant) =====\n\n");
        out.push_str(&secondary.document.text);
    }

    if !set.alternatives.is_empty() {
        let titles: Vec<&str> = set
            .alternatives
            .iter()
            .map(|key| index.get(key).map(|d| d.title.as_str()).unwrap_or(key.as_str()))
            .collect();
        out.push_str(
            "\n\n---\nOther potentially relevant guides (call get_business_rules again with a \
             different keyword if the question spans multiple domains): ",
        );
        out.push_str(&titles.join(", "));
    }
    out
}
