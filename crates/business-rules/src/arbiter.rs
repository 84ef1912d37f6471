/// Stage 3: optional LLM disambiguation of low-confidence retrievals.
///
/// The model's answer is an untrusted suggestion. Anything other than a single well-formed
/// line naming known guides is rejected as `StageError::MalformedVerdict`, and the
/// orchestrator falls back to the earlier stages.
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use rules_common::reasoning::Reasoner;

use crate::error::StageError;
use crate::index::DocumentIndex;
use crate::model::ScoredCandidate;

const ARBITER_SYSTEM_PROMPT: &str = "\
You choose which business rules guide applies to a database search term. \
You will see the search term, the leading candidate guides in ranked order, \
and the full catalog of guides.

Respond with EXACTLY one line, one of:
CONFIRM
SELECT: <guide key>[, <guide key>]
NONE

Use CONFIRM when the first leading candidate is the right guide. \
Use SELECT to name the right guide (or two guides when the term clearly spans \
two domains) by the key shown in the catalog. \
Use NONE when no guide in the catalog applies.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterDecision {
    /// The first leading candidate is correct.
    Confirm,
    /// These catalog keys are correct, in the order named.
    Select(Vec<String>),
    /// Nothing in the catalog applies.
    NoMatch,
}

pub struct Arbiter {
    reasoner: Arc<dyn Reasoner>,
    timeout: Duration,
}

impl Arbiter {
    pub fn new(reasoner: Arc<dyn Reasoner>, timeout: Duration) -> Self {
        Self { reasoner, timeout }
    }

    pub async fn confirm(
        &self,
        query: &str,
        leading: &[ScoredCandidate],
        catalog: &DocumentIndex,
    ) -> Result<ArbiterDecision, StageError> {
        let user_content = build_user_content(query, leading, catalog);
        let response = tokio::time::timeout(
            self.timeout,
            self.reasoner.complete(ARBITER_SYSTEM_PROMPT, &user_content),
        )
        .await
        .map_err(|_| StageError::Timeout(self.timeout))?
        .map_err(|e| StageError::Unavailable(e.to_string()))?;

        debug!(model = self.reasoner.model(), response = %response.trim(), "arbiter replied");
        let decision = parse_decision(&response, catalog)?;
        if decision == ArbiterDecision::Confirm && leading.is_empty() {
            return Err(StageError::MalformedVerdict(
                "CONFIRM with no leading candidate".to_string(),
            ));
        }
        Ok(decision)
    }
}

fn build_user_content(query: &str, leading: &[ScoredCandidate], catalog: &DocumentIndex) -> String {
    let mut out = format!("Search term: {query}\n\nLeading candidates:\n");
    if leading.is_empty() {
        out.push_str("(none)\n");
    }
    for (i, candidate) in leading.iter().enumerate() {
        let doc = &candidate.document;
        out.push_str(&format!("{}. {}\n", i + 1, doc.summary_line()));
        if !doc.headers.is_empty() {
            out.push_str(&format!("   Sections: {}\n", doc.headers.join("; ")));
        }
    }

    out.push_str("\nCatalog:\n");
    for doc in catalog.documents() {
        out.push_str(&format!("- {}\n", doc.summary_line()));
    }
    out
}

/// Strictly parse an arbiter reply. Names may be keys (with or without `.md`) or titles.
pub fn parse_decision(response: &str, catalog: &DocumentIndex) -> Result<ArbiterDecision, StageError> {
    let mut lines = response.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(line) = lines.next() else {
        return Err(StageError::MalformedVerdict("empty response".to_string()));
    };
    if lines.next().is_some() {
        return Err(StageError::MalformedVerdict(format!(
            "expected a single line, got: {}",
            truncate(response)
        )));
    }

    let word = line.trim_end_matches('.').to_ascii_uppercase();
    if word == "CONFIRM" {
        return Ok(ArbiterDecision::Confirm);
    }
    if word == "NONE" {
        return Ok(ArbiterDecision::NoMatch);
    }

    let Some(names) = line
        .get(..7)
        .filter(|prefix| prefix.eq_ignore_ascii_case("SELECT:"))
        .map(|_| &line[7..])
    else {
        return Err(StageError::MalformedVerdict(format!(
            "unrecognized reply: {}",
            truncate(line)
        )));
    };

    let mut keys: Vec<String> = Vec::new();
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let doc = catalog
            .find_by_name(name)
            .ok_or_else(|| StageError::MalformedVerdict(format!("unknown guide: {name}")))?;
        if !keys.contains(&doc.key) {
            keys.push(doc.key.clone());
        }
    }
    if keys.is_empty() {
        return Err(StageError::MalformedVerdict("SELECT named no guide".to_string()));
    }
    Ok(ArbiterDecision::Select(keys))
}

fn truncate(text: &str) -> String {
    text.chars().take(120).collect()
}
