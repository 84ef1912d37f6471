/// Verification gate: a second model reviews candidate SQL against the question, the
/// retrieved rules and the schema before an answer is accepted.
///
/// The gate fails closed. An outage, a timeout or an unreadable reply is a FAIL with an
/// explanatory issue, never a silent PASS.
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use rules_common::reasoning::Reasoner;

use crate::clauses::{self, ClauseFinding};
use crate::error::StageError;
use crate::schema::SchemaContext;

const VERIFIER_SYSTEM_PROMPT: &str = "\
You verify SQL written for a DuckDB database. Decide whether the query returns the \
correct result for the question, given the business rules and the schema.

You receive the question, every applicable business rules guide in full, the schema \
of the tables involved, and the query.

Check, in order:

1. Rule coverage. Every rule that applies to the question must be implemented as a \
WHERE filter, HAVING clause, CASE expression or JOIN condition. Exclusions, entities \
reported separately, code-to-label mappings, minimum thresholds and date cutoffs are \
the rules most often missed.
2. Columns. Every column must exist in the schema. Watch for similarly named columns \
with different meanings.
3. Tables and domain terms. Prefer detail tables when filters apply. Domain terms \
follow the guide's definition, not everyday usage.
4. Output shape. All requested columns are selected, names stay in separate columns, \
classifications use the guide's labels, literal label columns are present when implied.
5. Numbers. ROUND only when asked. Ratios are fractions unless a percentage is asked for.
6. Filters. No unjustified filters or joins. HAVING for aggregate thresholds, WHERE \
for per-row thresholds.

Reply with PASS on the first line when the query is correct. Otherwise reply with \
FAIL on the first line and then one specific issue per line, each saying what is \
wrong and how to fix it.";

const GENERIC_FAILURE_ISSUE: &str =
    "The verifier rejected the query without listing specific issues.";

static ISSUE_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]+|\d+[.):])\s*").expect("valid regex"));

/// A retrieved guide as handed to the gate: its key and full text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleText {
    pub source: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub passed: bool,
    pub issues: Vec<String>,
}

impl VerificationVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            issues: Vec::new(),
        }
    }

    pub fn fail(issues: Vec<String>) -> Self {
        Self {
            passed: false,
            issues,
        }
    }
}

pub struct VerificationGate {
    reasoner: Arc<dyn Reasoner>,
    timeout: Duration,
    enforce_clauses: bool,
}

impl VerificationGate {
    pub fn new(reasoner: Arc<dyn Reasoner>, timeout: Duration, enforce_clauses: bool) -> Self {
        Self {
            reasoner,
            timeout,
            enforce_clauses,
        }
    }

    pub fn model(&self) -> &str {
        self.reasoner.model()
    }

    /// Review `sql` once. Never retries; the caller owns any revision loop.
    pub async fn verify(
        &self,
        question: &str,
        sql: &str,
        rules: &[RuleText],
        schema: &SchemaContext,
    ) -> VerificationVerdict {
        if sql.trim().is_empty() {
            return VerificationVerdict::fail(vec!["The submitted SQL is empty.".to_string()]);
        }

        let findings = clauses::audit(rules, sql);
        let user_content = build_user_content(question, sql, rules, schema, &findings);

        let verdict = match self.call(&user_content).await {
            Ok(response) => match parse_verdict(&response) {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(model = self.model(), error = %e, "verifier reply could not be parsed");
                    VerificationVerdict::fail(vec![format!(
                        "The verifier response could not be parsed ({e}); the query was not verified."
                    )])
                }
            },
            Err(e) => {
                warn!(model = self.model(), error = %e, "verifier unavailable, failing closed");
                VerificationVerdict::fail(vec![format!(
                    "The verifier could not be reached ({e}); the query was not verified."
                )])
            }
        };

        let verdict = if verdict.passed && self.enforce_clauses && !findings.is_empty() {
            VerificationVerdict::fail(findings.iter().map(ClauseFinding::describe).collect())
        } else {
            verdict
        };

        info!(
            passed = verdict.passed,
            issues = verdict.issues.len(),
            clause_findings = findings.len(),
            "verification complete"
        );
        verdict
    }

    async fn call(&self, user_content: &str) -> Result<String, StageError> {
        tokio::time::timeout(
            self.timeout,
            self.reasoner.complete(VERIFIER_SYSTEM_PROMPT, user_content),
        )
        .await
        .map_err(|_| StageError::Timeout(self.timeout))?
        .map_err(|e| StageError::Unavailable(e.to_string()))
    }
}

fn build_user_content(
    question: &str,
    sql: &str,
    rules: &[RuleText],
    schema: &SchemaContext,
    findings: &[ClauseFinding],
) -> String {
    let mut out = format!("## Original Question\n{question}\n\n## Business Rules\n");
    if rules.is_empty() {
        out.push_str("(none retrieved)\n");
    }
    for rule in rules {
        out.push_str(&format!("### {}\n{}\n\n", rule.source, rule.text.trim_end()));
    }

    out.push_str("\n## Schema Information\n");
    if schema.is_empty() {
        out.push_str("(none retrieved)");
    } else {
        out.push_str(&schema.render());
    }

    out.push_str(&format!("\n\n## Submitted SQL Query\n```sql\n{}\n```", sql.trim()));

    if !findings.is_empty() {
        out.push_str("\n\n## Exclusion Clause Pre-check (advisory)\n");
        out.push_str("These exclusion sentences name terms the query does not filter on:\n");
        for finding in findings {
            out.push_str(&format!("- {}\n", finding.describe()));
        }
    }
    out
}

/// Parse a verifier reply. The first non-empty line must start with PASS or FAIL.
pub fn parse_verdict(response: &str) -> Result<VerificationVerdict, StageError> {
    let mut lines = response
        .lines()
        .map(|l| l.trim().trim_matches(|c: char| c == '*' || c == '`').trim())
        .filter(|l| !l.is_empty());
    let Some(first) = lines.next() else {
        return Err(StageError::MalformedVerdict("empty response".to_string()));
    };

    let word: String = first
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    match word.as_str() {
        "PASS" => Ok(VerificationVerdict::pass()),
        "FAIL" => {
            let rest = first[word.len()..].trim_start_matches([':', '-', ' ']);
            let issues: Vec<String> = std::iter::once(rest)
                .chain(lines)
                .map(|l| ISSUE_MARKER_RE.replace(l.trim(), "").trim().to_string())
                .filter(|l| !l.is_empty())
                .collect();
            if issues.is_empty() {
                Ok(VerificationVerdict::fail(vec![GENERIC_FAILURE_ISSUE.to_string()]))
            } else {
                Ok(VerificationVerdict::fail(issues))
            }
        }
        _ => Err(StageError::MalformedVerdict(
            first.chars().take(120).collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnInfo, TableSchema};
    use crate::testing::{StubReasoner, CHESS};

    fn chess_rules() -> Vec<RuleText> {
        vec![RuleText {
            source: "chess_tournaments.md".to_string(),
            text: CHESS.to_string(),
        }]
    }

    fn games_schema() -> SchemaContext {
        let mut ctx = SchemaContext::default();
        ctx.record_table(TableSchema {
            schema: "chess".to_string(),
            table: "games".to_string(),
            columns: vec![ColumnInfo {
                name: "opening".to_string(),
                data_type: "VARCHAR".to_string(),
                nullable: true,
            }],
            sample_rows: Vec::new(),
        });
        ctx
    }

    const UNFILTERED: &str = "SELECT opening, COUNT(*) FROM chess.games GROUP BY opening";

    #[test]
    fn parses_pass_and_fail_replies() {
        assert_eq!(parse_verdict("PASS"), Ok(VerificationVerdict::pass()));
        assert_eq!(parse_verdict("**PASS**\nLooks good."), Ok(VerificationVerdict::pass()));
        assert_eq!(
            parse_verdict("FAIL: missing the French Defense exclusion\n- ROUND is not requested\n2. wrong column"),
            Ok(VerificationVerdict::fail(vec![
                "missing the French Defense exclusion".to_string(),
                "ROUND is not requested".to_string(),
                "wrong column".to_string(),
            ]))
        );
        assert_eq!(
            parse_verdict("FAIL"),
            Ok(VerificationVerdict::fail(vec![GENERIC_FAILURE_ISSUE.to_string()]))
        );
    }

    #[test]
    fn unparseable_replies_are_malformed() {
        for reply in ["", "   \n", "The query looks mostly fine.", "PASSABLE?"] {
            assert!(
                matches!(parse_verdict(reply), Err(StageError::MalformedVerdict(_))),
                "reply should be rejected: {reply:?}"
            );
        }
    }

    #[tokio::test]
    async fn empty_sql_fails_without_calling_the_model() {
        let reasoner = Arc::new(StubReasoner::replying("PASS"));
        let gate = VerificationGate::new(reasoner.clone(), Duration::from_secs(1), false);
        let verdict = gate.verify("q", "  ", &chess_rules(), &games_schema()).await;
        assert!(!verdict.passed);
        assert_eq!(reasoner.calls(), 0);
    }

    #[tokio::test]
    async fn outages_timeouts_and_garbage_fail_closed() {
        let failing = VerificationGate::new(Arc::new(StubReasoner::failing()), Duration::from_secs(1), false);
        let verdict = failing.verify("q", UNFILTERED, &[], &SchemaContext::default()).await;
        assert!(!verdict.passed);
        assert!(verdict.issues[0].contains("could not be reached"));

        let hanging = VerificationGate::new(Arc::new(StubReasoner::hanging()), Duration::from_millis(20), false);
        let verdict = hanging.verify("q", UNFILTERED, &[], &SchemaContext::default()).await;
        assert!(!verdict.passed);

        let chatty = VerificationGate::new(
            Arc::new(StubReasoner::replying("Sure, here is my review")),
            Duration::from_secs(1),
            false,
        );
        let verdict = chatty.verify("q", UNFILTERED, &[], &SchemaContext::default()).await;
        assert!(!verdict.passed);
        assert!(verdict.issues[0].contains("could not be parsed"));
    }

    #[tokio::test]
    async fn prompt_carries_full_rules_schema_and_sql() {
        let long_rule = format!("# Long Guide\n\n{}END-OF-GUIDE", "Rows are kept. ".repeat(600));
        let rules = vec![RuleText {
            source: "long.md".to_string(),
            text: long_rule.clone(),
        }];
        let reasoner = Arc::new(StubReasoner::replying("PASS"));
        let gate = VerificationGate::new(reasoner.clone(), Duration::from_secs(1), false);

        let verdict = gate
            .verify("How many openings?", UNFILTERED, &rules, &games_schema())
            .await;
        assert!(verdict.passed);

        let prompt = reasoner.last_user_content().unwrap();
        assert!(prompt.starts_with("## Original Question\nHow many openings?"));
        assert!(prompt.contains(long_rule.trim_end()));
        assert!(prompt.contains("Table chess.games\n  - opening VARCHAR NULL"));
        assert!(prompt.contains(&format!("```sql\n{UNFILTERED}\n```")));
        assert!(!prompt.contains("Pre-check"));
    }

    #[tokio::test]
    async fn missing_french_defense_exclusion_fails_when_enforced() {
        let reasoner = Arc::new(StubReasoner::replying("PASS"));
        let advisory = VerificationGate::new(reasoner.clone(), Duration::from_secs(1), false);
        let verdict = advisory
            .verify("Most common opening?", UNFILTERED, &chess_rules(), &games_schema())
            .await;
        assert!(verdict.passed);
        let prompt = reasoner.last_user_content().unwrap();
        assert!(prompt.contains("## Exclusion Clause Pre-check (advisory)"));
        assert!(prompt.contains("'French Defense'"));

        let enforced = VerificationGate::new(Arc::new(StubReasoner::replying("PASS")), Duration::from_secs(1), true);
        let verdict = enforced
            .verify("Most common opening?", UNFILTERED, &chess_rules(), &games_schema())
            .await;
        assert!(!verdict.passed);
        assert!(verdict.issues.iter().any(|i| i.contains("French Defense")));
    }

    #[tokio::test]
    async fn excluding_the_wrong_opening_fails_when_enforced() {
        let gate = VerificationGate::new(Arc::new(StubReasoner::replying("PASS")), Duration::from_secs(1), true);
        let sql = "SELECT opening, COUNT(*) FROM chess.games \
                   WHERE opening NOT LIKE '%Sicilian Defense%' GROUP BY opening";
        let verdict = gate
            .verify("Most common opening?", sql, &chess_rules(), &games_schema())
            .await;
        assert!(!verdict.passed);
        assert!(verdict.issues.iter().any(|i| i.contains("French Defense")));
    }

    #[tokio::test]
    async fn model_fail_reports_its_issues() {
        let gate = VerificationGate::new(
            Arc::new(StubReasoner::replying("FAIL:\n- The French Defense exclusion is missing")),
            Duration::from_secs(1),
            false,
        );
        let verdict = gate
            .verify("Most common opening?", UNFILTERED, &chess_rules(), &games_schema())
            .await;
        assert_eq!(
            verdict,
            VerificationVerdict::fail(vec!["The French Defense exclusion is missing".to_string()])
        );
    }
}
