use std::sync::Arc;

use tracing::{info, warn};

use crate::schema::SchemaContext;
use crate::verifier::{RuleText, VerificationGate};

/// FAIL verdicts one question may consume before an answer is accepted unverified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionBudget {
    used: u32,
    max: u32,
}

impl RevisionBudget {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn consume(&mut self) {
        self.used = self.used.saturating_add(1).min(self.max);
    }
}

/// One candidate answer as presented at the submission boundary.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionAttempt<'a> {
    pub question: &'a str,
    pub sql: &'a str,
    pub rules: &'a [RuleText],
    pub schema: &'a SchemaContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted {
        sql: String,
    },
    RevisionRequested {
        issues: Vec<String>,
        revisions_remaining: u32,
    },
    /// The budget ran out; the last attempt stands with its unresolved issues.
    AcceptedUnverified {
        sql: String,
        issues: Vec<String>,
    },
}

impl SubmissionOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::RevisionRequested { .. } => "revision_requested",
            Self::AcceptedUnverified { .. } => "accepted_unverified",
        }
    }

    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::RevisionRequested { .. })
    }

    pub fn issues(&self) -> &[String] {
        match self {
            Self::Accepted { .. } => &[],
            Self::RevisionRequested { issues, .. } | Self::AcceptedUnverified { issues, .. } => {
                issues
            }
        }
    }

    /// Text returned to the agent loop.
    pub fn feedback(&self) -> String {
        match self {
            Self::Accepted { .. } => "Answer accepted.".to_string(),
            Self::RevisionRequested {
                issues,
                revisions_remaining,
            } => format!(
                "The answer was not submitted. Fix these issues and call submit_answer again \
                 ({revisions_remaining} revision(s) left):\n{}",
                bullet_list(issues)
            ),
            Self::AcceptedUnverified { issues, .. } => format!(
                "Answer accepted without verification; the revision budget is exhausted. \
                 Unresolved issues:\n{}",
                bullet_list(issues)
            ),
        }
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Runs the gate once per submission and applies the revision budget.
pub struct SubmissionController {
    gate: Arc<VerificationGate>,
}

impl SubmissionController {
    pub fn new(gate: Arc<VerificationGate>) -> Self {
        Self { gate }
    }

    pub async fn submit(
        &self,
        budget: &mut RevisionBudget,
        attempt: SubmissionAttempt<'_>,
    ) -> SubmissionOutcome {
        let verdict = self
            .gate
            .verify(attempt.question, attempt.sql, attempt.rules, attempt.schema)
            .await;

        if verdict.passed {
            info!(revisions_used = budget.used(), "submission accepted");
            return SubmissionOutcome::Accepted {
                sql: attempt.sql.to_string(),
            };
        }

        if budget.is_exhausted() {
            warn!(
                revisions_used = budget.used(),
                issues = verdict.issues.len(),
                "revision budget exhausted, accepting unverified"
            );
            return SubmissionOutcome::AcceptedUnverified {
                sql: attempt.sql.to_string(),
                issues: verdict.issues,
            };
        }

        budget.consume();
        info!(
            revisions_remaining = budget.remaining(),
            issues = verdict.issues.len(),
            "submission sent back for revision"
        );
        SubmissionOutcome::RevisionRequested {
            issues: verdict.issues,
            revisions_remaining: budget.remaining(),
        }
    }
}
