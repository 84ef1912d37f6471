/// Deterministic doubles and a small guide corpus shared by unit tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rules_common::embedding::TextEmbedder;
use rules_common::error::CommonError;
use rules_common::reasoning::Reasoner;

use crate::index::DocumentIndex;
use crate::model::ParsedGuide;
use crate::parser;

pub const CHESS: &str = r#"# Chess Tournament Rules (chess Database)

## Opening Classification

Never count games that open with the French Defense in opening statistics.
Openings are grouped by ECO code: 'A' flank, 'B' semi-open, 'C' open, 'D' closed.

## Player Names

Keep first and last names in separate columns.
Ratings below 1000 are provisional and must be excluded from rating averages.
"#;

pub const CRAFT_BEER: &str = r#"# Craft Beer Inventory Rules (craft_beer Database)

## Bitterness Classification

Map `ibu` values to labels with CASE WHEN: 'Low' below 20, 'Medium' from 20 to 40, 'High' above 40.

## Brewery Filters

Exclude breweries whose status is 'Closed'.
"#;

pub const FINANCIAL_BANKING: &str = r#"# Financial Banking Rules (financial Database)

Tables: loan, account

## Loan Status Codes

Status 'A' means the contract finished with no problems, 'B' finished unpaid,
'C' running OK, 'D' running in debt.

## Asset Quality

Loans in status 'B' or 'D' are non-performing; all others are performing assets.
"#;

pub const FINANCIAL_MARKETS: &str = r#"# Financial Markets Rules (markets Database)

## Trade Settlement

Only settled trades count toward volume. Ignore trades flagged "CANCELLED".
"#;

pub fn sample_guides() -> Vec<ParsedGuide> {
    vec![
        parser::parse_guide("chess_tournaments.md", CHESS),
        parser::parse_guide("craft_beer_inventory.md", CRAFT_BEER),
        parser::parse_guide("financial_banking.md", FINANCIAL_BANKING),
        parser::parse_guide("financial_markets.md", FINANCIAL_MARKETS),
    ]
}

pub async fn sample_index() -> Arc<DocumentIndex> {
    let index = DocumentIndex::build(sample_guides(), &StubEmbedder::new())
        .await
        .expect("sample index builds");
    Arc::new(index)
}

/// Topic vocabulary for the stub embedder: one dimension per topic.
const TOPICS: &[&[&str]] = &[
    &["financ", "bank", "loan", "asset", "perform", "credit", "debt", "account"],
    &["beer", "brew", "ibu", "bitter", "hop"],
    &["chess", "opening", "rating", "game", "player", "defense"],
    &["market", "trade", "settle", "stock", "volume"],
];

/// Bag-of-topics embedder. Each dimension counts tokens starting with a topic stem.
#[derive(Default)]
pub struct StubEmbedder {
    overrides: HashMap<String, Vec<f32>>,
    delay: Option<Duration>,
    fail_queries: bool,
    query_calls: AtomicUsize,
}

impl StubEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query_vector(mut self, query: &str, vector: Vec<f32>) -> Self {
        self.overrides.insert(query.to_string(), vector);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn topic_vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; TOPICS.len()];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
        {
            for (dim, stems) in TOPICS.iter().enumerate() {
                if stems.iter().any(|s| token.starts_with(s)) {
                    vector[dim] += 1.0;
                }
            }
        }
        vector
    }
}

#[async_trait]
impl TextEmbedder for StubEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CommonError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = Self::topic_vector(t);
                // documents always carry a small constant component so none is all-zero
                v.push(0.1);
                v
            })
            .collect())
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CommonError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_queries {
            return Err(CommonError::Embedding("stub embedder offline".to_string()));
        }
        if let Some(vector) = self.overrides.get(query) {
            return Ok(vector.clone());
        }
        let mut v = Self::topic_vector(query);
        v.push(0.0);
        Ok(v)
    }

    fn model_tag(&self) -> &str {
        "stub-topics"
    }
}

enum Behavior {
    Reply(String),
    Fail,
    Hang,
}

/// Scripted reasoner that records every prompt it receives.
pub struct StubReasoner {
    behavior: Behavior,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl StubReasoner {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with_behavior(Behavior::Reply(text.to_string()))
    }

    pub fn failing() -> Self {
        Self::with_behavior(Behavior::Fail)
    }

    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_user_content(&self) -> Option<String> {
        self.prompts.lock().ok()?.last().cloned()
    }
}

#[async_trait]
impl Reasoner for StubReasoner {
    async fn complete(&self, _system_prompt: &str, user_content: &str) -> Result<String, CommonError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(user_content.to_string());
        }
        match &self.behavior {
            Behavior::Reply(text) => Ok(text.clone()),
            Behavior::Fail => Err(CommonError::Reasoning("stub reasoner offline".to_string())),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("PASS".to_string())
            }
        }
    }

    fn model(&self) -> &str {
        "stub-reasoner"
    }
}
