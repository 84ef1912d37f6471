/// Per-model request and token counters for the arbiter and verifier models.
///
/// All counters share one Redis hash; each field is `{counter}:{model}`. Without Redis,
/// recording does nothing and the stats come back empty.
use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::openai::ChatCompletionUsage;
use crate::redis::RedisCache;

const USAGE_KEY: &str = "business_rules:usage";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UsageStats {
    pub models: Vec<ModelUsageStats>,
    pub redis_available: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModelUsageStats {
    pub model: String,
    pub requests: u64,
    /// Sum over requests whose response reported a token count.
    pub total_tokens: Option<u64>,
    pub token_counted_requests: u64,
    pub token_unknown_requests: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    Requests,
    Tokens,
    Counted,
    Unknown,
}

impl Counter {
    const ALL: [Counter; 4] = [
        Counter::Requests,
        Counter::Tokens,
        Counter::Counted,
        Counter::Unknown,
    ];

    fn name(self) -> &'static str {
        match self {
            Counter::Requests => "requests",
            Counter::Tokens => "tokens_total",
            Counter::Counted => "tokens_known_requests",
            Counter::Unknown => "tokens_unknown_requests",
        }
    }

    fn field(self, model: &str) -> String {
        format!("{}:{model}", self.name())
    }

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

#[derive(Clone)]
pub struct UsageTracker {
    redis: RedisCache,
}

impl UsageTracker {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    pub async fn record(&self, model: &str, usage: Option<&ChatCompletionUsage>) {
        let fields = increments(model, usage);
        let borrowed: Vec<(&str, i64)> = fields.iter().map(|(f, d)| (f.as_str(), *d)).collect();
        self.redis.hincr_many(USAGE_KEY, &borrowed).await;
    }

    pub async fn get_usage_stats(&self) -> UsageStats {
        let redis_available = self.redis.is_available().await;
        let models = self
            .redis
            .hgetall(USAGE_KEY)
            .await
            .map(|entries| aggregate(entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))))
            .unwrap_or_default();
        UsageStats {
            models,
            redis_available,
        }
    }
}

fn increments(model: &str, usage: Option<&ChatCompletionUsage>) -> Vec<(String, i64)> {
    let mut fields = vec![(Counter::Requests.field(model), 1)];
    match usage.and_then(|u| u.total_tokens) {
        Some(tokens) => {
            fields.push((Counter::Tokens.field(model), i64::try_from(tokens).unwrap_or(i64::MAX)));
            fields.push((Counter::Counted.field(model), 1));
        }
        None => fields.push((Counter::Unknown.field(model), 1)),
    }
    fields
}

/// Fold raw hash fields into one row per model, sorted by model name.
fn aggregate<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<ModelUsageStats> {
    let mut by_model: BTreeMap<&str, ModelUsageStats> = BTreeMap::new();

    for (field, value) in entries {
        let Some((counter, model)) = field
            .split_once(':')
            .and_then(|(name, model)| Some((Counter::parse(name)?, model)))
        else {
            continue;
        };
        let n = value.parse::<u64>().unwrap_or(0);
        let stats = by_model.entry(model).or_insert_with(|| ModelUsageStats {
            model: model.to_string(),
            ..Default::default()
        });
        match counter {
            Counter::Requests => stats.requests = n,
            Counter::Tokens => stats.total_tokens = Some(n),
            Counter::Counted => stats.token_counted_requests = n,
            Counter::Unknown => stats.token_unknown_requests = n,
        }
    }

    by_model.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregates_fields_per_model() {
        let entries = [
            ("requests:verifier", "3"),
            ("tokens_total:verifier", "1200"),
            ("tokens_known_requests:verifier", "2"),
            ("tokens_unknown_requests:verifier", "1"),
            ("requests:arbiter", "1"),
            ("garbage", "9"),
            ("latency:arbiter", "40"),
        ];
        let models = aggregate(entries);
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model, "arbiter");
        assert_eq!(models[0].requests, 1);
        assert_eq!(models[0].total_tokens, None);
        assert_eq!(
            models[1],
            ModelUsageStats {
                model: "verifier".to_string(),
                requests: 3,
                total_tokens: Some(1200),
                token_counted_requests: 2,
                token_unknown_requests: 1,
            }
        );
    }

    #[test]
    fn model_names_may_contain_colons() {
        let models = aggregate([("requests:openai/gpt-4o:free", "2")]);
        assert_eq!(models[0].model, "openai/gpt-4o:free");
    }

    #[test]
    fn increments_split_on_token_reporting() {
        let usage = ChatCompletionUsage {
            prompt_tokens: Some(10),
            completion_tokens: Some(5),
            total_tokens: Some(15),
        };
        assert_eq!(
            increments("m", Some(&usage)),
            vec![
                ("requests:m".to_string(), 1),
                ("tokens_total:m".to_string(), 15),
                ("tokens_known_requests:m".to_string(), 1),
            ]
        );
        assert_eq!(
            increments("m", None),
            vec![
                ("requests:m".to_string(), 1),
                ("tokens_unknown_requests:m".to_string(), 1),
            ]
        );
    }
}
