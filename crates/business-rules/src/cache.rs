/// Redis cache for query embeddings.
///
/// All operations degrade to misses when Redis is unavailable. Vectors are keyed by the
/// embedding model tag and the exact query text.
///
/// Key schema:
/// - `brg:v1:qemb:{sha256(model_tag|query)}`: JSON-serialized `Vec<f32>` (TTL: 3600s)
use sha2::{Digest, Sha256};
use tracing::warn;

use rules_common::redis::RedisCache;

const KEY_PREFIX: &str = "brg:v1:";
const QUERY_EMBEDDING_TTL_SECS: u64 = 3600;

pub struct QueryEmbeddingCache {
    redis: RedisCache,
}

impl QueryEmbeddingCache {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    pub async fn get(&self, model_tag: &str, query: &str) -> Option<Vec<f32>> {
        let key = query_embedding_key(model_tag, query);
        let json = self.redis.get(&key).await?;
        serde_json::from_str::<Vec<f32>>(&json)
            .inspect_err(|e| warn!(error = %e, key, "cache deserialization failed"))
            .ok()
            .filter(|v| !v.is_empty())
    }

    pub async fn set(&self, model_tag: &str, query: &str, embedding: &[f32]) {
        let key = query_embedding_key(model_tag, query);
        if let Ok(json) = serde_json::to_string(embedding) {
            self.redis
                .set_with_ttl(&key, &json, QUERY_EMBEDDING_TTL_SECS)
                .await;
        }
    }
}

fn query_embedding_key(model_tag: &str, query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_tag.as_bytes());
    hasher.update(b"|");
    hasher.update(query.as_bytes());
    format!("{KEY_PREFIX}qemb:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_model_specific() {
        let a = query_embedding_key("nomic-embed-text-v1.5", "loan status");
        let b = query_embedding_key("other-model", "loan status");
        assert!(a.starts_with("brg:v1:qemb:"));
        assert_eq!(a.len(), "brg:v1:qemb:".len() + 64);
        assert_ne!(a, b);
        assert_eq!(a, query_embedding_key("nomic-embed-text-v1.5", "loan status"));
    }

    #[tokio::test]
    async fn misses_without_redis() {
        let cache = QueryEmbeddingCache::new(RedisCache::new(None));
        cache.set("m", "q", &[1.0, 2.0]).await;
        assert_eq!(cache.get("m", "q").await, None);
    }
}
