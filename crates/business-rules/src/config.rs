use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

const DEFAULT_VERIFIER_MODEL: &str = "moonshotai/kimi-k2.5";

/// Thresholds for the multi-stage retrieval engine.
///
/// Lexical scores are weighted token-match sums; semantic scores are cosine similarities.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalThresholds {
    /// Stage 1 accepts when the top lexical score reaches this value.
    pub lexical_accept: f32,
    pub lexical_multi_relative: f32,
    pub lexical_multi_absolute: f32,
    /// Lowest lexical score still usable as a fallback answer.
    pub lexical_floor: f32,
    /// Stage 2 accepts when the top similarity reaches this value.
    pub semantic_accept: f32,
    pub semantic_multi_relative: f32,
    pub semantic_multi_absolute: f32,
    /// Lowest similarity still usable as a fallback answer.
    pub semantic_floor: f32,
    /// A Stage 2 acceptance within this margin of `semantic_accept` is sent to the arbiter.
    pub borderline_margin: f32,
}

impl Default for RetrievalThresholds {
    fn default() -> Self {
        Self {
            lexical_accept: 50.0,
            lexical_multi_relative: 0.6,
            lexical_multi_absolute: 30.0,
            lexical_floor: 10.0,
            semantic_accept: 0.25,
            semantic_multi_relative: 0.9,
            semantic_multi_absolute: 0.35,
            semantic_floor: 0.15,
            borderline_margin: 0.05,
        }
    }
}

/// Application configuration loaded explicitly from environment variables.
///
/// Paths have no defaults. Redis, DuckDB and the arbiter model are optional; without them
/// the server runs without caching, without the SQL tools, and without Stage 3.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the `*.md` business rules guides.
    pub guides_dir: PathBuf,
    /// Filesystem path to the LanceDB data directory.
    pub lancedb_path: String,
    /// Redis connection URL. `None` disables caching and usage accounting.
    pub redis_url: Option<String>,
    /// DuckDB database file opened read-only by the SQL tools.
    pub duckdb_path: Option<String>,
    pub arbiter_model: Option<String>,
    pub verifier_model: String,
    pub thresholds: RetrievalThresholds,
    pub embedding_timeout: Duration,
    pub arbiter_timeout: Duration,
    pub verifier_timeout: Duration,
    /// Turn advisory exclusion-clause findings into a hard FAIL.
    pub enforce_clauses: bool,
    pub max_revisions: u32,
    pub sql_max_rows: usize,
    pub tcp_listen_addr: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RULES_GUIDES_DIR`: directory of business rules guides
    /// - `LANCEDB_PATH`: path to LanceDB data directory
    ///
    /// Everything else is optional; unparseable numbers fall back to defaults.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let guides_dir = var("RULES_GUIDES_DIR").map(PathBuf::from).ok_or_else(|| {
            AppError::Config("RULES_GUIDES_DIR environment variable is required".to_string())
        })?;
        if !guides_dir.is_dir() {
            return Err(AppError::Config(format!(
                "guides directory not found at {}",
                guides_dir.display()
            )));
        }

        let lancedb_path = var("LANCEDB_PATH").ok_or_else(|| {
            AppError::Config("LANCEDB_PATH environment variable is required".to_string())
        })?;

        let defaults = RetrievalThresholds::default();
        let f32_or = |name: &str, default: f32| {
            var(name)
                .and_then(|s| s.trim().parse::<f32>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(default)
        };
        let u64_or = |name: &str, default: u64| {
            var(name)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let thresholds = RetrievalThresholds {
            lexical_accept: f32_or("RULES_LEXICAL_ACCEPT", defaults.lexical_accept),
            lexical_multi_relative: f32_or(
                "RULES_LEXICAL_MULTI_RELATIVE",
                defaults.lexical_multi_relative,
            ),
            lexical_multi_absolute: f32_or(
                "RULES_LEXICAL_MULTI_ABSOLUTE",
                defaults.lexical_multi_absolute,
            ),
            lexical_floor: f32_or("RULES_LEXICAL_FLOOR", defaults.lexical_floor),
            semantic_accept: f32_or("RULES_SEMANTIC_ACCEPT", defaults.semantic_accept),
            semantic_multi_relative: f32_or(
                "RULES_SEMANTIC_MULTI_RELATIVE",
                defaults.semantic_multi_relative,
            ),
            semantic_multi_absolute: f32_or(
                "RULES_SEMANTIC_MULTI_ABSOLUTE",
                defaults.semantic_multi_absolute,
            ),
            semantic_floor: f32_or("RULES_SEMANTIC_FLOOR", defaults.semantic_floor),
            borderline_margin: f32_or("RULES_BORDERLINE_MARGIN", defaults.borderline_margin),
        };

        let enforce_clauses = var("VERIFIER_ENFORCE_CLAUSES")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            guides_dir,
            lancedb_path,
            redis_url: var("REDIS_URL"),
            duckdb_path: var("DUCKDB_PATH"),
            arbiter_model: var("ARBITER_MODEL"),
            verifier_model: var("VERIFIER_MODEL")
                .unwrap_or_else(|| DEFAULT_VERIFIER_MODEL.to_string()),
            thresholds,
            embedding_timeout: Duration::from_millis(u64_or("EMBEDDING_TIMEOUT_MS", 2_000)),
            arbiter_timeout: Duration::from_secs(u64_or("ARBITER_TIMEOUT_SECS", 20)),
            verifier_timeout: Duration::from_secs(u64_or("VERIFIER_TIMEOUT_SECS", 60)),
            enforce_clauses,
            max_revisions: u64_or("MAX_REVISIONS", 2) as u32,
            sql_max_rows: u64_or("SQL_MAX_ROWS", 100) as usize,
            tcp_listen_addr: var("MCP_TCP_LISTEN_ADDR"),
        })
    }
}
