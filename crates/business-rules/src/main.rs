use std::sync::Arc;

use rmcp::{ServiceExt, transport::stdio};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use business_rules::arbiter::Arbiter;
use business_rules::cache::QueryEmbeddingCache;
use business_rules::config::Config;
use business_rules::parser;
use business_rules::retrieval::RetrievalEngine;
use business_rules::semantic::SemanticScorer;
use business_rules::server::BusinessRulesServer;
use business_rules::sql_engine::SqlEngine;
use business_rules::store::EmbeddingStore;
use business_rules::verifier::VerificationGate;
use rules_common::embedding::{Embedder, TextEmbedder};
use rules_common::openai::{OpenAiClient, OpenAiClientConfig};
use rules_common::reasoning::ChatReasoner;
use rules_common::redis::RedisCache;
use rules_common::usage::UsageTracker;
use rules_common::vectordb::VectorDb;

const ARBITER_TEMPERATURE: f32 = 0.0;
const VERIFIER_TEMPERATURE: f32 = 0.1;

fn init_tracing() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    // stdout carries the MCP stream
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "business-rules starting");

    let config = Config::from_env()?;
    info!(
        guides_dir = %config.guides_dir.display(),
        lancedb_path = %config.lancedb_path,
        redis = config.redis_url.is_some(),
        duckdb = config.duckdb_path.is_some(),
        arbiter_model = config.arbiter_model.as_deref().unwrap_or("disabled"),
        verifier_model = %config.verifier_model,
        "config"
    );

    let redis = RedisCache::new(config.redis_url.as_deref());
    if redis.is_available().await {
        info!("redis reachable");
    } else if redis.is_configured() {
        warn!("redis configured but unreachable, running without cache or usage accounting");
    }
    let usage = UsageTracker::new(redis.clone());
    let query_cache = Arc::new(QueryEmbeddingCache::new(redis));

    let embedder = Arc::new(Embedder::new().await?);
    info!(model = embedder.model_tag(), "embedding model loaded");

    let guides = parser::load_guides(&config.guides_dir)?;
    info!(guides = guides.len(), "loaded business rules guides");

    let store = EmbeddingStore::new(VectorDb::connect(&config.lancedb_path).await?);
    let index = Arc::new(store.load_or_build(guides, embedder.as_ref()).await?);

    let openai = Arc::new(OpenAiClient::new(OpenAiClientConfig::from_env())?);

    let semantic = SemanticScorer::new(embedder, config.embedding_timeout).with_cache(query_cache);
    let mut retrieval = RetrievalEngine::new(index, semantic, config.thresholds.clone());
    if let Some(model) = &config.arbiter_model {
        let reasoner = ChatReasoner::new(Arc::clone(&openai), model.as_str(), ARBITER_TEMPERATURE)
            .with_request_timeout(config.arbiter_timeout)
            .with_usage(usage.clone());
        retrieval = retrieval.with_arbiter(Arbiter::new(Arc::new(reasoner), config.arbiter_timeout));
        info!(model = %model, "arbiter enabled");
    }

    let verifier = ChatReasoner::new(
        Arc::clone(&openai),
        config.verifier_model.as_str(),
        VERIFIER_TEMPERATURE,
    )
    .with_request_timeout(config.verifier_timeout)
    .with_usage(usage.clone());
    let gate = Arc::new(VerificationGate::new(
        Arc::new(verifier),
        config.verifier_timeout,
        config.enforce_clauses,
    ));

    let server = BusinessRulesServer::new(
        Arc::new(retrieval),
        gate,
        sql_engine(&config),
        usage,
        config.max_revisions,
    );

    match &config.tcp_listen_addr {
        Some(addr) => serve_tcp(server, addr).await,
        None => serve_stdio(server).await,
    }
}

async fn serve_stdio(server: BusinessRulesServer) -> anyhow::Result<()> {
    info!("serving MCP on stdio");
    let running = server
        .serve(stdio())
        .await
        .inspect_err(|e| error!(error = %e, "stdio session failed to start"))?;
    let reason = running.waiting().await?;
    info!(?reason, "stdio session ended");
    Ok(())
}

/// Every accepted connection gets its own session state over the shared engines.
async fn serve_tcp(server: BusinessRulesServer, addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(listen_addr = %addr, "serving MCP on TCP");
    loop {
        let (stream, peer) = listener.accept().await?;
        let session = server.new_session();
        tokio::spawn(async move {
            info!(%peer, "client connected");
            match session.serve(stream).await {
                Ok(running) => match running.waiting().await {
                    Ok(reason) => info!(%peer, ?reason, "client disconnected"),
                    Err(e) => error!(%peer, error = %e, "session task failed"),
                },
                Err(e) => error!(%peer, error = %e, "session failed to start"),
            }
        });
    }
}

#[cfg(feature = "duckdb")]
fn sql_engine(config: &Config) -> Option<Arc<dyn SqlEngine>> {
    let path = config.duckdb_path.as_ref()?;
    info!(duckdb_path = %path, max_rows = config.sql_max_rows, "sql engine enabled");
    Some(Arc::new(business_rules::sql_engine::DuckDbEngine::new(
        path,
        config.sql_max_rows,
    )))
}

#[cfg(not(feature = "duckdb"))]
fn sql_engine(config: &Config) -> Option<Arc<dyn SqlEngine>> {
    if config.duckdb_path.is_some() {
        warn!("DUCKDB_PATH is set but this build lacks the duckdb feature; SQL tools disabled");
    }
    None
}
