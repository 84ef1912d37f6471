/// MCP server for business rules retrieval and SQL verification.
///
/// Exposes eight tools:
/// - `get_business_rules`: Retrieve the guide(s) for a schema, domain or topic
/// - `check_sql`: Ask the verifier for a second opinion on a query
/// - `submit_answer`: Submit a final query through the verification gate
/// - `list_schemas`, `describe_table`, `search_columns`, `execute_sql`: Read-only
///   database access
/// - `get_usage_stats`: Per-model request and token counters
///
/// Each connection owns a `Session` holding the tables described so far, and per question
/// the guides retrieved for it and its revision budget.
use std::collections::HashMap;
use std::sync::Arc;

use rmcp::{
    Json, ServerHandler,
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router,
};
use tokio::sync::Mutex;
use tracing::info;

use rules_common::mcp_api::{
    BusinessRulesResponse, CheckSqlParams, ColumnDescription, ColumnMatchEntry,
    DescribeTableParams, DescribeTableResponse, ExecuteSqlParams, ExecuteSqlResponse,
    GetBusinessRulesParams, ListSchemasResponse, RetrievedRuleDocument, SchemaListingEntry,
    SearchColumnsParams, SearchColumnsResponse, SubmitAnswerParams, SubmitAnswerResponse,
    VerdictResponse,
};
use rules_common::usage::{UsageStats, UsageTracker};

use crate::model::{DocumentSet, RuleDocument};
use crate::retrieval::{self, RetrievalEngine};
use crate::schema::{ColumnSearch, SchemaContext};
use crate::sql_engine::{SqlEngine, MAX_COLUMN_MATCHES};
use crate::submission::{RevisionBudget, SubmissionAttempt, SubmissionController};
use crate::verifier::{RuleText, VerificationGate};

/// Per-connection state.
///
/// Retrieval does not name a question, so guides collect in `pending` until the next
/// `check_sql` or `submit_answer` claims them for its question.
#[derive(Debug, Default)]
pub struct Session {
    pending: Vec<Arc<RuleDocument>>,
    /// Keyed by normalized question text, as are `budgets`.
    rules: HashMap<String, Vec<Arc<RuleDocument>>>,
    schema: SchemaContext,
    budgets: HashMap<String, RevisionBudget>,
}

impl Session {
    fn record_rules(&mut self, set: &DocumentSet) {
        for entry in &set.entries {
            push_unique(&mut self.pending, &entry.document);
        }
    }

    /// Guides for `question_key`, first claiming whatever is pending.
    fn rules_for(&mut self, question_key: &str) -> Vec<RuleText> {
        let claimed = self.rules.entry(question_key.to_string()).or_default();
        for document in self.pending.drain(..) {
            push_unique(claimed, &document);
        }
        claimed
            .iter()
            .map(|d| RuleText {
                source: d.key.clone(),
                text: d.text.clone(),
            })
            .collect()
    }
}

fn push_unique(documents: &mut Vec<Arc<RuleDocument>>, document: &Arc<RuleDocument>) {
    if !documents.iter().any(|d| d.key == document.key) {
        documents.push(Arc::clone(document));
    }
}

fn question_key(question: &str) -> String {
    question
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Clone)]
pub struct BusinessRulesServer {
    retrieval: Arc<RetrievalEngine>,
    gate: Arc<VerificationGate>,
    submissions: Arc<SubmissionController>,
    sql_engine: Option<Arc<dyn SqlEngine>>,
    usage: UsageTracker,
    max_revisions: u32,
    session: Arc<Mutex<Session>>,
    tool_router: ToolRouter<BusinessRulesServer>,
}

impl BusinessRulesServer {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        gate: Arc<VerificationGate>,
        sql_engine: Option<Arc<dyn SqlEngine>>,
        usage: UsageTracker,
        max_revisions: u32,
    ) -> Self {
        Self {
            retrieval,
            submissions: Arc::new(SubmissionController::new(Arc::clone(&gate))),
            gate,
            sql_engine,
            usage,
            max_revisions,
            session: Arc::new(Mutex::new(Session::default())),
            tool_router: Self::tool_router(),
        }
    }

    /// A handle sharing every read-only component but starting an empty session.
    pub fn new_session(&self) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::default())),
            ..self.clone()
        }
    }

    fn sql_engine(&self) -> Result<&Arc<dyn SqlEngine>, String> {
        self.sql_engine.as_ref().ok_or_else(|| {
            "SQL tools are not configured: set DUCKDB_PATH and build with the duckdb feature"
                .to_string()
        })
    }
}

#[tool_router]
impl BusinessRulesServer {
    #[tool(description = "Retrieve the business rules guide for a schema name, domain keyword or topic (e.g. 'financial', 'craft beer IBU', 'loan status'). Returns the full guide text, a second guide when the term spans two domains, and other guides worth a follow-up search.")]
    async fn get_business_rules(
        &self,
        Parameters(params): Parameters<GetBusinessRulesParams>,
    ) -> Result<Json<BusinessRulesResponse>, String> {
        let search_term = params.search_term.trim().to_string();
        if search_term.is_empty() {
            return Err("search_term must not be empty".to_string());
        }

        let set = self.retrieval.resolve(&search_term).await;
        let text = retrieval::render(&set, &search_term, self.retrieval.index());
        self.session.lock().await.record_rules(&set);

        info!(
            search_term = %search_term,
            resolution = set.resolution.as_str(),
            documents = ?set.keys(),
            "business rules retrieved"
        );

        let documents = set
            .entries
            .iter()
            .map(|e| RetrievedRuleDocument {
                key: e.document.key.clone(),
                title: e.document.title.clone(),
                schema_hints: e.document.schema_hints.clone(),
                score: e.score,
                content: e.document.text.clone(),
            })
            .collect();

        Ok(Json(BusinessRulesResponse {
            resolution: set.resolution.as_str().to_string(),
            documents,
            alternatives: set.alternatives,
            text,
        }))
    }

    #[tool(description = "Validate a SQL query before submitting it. Checks that every applicable business rule is implemented, that columns exist, and that output format and numeric precision match the question. Guides retrieved and tables described in this session are included automatically.")]
    async fn check_sql(
        &self,
        Parameters(params): Parameters<CheckSqlParams>,
    ) -> Result<Json<VerdictResponse>, String> {
        if params.question.trim().is_empty() {
            return Err("question must not be empty".to_string());
        }

        let (rules, schema) = {
            let mut session = self.session.lock().await;
            let rules = match params.business_rules.filter(|r| !r.trim().is_empty()) {
                Some(text) => vec![RuleText {
                    source: "provided business rules".to_string(),
                    text,
                }],
                None => session.rules_for(&question_key(&params.question)),
            };
            (rules, session.schema.clone().with_notes(params.schema_info))
        };

        let verdict = self
            .gate
            .verify(&params.question, &params.sql, &rules, &schema)
            .await;

        let message = if verdict.passed {
            "LGTM: no issues found. You may call submit_answer with this query.".to_string()
        } else {
            format!(
                "Issues found. Fix these before submitting:\n{}",
                verdict
                    .issues
                    .iter()
                    .map(|i| format!("- {i}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )
        };

        Ok(Json(VerdictResponse {
            passed: verdict.passed,
            issues: verdict.issues,
            message,
        }))
    }

    #[tool(description = "Submit the final SQL query for a question. The query is verified first; if issues are found it is sent back for revision until the revision budget for that question is spent.")]
    async fn submit_answer(
        &self,
        Parameters(params): Parameters<SubmitAnswerParams>,
    ) -> Result<Json<SubmitAnswerResponse>, String> {
        let query = params.query.trim().to_string();
        if query.is_empty() {
            return Err("query must not be empty".to_string());
        }
        let key = question_key(&params.question);

        let (rules, schema, mut budget) = {
            let mut session = self.session.lock().await;
            let budget = session
                .budgets
                .get(&key)
                .copied()
                .unwrap_or_else(|| RevisionBudget::new(self.max_revisions));
            (session.rules_for(&key), session.schema.clone(), budget)
        };

        let attempt = SubmissionAttempt {
            question: &params.question,
            sql: &query,
            rules: &rules,
            schema: &schema,
        };
        let outcome = self.submissions.submit(&mut budget, attempt).await;
        self.session.lock().await.budgets.insert(key, budget);

        Ok(Json(SubmitAnswerResponse {
            status: outcome.status().to_string(),
            accepted: outcome.is_accepted(),
            query,
            issues: outcome.issues().to_vec(),
            revisions_remaining: budget.remaining(),
            message: outcome.feedback(),
        }))
    }

    #[tool(description = "List the database schemas and their tables.")]
    async fn list_schemas(&self) -> Result<Json<ListSchemasResponse>, String> {
        let listings = self
            .sql_engine()?
            .list_schemas()
            .await
            .map_err(|e| format!("list_schemas failed: {e}"))?;

        Ok(Json(ListSchemasResponse {
            schemas: listings
                .into_iter()
                .map(|l| SchemaListingEntry {
                    schema: l.name,
                    tables: l.tables,
                })
                .collect(),
        }))
    }

    #[tool(description = "Describe a table: column names, types, nullability and a few sample rows. Described tables are passed to the verifier.")]
    async fn describe_table(
        &self,
        Parameters(params): Parameters<DescribeTableParams>,
    ) -> Result<Json<DescribeTableResponse>, String> {
        let schema_name = params.schema_name.trim();
        let table_name = params.table_name.trim();
        if schema_name.is_empty() || table_name.is_empty() {
            return Err("schema_name and table_name must not be empty".to_string());
        }

        let table = self
            .sql_engine()?
            .describe_table(schema_name, table_name)
            .await
            .map_err(|e| format!("describe_table failed: {e}"))?;
        self.session.lock().await.schema.record_table(table.clone());

        Ok(Json(DescribeTableResponse {
            schema: table.schema,
            table: table.table,
            columns: table
                .columns
                .into_iter()
                .map(|c| ColumnDescription {
                    name: c.name,
                    data_type: c.data_type,
                    nullable: c.nullable,
                })
                .collect(),
            sample_rows: table.sample_rows,
        }))
    }

    #[tool(description = "Search column names across all schemas and tables by keyword (e.g. 'status', 'amount', 'date'). Matches are ranked exact, then prefix, then substring; optional schema and table filters narrow the search. Follow up with describe_table for sample values.")]
    async fn search_columns(
        &self,
        Parameters(params): Parameters<SearchColumnsParams>,
    ) -> Result<Json<SearchColumnsResponse>, String> {
        let keyword = params.keyword.trim();
        if keyword.is_empty() {
            return Err("keyword must not be empty".to_string());
        }
        let filter = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let search = ColumnSearch {
            keyword: keyword.to_string(),
            schema: filter(params.schema_name),
            table: filter(params.table_name),
        };

        let matches = self
            .sql_engine()?
            .search_columns(&search)
            .await
            .map_err(|e| format!("search_columns failed: {e}"))?;
        info!(keyword = %search.keyword, matches = matches.len(), "columns searched");

        Ok(Json(SearchColumnsResponse {
            capped: matches.len() >= MAX_COLUMN_MATCHES,
            matches: matches
                .into_iter()
                .map(|m| ColumnMatchEntry {
                    schema: m.schema,
                    table: m.table,
                    column: m.column,
                    data_type: m.data_type,
                    rank: m.rank,
                })
                .collect(),
        }))
    }

    #[tool(description = "Execute a read-only SQL query and return the rows as text. Results are capped; truncated is true when more rows existed.")]
    async fn execute_sql(
        &self,
        Parameters(params): Parameters<ExecuteSqlParams>,
    ) -> Result<Json<ExecuteSqlResponse>, String> {
        if params.sql.trim().is_empty() {
            return Err("sql must not be empty".to_string());
        }

        let result = self
            .sql_engine()?
            .execute(&params.sql)
            .await
            .map_err(|e| format!("execute_sql failed: {e}"))?;

        Ok(Json(ExecuteSqlResponse {
            columns: result.columns,
            rows: result.rows,
            truncated: result.truncated,
        }))
    }

    #[tool(description = "Get usage stats aggregated per model for the arbiter and verifier (requests + tokens when reported by upstream).")]
    async fn get_usage_stats(&self) -> Result<Json<UsageStats>, String> {
        Ok(Json(self.usage.get_usage_stats().await))
    }
}

#[tool_handler]
impl ServerHandler for BusinessRulesServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "business-rules".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Business rules MCP server for text-to-SQL. Call get_business_rules with a \
                 schema name or domain keyword before writing SQL, inspect tables with \
                 list_schemas, search_columns and describe_table, test with execute_sql, optionally ask \
                 check_sql for a second opinion, and finish with submit_answer."
                    .to_string(),
            ),
        }
    }
}
