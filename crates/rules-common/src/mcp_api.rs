use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GetBusinessRulesParams {
    /// A schema name, domain keyword, or topic, e.g. "financial", "craft beer IBU",
    /// "loan status".
    pub search_term: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RetrievedRuleDocument {
    /// Stable document key (the guide's file name).
    pub key: String,
    pub title: String,
    pub schema_hints: Vec<String>,
    /// Score of the stage that selected this document.
    pub score: f32,
    /// Full rule text.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BusinessRulesResponse {
    /// Which stage resolved the search: lexical, semantic, arbitrated, fallback or
    /// no_confident_match.
    pub resolution: String,
    /// Zero, one or two rule documents.
    pub documents: Vec<RetrievedRuleDocument>,
    /// Other guides worth a follow-up search if the question spans several domains.
    pub alternatives: Vec<String>,
    /// Agent-facing rendering of the result.
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CheckSqlParams {
    /// The original natural-language question.
    pub question: String,
    /// The SQL query to check.
    pub sql: String,
    /// Business rules text. Defaults to every guide retrieved in this session.
    pub business_rules: Option<String>,
    /// Extra schema notes. Tables described in this session are always included.
    pub schema_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VerdictResponse {
    pub passed: bool,
    pub issues: Vec<String>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SubmitAnswerParams {
    /// The original natural-language question this answer is for.
    pub question: String,
    /// The final SQL query, with schema-qualified table names.
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubmitAnswerResponse {
    /// accepted, revision_requested or accepted_unverified.
    pub status: String,
    pub accepted: bool,
    pub query: String,
    pub issues: Vec<String>,
    pub revisions_remaining: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchemaListingEntry {
    pub schema: String,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ListSchemasResponse {
    pub schemas: Vec<SchemaListingEntry>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DescribeTableParams {
    /// Schema name, e.g. "financial".
    pub schema_name: String,
    /// Table name within the schema.
    pub table_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DescribeTableResponse {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnDescription>,
    pub sample_rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SearchColumnsParams {
    /// A word or partial word to find in column names, e.g. "status", "amount", "date".
    pub keyword: String,
    /// Optional schema filter (case-insensitive contains match).
    pub schema_name: Option<String>,
    /// Optional table filter (case-insensitive contains match).
    pub table_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ColumnMatchEntry {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub data_type: String,
    /// 3 exact, 2 prefix, 1 substring.
    pub rank: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchColumnsResponse {
    pub matches: Vec<ColumnMatchEntry>,
    /// True when the result hit the cap and a narrower keyword may find more.
    pub capped: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteSqlParams {
    /// SQL to execute against the read-only database.
    pub sql: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteSqlResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// True when more rows existed than were returned.
    pub truncated: bool,
}
