/// The relational store the agent queries. Only introspection and read-only execution
/// are exposed.
use async_trait::async_trait;

use crate::error::AppError;
use crate::schema::{ColumnMatch, ColumnSearch, ResultSet, SchemaListing, TableSchema};

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckDbEngine;

/// Rows fetched by `describe_table` as a preview.
pub const SAMPLE_ROWS: usize = 3;
/// Upper bound on `search_columns` results.
pub const MAX_COLUMN_MATCHES: usize = 40;

#[async_trait]
pub trait SqlEngine: Send + Sync {
    async fn list_schemas(&self) -> Result<Vec<SchemaListing>, AppError>;

    async fn describe_table(&self, schema: &str, table: &str) -> Result<TableSchema, AppError>;

    /// Columns whose name contains the keyword, best match first: exact, then prefix,
    /// then substring. At most `MAX_COLUMN_MATCHES`.
    async fn search_columns(&self, search: &ColumnSearch) -> Result<Vec<ColumnMatch>, AppError>;

    /// Run a query, returning at most the engine's configured row cap.
    async fn execute(&self, sql: &str) -> Result<ResultSet, AppError>;
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
