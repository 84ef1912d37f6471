/// DuckDB-backed `SqlEngine`.
///
/// Every call opens its own read-only connection on a blocking thread, so concurrent
/// sessions never share a connection and no statement can write to the file.
use std::path::PathBuf;

use async_trait::async_trait;
use duckdb::arrow::array::Array;
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::arrow::util::display::array_value_to_string;
use duckdb::{AccessMode, Config, Connection};
use tracing::debug;

use super::{quote_ident, SqlEngine, MAX_COLUMN_MATCHES, SAMPLE_ROWS};
use crate::error::AppError;
use crate::schema::{ColumnInfo, ColumnMatch, ColumnSearch, ResultSet, SchemaListing, TableSchema};

pub struct DuckDbEngine {
    path: PathBuf,
    max_rows: usize,
}

impl DuckDbEngine {
    pub fn new(path: impl Into<PathBuf>, max_rows: usize) -> Self {
        Self {
            path: path.into(),
            max_rows,
        }
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T, AppError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, duckdb::Error> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let config = Config::default().access_mode(AccessMode::ReadOnly)?;
            let conn = Connection::open_with_flags(&path, config)?;
            f(&conn)
        })
        .await
        .map_err(|e| AppError::SqlEngine(format!("spawn_blocking join error: {e}")))?
        .map_err(|e| AppError::SqlEngine(e.to_string()))
    }
}

#[async_trait]
impl SqlEngine for DuckDbEngine {
    async fn list_schemas(&self) -> Result<Vec<SchemaListing>, AppError> {
        let pairs = self
            .with_connection(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT table_schema, table_name FROM information_schema.tables \
                     WHERE table_schema NOT IN ('information_schema', 'pg_catalog') \
                     ORDER BY table_schema, table_name",
                )?;
                let pairs = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(pairs)
            })
            .await?;

        let mut listings: Vec<SchemaListing> = Vec::new();
        for (schema, table) in pairs {
            match listings.last_mut() {
                Some(last) if last.name == schema => last.tables.push(table),
                _ => listings.push(SchemaListing {
                    name: schema,
                    tables: vec![table],
                }),
            }
        }
        Ok(listings)
    }

    async fn describe_table(&self, schema: &str, table: &str) -> Result<TableSchema, AppError> {
        let (schema_name, table_name) = (schema.to_string(), table.to_string());
        let (columns, sample_rows) = self
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT column_name, data_type, is_nullable FROM information_schema.columns \
                     WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                )?;
                let columns = stmt
                    .query_map([&schema_name, &table_name], |row| {
                        Ok(ColumnInfo {
                            name: row.get(0)?,
                            data_type: row.get(1)?,
                            nullable: row.get::<_, String>(2)? == "YES",
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                if columns.is_empty() {
                    return Ok((columns, Vec::new()));
                }

                let sql = format!(
                    "SELECT * FROM {}.{} LIMIT {SAMPLE_ROWS}",
                    quote_ident(&schema_name),
                    quote_ident(&table_name)
                );
                let mut stmt = conn.prepare(&sql)?;
                let batches: Vec<RecordBatch> = stmt.query_arrow([])?.collect();
                let (rows, _) = render_rows(&batches, SAMPLE_ROWS);
                Ok((columns, rows))
            })
            .await?;

        if columns.is_empty() {
            return Err(AppError::SqlEngine(format!("table not found: {schema}.{table}")));
        }
        Ok(TableSchema {
            schema: schema.to_string(),
            table: table.to_string(),
            columns,
            sample_rows,
        })
    }

    async fn search_columns(&self, search: &ColumnSearch) -> Result<Vec<ColumnMatch>, AppError> {
        let keyword = search.keyword.trim().to_string();
        if keyword.is_empty() {
            return Err(AppError::SqlEngine("keyword must not be empty".to_string()));
        }

        // rank parameters come first, then the WHERE parameters in clause order
        let mut params = vec![keyword.clone(), format!("{keyword}%"), format!("%{keyword}%")];
        let mut clauses = vec![
            "table_catalog NOT IN ('system', 'temp')",
            "table_schema NOT IN ('information_schema', 'pg_catalog')",
            "LOWER(column_name) LIKE LOWER(?)",
        ];
        let filters = [
            ("LOWER(table_schema) LIKE LOWER(?)", &search.schema),
            ("LOWER(table_name) LIKE LOWER(?)", &search.table),
        ];
        for (clause, filter) in filters {
            if let Some(value) = filter.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                clauses.push(clause);
                params.push(format!("%{value}%"));
            }
        }
        let sql = format!(
            "SELECT table_schema, table_name, column_name, data_type, \
                    CASE WHEN LOWER(column_name) = LOWER(?) THEN 3 \
                         WHEN LOWER(column_name) LIKE LOWER(?) THEN 2 \
                         ELSE 1 END AS match_rank \
             FROM information_schema.columns \
             WHERE {} \
             ORDER BY match_rank DESC, table_schema, table_name, column_name \
             LIMIT {MAX_COLUMN_MATCHES}",
            clauses.join(" AND ")
        );

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let matches = stmt
                .query_map(duckdb::params_from_iter(params.iter()), |row| {
                    Ok(ColumnMatch {
                        schema: row.get(0)?,
                        table: row.get(1)?,
                        column: row.get(2)?,
                        data_type: row.get(3)?,
                        rank: u8::try_from(row.get::<_, i32>(4)?).unwrap_or(1),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(matches)
        })
        .await
    }

    async fn execute(&self, sql: &str) -> Result<ResultSet, AppError> {
        let sql = sql.trim().trim_end_matches(';').to_string();
        if sql.is_empty() {
            return Err(AppError::SqlEngine("sql must not be empty".to_string()));
        }
        let max_rows = self.max_rows;
        debug!(sql = %sql, "executing sql");

        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let arrow = stmt.query_arrow([])?;
            let columns: Vec<String> = arrow
                .get_schema()
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect();
            let batches: Vec<RecordBatch> = arrow.collect();
            let (rows, truncated) = render_rows(&batches, max_rows);
            Ok(ResultSet {
                columns,
                rows,
                truncated,
            })
        })
        .await
    }
}

/// Render up to `max_rows` rows as display strings. Returns whether rows were dropped.
fn render_rows(batches: &[RecordBatch], max_rows: usize) -> (Vec<Vec<String>>, bool) {
    let total: usize = batches.iter().map(|b| b.num_rows()).sum();
    let mut rows = Vec::with_capacity(total.min(max_rows));
    'outer: for batch in batches {
        for row in 0..batch.num_rows() {
            if rows.len() == max_rows {
                break 'outer;
            }
            let values = batch
                .columns()
                .iter()
                .map(|col| {
                    if col.is_null(row) {
                        "NULL".to_string()
                    } else {
                        array_value_to_string(col, row).unwrap_or_else(|e| format!("<{e}>"))
                    }
                })
                .collect();
            rows.push(values);
        }
    }
    (rows, total > max_rows)
}
