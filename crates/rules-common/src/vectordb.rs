/// Durable storage for document embeddings on top of LanceDB.
///
/// Similarity search happens in memory; the table only lets a restart skip the
/// embedding model when the corpus has not changed.
use std::sync::Arc;

use arrow_array::{RecordBatch, RecordBatchIterator};
use arrow_schema::Schema;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::Table;
use tracing::{debug, info};

use crate::error::CommonError;

fn vector_err<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> CommonError {
    move |e| CommonError::VectorDb(format!("{context}: {e}"))
}

pub struct VectorDb {
    db: lancedb::Connection,
}

impl VectorDb {
    /// Open (or create) the database directory at `path`.
    pub async fn connect(path: &str) -> Result<Self, CommonError> {
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(vector_err("connection failed"))?;
        debug!(path, "lancedb opened");
        Ok(Self { db })
    }

    pub async fn table_exists(&self, table_name: &str) -> Result<bool, CommonError> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(vector_err("listing tables failed"))?;
        Ok(names.iter().any(|n| n == table_name))
    }

    /// Replace the whole table with `batches`.
    pub async fn create_or_replace_table(
        &self,
        table_name: &str,
        schema: Arc<Schema>,
        batches: Vec<RecordBatch>,
    ) -> Result<(), CommonError> {
        if self.table_exists(table_name).await? {
            self.db
                .drop_table(table_name)
                .await
                .map_err(vector_err("drop table failed"))?;
        }

        let rows: usize = batches.iter().map(RecordBatch::num_rows).sum();
        let reader = RecordBatchIterator::new(batches.into_iter().map(Ok), schema);
        self.db
            .create_table(table_name, Box::new(reader))
            .execute()
            .await
            .map_err(vector_err("create table failed"))?;

        info!(table = table_name, rows, "vector table written");
        Ok(())
    }

    /// Full scan of a table, capped at `max_rows`.
    pub async fn read_all(
        &self,
        table_name: &str,
        max_rows: usize,
    ) -> Result<Vec<RecordBatch>, CommonError> {
        let stream = self
            .open(table_name)
            .await?
            .query()
            .limit(max_rows)
            .execute()
            .await
            .map_err(vector_err("table scan failed"))?;
        stream
            .try_collect()
            .await
            .map_err(vector_err("reading scan results failed"))
    }

    async fn open(&self, table_name: &str) -> Result<Table, CommonError> {
        self.db
            .open_table(table_name)
            .execute()
            .await
            .map_err(vector_err("open table failed"))
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Int32Array, StringArray};
    use arrow_schema::{DataType, Field};

    use super::*;

    fn batch(names: &[&str]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("name", DataType::Utf8, false),
            Field::new("n", DataType::Int32, false),
        ]));
        let n: Vec<i32> = (0..names.len() as i32).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(names.to_vec())),
                Arc::new(Int32Array::from(n)),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn tables_are_replaced_not_appended() {
        let dir = tempfile::tempdir().unwrap();
        let db = VectorDb::connect(dir.path().to_str().unwrap()).await.unwrap();
        assert!(!db.table_exists("docs").await.unwrap());

        let first = batch(&["a", "b", "c"]);
        db.create_or_replace_table("docs", first.schema(), vec![first])
            .await
            .unwrap();
        assert!(db.table_exists("docs").await.unwrap());

        let second = batch(&["d"]);
        db.create_or_replace_table("docs", second.schema(), vec![second])
            .await
            .unwrap();
        let rows: usize = db
            .read_all("docs", 100)
            .await
            .unwrap()
            .iter()
            .map(RecordBatch::num_rows)
            .sum();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn reading_a_missing_table_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = VectorDb::connect(dir.path().to_str().unwrap()).await.unwrap();
        assert!(matches!(
            db.read_all("absent", 10).await,
            Err(CommonError::VectorDb(_))
        ));
    }
}
