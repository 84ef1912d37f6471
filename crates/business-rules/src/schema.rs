use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

/// A described table: ordered columns plus a few sample rows rendered as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub sample_rows: Vec<Vec<String>>,
}

impl TableSchema {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaListing {
    pub name: String,
    pub tables: Vec<String>,
}

/// A column whose name matched a search keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMatch {
    pub schema: String,
    pub table: String,
    pub column: String,
    pub data_type: String,
    /// 3 exact, 2 prefix, 1 substring.
    pub rank: u8,
}

/// Narrows a column search. Filters are case-insensitive substring matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnSearch {
    pub keyword: String,
    pub schema: Option<String>,
    pub table: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub truncated: bool,
}

/// Schema metadata handed to the verification gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaContext {
    pub tables: Vec<TableSchema>,
    pub notes: Option<String>,
}

impl SchemaContext {
    /// Add a described table, replacing an earlier description of the same table.
    pub fn record_table(&mut self, table: TableSchema) {
        match self
            .tables
            .iter_mut()
            .find(|t| t.schema.eq_ignore_ascii_case(&table.schema) && t.table.eq_ignore_ascii_case(&table.table))
        {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.notes.is_none()
    }

    /// Plain-text rendering for prompts: one block per table, then caller notes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("Table {}\n", table.qualified_name()));
            for col in &table.columns {
                let null = if col.nullable { "NULL" } else { "NOT NULL" };
                out.push_str(&format!("  - {} {} {}\n", col.name, col.data_type, null));
            }
            if !table.sample_rows.is_empty() {
                out.push_str("  Sample rows:\n");
                for row in &table.sample_rows {
                    out.push_str(&format!("    {}\n", row.join(" | ")));
                }
            }
            out.push('\n');
        }
        if let Some(notes) = &self.notes {
            out.push_str("Notes:\n");
            out.push_str(notes.trim());
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loan_table(columns: &[(&str, &str)]) -> TableSchema {
        TableSchema {
            schema: "financial".to_string(),
            table: "loan".to_string(),
            columns: columns
                .iter()
                .map(|(name, ty)| ColumnInfo {
                    name: name.to_string(),
                    data_type: ty.to_string(),
                    nullable: true,
                })
                .collect(),
            sample_rows: vec![vec!["1".to_string(), "A".to_string()]],
        }
    }

    #[test]
    fn re_describing_a_table_replaces_it() {
        let mut ctx = SchemaContext::default();
        ctx.record_table(loan_table(&[("loan_id", "INTEGER")]));
        ctx.record_table(loan_table(&[("loan_id", "INTEGER"), ("status", "VARCHAR")]));
        assert_eq!(ctx.tables.len(), 1);
        assert_eq!(ctx.tables[0].columns.len(), 2);
    }

    #[test]
    fn render_lists_columns_samples_and_notes() {
        let mut ctx = SchemaContext::default().with_notes(Some("status is a single letter".to_string()));
        ctx.record_table(loan_table(&[("loan_id", "INTEGER"), ("status", "VARCHAR")]));
        let text = ctx.render();
        assert!(text.starts_with("Table financial.loan\n  - loan_id INTEGER NULL"));
        assert!(text.contains("  - status VARCHAR NULL"));
        assert!(text.contains("    1 | A"));
        assert!(text.ends_with("Notes:\nstatus is a single letter"));
    }

    #[test]
    fn blank_notes_are_dropped() {
        let ctx = SchemaContext::default().with_notes(Some("   ".to_string()));
        assert!(ctx.is_empty());
        assert_eq!(ctx.render(), "");
    }
}
