use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_destination_schema() -> String {
    "public".to_owned()
}

fn default_enabled() -> bool {
    true
}

/// Per-table synchronization settings, resolved from configuration.
///
/// A [`TableConfig`] is immutable for the duration of one run and is owned by
/// the pipeline processing that table. SQL snippets (`extract_query`,
/// `create_table_sql`, `truncate_sql`, `index_query`) arrive here already
/// rendered; template expansion happens upstream of the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TableConfig {
    /// Name of the table in the source database. When `extract_query` is set
    /// this is used for logging and index tracking only.
    pub source_table_name: String,
    /// Name of the destination table in the warehouse.
    pub destination_table_name: String,
    /// Schema of the destination table.
    #[serde(default = "default_destination_schema")]
    pub destination_schema_name: String,
    /// Hand-written extraction query replacing the generated `SELECT`.
    #[serde(default)]
    pub extract_query: Option<String>,
    /// Hand-written `CREATE TABLE` statement replacing the generated DDL.
    #[serde(default)]
    pub create_table_sql: Option<String>,
    /// Hand-written truncate statement used when full-refreshing a table that
    /// is defined by a hand-written extraction query.
    #[serde(default)]
    pub truncate_sql: Option<String>,
    /// Source columns excluded from the warehouse.
    #[serde(default)]
    pub columns_to_drop: Vec<String>,
    /// Destination column used as the distribution key.
    #[serde(default)]
    pub distribution_key: Option<String>,
    /// Destination columns used as sort keys.
    #[serde(default)]
    pub sort_keys: Vec<String>,
    /// Columns used to match records when merging into the destination.
    /// Empty means primary keys are inferred from the source table.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Monotonically increasing source column used to detect new rows.
    #[serde(default)]
    pub index_column: Option<String>,
    /// Hand-written query returning the current maximum index in a column
    /// named `index_value`. Overrides `index_column` for computing the new
    /// index.
    #[serde(default)]
    pub index_query: Option<String>,
    /// Rows are only ever inserted, never updated or deleted by key.
    #[serde(default)]
    pub append_only: bool,
    /// Delete all destination rows before loading instead of merging by key.
    #[serde(default)]
    pub full_refresh: bool,
    /// Drop and recreate the destination table, preserving grants. Implies
    /// a full refresh.
    #[serde(default)]
    pub rebuild: bool,
    /// Per-column overrides of the source-to-warehouse type mapping, keyed by
    /// the lowercased native type.
    #[serde(default)]
    pub type_map: HashMap<String, String>,
    /// Whether this table is processed at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl TableConfig {
    /// Returns the type-map override for a native type, if configured.
    pub fn type_override(&self, native_type: &str) -> Option<&str> {
        self.type_map
            .get(&native_type.to_lowercase())
            .map(String::as_str)
    }

    /// Returns `true` if the table tracks an incremental index.
    pub fn has_incremental_index(&self) -> bool {
        self.index_column.is_some() || self.index_query.is_some()
    }

    /// Fully qualified name of the destination table.
    pub fn destination(&self) -> String {
        format!(
            "{}.{}",
            self.destination_schema_name, self.destination_table_name
        )
    }
}
