use serde::{Deserialize, Serialize};

fn default_index_schema() -> String {
    "public".to_owned()
}

fn default_index_table() -> String {
    "sync_table_index".to_owned()
}

/// Location of the warehouse table tracking per-table index values.
///
/// The table is append-only; the newest row per
/// `(datastore_name, database_name, table_name)` is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IndexTableConfig {
    /// Schema holding the index table.
    #[serde(default = "default_index_schema")]
    pub schema: String,
    /// Name of the index table.
    #[serde(default = "default_index_table")]
    pub table: String,
}

impl Default for IndexTableConfig {
    fn default() -> Self {
        Self {
            schema: default_index_schema(),
            table: default_index_table(),
        }
    }
}
