use serde::{Deserialize, Serialize};

use crate::shared::{SourceConnectionConfig, SourceEngine, TableConfig};

fn default_enabled() -> bool {
    true
}

/// A source database and the tables synchronized out of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceConfig {
    /// Colloquial name of the source, used in object keys, index tracking and
    /// logs. Must be unique across sources.
    pub alias: String,
    /// Engine family of the source database.
    pub engine: SourceEngine,
    /// Connection parameters.
    pub connection: SourceConnectionConfig,
    /// Whether this source is processed at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Tables to synchronize.
    pub tables: Vec<TableConfig>,
}
