use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::shared::{
    IndexTableConfig, RetryConfig, SourceConfig, StorageConfig, ValidationError,
    WarehouseConnectionConfig,
};

fn default_max_parallel_tables() -> usize {
    4
}

/// Top-level configuration for a syncer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SyncerConfig {
    /// Warehouse connection parameters.
    pub warehouse: WarehouseConnectionConfig,
    /// Object storage used for staging extracted data.
    pub storage: StorageConfig,
    /// Location of the warehouse index table.
    #[serde(default)]
    pub index: IndexTableConfig,
    /// Retry policy for connectivity failures while processing a table.
    #[serde(default)]
    pub table_retry: RetryConfig,
    /// Maximum number of tables processed concurrently.
    #[serde(default = "default_max_parallel_tables")]
    pub max_parallel_tables: usize,
    /// Source databases to synchronize.
    pub sources: Vec<SourceConfig>,
}

impl SyncerConfig {
    /// Validates the whole configuration tree.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.storage.validate()?;

        if self.sources.is_empty() {
            return Err(ValidationError::NoSources);
        }

        let mut aliases = HashSet::new();
        for source in &self.sources {
            if !aliases.insert(source.alias.as_str()) {
                return Err(ValidationError::DuplicateSource(source.alias.clone()));
            }
        }

        if self.max_parallel_tables == 0 {
            return Err(ValidationError::InvalidConfig(
                "max_parallel_tables must be greater than 0".to_owned(),
            ));
        }

        Ok(())
    }
}
