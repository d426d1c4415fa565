use config::load_config;
use config::shared::SyncerConfig;

use crate::core::SyncerError;

/// Loads the [`SyncerConfig`] and validates it.
pub fn load_syncer_config() -> Result<SyncerConfig, SyncerError> {
    let config = load_config::<SyncerConfig>()
        .map_err(|err| SyncerError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| SyncerError::Config(err.to_string()))?;

    Ok(config)
}
