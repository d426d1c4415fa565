use std::path::Path;

use rust_cli_config::{Config, ConfigError, File};
use serde::de::DeserializeOwned;

use crate::environment::Environment;

/// Name of the environment variable overriding the configuration directory.
const CONFIG_DIR_ENV_NAME: &str = "SYNCER_CONFIG_DIR";

/// Default directory, relative to the working directory, holding config files.
const DEFAULT_CONFIG_DIR: &str = "configuration";

/// Prefix for environment variable overrides, e.g.
/// `SYNCER__WAREHOUSE__HOST=localhost`.
const ENV_PREFIX: &str = "SYNCER";

/// Loads configuration from layered YAML files plus environment overrides.
///
/// `base.yaml` is loaded first, then `{environment}.yaml` on top of it, then
/// any `SYNCER__`-prefixed environment variables. The environment is selected
/// via `APP_ENVIRONMENT` and defaults to prod.
pub fn load_config<T: DeserializeOwned>() -> Result<T, ConfigError> {
    let config_dir = std::env::var(CONFIG_DIR_ENV_NAME)
        .unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_owned());
    let config_dir = Path::new(&config_dir);

    let environment = Environment::load()
        .map_err(|err| ConfigError::Message(err.to_string()))?;
    let environment_file = format!("{environment}.yaml");

    let settings = Config::builder()
        .add_source(File::from(config_dir.join("base.yaml")).required(false))
        .add_source(File::from(config_dir.join(environment_file)).required(false))
        .add_source(
            rust_cli_config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<T>()
}
