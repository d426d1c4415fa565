use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The object storage bucket is missing or empty.
    #[error("Invalid storage config: `bucket` must be set")]
    MissingBucket,

    /// No sources configured.
    #[error("At least one source database must be configured")]
    NoSources,

    /// Duplicate source aliases.
    #[error("Duplicate source alias: {0}")]
    DuplicateSource(String),

    /// General configuration validation error.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
