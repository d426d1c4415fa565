use serde::{Deserialize, Serialize};

/// Retry policy for per-table processing.
///
/// Only connectivity-class failures consume attempts; schema and data errors
/// skip the table without retrying. Backoff between attempts is quadratic in
/// the number of attempts already made.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts before a connectivity failure becomes fatal.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}
