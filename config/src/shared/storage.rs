use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Object storage configuration used for staging extracted data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Name of the bucket, without any scheme prefix.
    pub bucket: String,
    /// Key prefix under which all staged objects are written.
    #[serde(default)]
    pub prefix: String,
    /// Region of the bucket.
    pub region: String,
    /// IAM role ARN the warehouse assumes when bulk-loading from the bucket.
    pub iam_copy_role: String,
}

impl StorageConfig {
    /// Validates the [`StorageConfig`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bucket.is_empty() {
            return Err(ValidationError::MissingBucket);
        }

        Ok(())
    }
}
