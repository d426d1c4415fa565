use std::future::Future;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use config::shared::StorageConfig;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sync_error;

/// Upload attempts per object before the table fails.
const UPLOAD_RETRIES: u32 = 3;

/// Object-store key layout for one table extraction.
///
/// A single-file extract lands at `{prefix}/{alias}.{table}.{date_key}.avro`.
/// Once more than one chunk is produced the extract switches to manifest
/// mode: numbered chunks under `{prefix}/{alias}.{table}.{date_key}/` plus a
/// sibling `.manifest` file enumerating them.
#[derive(Debug, Clone)]
pub struct StagePaths {
    key_prefix: String,
}

impl StagePaths {
    pub fn new(prefix: &str, alias: &str, table: &str, date_key: &str) -> StagePaths {
        let qualified = format!("{alias}.{table}.{date_key}");
        let key_prefix = if prefix.is_empty() {
            qualified
        } else {
            format!("{prefix}/{qualified}")
        };

        StagePaths { key_prefix }
    }

    pub fn single_data_key(&self) -> String {
        format!("{}.avro", self.key_prefix)
    }

    pub fn numbered_data_key(&self, file_num: usize) -> String {
        format!("{}/{:05}.avro", self.key_prefix, file_num)
    }

    pub fn manifest_key(&self) -> String {
        format!("{}.manifest", self.key_prefix)
    }

    /// Key the next data file should be written to.
    pub fn next_data_key(&self, num_data_files: usize, manifest_mode: bool) -> String {
        if manifest_mode {
            self.numbered_data_key(num_data_files)
        } else {
            self.single_data_key()
        }
    }

    /// Keys of all data files written so far.
    pub fn data_keys(&self, num_data_files: usize, manifest_mode: bool) -> Vec<String> {
        if manifest_mode {
            (0..num_data_files)
                .map(|n| self.numbered_data_key(n))
                .collect()
        } else if num_data_files > 0 {
            vec![self.single_data_key()]
        } else {
            Vec::new()
        }
    }

    /// Key the warehouse bulk load points at.
    pub fn copy_target_key(&self, manifest_mode: bool) -> String {
        if manifest_mode {
            self.manifest_key()
        } else {
            self.single_data_key()
        }
    }
}

/// Client for the object store staging area.
#[derive(Clone)]
pub struct StageClient {
    client: Client,
    bucket: String,
}

impl StageClient {
    /// Creates a new staging client and verifies the bucket is reachable.
    pub async fn new(storage: &StorageConfig) -> SyncResult<StageClient> {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()))
            .load()
            .await;

        let stage_client = StageClient {
            client: Client::new(&config),
            bucket: storage.bucket.clone(),
        };

        stage_client.test_connection().await?;

        Ok(stage_client)
    }

    async fn test_connection(&self) -> SyncResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::StorageIoError,
                    "Object store bucket is not reachable",
                    DisplayErrorContext(&err)
                )
            })?;

        Ok(())
    }

    pub fn url(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    /// Uploads one object, retrying transient failures.
    pub async fn put_object(&self, key: &str, data: Vec<u8>) -> SyncResult<()> {
        let url = self.url(key);
        info!(url, bytes = data.len(), "writing staged object");

        with_upload_retries(key, || {
            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.to_owned();
            let data = data.clone();

            async move {
                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(data))
                    .content_type("application/octet-stream")
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        sync_error!(
                            ErrorKind::StorageIoError,
                            "Failed to upload staged object",
                            DisplayErrorContext(&err)
                        )
                    })
            }
        })
        .await?;

        info!(url, "wrote staged object");

        Ok(())
    }

    /// Writes the manifest object enumerating all chunk files.
    ///
    /// Written last, after all data chunks succeeded, so a partial extract
    /// never leaves a manifest pointing at missing objects.
    pub async fn put_manifest(
        &self,
        paths: &StagePaths,
        num_data_files: usize,
    ) -> SyncResult<()> {
        let entries: Vec<serde_json::Value> = paths
            .data_keys(num_data_files, true)
            .iter()
            .map(|key| json!({"url": self.url(key), "mandatory": true}))
            .collect();
        let manifest = json!({ "entries": entries });

        self.put_object(&paths.manifest_key(), manifest.to_string().into_bytes())
            .await
    }

    /// Deletes one staged object. Chunks are write-once, read-once: they are
    /// removed after a successful merge and never reused across runs.
    pub async fn delete_object(&self, key: &str) -> SyncResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::StorageIoError,
                    "Failed to delete staged object",
                    DisplayErrorContext(&err)
                )
            })?;

        Ok(())
    }
}

/// Runs an upload operation with quadratic backoff between attempts.
///
/// Intermittent credential refreshes and connection resets surface as errors
/// from a single attempt; the budget covers those without masking a bucket
/// that is genuinely gone.
async fn with_upload_retries<F, Fut>(key: &str, mut op: F) -> SyncResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<()>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt >= UPLOAD_RETRIES {
                    return Err(err);
                }

                let backoff = Duration::from_secs((3 * attempt * attempt) as u64);
                warn!(
                    key,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %err,
                    "staged object upload failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn single_file_key_layout() {
        let paths = StagePaths::new("stage", "shop", "orders", "20210501T000000");
        assert_eq!(
            paths.single_data_key(),
            "stage/shop.orders.20210501T000000.avro"
        );
        assert_eq!(
            paths.copy_target_key(false),
            "stage/shop.orders.20210501T000000.avro"
        );
        assert_eq!(
            paths.data_keys(1, false),
            vec!["stage/shop.orders.20210501T000000.avro".to_owned()]
        );
    }

    #[test]
    fn manifest_mode_key_layout() {
        let paths = StagePaths::new("stage", "shop", "orders", "20210501T000000");
        assert_eq!(
            paths.numbered_data_key(0),
            "stage/shop.orders.20210501T000000/00000.avro"
        );
        assert_eq!(
            paths.numbered_data_key(12),
            "stage/shop.orders.20210501T000000/00012.avro"
        );
        assert_eq!(
            paths.manifest_key(),
            "stage/shop.orders.20210501T000000.manifest"
        );
        assert_eq!(
            paths.copy_target_key(true),
            "stage/shop.orders.20210501T000000.manifest"
        );
        assert_eq!(
            paths.data_keys(2, true),
            vec![
                "stage/shop.orders.20210501T000000/00000.avro".to_owned(),
                "stage/shop.orders.20210501T000000/00001.avro".to_owned(),
            ]
        );
    }

    #[test]
    fn empty_prefix_omits_leading_separator() {
        let paths = StagePaths::new("", "shop", "orders", "20210501T000000");
        assert_eq!(paths.single_data_key(), "shop.orders.20210501T000000.avro");
    }

    #[test]
    fn no_files_means_no_keys() {
        let paths = StagePaths::new("stage", "shop", "orders", "20210501T000000");
        assert!(paths.data_keys(0, false).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upload_succeeds_within_the_retry_budget() {
        let attempts = RefCell::new(0u32);

        let result = with_upload_retries("k", || {
            let attempt = {
                let mut attempts = attempts.borrow_mut();
                *attempts += 1;
                *attempts
            };
            async move {
                if attempt < 3 {
                    Err(SyncError::from((
                        ErrorKind::StorageIoError,
                        "transient upload failure",
                    )))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(*attempts.borrow(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_fails_after_exhausting_retries() {
        let attempts = RefCell::new(0u32);

        let result = with_upload_retries("k", || {
            *attempts.borrow_mut() += 1;
            async {
                Err(SyncError::from((
                    ErrorKind::StorageIoError,
                    "transient upload failure",
                )))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::StorageIoError);
        assert_eq!(*attempts.borrow(), UPLOAD_RETRIES);
    }
}
