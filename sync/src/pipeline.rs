use std::time::Duration;

use chrono::Utc;
use config::shared::{RetryConfig, StorageConfig, TableConfig};
use tracing::{debug, error, info};

use crate::avro::{record_schema, write_chunk, AvroField, DEFAULT_MAX_CHUNK_BYTES};
use crate::connectors::{ColumnDescriptor, SourceClient};
use crate::error::{ErrorKind, Fault, SyncError, SyncResult};
use crate::index::store::IndexStore;
use crate::index::IndexWindow;
use crate::load::{load, staging_table_name, LoadOutcome, LoadRequest};
use crate::metrics::{
    observe, record_event, EventState, EVENT_CREATE_TABLE, EVENT_DISCONNECT_ERROR,
    EVENT_EXTRACT_TABLE, EVENT_LOAD_TABLE, SYNC_ROWS_EXTRACTED_TOTAL, SYNC_UPLOAD_BYTES_TOTAL,
};
use crate::schema::{reconcile, DestinationStatus};
use crate::stage::{StageClient, StagePaths};
use crate::warehouse::Warehouse;
use crate::{bail, sync_error};

/// Terminal result of processing one table.
///
/// A skipped table is not a failed run: the error is collected and the batch
/// continues with its other tables.
#[derive(Debug)]
pub enum TableOutcome {
    Completed(LoadOutcome),
    Skipped {
        table: String,
        error: SyncError,
    },
}

/// Validates a table's static configuration.
///
/// These are the contradictions that can be detected without touching any
/// database; they classify as configuration errors and are never retried.
pub fn validate(spec: &TableConfig) -> SyncResult<()> {
    let table = &spec.source_table_name;
    let has_index = spec.has_incremental_index();

    let conflict = |msg: &'static str| -> SyncError {
        sync_error!(
            ErrorKind::ConfigError,
            msg,
            format!("table {table}")
        )
    };

    if !has_index && spec.append_only {
        return Err(conflict("Append only without an incremental index"));
    }
    if spec.full_refresh && spec.append_only {
        return Err(conflict("Append only with full refresh"));
    }
    if !has_index && !spec.full_refresh && !spec.rebuild {
        return Err(conflict("Incremental update with no specified index"));
    }
    if spec.index_column.is_some() && spec.full_refresh {
        return Err(conflict("Full refresh with an index column"));
    }
    if spec.index_query.is_some() && spec.full_refresh {
        return Err(conflict("Full refresh with an index query"));
    }
    if spec.index_query.is_some() && spec.index_column.is_some() {
        return Err(conflict("Both an index query and an index column"));
    }
    if spec.extract_query.is_some()
        && spec.primary_key.is_empty()
        && !spec.append_only
        && !spec.full_refresh
        && !spec.rebuild
    {
        return Err(conflict("Incremental extract query without a primary key"));
    }
    if spec.rebuild && spec.truncate_sql.is_some() {
        return Err(conflict(
            "Cannot rebuild a table with a truncate statement because it would \
             not be correct to drop the table",
        ));
    }
    if spec.rebuild && spec.create_table_sql.is_some() {
        return Err(conflict(
            "Cannot rebuild a table with hand-written DDL, the staging table \
             name cannot be substituted into it",
        ));
    }

    Ok(())
}

/// What one extraction produced in the staging area.
struct ExtractOutput {
    paths: StagePaths,
    row_count: usize,
    num_data_files: usize,
    manifest_mode: bool,
    upload_size: usize,
}

/// Drives one table through validate, reconcile, extract, load and index
/// recording, with the retry policy wrapped around the whole pass.
pub struct TablePipeline {
    alias: String,
    spec: TableConfig,
    client: SourceClient,
    warehouse: Warehouse,
    stage: StageClient,
    index_store: IndexStore,
    storage_prefix: String,
    iam_copy_role: String,
    max_chunk_bytes: usize,
    retry: RetryConfig,
}

impl TablePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        alias: String,
        spec: TableConfig,
        client: SourceClient,
        warehouse: Warehouse,
        stage: StageClient,
        index_store: IndexStore,
        storage: &StorageConfig,
        retry: RetryConfig,
    ) -> TablePipeline {
        TablePipeline {
            alias,
            spec,
            client,
            warehouse,
            stage,
            index_store,
            storage_prefix: storage.prefix.clone(),
            iam_copy_role: storage.iam_copy_role.clone(),
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            retry,
        }
    }

    pub fn source_table_name(&self) -> &str {
        &self.spec.source_table_name
    }

    /// Processes the table to exactly one terminal outcome.
    ///
    /// Configuration, schema and data errors skip the table; connectivity
    /// errors are retried with quadratic backoff up to the retry budget; an
    /// unclassified error is returned as-is and aborts the run.
    pub async fn run(&self) -> SyncResult<TableOutcome> {
        let table = self.spec.source_table_name.clone();

        if let Err(err) = validate(&self.spec) {
            error!(table, error = %err, "invalid table configuration");
            return Ok(TableOutcome::Skipped { table, error: err });
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            match self.run_once().await {
                Ok(outcome) => {
                    info!(
                        alias = self.alias,
                        table,
                        rows_inserted = outcome.rows_inserted,
                        rows_deleted = outcome.rows_deleted,
                        "done with table"
                    );
                    return Ok(TableOutcome::Completed(outcome));
                }
                Err(err) => match err.fault() {
                    Fault::Config | Fault::SkipTable => {
                        error!(
                            alias = self.alias,
                            table,
                            error = %err,
                            "error processing table, skipping and continuing"
                        );
                        return Ok(TableOutcome::Skipped { table, error: err });
                    }
                    Fault::Retry => {
                        attempt += 1;
                        if attempt >= max_attempts {
                            error!(
                                alias = self.alias,
                                table,
                                error = %err,
                                "error processing table and out of retries"
                            );
                            return Err(err);
                        }

                        record_event(
                            EVENT_DISCONNECT_ERROR,
                            EventState::Error,
                            &self.alias,
                            Some(&table),
                            None,
                        );

                        let backoff = Duration::from_secs((attempt * attempt) as u64);
                        info!(
                            alias = self.alias,
                            table,
                            error = %err,
                            backoff_secs = backoff.as_secs(),
                            "disconnected while processing table, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Fault::Fatal => {
                        error!(
                            alias = self.alias,
                            table,
                            error = %err,
                            "unexpected error processing table"
                        );
                        return Err(err);
                    }
                },
            }
        }
    }

    /// One full pass of the per-table state machine.
    async fn run_once(&self) -> SyncResult<LoadOutcome> {
        let spec = &self.spec;
        let full_refresh = spec.full_refresh || spec.rebuild;

        // Compute the delta window.
        let old_value = if spec.has_incremental_index() {
            self.index_store
                .last_value(
                    &self.warehouse,
                    &self.alias,
                    self.client.database_name(),
                    &spec.source_table_name,
                )
                .await?
        } else {
            None
        };

        let new_value = if let Some(index_query) = &spec.index_query {
            self.client.fetch_index_value(index_query).await?
        } else if let Some(index_column) = &spec.index_column {
            self.client
                .max_index_value(&spec.source_table_name, index_column)
                .await?
        } else {
            None
        };

        let window = IndexWindow::compute(
            &spec.source_table_name,
            spec.index_column.clone(),
            full_refresh,
            spec.append_only,
            old_value,
            new_value,
        );

        // Hand-written queries arrive fully rendered; generated ones get the
        // window filter appended.
        let sql = match &spec.extract_query {
            Some(query) => query.clone(),
            None => format!(
                "{}{}",
                self.client.build_select(spec).await?,
                window.where_clause()
            ),
        };
        debug!(sql, "extraction query");

        // Reconcile the destination shape and make sure DDL is available
        // where the plan requires creating a table.
        let (descriptors, status, ddl) = observe(
            EVENT_CREATE_TABLE,
            &self.alias,
            Some(&spec.source_table_name),
            self.check_destination(&sql),
        )
        .await?;

        // Extract into the staging area.
        let extract = observe(
            EVENT_EXTRACT_TABLE,
            &self.alias,
            Some(&spec.source_table_name),
            self.extract(&sql, &descriptors),
        )
        .await?;

        // Resolve merge keys. Keys are only inferred for generated queries;
        // hand-written ones must configure an override.
        let primary_keys = if !spec.primary_key.is_empty() {
            spec.primary_key.clone()
        } else if spec.extract_query.is_none() && !spec.append_only && !full_refresh {
            self.client.primary_keys(&spec.source_table_name).await?
        } else {
            Vec::new()
        };

        // Merge into the destination.
        let outcome = observe(
            EVENT_LOAD_TABLE,
            &self.alias,
            Some(&spec.source_table_name),
            load(
                &self.warehouse,
                LoadRequest {
                    spec,
                    alias: &self.alias,
                    status,
                    create_table_sql: ddl,
                    primary_keys,
                    row_count: extract.row_count,
                    copy_target_url: self
                        .stage
                        .url(&extract.paths.copy_target_key(extract.manifest_mode)),
                    manifest_mode: extract.manifest_mode,
                    iam_copy_role: &self.iam_copy_role,
                },
            ),
        )
        .await?;

        // Record the index and clean up staged objects, only after the
        // warehouse transaction committed.
        if extract.row_count > 0 {
            if let Some(new_value) = window.new_value() {
                self.index_store
                    .record(
                        &self.warehouse,
                        &self.alias,
                        self.client.database_name(),
                        &spec.source_table_name,
                        new_value,
                    )
                    .await?;
            }

            for key in extract
                .paths
                .data_keys(extract.num_data_files, extract.manifest_mode)
            {
                self.stage.delete_object(&key).await?;
            }
            if extract.manifest_mode {
                self.stage.delete_object(&extract.paths.manifest_key()).await?;
            }
        }

        Ok(outcome)
    }

    /// Describes the query, reconciles the destination shape and produces the
    /// DDL the load plan needs.
    ///
    /// Generating the DDL here doubles as the check that generation is
    /// possible at all; engines without DDL support fail the table before
    /// anything is extracted.
    async fn check_destination(
        &self,
        sql: &str,
    ) -> SyncResult<(Vec<ColumnDescriptor>, DestinationStatus, Option<String>)> {
        let spec = &self.spec;

        let descriptors = self.client.describe_query(sql).await?;

        let expected: Vec<String> = descriptors
            .iter()
            .map(|d| d.name.clone())
            .filter(|name| !spec.columns_to_drop.contains(name))
            .collect();

        let destination_columns = self
            .warehouse
            .destination_columns(&spec.destination_schema_name, &spec.destination_table_name)
            .await?;

        let status = reconcile(
            &spec.source_table_name,
            &expected,
            &destination_columns,
            spec.rebuild,
        );

        let ddl = match status {
            DestinationStatus::Incorrect => {
                bail!(
                    ErrorKind::InvalidSchema,
                    "Extra columns exist in the destination table, migration needed",
                    spec.destination()
                );
            }
            DestinationStatus::DoesNotExist => Some(
                self.client
                    .create_table_sql(spec, sql, &spec.destination_table_name)
                    .await?,
            ),
            DestinationStatus::NeedsRebuild => Some(
                self.client
                    .create_table_sql(
                        spec,
                        sql,
                        &staging_table_name(&self.alias, &spec.destination_table_name),
                    )
                    .await?,
            ),
            DestinationStatus::Ok => None,
        };

        Ok((descriptors, status, ddl))
    }

    /// Streams the extraction query through the Avro writer into size-bounded
    /// staged objects, switching to manifest mode past one file.
    async fn extract(
        &self,
        sql: &str,
        descriptors: &[ColumnDescriptor],
    ) -> SyncResult<ExtractOutput> {
        let spec = &self.spec;

        let date_key = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let paths = StagePaths::new(
            &self.storage_prefix,
            &self.alias,
            &spec.source_table_name,
            &date_key,
        );

        let fields: Vec<AvroField> = descriptors
            .iter()
            .map(|d| AvroField {
                name: d.name.clone(),
                bucket: self.client.bucket(&d.native_type),
            })
            .collect();
        let schema = record_schema(&spec.destination_table_name, &fields)?;

        info!(
            database = self.client.database_name(),
            table = spec.source_table_name,
            "extracting table"
        );

        let mut rows = self.client.stream_rows(sql).await?;

        let mut output = ExtractOutput {
            paths,
            row_count: 0,
            num_data_files: 0,
            manifest_mode: false,
            upload_size: 0,
        };

        loop {
            let chunk = write_chunk(&schema, &fields, &mut rows, self.max_chunk_bytes).await?;

            output.row_count += chunk.row_count;
            output.upload_size += chunk.data.len();

            if !chunk.complete {
                output.manifest_mode = true;
            }

            if chunk.row_count > 0 {
                let key = output
                    .paths
                    .next_data_key(output.num_data_files, output.manifest_mode);
                self.stage.put_object(&key, chunk.data).await?;
                output.num_data_files += 1;
            }

            if chunk.complete {
                break;
            }
        }

        if output.num_data_files == 0 {
            info!(
                database = self.client.database_name(),
                table = spec.source_table_name,
                "no data extracted, not uploading"
            );
        }

        if output.manifest_mode {
            self.stage
                .put_manifest(&output.paths, output.num_data_files)
                .await?;
        }

        metrics::counter!(
            SYNC_ROWS_EXTRACTED_TOTAL,
            "alias" => self.alias.clone(),
            "table" => spec.source_table_name.clone()
        )
        .increment(output.row_count as u64);
        metrics::counter!(
            SYNC_UPLOAD_BYTES_TOTAL,
            "alias" => self.alias.clone(),
            "table" => spec.source_table_name.clone()
        )
        .increment(output.upload_size as u64);

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(value: serde_json::Value) -> TableConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn incremental_table_with_index_is_valid() {
        let spec = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "updated_at",
        }));
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn append_only_requires_an_index() {
        let spec = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "append_only": true,
        }));
        assert_eq!(validate(&spec).unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn append_only_conflicts_with_full_refresh() {
        let spec = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "id",
            "append_only": true,
            "full_refresh": true,
        }));
        assert_eq!(validate(&spec).unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn incremental_without_index_is_rejected() {
        let spec = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
        }));
        assert_eq!(validate(&spec).unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn full_refresh_conflicts_with_index_settings() {
        let with_column = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "id",
            "full_refresh": true,
        }));
        assert!(validate(&with_column).is_err());

        let with_query = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_query": "SELECT MAX(id) AS index_value FROM orders",
            "full_refresh": true,
        }));
        assert!(validate(&with_query).is_err());
    }

    #[test]
    fn index_query_conflicts_with_index_column() {
        let spec = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "id",
            "index_query": "SELECT MAX(id) AS index_value FROM orders",
        }));
        assert_eq!(validate(&spec).unwrap_err().kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn incremental_extract_query_requires_primary_key() {
        let without_key = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "updated_at",
            "extract_query": "SELECT * FROM orders",
        }));
        assert_eq!(validate(&without_key).unwrap_err().kind(), ErrorKind::ConfigError);

        let with_key = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "updated_at",
            "extract_query": "SELECT * FROM orders",
            "primary_key": ["id"],
        }));
        assert!(validate(&with_key).is_ok());
    }

    #[test]
    fn rebuild_conflicts_with_hand_written_sql() {
        let with_truncate = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "id",
            "rebuild": true,
            "truncate_sql": "DELETE FROM orders;",
        }));
        assert!(validate(&with_truncate).is_err());

        let with_ddl = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "id",
            "rebuild": true,
            "create_table_sql": "CREATE TABLE orders (id int)",
        }));
        assert!(validate(&with_ddl).is_err());
    }

    #[test]
    fn rebuild_without_index_is_valid() {
        let spec = spec(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "rebuild": true,
        }));
        assert!(validate(&spec).is_ok());
    }
}
