use std::sync::Arc;
use std::time::Instant;

use config::shared::{SourceConfig, StorageConfig, SyncerConfig, WarehouseConnectionConfig};
use sync::connectors::SourceClient;
use sync::error::{Fault, SyncError};
use sync::index::store::IndexStore;
use sync::metrics::{record_event, register_metrics, EventState, EVENT_FULL_RUN_TIME};
use sync::pipeline::{TableOutcome, TablePipeline};
use sync::stage::StageClient;
use sync::warehouse::Warehouse;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::load_syncer_config;

/// Terminal failure of a whole syncer run, mapped onto the process exit code.
#[derive(Debug, Error)]
pub enum SyncerError {
    /// Required configuration is missing or contradictory. Exit code 1.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A table failed past every recovery tier. Exit code 2.
    #[error("fatal table failure: {0}")]
    Fatal(#[from] SyncError),
}

impl SyncerError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncerError::Config(_) => 1,
            SyncerError::Fatal(_) => 2,
        }
    }
}

pub async fn start_syncer() -> Result<(), SyncerError> {
    info!("starting syncer service");
    let config = load_syncer_config()?;

    log_config(&config);
    register_metrics();

    let started = Instant::now();
    record_event(EVENT_FULL_RUN_TIME, EventState::Start, "syncer", None, None);

    let result = run_all_tables(&config).await;

    let state = if result.is_ok() {
        EventState::Complete
    } else {
        EventState::Error
    };
    record_event(
        EVENT_FULL_RUN_TIME,
        state,
        "syncer",
        None,
        Some(started.elapsed().as_secs_f64()),
    );

    result?;
    info!("syncer service completed");

    Ok(())
}

async fn run_all_tables(config: &SyncerConfig) -> Result<(), SyncerError> {
    let warehouse = Warehouse::new(config.warehouse.clone());

    let index_store = IndexStore::new(&config.index);
    index_store.ensure_exists(&warehouse).await?;

    let stage = StageClient::new(&config.storage).await?;

    // Tables run in parallel worker units; the semaphore bounds how many are
    // in flight at once across all sources.
    let permits = Arc::new(Semaphore::new(config.max_parallel_tables));
    let mut tasks: JoinSet<Result<TableOutcome, SyncError>> = JoinSet::new();

    for source in &config.sources {
        if !source.enabled {
            info!(alias = source.alias, "source disabled, skipping");
            continue;
        }

        for table in &source.tables {
            if !table.enabled {
                continue;
            }

            let pipeline = TablePipeline::new(
                source.alias.clone(),
                table.clone(),
                SourceClient::new(source.engine, source.connection.clone()),
                warehouse.clone(),
                stage.clone(),
                index_store.clone(),
                &config.storage,
                config.table_retry.clone(),
            );

            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("semaphore closed while tables are pending");
                pipeline.run().await
            });
        }
    }

    let mut invalid_tables = Vec::new();
    let mut skipped_tables = 0usize;
    let mut completed_tables = 0usize;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(TableOutcome::Completed(_))) => completed_tables += 1,
            Ok(Ok(TableOutcome::Skipped { table, error })) => {
                if error.fault() == Fault::Config {
                    invalid_tables.push(table);
                } else {
                    skipped_tables += 1;
                }
            }
            Ok(Err(err)) => {
                // A fatal table failure aborts the whole worker pool.
                error!(error = %err, "fatal error, aborting remaining tables");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(err.into());
            }
            Err(join_err) => {
                error!(error = %join_err, "table worker panicked, aborting remaining tables");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(SyncerError::Fatal(SyncError::from((
                    sync::error::ErrorKind::Unknown,
                    "Table worker panicked",
                    join_err.to_string(),
                ))));
            }
        }
    }

    info!(
        completed_tables,
        skipped_tables,
        invalid_tables = invalid_tables.len(),
        "all tables processed"
    );

    if !invalid_tables.is_empty() {
        return Err(SyncerError::Config(format!(
            "invalid table configurations: {}",
            invalid_tables.join(", ")
        )));
    }

    if skipped_tables > 0 {
        // Schema and data errors were already logged per table; they do not
        // fail the run.
        warn!(skipped_tables, "some tables were skipped this run");
    }

    Ok(())
}

fn log_config(config: &SyncerConfig) {
    log_warehouse_config(&config.warehouse);
    log_storage_config(&config.storage);

    info!(
        index_schema = config.index.schema,
        index_table = config.index.table,
        max_parallel_tables = config.max_parallel_tables,
        table_retry_max_attempts = config.table_retry.max_attempts,
        "run config"
    );

    for source in &config.sources {
        log_source_config(source);
    }
}

fn log_warehouse_config(config: &WarehouseConnectionConfig) {
    info!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        "warehouse connection config",
    );
}

fn log_storage_config(config: &StorageConfig) {
    info!(
        bucket = config.bucket,
        prefix = config.prefix,
        region = config.region,
        "storage config"
    );
}

fn log_source_config(config: &SourceConfig) {
    info!(
        alias = config.alias,
        engine = %config.engine,
        host = config.connection.host,
        port = config.connection.port,
        dbname = config.connection.name,
        enabled = config.enabled,
        tables = config.tables.len(),
        "source config",
    );
}
