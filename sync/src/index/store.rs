use config::shared::IndexTableConfig;
use sqlx::Row as SqlxRow;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::index::IndexValue;
use crate::warehouse::{table_exists, Warehouse};

/// The warehouse-side store of per-table index values.
///
/// The table is append-only: every successful load inserts a new row, and the
/// newest row per `(datastore_alias, database_name, table_name)` is
/// authoritative.
#[derive(Debug, Clone)]
pub struct IndexStore {
    schema: String,
    table: String,
}

impl IndexStore {
    pub fn new(config: &IndexTableConfig) -> IndexStore {
        IndexStore {
            schema: config.schema.clone(),
            table: config.table.clone(),
        }
    }

    /// Creates the index table when it does not exist yet.
    pub async fn ensure_exists(&self, warehouse: &Warehouse) -> SyncResult<()> {
        info!(
            schema = self.schema,
            table = self.table,
            "checking for existence of index table"
        );

        let pool = warehouse.connect().await?;

        if !table_exists(&pool, &self.schema, &self.table).await? {
            warn!(
                schema = self.schema,
                table = self.table,
                "index table does not exist, creating"
            );

            sqlx::query(&format!(
                r#"
                CREATE TABLE {}.{} (
                    datastore_alias VARCHAR(127) NOT NULL,
                    database_name   VARCHAR(127) NOT NULL,
                    table_name      VARCHAR(127) NOT NULL,
                    index_value     VARCHAR(256) NOT NULL,
                    created_at      TIMESTAMP DEFAULT getdate()
                )
                DISTSTYLE even
                SORTKEY(created_at)
                "#,
                self.schema, self.table
            ))
            .execute(&pool)
            .await?;

            info!(
                schema = self.schema,
                table = self.table,
                "index table created"
            );
        }

        pool.close().await;

        Ok(())
    }

    /// Loads the latest recorded index value for a table, if any.
    pub async fn last_value(
        &self,
        warehouse: &Warehouse,
        alias: &str,
        database: &str,
        table: &str,
    ) -> SyncResult<Option<IndexValue>> {
        debug!(alias, database, table, "querying warehouse for last recorded index");

        let pool = warehouse.connect().await?;

        let row = sqlx::query(&format!(
            r#"
            SELECT index_value
            FROM "{}"."{}"
            WHERE datastore_alias = $1
              AND database_name = $2
              AND table_name = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            self.schema, self.table
        ))
        .bind(alias)
        .bind(database)
        .bind(table)
        .fetch_optional(&pool)
        .await?;

        pool.close().await;

        match row {
            Some(row) => {
                let encoded: String = row.try_get(0)?;
                info!(alias, table, index = encoded, "index found");
                Ok(Some(IndexValue::parse(&encoded)))
            }
            None => {
                info!(alias, table, "no index found, dumping entire table");
                Ok(None)
            }
        }
    }

    /// Appends a new index value for a table.
    ///
    /// Called only after the load transaction commits, so an interrupted run
    /// re-extracts its window instead of skipping it.
    pub async fn record(
        &self,
        warehouse: &Warehouse,
        alias: &str,
        database: &str,
        table: &str,
        value: &IndexValue,
    ) -> SyncResult<()> {
        info!(alias, database, table, index = %value, "updating index table");

        let pool = warehouse.connect().await?;

        sqlx::query(&format!(
            r#"
            INSERT INTO "{}"."{}"
                (datastore_alias, database_name, table_name, index_value)
            VALUES ($1, $2, $3, $4)
            "#,
            self.schema, self.table
        ))
        .bind(alias)
        .bind(database)
        .bind(table)
        .bind(value.encode())
        .execute(&pool)
        .await?;

        pool.close().await;

        Ok(())
    }
}
