use config::shared::{IntoConnectOptions, WarehouseConnectionConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Row as SqlxRow};
use tracing::{debug, info};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::warehouse::permissions::Permissions;
use crate::{bail, sync_error};

pub mod permissions;

const NUM_POOL_CONNECTIONS: u32 = 1;

/// Client for the analytical warehouse.
///
/// Connections are opened per operation and closed deterministically; the
/// per-table pipelines do not share warehouse sessions, so ordering between
/// tables feeding the same destination is enforced only by the warehouse's
/// table lock.
#[derive(Debug, Clone)]
pub struct Warehouse {
    config: WarehouseConnectionConfig,
}

impl Warehouse {
    pub fn new(config: WarehouseConnectionConfig) -> Warehouse {
        Warehouse { config }
    }

    /// Opens a fresh single-connection pool to the warehouse.
    ///
    /// A pool of one connection keeps session state (like `search_path`)
    /// consistent across the statements of one operation while still getting
    /// sqlx's reconnect handling.
    pub async fn connect(&self) -> SyncResult<PgPool> {
        let options: PgConnectOptions = self.config.with_db();

        let pool = PgPoolOptions::new()
            .max_connections(NUM_POOL_CONNECTIONS)
            .min_connections(NUM_POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::WarehouseConnectionFailed,
                    "Failed to connect to the warehouse",
                    err
                )
            })?;

        Ok(pool)
    }

    /// Returns the destination table's column names.
    ///
    /// An empty result means the table does not exist.
    pub async fn destination_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> SyncResult<Vec<String>> {
        let pool = self.connect().await?;

        sqlx::query(&generate_set_search_path_query(schema))
            .execute(&pool)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT "column"
            FROM pg_table_def
            WHERE schemaname = $1
              AND tablename = $2
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&pool)
        .await?;

        pool.close().await;

        let columns = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(schema, table, columns = columns.len(), "destination columns loaded");

        Ok(columns)
    }
}

/// Reads the destination table's grants and renders the statements restoring
/// them onto the staging table.
///
/// Returns `None` when the table carries no explicit grants. Rebuilding a
/// table owned by someone else, or one whose ACL cannot be parsed, is a
/// migration error: swapping the table would silently change who can read it.
pub async fn capture_grant_sql(
    conn: &mut PgConnection,
    schema: &str,
    table: &str,
    staging_table: &str,
) -> SyncResult<Option<String>> {
    let rows = sqlx::query(
        r#"
        SELECT
            use.usename = CURRENT_USER AS owned
            , c.relacl::varchar(max)   AS acl
        FROM pg_class c
            LEFT JOIN pg_namespace nsp ON c.relnamespace = nsp.oid
            LEFT JOIN pg_user use ON c.relowner = use.usesysid
        WHERE c.relkind = 'r'
          AND nsp.nspname = $1
          AND c.relname = $2
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_all(&mut *conn)
    .await?;

    if rows.is_empty() {
        info!(schema, table, "no existing permissions found");
        return Ok(None);
    }
    if rows.len() > 1 {
        bail!(
            ErrorKind::MigrationNotSupported,
            "Got multiple permissions rows for destination table",
            format!("{schema}.{table}")
        );
    }

    let owned: bool = rows[0].try_get("owned")?;
    let acl: Option<String> = rows[0].try_get("acl")?;

    if !owned {
        bail!(
            ErrorKind::MigrationNotSupported,
            "Cannot rebuild a table owned by another user",
            format!("{schema}.{table}")
        );
    }

    let acl = acl.unwrap_or_default();
    let Some(permissions) = Permissions::parse(&acl) else {
        bail!(
            ErrorKind::MigrationNotSupported,
            "Could not parse permissions of destination table",
            format!("{schema}.{table}: {acl}")
        );
    };

    if permissions.is_empty() {
        return Ok(None);
    }

    info!(
        schema,
        table, staging_table, "captured existing permissions for staging table"
    );

    Ok(Some(Permissions::grant_statements(
        &permissions,
        staging_table,
    )))
}

pub fn generate_set_search_path_query(schema: &str) -> String {
    format!("SET search_path TO {schema};")
}

pub fn generate_copy_query(
    table_to_copy: &str,
    copy_target_url: &str,
    iam_copy_role: &str,
    manifest_mode: bool,
) -> String {
    format!(
        "COPY \"{table_to_copy}\" FROM '{copy_target_url}'\n\
         CREDENTIALS 'aws_iam_role={iam_copy_role}'\n\
         {}\n\
         FORMAT AS AVRO 'auto'\n\
         EXPLICIT_IDS ACCEPTINVCHARS TRUNCATECOLUMNS\n\
         COMPUPDATE OFF STATUPDATE OFF;",
        if manifest_mode { "MANIFEST" } else { "" },
    )
}

pub fn generate_rename_query(current_table_name: &str, renamed_table_name: &str) -> String {
    format!("ALTER TABLE \"{current_table_name}\" RENAME TO \"{renamed_table_name}\";")
}

pub fn generate_count_query(table: &str) -> String {
    format!("SELECT COUNT(*) FROM {table};")
}

pub fn generate_insert_all_query(table_to_select_from: &str, table_to_insert_into: &str) -> String {
    format!("INSERT INTO \"{table_to_insert_into}\" SELECT * FROM \"{table_to_select_from}\";")
}

pub fn generate_create_table_like_query(new_table_name: &str, table_to_copy: &str) -> String {
    format!("CREATE TABLE \"{new_table_name}\" (LIKE \"{table_to_copy}\");")
}

pub fn generate_drop_query(table: &str) -> String {
    format!("DROP TABLE \"{table}\";")
}

pub fn generate_drop_exists_query(table: &str) -> String {
    format!("DROP TABLE IF EXISTS \"{table}\";")
}

pub fn generate_lock_query(table: &str) -> String {
    format!("LOCK TABLE \"{table}\";")
}

/// Returns `true` when a regular table exists in the given schema.
pub async fn table_exists(pool: &PgPool, schema: &str, table: &str) -> SyncResult<bool> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) = 1 AS present
        FROM pg_catalog.pg_class c
        JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = $1
          AND c.relname = $2
          AND c.relkind = 'r'
        "#,
    )
    .bind(schema)
    .bind(table)
    .fetch_one(pool)
    .await?;

    Ok(row.try_get::<bool, _>("present")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_query_includes_manifest_keyword_only_in_manifest_mode() {
        let single = generate_copy_query(
            "orders_staging",
            "s3://bucket/prefix/db.orders.20210501T000000.avro",
            "arn:aws:iam::123:role/copy",
            false,
        );
        assert!(single.contains("FORMAT AS AVRO 'auto'"));
        assert!(single.contains("CREDENTIALS 'aws_iam_role=arn:aws:iam::123:role/copy'"));
        assert!(!single.contains("MANIFEST"));

        let manifest = generate_copy_query(
            "orders_staging",
            "s3://bucket/prefix/db.orders.20210501T000000.manifest",
            "arn:aws:iam::123:role/copy",
            true,
        );
        assert!(manifest.contains("MANIFEST"));
    }

    #[test]
    fn rename_and_drop_queries_quote_identifiers() {
        assert_eq!(
            generate_rename_query("orders_staging", "orders"),
            "ALTER TABLE \"orders_staging\" RENAME TO \"orders\";"
        );
        assert_eq!(generate_drop_query("orders"), "DROP TABLE \"orders\";");
        assert_eq!(
            generate_drop_exists_query("orders_staging"),
            "DROP TABLE IF EXISTS \"orders_staging\";"
        );
    }

    #[test]
    fn insert_all_selects_from_staging() {
        assert_eq!(
            generate_insert_all_query("orders_staging", "orders"),
            "INSERT INTO \"orders\" SELECT * FROM \"orders_staging\";"
        );
    }

    #[test]
    fn create_like_copies_destination_shape() {
        assert_eq!(
            generate_create_table_like_query("orders_staging", "orders"),
            "CREATE TABLE \"orders_staging\" (LIKE \"orders\");"
        );
    }
}
