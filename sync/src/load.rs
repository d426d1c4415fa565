use config::shared::TableConfig;
use sqlx::Row as SqlxRow;
use tracing::{debug, info};

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::schema::DestinationStatus;
use crate::warehouse::{
    capture_grant_sql, generate_copy_query, generate_count_query,
    generate_create_table_like_query, generate_drop_exists_query, generate_drop_query,
    generate_insert_all_query, generate_lock_query, generate_rename_query,
    generate_set_search_path_query, Warehouse,
};
use crate::bail;

/// Everything the load engine needs for one table's merge.
pub struct LoadRequest<'a> {
    pub spec: &'a TableConfig,
    pub alias: &'a str,
    pub status: DestinationStatus,
    /// Generated or hand-written DDL. Targets the destination table when the
    /// destination does not exist, and the staging table on a rebuild.
    pub create_table_sql: Option<String>,
    /// Resolved merge keys: the configured override, or the keys inferred
    /// from the source table.
    pub primary_keys: Vec<String>,
    pub row_count: usize,
    pub copy_target_url: String,
    pub manifest_mode: bool,
    pub iam_copy_role: &'a str,
}

/// Row counts reported by a completed load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub rows_inserted: i64,
    pub rows_deleted: i64,
}

/// Name of the transient staging table for one destination table.
pub fn staging_table_name(alias: &str, destination_table: &str) -> String {
    format!("{alias}_{destination_table}_staging")
}

/// Builds the delete statement issued between bulk load and insert.
///
/// Returns `None` when nothing is deleted (append-only merges and rebuilds,
/// where the old table is dropped wholesale instead). A keyed merge with no
/// resolvable primary key is rejected here, before any transaction opens:
/// deleting by an empty key set would wipe the destination table.
pub(crate) fn delete_sql(
    spec: &TableConfig,
    status: DestinationStatus,
    staging_table: &str,
    primary_keys: &[String],
) -> SyncResult<Option<String>> {
    // A rebuild is a full refresh whether or not the flag is set explicitly.
    if spec.full_refresh || spec.rebuild {
        if status == DestinationStatus::NeedsRebuild {
            // The old table is dropped outright; nothing to delete.
            return Ok(None);
        }
        if let Some(truncate) = &spec.truncate_sql {
            return Ok(Some(truncate.clone()));
        }
        return Ok(Some(format!(
            "DELETE FROM \"{}\";",
            spec.destination_table_name
        )));
    }

    if spec.append_only {
        return Ok(None);
    }

    if primary_keys.is_empty() {
        bail!(
            ErrorKind::InvalidSchema,
            "Cannot merge by key without a primary key",
            format!(
                "table {}: no primary key could be inferred or configured; \
                 deleting without keys would remove all existing rows. Run with \
                 full_refresh if that is intended",
                spec.source_table_name
            )
        );
    }

    let constraints: Vec<String> = primary_keys
        .iter()
        .map(|pk| {
            format!(
                "\"{}\".\"{}\" = \"{}\".\"{}\"",
                staging_table, pk, spec.destination_table_name, pk
            )
        })
        .collect();

    Ok(Some(format!(
        "DELETE FROM \"{}\" USING \"{}\" WHERE {};",
        spec.destination_table_name,
        staging_table,
        constraints.join(" AND ")
    )))
}

/// Runs the warehouse-side load for one table.
///
/// All staging, loading and merging happens inside one transaction, with the
/// destination table locked immediately after the transaction opens so
/// many-to-one pipelines cannot deadlock. When nothing was extracted the
/// transaction is skipped entirely.
pub async fn load(warehouse: &Warehouse, request: LoadRequest<'_>) -> SyncResult<LoadOutcome> {
    let spec = request.spec;
    let staging_table = staging_table_name(request.alias, &spec.destination_table_name);
    let destination_table = spec.destination_table_name.as_str();

    let is_rebuild = request.status == DestinationStatus::NeedsRebuild;
    let is_dne = request.status == DestinationStatus::DoesNotExist;
    if !is_rebuild && !is_dne && request.status != DestinationStatus::Ok {
        bail!(
            ErrorKind::InvalidState,
            "Invalid destination status for load",
            request.status
        );
    }

    // Resolved before any transaction is opened.
    let delete_clause = delete_sql(spec, request.status, &staging_table, &request.primary_keys)?;

    let pool = warehouse.connect().await?;

    sqlx::query(&generate_set_search_path_query(&spec.destination_schema_name))
        .execute(&pool)
        .await?;

    if is_dne {
        let Some(create_table) = &request.create_table_sql else {
            bail!(
                ErrorKind::MigrationNotSupported,
                "Destination table does not exist and no DDL is available"
            );
        };

        info!(table = destination_table, "creating destination table");
        debug!(sql = create_table, "create table");
        sqlx::query(create_table).execute(&pool).await?;
    }

    // Nothing extracted means nothing to load or merge.
    if request.row_count == 0 {
        pool.close().await;
        return Ok(LoadOutcome {
            rows_inserted: 0,
            rows_deleted: 0,
        });
    }

    let mut tx = pool.begin().await?;

    // Lock the destination early to avoid deadlocks in many-to-one pipelines.
    sqlx::query(&generate_lock_query(destination_table))
        .execute(&mut *tx)
        .await?;

    sqlx::query(&generate_drop_exists_query(&staging_table))
        .execute(&mut *tx)
        .await?;

    if is_rebuild {
        info!(
            table = destination_table,
            staging_table, "creating staging table to rebuild destination"
        );

        let Some(create_staging) = &request.create_table_sql else {
            bail!(
                ErrorKind::MigrationNotSupported,
                "Cannot rebuild destination table without DDL"
            );
        };

        // Grants are read before anything is dropped.
        let grant_sql = capture_grant_sql(
            &mut tx,
            &spec.destination_schema_name,
            destination_table,
            &staging_table,
        )
        .await?;

        sqlx::query(create_staging).execute(&mut *tx).await?;

        if let Some(grant_sql) = grant_sql {
            info!(staging_table, grants = grant_sql, "copying permissions onto staging table");
            for statement in grant_sql.lines() {
                sqlx::query(statement).execute(&mut *tx).await?;
            }
        }
    } else {
        info!(staging_table, "creating staging table");
        sqlx::query(&generate_create_table_like_query(&staging_table, destination_table))
            .execute(&mut *tx)
            .await?;
    }

    info!(table = destination_table, "issuing copy command");
    let copy = generate_copy_query(
        &staging_table,
        &request.copy_target_url,
        request.iam_copy_role,
        request.manifest_mode,
    );
    debug!(sql = copy, "copy");
    sqlx::query(&copy).execute(&mut *tx).await?;

    let full_refresh = spec.full_refresh || spec.rebuild;
    let rows_deleted = if is_rebuild || (spec.append_only && !full_refresh) {
        0
    } else {
        match &delete_clause {
            Some(delete) => {
                let result = sqlx::query(delete).execute(&mut *tx).await?;
                result.rows_affected() as i64
            }
            None => 0,
        }
    };

    let rows_inserted = if is_rebuild {
        info!(table = destination_table, "swapping staging table into destination");
        sqlx::query(&generate_drop_query(destination_table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&generate_rename_query(&staging_table, destination_table))
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&generate_count_query(destination_table))
            .fetch_one(&mut *tx)
            .await?;
        row.try_get::<i64, _>(0)?
    } else {
        let result = sqlx::query(&generate_insert_all_query(&staging_table, destination_table))
            .execute(&mut *tx)
            .await?;
        let rows_inserted = result.rows_affected() as i64;

        sqlx::query(&generate_drop_query(&staging_table))
            .execute(&mut *tx)
            .await?;

        rows_inserted
    };

    tx.commit().await?;
    pool.close().await;

    Ok(LoadOutcome {
        rows_inserted,
        rows_deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TableConfig {
        serde_json::from_value(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
            "index_column": "updated_at",
        }))
        .unwrap()
    }

    #[test]
    fn staging_table_name_is_per_alias() {
        assert_eq!(staging_table_name("shop", "orders"), "shop_orders_staging");
    }

    #[test]
    fn keyed_merge_deletes_by_key_using_staging() {
        let spec = spec();
        let sql = delete_sql(
            &spec,
            DestinationStatus::Ok,
            "shop_orders_staging",
            &["id".to_owned()],
        )
        .unwrap()
        .unwrap();

        assert_eq!(
            sql,
            "DELETE FROM \"orders\" USING \"shop_orders_staging\" \
             WHERE \"shop_orders_staging\".\"id\" = \"orders\".\"id\";"
        );
    }

    #[test]
    fn composite_key_constraints_join_with_and() {
        let spec = spec();
        let sql = delete_sql(
            &spec,
            DestinationStatus::Ok,
            "shop_orders_staging",
            &["id".to_owned(), "region".to_owned()],
        )
        .unwrap()
        .unwrap();

        assert!(sql.contains(
            "\"shop_orders_staging\".\"id\" = \"orders\".\"id\" AND \
             \"shop_orders_staging\".\"region\" = \"orders\".\"region\""
        ));
    }

    #[test]
    fn keyed_merge_without_primary_key_is_rejected() {
        let spec = spec();
        let err =
            delete_sql(&spec, DestinationStatus::Ok, "shop_orders_staging", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSchema);
    }

    #[test]
    fn append_only_merges_never_delete() {
        let mut spec = spec();
        spec.append_only = true;

        let sql = delete_sql(&spec, DestinationStatus::Ok, "shop_orders_staging", &[]).unwrap();
        assert_eq!(sql, None);
    }

    #[test]
    fn rebuild_never_deletes() {
        let mut spec = spec();
        spec.full_refresh = true;
        spec.rebuild = true;

        let sql = delete_sql(
            &spec,
            DestinationStatus::NeedsRebuild,
            "shop_orders_staging",
            &[],
        )
        .unwrap();
        assert_eq!(sql, None);
    }

    #[test]
    fn rebuild_implies_full_refresh_without_the_explicit_flag() {
        let mut spec = spec();
        spec.rebuild = true;

        let sql = delete_sql(
            &spec,
            DestinationStatus::NeedsRebuild,
            "shop_orders_staging",
            &[],
        )
        .unwrap();
        assert_eq!(sql, None);

        // A rebuild of a missing table creates it fresh; the delete is a
        // harmless full-refresh delete on the brand new table.
        let sql = delete_sql(
            &spec,
            DestinationStatus::DoesNotExist,
            "shop_orders_staging",
            &[],
        )
        .unwrap()
        .unwrap();
        assert_eq!(sql, "DELETE FROM \"orders\";");
    }

    #[test]
    fn full_refresh_deletes_everything() {
        let mut spec = spec();
        spec.full_refresh = true;

        let sql = delete_sql(&spec, DestinationStatus::Ok, "shop_orders_staging", &[])
            .unwrap()
            .unwrap();
        assert_eq!(sql, "DELETE FROM \"orders\";");
    }

    #[test]
    fn full_refresh_prefers_hand_written_truncate() {
        let mut spec = spec();
        spec.full_refresh = true;
        spec.truncate_sql = Some("DELETE FROM \"orders\" WHERE region = 'eu';".to_owned());

        let sql = delete_sql(&spec, DestinationStatus::Ok, "shop_orders_staging", &[])
            .unwrap()
            .unwrap();
        assert_eq!(sql, "DELETE FROM \"orders\" WHERE region = 'eu';");
    }
}
