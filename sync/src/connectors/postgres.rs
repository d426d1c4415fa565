use config::shared::{IntoConnectOptions, SourceConnectionConfig, TableConfig};
use sqlx::postgres::types::{Oid, PgMoney};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row as SqlxRow, TypeInfo};
use tracing::warn;

use crate::connectors::{create_table_keys, row_channel, ColumnDescriptor, RowStream};
use crate::conversions::{AvroBucket, Cell, Row};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::index::IndexValue;
use crate::{bail, sync_error};

const NUM_POOL_CONNECTIONS: u32 = 1;

/// Maximum numeric precision the warehouse supports.
const PMAX: u32 = 38;

/// Connector for PostgreSQL-family sources.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: SourceConnectionConfig,
}

impl PostgresConnector {
    pub fn new(config: SourceConnectionConfig) -> PostgresConnector {
        PostgresConnector { config }
    }

    pub fn database_name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self) -> SyncResult<PgPool> {
        let options: PgConnectOptions = self.config.with_db();

        PgPoolOptions::new()
            .max_connections(NUM_POOL_CONNECTIONS)
            .min_connections(NUM_POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::SourceConnectionFailed,
                    "Failed to connect to Postgres source",
                    err
                )
            })
    }

    pub async fn describe_query(&self, sql: &str) -> SyncResult<Vec<ColumnDescriptor>> {
        let pool = self.connect().await?;
        let describe = pool.describe(sql).await?;

        let columns = describe
            .columns()
            .iter()
            .enumerate()
            .map(|(i, col)| ColumnDescriptor {
                name: col.name().to_owned(),
                native_type: col.type_info().name().to_lowercase(),
                nullable: describe.nullable(i),
            })
            .collect();

        pool.close().await;

        Ok(columns)
    }

    pub async fn stream_rows(&self, sql: &str) -> SyncResult<RowStream> {
        let pool = self.connect().await?;
        let sql = sql.to_owned();
        let (tx, stream) = row_channel();

        tokio::spawn(async move {
            use futures::StreamExt;

            let mut rows = sqlx::query(&sql).fetch(&pool);
            while let Some(item) = rows.next().await {
                let message = match item {
                    Ok(row) => decode_row(&row),
                    Err(err) => Err(err.into()),
                };
                let failed = message.is_err();
                if tx.send(message).await.is_err() || failed {
                    break;
                }
            }

            drop(rows);
            pool.close().await;
        });

        Ok(stream)
    }

    pub async fn primary_keys(&self, table: &str) -> SyncResult<Vec<String>> {
        let pool = self.connect().await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT a.attname
            FROM pg_index i
                JOIN pg_attribute a ON a.attrelid = i.indrelid
                                    AND a.attnum = ANY(i.indkey)
            WHERE i.indrelid = '{table}'::regclass
              AND i.indisprimary
            "#
        ))
        .fetch_all(&pool)
        .await?;

        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?;

        pool.close().await;

        Ok(keys)
    }

    pub async fn max_index_value(
        &self,
        table: &str,
        index_column: &str,
    ) -> SyncResult<Option<IndexValue>> {
        let sql =
            format!("SELECT MAX(\"{index_column}\") AS index_value FROM \"{table}\";");
        self.fetch_index_value(&sql).await
    }

    pub async fn fetch_index_value(&self, sql: &str) -> SyncResult<Option<IndexValue>> {
        let pool = self.connect().await?;
        let row = sqlx::query(sql).fetch_optional(&pool).await?;
        pool.close().await;

        let Some(row) = row else {
            return Ok(None);
        };

        let cell = decode_named_cell(&row, "index_value")?;
        Ok(IndexValue::from_cell(&cell))
    }

    pub async fn build_select(&self, spec: &TableConfig) -> SyncResult<String> {
        let pool = self.connect().await?;

        let rows = sqlx::query(
            r#"
            SELECT column_name
            FROM information_schema.columns
            WHERE table_schema = CURRENT_SCHEMA
              AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(&spec.source_table_name)
        .fetch_all(&pool)
        .await?;

        pool.close().await;

        let columns: Vec<String> = rows
            .iter()
            .map(|row| row.try_get::<String, _>(0))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|c| !spec.columns_to_drop.contains(c))
            .collect();

        if columns.is_empty() {
            bail!(
                ErrorKind::InvalidSchema,
                "Source table has no selectable columns",
                spec.source_table_name
            );
        }

        let quoted: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();

        Ok(format!(
            "SELECT\n    {}\nFROM \"{}\"",
            quoted.join("\n  , "),
            spec.source_table_name
        ))
    }

    pub async fn create_table_sql(
        &self,
        spec: &TableConfig,
        select_sql: &str,
        table_name: &str,
    ) -> SyncResult<String> {
        if let Some(ddl) = &spec.create_table_sql {
            let mut create_table = ddl.trim_end_matches([';', ' ', '\n', '\t']).to_owned();
            create_table.push_str(&create_table_keys(spec));
            return Ok(create_table);
        }

        let fields = if spec.extract_query.is_some() {
            let described = self.describe_query(select_sql).await?;
            if described.iter().any(|col| col.nullable.is_none()) {
                warn!(
                    table_name,
                    "cannot obtain nullability for all columns of a hand-written \
                     query, assuming NOT NULL; rebuild the destination manually if \
                     some columns should be nullable"
                );
            }
            described
                .into_iter()
                .map(|col| {
                    let native = col.native_type;
                    (col.name, native, None, None, None, col.nullable.unwrap_or(false))
                })
                .collect()
        } else {
            self.table_columns(spec).await?
        };

        let field_strs: Vec<String> = fields
            .into_iter()
            .map(|(name, native, char_len, precision, scale, nullable)| {
                format!(
                    "\"{}\" {}{}",
                    name,
                    warehouse_type(spec, &native, char_len, precision, scale),
                    if nullable { "" } else { " NOT NULL" }
                )
            })
            .collect();

        let mut create_table = format!(
            "CREATE TABLE \"{}\".\"{}\" (\n    ",
            spec.destination_schema_name, table_name
        );
        create_table.push_str(&field_strs.join("\n  , "));
        create_table.push_str("\n)\n");
        create_table.push_str(&create_table_keys(spec));

        Ok(create_table)
    }

    /// Reads column shape for a table, in ordinal order, excluding dropped
    /// columns: `(name, udt name, char length, precision, scale, nullable)`.
    #[allow(clippy::type_complexity)]
    async fn table_columns(
        &self,
        spec: &TableConfig,
    ) -> SyncResult<Vec<(String, String, Option<u32>, Option<u32>, Option<u32>, bool)>> {
        let pool = self.connect().await?;

        let rows = sqlx::query(
            r#"
            SELECT
                column_name
                , udt_name
                , character_maximum_length
                , numeric_precision
                , numeric_scale
                , is_nullable = 'YES' AS is_nullable
            FROM information_schema.columns
            WHERE table_schema = CURRENT_SCHEMA
              AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(&spec.source_table_name)
        .fetch_all(&pool)
        .await?;

        pool.close().await;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get(0)?;
            if spec.columns_to_drop.contains(&name) {
                continue;
            }
            let udt_name: String = row.try_get(1)?;
            let char_len: Option<i32> = row.try_get(2)?;
            let precision: Option<i32> = row.try_get(3)?;
            let scale: Option<i32> = row.try_get(4)?;
            let nullable: bool = row.try_get(5)?;

            columns.push((
                name,
                udt_name,
                char_len.and_then(|v| u32::try_from(v).ok()),
                precision.and_then(|v| u32::try_from(v).ok()),
                scale.and_then(|v| u32::try_from(v).ok()),
                nullable,
            ));
        }

        if columns.is_empty() {
            bail!(
                ErrorKind::InvalidSchema,
                "Source table has no selectable columns",
                spec.source_table_name
            );
        }

        Ok(columns)
    }
}

fn decode_row(row: &PgRow) -> SyncResult<Row> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        values.push(decode_cell(row, i, column.type_info().name())?);
    }
    Ok(Row::new(values))
}

fn decode_named_cell(row: &PgRow, name: &str) -> SyncResult<Cell> {
    for (i, column) in row.columns().iter().enumerate() {
        if column.name().eq_ignore_ascii_case(name) {
            return decode_cell(row, i, column.type_info().name());
        }
    }

    bail!(
        ErrorKind::InvalidState,
        "Expected column missing from query result",
        name
    )
}

fn decode_cell(row: &PgRow, i: usize, type_name: &str) -> SyncResult<Cell> {
    macro_rules! cell {
        ($ty:ty, $variant:expr) => {
            row.try_get::<Option<$ty>, _>(i)?
                .map($variant)
                .unwrap_or(Cell::Null)
        };
    }

    let cell = match type_name {
        "BOOL" => cell!(bool, Cell::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(i)?
            .map(|v| Cell::I64(v as i64))
            .unwrap_or(Cell::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(i)?
            .map(|v| Cell::I64(v as i64))
            .unwrap_or(Cell::Null),
        "INT8" => cell!(i64, Cell::I64),
        "OID" => row
            .try_get::<Option<Oid>, _>(i)?
            .map(|v| Cell::U64(v.0 as u64))
            .unwrap_or(Cell::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(i)?
            .map(|f| Cell::F64(f as f64))
            .unwrap_or(Cell::Null),
        "FLOAT8" => cell!(f64, Cell::F64),
        "NUMERIC" => cell!(bigdecimal::BigDecimal, Cell::Numeric),
        "MONEY" => row
            .try_get::<Option<PgMoney>, _>(i)?
            .map(|m| Cell::Numeric(m.to_bigdecimal(2)))
            .unwrap_or(Cell::Null),
        "UUID" => cell!(uuid::Uuid, Cell::Uuid),
        "DATE" => cell!(chrono::NaiveDate, Cell::Date),
        "TIME" => cell!(chrono::NaiveTime, Cell::Time),
        "TIMESTAMP" => cell!(chrono::NaiveDateTime, Cell::TimeStamp),
        "TIMESTAMPTZ" => cell!(chrono::DateTime<chrono::Utc>, Cell::TimeStampTz),
        "JSON" | "JSONB" => cell!(serde_json::Value, Cell::Json),
        "BYTEA" => cell!(Vec<u8>, Cell::Bytes),
        _ => cell!(String, Cell::String),
    };

    Ok(cell)
}

/// Classifies a lowercased native type into its serialization bucket.
pub fn bucket(native_type: &str) -> AvroBucket {
    match native_type {
        "int2" | "int4" | "int8" | "oid" | "serial8" => AvroBucket::Long,
        "float4" | "float8" => AvroBucket::Double,
        "bool" => AvroBucket::Boolean,
        "decimal" | "numeric" | "money" => AvroBucket::Decimal,
        "xml" | "char" | "bpchar" | "text" | "bytea" | "name" | "json" | "jsonb" | "varchar"
        | "timestamp" | "timestamptz" | "date" | "time" | "timetz" | "citext" | "uuid" => {
            AvroBucket::String
        }
        other => {
            warn!(native_type = other, "unmatched postgres data type, encoding as string");
            AvroBucket::String
        }
    }
}

/// Maps a native Postgres type to its warehouse column type.
///
/// Unbounded text shapes become the warehouse's maximum varchar, UUIDs a
/// fixed char(36), fixed-point precision clamps to the warehouse maximum and
/// everything temporal lands on timestamp/date. User overrides win over the
/// defaults.
pub(crate) fn warehouse_type(
    spec: &TableConfig,
    udt_name: &str,
    char_len: Option<u32>,
    precision: Option<u32>,
    scale: Option<u32>,
) -> String {
    let udt_name = udt_name.to_lowercase();

    if let Some(mapped) = spec.type_override(&udt_name) {
        return mapped.to_owned();
    }

    match udt_name.as_str() {
        "int2" => "smallint".to_owned(),
        "int4" => "integer".to_owned(),
        "int8" | "oid" | "serial8" => "bigint".to_owned(),
        "float4" => "real".to_owned(),
        "float8" => "double precision".to_owned(),
        "bool" => "boolean".to_owned(),
        "numeric" | "decimal" => match precision {
            Some(p) => {
                let p = p.min(PMAX);
                let s = scale.unwrap_or(0).min(p);
                format!("numeric({p},{s})")
            }
            None => "numeric".to_owned(),
        },
        "money" => "numeric(19,2)".to_owned(),
        "varchar" => match char_len {
            Some(n) => format!("varchar({n})"),
            None => "varchar(max)".to_owned(),
        },
        "bpchar" => match char_len {
            Some(n) => format!("char({n})"),
            None => "varchar(max)".to_owned(),
        },
        "uuid" => "char(36)".to_owned(),
        "date" => "date".to_owned(),
        "time" | "timetz" => "varchar(40)".to_owned(),
        "timestamp" | "timestamptz" => "timestamp".to_owned(),
        // Unbounded or unrepresentable shapes land on the widest varchar.
        _ => "varchar(max)".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TableConfig {
        serde_json::from_value(serde_json::json!({
            "source_table_name": "orders",
            "destination_table_name": "orders",
        }))
        .unwrap()
    }

    #[test]
    fn integers_map_to_warehouse_aliases() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "int2", None, None, None), "smallint");
        assert_eq!(warehouse_type(&spec, "int4", None, None, None), "integer");
        assert_eq!(warehouse_type(&spec, "int8", None, None, None), "bigint");
        assert_eq!(warehouse_type(&spec, "oid", None, None, None), "bigint");
    }

    #[test]
    fn unbounded_text_becomes_max_varchar() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "text", None, None, None), "varchar(max)");
        assert_eq!(warehouse_type(&spec, "jsonb", None, None, None), "varchar(max)");
        assert_eq!(warehouse_type(&spec, "citext", None, None, None), "varchar(max)");
        assert_eq!(
            warehouse_type(&spec, "varchar", Some(120), None, None),
            "varchar(120)"
        );
        assert_eq!(warehouse_type(&spec, "varchar", None, None, None), "varchar(max)");
    }

    #[test]
    fn numeric_precision_clamps() {
        let spec = spec();
        assert_eq!(
            warehouse_type(&spec, "numeric", None, Some(10), Some(2)),
            "numeric(10,2)"
        );
        assert_eq!(
            warehouse_type(&spec, "numeric", None, Some(600), Some(40)),
            "numeric(38,38)"
        );
        assert_eq!(warehouse_type(&spec, "numeric", None, None, None), "numeric");
    }

    #[test]
    fn uuid_and_temporal_defaults() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "uuid", None, None, None), "char(36)");
        assert_eq!(
            warehouse_type(&spec, "timestamptz", None, None, None),
            "timestamp"
        );
        assert_eq!(warehouse_type(&spec, "date", None, None, None), "date");
        assert_eq!(warehouse_type(&spec, "time", None, None, None), "varchar(40)");
    }

    #[test]
    fn type_override_wins_over_defaults() {
        let mut spec = spec();
        spec.type_map
            .insert("jsonb".to_owned(), "super".to_owned());
        assert_eq!(warehouse_type(&spec, "jsonb", None, None, None), "super");
    }

    #[test]
    fn buckets_follow_the_capability_table() {
        assert_eq!(bucket("int8"), AvroBucket::Long);
        assert_eq!(bucket("float4"), AvroBucket::Double);
        assert_eq!(bucket("bool"), AvroBucket::Boolean);
        assert_eq!(bucket("numeric"), AvroBucket::Decimal);
        assert_eq!(bucket("money"), AvroBucket::Decimal);
        assert_eq!(bucket("jsonb"), AvroBucket::String);
        assert_eq!(bucket("uuid"), AvroBucket::String);
        assert_eq!(bucket("interval"), AvroBucket::String);
    }
}
