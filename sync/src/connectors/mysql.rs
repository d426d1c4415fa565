use config::shared::{IntoConnectOptions, SourceConnectionConfig, TableConfig};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Executor, Row as SqlxRow, TypeInfo};
use tracing::warn;

use crate::connectors::{create_table_keys, row_channel, ColumnDescriptor, RowStream};
use crate::conversions::{AvroBucket, Cell, Row};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::index::IndexValue;
use crate::{bail, sync_error};

const NUM_POOL_CONNECTIONS: u32 = 1;

/// Maximum varchar width the warehouse supports.
const CMAX: u32 = 65535;

/// Maximum numeric precision the warehouse supports.
const PMAX: u32 = 38;

/// Connector for MySQL-family sources.
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    config: SourceConnectionConfig,
}

impl MysqlConnector {
    pub fn new(config: SourceConnectionConfig) -> MysqlConnector {
        MysqlConnector { config }
    }

    pub fn database_name(&self) -> &str {
        &self.config.name
    }

    /// Opens a fresh single-connection pool to the source.
    ///
    /// Connections are opened per table operation and closed on every exit
    /// path; nothing is pooled across tables.
    async fn connect(&self) -> SyncResult<MySqlPool> {
        let options: MySqlConnectOptions = self.config.with_db();

        MySqlPoolOptions::new()
            .max_connections(NUM_POOL_CONNECTIONS)
            .min_connections(NUM_POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::SourceConnectionFailed,
                    "Failed to connect to MySQL source",
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
            "SHOW KEYS FROM `{table}` WHERE Key_name = 'PRIMARY'"
        ))
        .fetch_all(&pool)
        .await?;

        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>("Column_name"))
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
            format!("SELECT MAX(`{index_column}`) AS index_value FROM `{table}`;");
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
            WHERE table_schema = DATABASE()
              AND table_name = ?
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

        Ok(format!(
            "SELECT\n    `{}`\nFROM `{}`",
            columns.join("`\n  , `"),
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
            let mut create_table = ddl.trim_end_matches([';', ' ', '\n']).to_owned();
            create_table.push_str(&create_table_keys(spec));
            return Ok(create_table);
        }

        let fields = if spec.extract_query.is_some() {
            // Hand-written queries are described through the driver; the
            // native type names carry no display width there.
            self.describe_query(select_sql)
                .await?
                .into_iter()
                .map(|col| (col.name, col.native_type, col.nullable.unwrap_or(true)))
                .collect()
        } else {
            self.table_columns(spec).await?
        };

        let field_strs: Vec<String> = fields
            .into_iter()
            .map(|(name, native_type, nullable)| {
                format!(
                    "\"{}\" {}{}",
                    name,
                    warehouse_type(spec, &native_type),
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

    /// Reads `(name, native type, nullable)` for a table's columns, in
    /// ordinal order, excluding dropped columns.
    async fn table_columns(
        &self,
        spec: &TableConfig,
    ) -> SyncResult<Vec<(String, String, bool)>> {
        let pool = self.connect().await?;

        let rows = sqlx::query(
            r#"
            SELECT column_name, column_type, is_nullable
            FROM information_schema.columns
            WHERE table_schema = DATABASE()
              AND table_name = ?
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
            let column_type: String = row.try_get(1)?;
            let is_nullable: String = row.try_get(2)?;
            columns.push((name, column_type, is_nullable.eq_ignore_ascii_case("yes")));
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

/// Decodes one driver row into engine-agnostic cells.
fn decode_row(row: &MySqlRow) -> SyncResult<Row> {
    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        values.push(decode_cell(row, i, column.type_info().name())?);
    }
    Ok(Row::new(values))
}

fn decode_named_cell(row: &MySqlRow, name: &str) -> SyncResult<Cell> {
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

fn decode_cell(row: &MySqlRow, i: usize, type_name: &str) -> SyncResult<Cell> {
    macro_rules! cell {
        ($ty:ty, $variant:expr) => {
            row.try_get::<Option<$ty>, _>(i)?
                .map($variant)
                .unwrap_or(Cell::Null)
        };
    }

    let cell = match type_name {
        "BOOLEAN" => cell!(bool, Cell::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => cell!(i64, Cell::I64),
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" | "BIT" => cell!(u64, Cell::U64),
        "YEAR" => row
            .try_get::<Option<u16>, _>(i)?
            .map(|y| Cell::U64(y as u64))
            .unwrap_or(Cell::Null),
        "FLOAT" => row
            .try_get::<Option<f32>, _>(i)?
            .map(|f| Cell::F64(f as f64))
            .unwrap_or(Cell::Null),
        "DOUBLE" => cell!(f64, Cell::F64),
        "DECIMAL" => cell!(bigdecimal::BigDecimal, Cell::Numeric),
        "DATE" => cell!(chrono::NaiveDate, Cell::Date),
        "TIME" => cell!(chrono::NaiveTime, Cell::Time),
        "DATETIME" => cell!(chrono::NaiveDateTime, Cell::TimeStamp),
        "TIMESTAMP" => cell!(chrono::DateTime<chrono::Utc>, Cell::TimeStampTz),
        "JSON" => cell!(serde_json::Value, Cell::Json),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            cell!(Vec<u8>, Cell::Bytes)
        }
        _ => cell!(String, Cell::String),
    };

    Ok(cell)
}

/// Classifies a lowercased native type into its serialization bucket.
pub fn bucket(native_type: &str) -> AvroBucket {
    match base_type_name(native_type) {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "boolean" => {
            AvroBucket::Long
        }
        "float" | "double" => AvroBucket::Double,
        "decimal" | "numeric" => AvroBucket::Decimal,
        "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "blob"
        | "tinyblob" | "mediumblob" | "longblob" | "binary" | "varbinary" | "enum" | "set"
        | "bit" | "date" | "time" | "datetime" | "timestamp" | "json" | "year" | "geometry"
        | "null" => AvroBucket::String,
        other => {
            warn!(native_type = other, "unmatched mysql data type, encoding as string");
            AvroBucket::String
        }
    }
}

/// Maps a native MySQL type to its warehouse column type.
///
/// Numeric types widen so unsigned values cannot overflow the destination
/// column, fixed-point precision clamps to the warehouse maximum, and string
/// widths quadruple (bytes per character) up to the varchar cap.
pub(crate) fn warehouse_type(spec: &TableConfig, input_type: &str) -> String {
    let inp = input_type.to_lowercase();

    // Overrides match the full native type, e.g. `bigint(20) unsigned`.
    if let Some(mapped) = spec.type_override(&inp) {
        return mapped.to_owned();
    }

    let unsigned = inp.contains("unsigned");
    let (precision, scale) = parse_precision(&inp);
    let inp = inp.replace("integer", "int");
    let type_name = base_type_name(&inp);

    match type_name {
        // Types that always widen, with or without the unsigned marker.
        "tinyint" => "smallint".to_owned(),
        "mediumint" => "integer".to_owned(),
        "float" => "real".to_owned(),
        "double" => "double precision".to_owned(),
        "smallint" => {
            if unsigned {
                "integer".to_owned()
            } else {
                "smallint".to_owned()
            }
        }
        "int" => {
            if unsigned {
                "bigint".to_owned()
            } else {
                "integer".to_owned()
            }
        }
        "bigint" => {
            if unsigned {
                format!("numeric({PMAX}, 0)")
            } else {
                "bigint".to_owned()
            }
        }
        "decimal" | "numeric" => {
            let precision = precision.unwrap_or(18).min(PMAX);
            let scale = scale.unwrap_or(0).min(precision);
            format!("decimal({precision},{scale})")
        }
        "bit" => match precision {
            Some(1) | None => "boolean".to_owned(),
            Some(p) => format!("varchar({p})"),
        },
        "date" => "date".to_owned(),
        "time" => "varchar(40)".to_owned(),
        "datetime" | "timestamp" => "timestamp".to_owned(),
        "year" => "integer".to_owned(),
        "char" | "varchar" => {
            let width = precision.map(|p| (4 * p).min(CMAX)).unwrap_or(CMAX);
            format!("varchar({width})")
        }
        _ => format!("varchar({CMAX})"),
    }
}

/// Strips display width and the unsigned marker off a native type name.
fn base_type_name(native_type: &str) -> &str {
    let base = native_type.split('(').next().unwrap_or("").trim();
    base.strip_suffix(" unsigned").unwrap_or(base).trim()
}

/// Parses `(precision[, scale])` out of a native type string.
fn parse_precision(native_type: &str) -> (Option<u32>, Option<u32>) {
    let Some(start) = native_type.find('(') else {
        return (None, None);
    };
    let Some(end) = native_type[start..].find(')') else {
        return (None, None);
    };

    let inner = &native_type[start + 1..start + end];
    let mut parts = inner.splitn(2, ',');
    let precision = parts.next().and_then(|p| p.trim().parse().ok());
    let scale = parts.next().and_then(|s| s.trim().parse().ok());

    (precision, scale)
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
    fn signed_integers_keep_or_widen() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "tinyint(1)"), "smallint");
        assert_eq!(warehouse_type(&spec, "smallint(6)"), "smallint");
        assert_eq!(warehouse_type(&spec, "mediumint(9)"), "integer");
        assert_eq!(warehouse_type(&spec, "int(11)"), "integer");
        assert_eq!(warehouse_type(&spec, "integer(11)"), "integer");
        assert_eq!(warehouse_type(&spec, "bigint(20)"), "bigint");
    }

    #[test]
    fn unsigned_integers_promote() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "smallint(5) unsigned"), "integer");
        assert_eq!(warehouse_type(&spec, "int(10) unsigned"), "bigint");
        assert_eq!(warehouse_type(&spec, "bigint(20) unsigned"), "numeric(38, 0)");
        assert_eq!(warehouse_type(&spec, "int unsigned"), "bigint");
    }

    #[test]
    fn fixed_point_clamps_to_warehouse_maximum() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "decimal(10,2)"), "decimal(10,2)");
        assert_eq!(warehouse_type(&spec, "decimal(65,30)"), "decimal(38,30)");
        assert_eq!(warehouse_type(&spec, "numeric(20,4) unsigned"), "decimal(20,4)");
    }

    #[test]
    fn strings_quadruple_up_to_the_cap() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "varchar(35)"), "varchar(140)");
        assert_eq!(warehouse_type(&spec, "char(35)"), "varchar(140)");
        assert_eq!(warehouse_type(&spec, "varchar(20000)"), "varchar(65535)");
        assert_eq!(warehouse_type(&spec, "text"), "varchar(65535)");
    }

    #[test]
    fn temporal_and_bit_types() {
        let spec = spec();
        assert_eq!(warehouse_type(&spec, "datetime"), "timestamp");
        assert_eq!(warehouse_type(&spec, "timestamp"), "timestamp");
        assert_eq!(warehouse_type(&spec, "date"), "date");
        assert_eq!(warehouse_type(&spec, "time"), "varchar(40)");
        assert_eq!(warehouse_type(&spec, "year(4)"), "integer");
        assert_eq!(warehouse_type(&spec, "bit(1)"), "boolean");
        assert_eq!(warehouse_type(&spec, "bit(8)"), "varchar(8)");
    }

    #[test]
    fn type_override_wins() {
        let mut spec = spec();
        spec.type_map.insert(
            "bigint(20) unsigned".to_owned(),
            "bigint".to_owned(),
        );
        assert_eq!(warehouse_type(&spec, "BIGINT(20) UNSIGNED"), "bigint");
    }

    #[test]
    fn buckets_follow_the_capability_table() {
        assert_eq!(bucket("bigint unsigned"), AvroBucket::Long);
        assert_eq!(bucket("tinyint(1)"), AvroBucket::Long);
        assert_eq!(bucket("double"), AvroBucket::Double);
        assert_eq!(bucket("decimal(10,2)"), AvroBucket::Decimal);
        assert_eq!(bucket("varchar(35)"), AvroBucket::String);
        assert_eq!(bucket("datetime"), AvroBucket::String);
        assert_eq!(bucket("geometry"), AvroBucket::String);
    }
}
