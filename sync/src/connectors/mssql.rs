use std::str::FromStr;

use bigdecimal::BigDecimal;
use config::shared::{SourceConnectionConfig, TableConfig};
use futures::TryStreamExt;
use secrecy::ExposeSecret;
use tiberius::{AuthMethod, Client, ColumnType, Config, QueryItem};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::warn;

use crate::connectors::{create_table_keys, row_channel, ColumnDescriptor, RowStream};
use crate::conversions::{AvroBucket, Cell, Row};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::index::IndexValue;
use crate::{bail, sync_error};

const NOT_SUPPORTED: &str = "auto generated queries not yet supported for SQL Server";

/// Connector for SQL-Server-family sources.
///
/// SQL Server exposes the weakest metadata of the supported engines, so this
/// connector streams rows and describes queries but refuses to generate DDL,
/// selects or index aggregates; those tables need hand-written SQL in their
/// configuration.
#[derive(Debug, Clone)]
pub struct MssqlConnector {
    config: SourceConnectionConfig,
}

impl MssqlConnector {
    pub fn new(config: SourceConnectionConfig) -> MssqlConnector {
        MssqlConnector { config }
    }

    pub fn database_name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self) -> SyncResult<Client<Compat<TcpStream>>> {
        let mut config = Config::new();
        config.host(&self.config.host);
        config.port(self.config.port);
        config.database(&self.config.name);

        let password = self
            .config
            .password
            .as_ref()
            .map(|p| p.expose_secret().clone())
            .unwrap_or_default();
        config.authentication(AuthMethod::sql_server(&self.config.username, password));
        config.trust_cert();

        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|err| {
            sync_error!(
                ErrorKind::SourceConnectionFailed,
                "Failed to connect to SQL Server source",
                err
            )
        })?;
        tcp.set_nodelay(true).map_err(|err| {
            sync_error!(
                ErrorKind::SourceConnectionFailed,
                "Failed to configure SQL Server connection",
                err
            )
        })?;

        let client = Client::connect(config, tcp.compat_write()).await?;

        Ok(client)
    }

    pub async fn describe_query(&self, sql: &str) -> SyncResult<Vec<ColumnDescriptor>> {
        let mut client = self.connect().await?;
        let mut stream = client.simple_query(sql).await?;

        // The first item of the stream is the result metadata; the rows
        // behind it are never pulled.
        while let Some(item) = stream.try_next().await? {
            if let QueryItem::Metadata(meta) = item {
                return Ok(meta
                    .columns()
                    .iter()
                    .map(|col| ColumnDescriptor {
                        name: col.name().to_owned(),
                        native_type: column_type_name(col.column_type()).to_owned(),
                        nullable: None,
                    })
                    .collect());
            }
        }

        Ok(Vec::new())
    }

    pub async fn stream_rows(&self, sql: &str) -> SyncResult<RowStream> {
        let mut client = self.connect().await?;
        let sql = sql.to_owned();
        let (tx, stream) = row_channel();

        tokio::spawn(async move {
            let mut rows = match client.simple_query(&sql).await {
                Ok(rows) => rows,
                Err(err) => {
                    let _ = tx.send(Err(err.into())).await;
                    return;
                }
            };

            loop {
                match rows.try_next().await {
                    Ok(Some(QueryItem::Metadata(_))) => continue,
                    Ok(Some(QueryItem::Row(row))) => {
                        let message = decode_row(row);
                        let failed = message.is_err();
                        if tx.send(message).await.is_err() || failed {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = tx.send(Err(err.into())).await;
                        break;
                    }
                }
            }
        });

        Ok(stream)
    }

    /// SQL Server tables do not get their keys inferred; a keyed merge needs
    /// an explicit `primary_key` override in the table configuration.
    pub async fn primary_keys(&self, _table: &str) -> SyncResult<Vec<String>> {
        Ok(Vec::new())
    }

    pub async fn max_index_value(
        &self,
        _table: &str,
        _index_column: &str,
    ) -> SyncResult<Option<IndexValue>> {
        Err(sync_error!(
            ErrorKind::MigrationNotSupported,
            "Auto generated index queries not yet supported for SQL Server"
        ))
    }

    pub async fn fetch_index_value(&self, sql: &str) -> SyncResult<Option<IndexValue>> {
        let mut client = self.connect().await?;
        let mut stream = client.simple_query(sql).await?;

        let mut index_position = None;
        while let Some(item) = stream.try_next().await? {
            match item {
                QueryItem::Metadata(meta) => {
                    index_position = meta
                        .columns()
                        .iter()
                        .position(|col| col.name().eq_ignore_ascii_case("index_value"));
                }
                QueryItem::Row(row) => {
                    let Some(position) = index_position else {
                        bail!(
                            ErrorKind::InvalidState,
                            "Expected column missing from query result",
                            "index_value"
                        );
                    };
                    let types: Vec<ColumnType> =
                        row.columns().iter().map(|c| c.column_type()).collect();
                    let cell = decode_cell(&row, position, types[position])?;
                    return Ok(IndexValue::from_cell(&cell));
                }
            }
        }

        Ok(None)
    }

    pub async fn build_select(&self, _spec: &TableConfig) -> SyncResult<String> {
        Err(sync_error!(ErrorKind::MigrationNotSupported, NOT_SUPPORTED))
    }

    pub async fn create_table_sql(
        &self,
        spec: &TableConfig,
        _select_sql: &str,
        _table_name: &str,
    ) -> SyncResult<String> {
        if let Some(ddl) = &spec.create_table_sql {
            let mut create_table = ddl.trim_end_matches([';', ' ', '\n']).to_owned();
            create_table.push_str(&create_table_keys(spec));
            return Ok(create_table);
        }

        Err(sync_error!(ErrorKind::MigrationNotSupported, NOT_SUPPORTED))
    }
}

fn decode_row(row: tiberius::Row) -> SyncResult<Row> {
    let types: Vec<ColumnType> = row.columns().iter().map(|c| c.column_type()).collect();

    let mut values = Vec::with_capacity(types.len());
    for (i, column_type) in types.iter().enumerate() {
        values.push(decode_cell(&row, i, *column_type)?);
    }

    Ok(Row::new(values))
}

fn decode_cell(row: &tiberius::Row, i: usize, column_type: ColumnType) -> SyncResult<Cell> {
    macro_rules! cell {
        ($ty:ty, $variant:expr) => {
            row.try_get::<$ty, _>(i)?.map($variant).unwrap_or(Cell::Null)
        };
    }

    let cell = match column_type {
        ColumnType::Bit | ColumnType::Bitn => cell!(bool, Cell::Bool),
        ColumnType::Int1 => row
            .try_get::<u8, _>(i)?
            .map(|v| Cell::I64(v as i64))
            .unwrap_or(Cell::Null),
        ColumnType::Int2 => row
            .try_get::<i16, _>(i)?
            .map(|v| Cell::I64(v as i64))
            .unwrap_or(Cell::Null),
        ColumnType::Int4 => row
            .try_get::<i32, _>(i)?
            .map(|v| Cell::I64(v as i64))
            .unwrap_or(Cell::Null),
        ColumnType::Int8 => cell!(i64, Cell::I64),
        // Nullable integer columns report their concrete width per value.
        ColumnType::Intn => decode_int_cascade(row, i)?,
        ColumnType::Float4 => row
            .try_get::<f32, _>(i)?
            .map(|f| Cell::F64(f as f64))
            .unwrap_or(Cell::Null),
        ColumnType::Float8 | ColumnType::Money | ColumnType::Money4 => cell!(f64, Cell::F64),
        ColumnType::Floatn => decode_float_cascade(row, i)?,
        ColumnType::Decimaln | ColumnType::Numericn => {
            match row.try_get::<tiberius::numeric::Numeric, _>(i)? {
                Some(n) => {
                    let decimal = BigDecimal::from_str(&n.to_string()).map_err(|err| {
                        sync_error!(
                            ErrorKind::ConversionError,
                            "Could not parse SQL Server numeric value",
                            err
                        )
                    })?;
                    Cell::Numeric(decimal)
                }
                None => Cell::Null,
            }
        }
        ColumnType::Datetime
        | ColumnType::Datetime4
        | ColumnType::Datetimen
        | ColumnType::Datetime2 => cell!(chrono::NaiveDateTime, Cell::TimeStamp),
        ColumnType::Daten => cell!(chrono::NaiveDate, Cell::Date),
        ColumnType::Timen => cell!(chrono::NaiveTime, Cell::Time),
        ColumnType::DatetimeOffsetn => {
            cell!(chrono::DateTime<chrono::Utc>, Cell::TimeStampTz)
        }
        ColumnType::Guid => cell!(uuid::Uuid, Cell::Uuid),
        ColumnType::BigBinary | ColumnType::BigVarBin | ColumnType::Image => row
            .try_get::<&[u8], _>(i)?
            .map(|b| Cell::Bytes(b.to_vec()))
            .unwrap_or(Cell::Null),
        _ => row
            .try_get::<&str, _>(i)?
            .map(|s| Cell::String(s.to_owned()))
            .unwrap_or(Cell::Null),
    };

    Ok(cell)
}

fn decode_int_cascade(row: &tiberius::Row, i: usize) -> SyncResult<Cell> {
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return Ok(v.map(Cell::I64).unwrap_or(Cell::Null));
    }
    if let Ok(v) = row.try_get::<i32, _>(i) {
        return Ok(v.map(|x| Cell::I64(x as i64)).unwrap_or(Cell::Null));
    }
    if let Ok(v) = row.try_get::<i16, _>(i) {
        return Ok(v.map(|x| Cell::I64(x as i64)).unwrap_or(Cell::Null));
    }
    let v = row.try_get::<u8, _>(i)?;
    Ok(v.map(|x| Cell::I64(x as i64)).unwrap_or(Cell::Null))
}

fn decode_float_cascade(row: &tiberius::Row, i: usize) -> SyncResult<Cell> {
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return Ok(v.map(Cell::F64).unwrap_or(Cell::Null));
    }
    let v = row.try_get::<f32, _>(i)?;
    Ok(v.map(|x| Cell::F64(x as f64)).unwrap_or(Cell::Null))
}

/// Native type name for a TDS column type, lowercased.
fn column_type_name(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Bit | ColumnType::Bitn => "bit",
        ColumnType::Int1 => "tinyint",
        ColumnType::Int2 => "smallint",
        ColumnType::Int4 | ColumnType::Intn => "int",
        ColumnType::Int8 => "bigint",
        ColumnType::Float4 => "real",
        ColumnType::Float8 | ColumnType::Floatn => "float",
        ColumnType::Money => "money",
        ColumnType::Money4 => "smallmoney",
        ColumnType::Decimaln => "decimal",
        ColumnType::Numericn => "numeric",
        ColumnType::Guid => "uniqueidentifier",
        ColumnType::BigChar => "char",
        ColumnType::BigVarChar => "varchar",
        ColumnType::NChar => "nchar",
        ColumnType::NVarchar => "nvarchar",
        ColumnType::Text => "text",
        ColumnType::NText => "ntext",
        ColumnType::BigBinary => "binary",
        ColumnType::BigVarBin => "varbinary",
        ColumnType::Image => "image",
        ColumnType::Datetime | ColumnType::Datetime4 | ColumnType::Datetimen => "datetime",
        ColumnType::Datetime2 => "datetime2",
        ColumnType::Daten => "date",
        ColumnType::Timen => "time",
        ColumnType::DatetimeOffsetn => "datetimeoffset",
        ColumnType::Xml => "xml",
        _ => "sql_variant",
    }
}

/// Classifies a lowercased native type into its serialization bucket.
pub fn bucket(native_type: &str) -> AvroBucket {
    match native_type {
        "tinyint" | "smallint" | "int" | "bigint" => AvroBucket::Long,
        "bit" => AvroBucket::Boolean,
        "float" | "real" => AvroBucket::Double,
        "decimal" | "numeric" | "money" | "smallmoney" => AvroBucket::Decimal,
        "char" | "varchar" | "nchar" | "nvarchar" | "text" | "ntext" | "datetime"
        | "smalldatetime" | "datetime2" | "date" | "time" | "datetimeoffset" | "binary"
        | "varbinary" | "image" | "uniqueidentifier" | "xml" => AvroBucket::String,
        other => {
            warn!(native_type = other, "unmatched sql server data type, encoding as string");
            AvroBucket::String
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_follow_the_capability_table() {
        assert_eq!(bucket("bigint"), AvroBucket::Long);
        assert_eq!(bucket("bit"), AvroBucket::Boolean);
        assert_eq!(bucket("float"), AvroBucket::Double);
        assert_eq!(bucket("money"), AvroBucket::Decimal);
        assert_eq!(bucket("nvarchar"), AvroBucket::String);
        assert_eq!(bucket("datetime2"), AvroBucket::String);
        assert_eq!(bucket("sql_variant"), AvroBucket::String);
    }

    #[test]
    fn column_type_names_are_native_spellings() {
        assert_eq!(column_type_name(ColumnType::Int8), "bigint");
        assert_eq!(column_type_name(ColumnType::NVarchar), "nvarchar");
        assert_eq!(column_type_name(ColumnType::Decimaln), "decimal");
        assert_eq!(column_type_name(ColumnType::Datetime2), "datetime2");
        assert_eq!(column_type_name(ColumnType::Guid), "uniqueidentifier");
    }
}
