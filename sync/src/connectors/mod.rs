use config::shared::{SourceConnectionConfig, SourceEngine, TableConfig};
use tokio::sync::mpsc;

use crate::conversions::{AvroBucket, Row};
use crate::error::SyncResult;
use crate::index::IndexValue;

pub mod mssql;
pub mod mysql;
pub mod postgres;

/// Number of rows buffered between the driver task and the consumer.
const STREAM_BUFFER_ROWS: usize = 1024;

/// One column of a described query result, in engine-native terms.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Lowercased native type name, e.g. `bigint unsigned` or `int8`.
    pub native_type: String,
    /// `None` when the engine cannot report nullability for this query.
    pub nullable: Option<bool>,
}

/// A lazy, single-pass stream of source rows.
///
/// Rows are produced by a spawned task that owns the database connection and
/// feeds a bounded channel; consumers cannot seek or iterate twice. Dropping
/// the stream hangs up the channel, which stops the producer on its next
/// send.
pub struct RowStream {
    rx: mpsc::Receiver<SyncResult<Row>>,
}

impl RowStream {
    pub(crate) fn new(rx: mpsc::Receiver<SyncResult<Row>>) -> Self {
        Self { rx }
    }

    /// Returns the next row, or `None` once the result set is drained.
    ///
    /// After an `Err` item the stream is over; the producer stops at the
    /// first failure.
    pub async fn next(&mut self) -> Option<SyncResult<Row>> {
        self.rx.recv().await
    }
}

pub(crate) fn row_channel() -> (mpsc::Sender<SyncResult<Row>>, RowStream) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER_ROWS);
    (tx, RowStream::new(rx))
}

/// Uniform contract over the supported source engines.
///
/// Engine behavior is composed from one module per engine plus its
/// capability table (type buckets, DDL availability) instead of inheritance;
/// this enum is the dispatch seam the pipeline programs against.
#[derive(Debug, Clone)]
pub enum SourceClient {
    Mysql(mysql::MysqlConnector),
    Postgres(postgres::PostgresConnector),
    Sqlserver(mssql::MssqlConnector),
}

impl SourceClient {
    pub fn new(engine: SourceEngine, connection: SourceConnectionConfig) -> SourceClient {
        match engine {
            SourceEngine::Mysql => SourceClient::Mysql(mysql::MysqlConnector::new(connection)),
            SourceEngine::Postgres => {
                SourceClient::Postgres(postgres::PostgresConnector::new(connection))
            }
            SourceEngine::Sqlserver => {
                SourceClient::Sqlserver(mssql::MssqlConnector::new(connection))
            }
        }
    }

    /// Name of the database this client connects to.
    pub fn database_name(&self) -> &str {
        match self {
            SourceClient::Mysql(c) => c.database_name(),
            SourceClient::Postgres(c) => c.database_name(),
            SourceClient::Sqlserver(c) => c.database_name(),
        }
    }

    /// Describes a query's result shape without materializing rows.
    pub async fn describe_query(&self, sql: &str) -> SyncResult<Vec<ColumnDescriptor>> {
        match self {
            SourceClient::Mysql(c) => c.describe_query(sql).await,
            SourceClient::Postgres(c) => c.describe_query(sql).await,
            SourceClient::Sqlserver(c) => c.describe_query(sql).await,
        }
    }

    /// Streams a query's rows lazily, in a single pass.
    pub async fn stream_rows(&self, sql: &str) -> SyncResult<RowStream> {
        match self {
            SourceClient::Mysql(c) => c.stream_rows(sql).await,
            SourceClient::Postgres(c) => c.stream_rows(sql).await,
            SourceClient::Sqlserver(c) => c.stream_rows(sql).await,
        }
    }

    /// Returns the ordered primary key columns of a source table.
    ///
    /// Engines without key introspection return an empty list; a keyed merge
    /// then requires an explicit `primary_key` override.
    pub async fn primary_keys(&self, table: &str) -> SyncResult<Vec<String>> {
        match self {
            SourceClient::Mysql(c) => c.primary_keys(table).await,
            SourceClient::Postgres(c) => c.primary_keys(table).await,
            SourceClient::Sqlserver(c) => c.primary_keys(table).await,
        }
    }

    /// Computes `MAX(index_column)` over the source table.
    pub async fn max_index_value(
        &self,
        table: &str,
        index_column: &str,
    ) -> SyncResult<Option<IndexValue>> {
        match self {
            SourceClient::Mysql(c) => c.max_index_value(table, index_column).await,
            SourceClient::Postgres(c) => c.max_index_value(table, index_column).await,
            SourceClient::Sqlserver(c) => c.max_index_value(table, index_column).await,
        }
    }

    /// Runs a caller-supplied index query expected to return a single row
    /// with an `index_value` column.
    pub async fn fetch_index_value(&self, sql: &str) -> SyncResult<Option<IndexValue>> {
        match self {
            SourceClient::Mysql(c) => c.fetch_index_value(sql).await,
            SourceClient::Postgres(c) => c.fetch_index_value(sql).await,
            SourceClient::Sqlserver(c) => c.fetch_index_value(sql).await,
        }
    }

    /// Builds the generated extraction query for a table, without any
    /// index-window filter.
    pub async fn build_select(&self, spec: &TableConfig) -> SyncResult<String> {
        match self {
            SourceClient::Mysql(c) => c.build_select(spec).await,
            SourceClient::Postgres(c) => c.build_select(spec).await,
            SourceClient::Sqlserver(c) => c.build_select(spec).await,
        }
    }

    /// Generates the warehouse `CREATE TABLE` statement for a table.
    ///
    /// Engines that cannot introspect schema well enough return a migration
    /// error instead of guessing.
    pub async fn create_table_sql(
        &self,
        spec: &TableConfig,
        select_sql: &str,
        table_name: &str,
    ) -> SyncResult<String> {
        match self {
            SourceClient::Mysql(c) => c.create_table_sql(spec, select_sql, table_name).await,
            SourceClient::Postgres(c) => c.create_table_sql(spec, select_sql, table_name).await,
            SourceClient::Sqlserver(c) => c.create_table_sql(spec, select_sql, table_name).await,
        }
    }

    /// Classifies a native type into its serialization bucket.
    pub fn bucket(&self, native_type: &str) -> AvroBucket {
        match self {
            SourceClient::Mysql(_) => mysql::bucket(native_type),
            SourceClient::Postgres(_) => postgres::bucket(native_type),
            SourceClient::Sqlserver(_) => mssql::bucket(native_type),
        }
    }
}

/// Renders the distkey/sortkey suffix appended to generated DDL.
pub(crate) fn create_table_keys(spec: &TableConfig) -> String {
    let mut output = String::new();

    if let Some(distkey) = &spec.distribution_key {
        output.push_str(&format!("distkey({distkey})\n"));
    }

    if !spec.sort_keys.is_empty() {
        if spec.sort_keys.len() > 1 {
            output.push_str("compound ");
        }
        output.push_str(&format!("sortkey({})\n", spec.sort_keys.join(",")));
    }

    output
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
    fn create_table_keys_empty_without_hints() {
        assert_eq!(create_table_keys(&spec()), "");
    }

    #[test]
    fn create_table_keys_renders_distkey_and_sortkeys() {
        let mut spec = spec();
        spec.distribution_key = Some("id".to_owned());
        spec.sort_keys = vec!["created_at".to_owned()];
        assert_eq!(create_table_keys(&spec), "distkey(id)\nsortkey(created_at)\n");

        spec.sort_keys = vec!["created_at".to_owned(), "id".to_owned()];
        assert_eq!(
            create_table_keys(&spec),
            "distkey(id)\ncompound sortkey(created_at,id)\n"
        );
    }
}
