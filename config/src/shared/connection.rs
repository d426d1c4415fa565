use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use std::fmt;

use crate::SerializableSecretString;

/// Family of the source database engine.
///
/// The engine determines which connector implementation is used for type
/// mapping, introspection and row streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceEngine {
    Mysql,
    Postgres,
    Sqlserver,
}

impl fmt::Display for SourceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceEngine::Mysql => write!(f, "mysql"),
            SourceEngine::Postgres => write!(f, "postgres"),
            SourceEngine::Sqlserver => write!(f, "sqlserver"),
        }
    }
}

/// Connection parameters for a source database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SourceConnectionConfig {
    /// Hostname or IP address of the database server.
    pub host: String,
    /// Port the database server is listening on.
    pub port: u16,
    /// Name of the database to connect to.
    pub name: String,
    /// Username for authentication.
    pub username: String,
    /// Password for the specified user. Redacted in debug output.
    pub password: Option<SerializableSecretString>,
}

/// Connection parameters for the analytical warehouse.
///
/// The warehouse speaks the Postgres wire protocol, so a single connection
/// shape covers it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WarehouseConnectionConfig {
    /// Hostname or IP address of the warehouse leader node.
    pub host: String,
    /// Port the warehouse is listening on.
    pub port: u16,
    /// Name of the warehouse database.
    pub name: String,
    /// Username for authentication.
    pub username: String,
    /// Password for the specified user. Redacted in debug output.
    pub password: Option<SerializableSecretString>,
}

/// Converts a connection config into a driver-specific connect options value.
///
/// The same config struct backs several sqlx drivers, so the conversion is a
/// trait implemented once per options type instead of a method per driver.
pub trait IntoConnectOptions<Output> {
    /// Creates connect options targeting a specific database.
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<PgConnectOptions> for WarehouseConnectionConfig {
    fn with_db(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.name);

        if let Some(password) = &self.password {
            options.password(password.expose_secret())
        } else {
            options
        }
    }
}

impl IntoConnectOptions<PgConnectOptions> for SourceConnectionConfig {
    fn with_db(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.name);

        if let Some(password) = &self.password {
            options.password(password.expose_secret())
        } else {
            options
        }
    }
}

impl IntoConnectOptions<MySqlConnectOptions> for SourceConnectionConfig {
    fn with_db(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.name)
            .charset("utf8mb4");

        if let Some(password) = &self.password {
            options.password(password.expose_secret())
        } else {
            options
        }
    }
}
