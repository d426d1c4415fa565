use std::error;
use std::fmt;

/// Convenient result type for sync operations using [`SyncError`] as the error type.
pub type SyncResult<T> = Result<T, SyncError>;

/// Main error type for table synchronization.
///
/// [`SyncError`] can represent a single error, an error with additional
/// dynamic detail, or multiple aggregated errors. Every error carries an
/// [`ErrorKind`], and each kind maps onto exactly one recovery tier via
/// [`ErrorKind::fault`], which is what the per-table retry policy consumes.
#[derive(Debug, Clone)]
pub struct SyncError {
    repr: ErrorRepr,
}

/// Internal representation of error data.
#[derive(Debug, Clone)]
enum ErrorRepr {
    /// Error with kind and static description.
    WithDescription(ErrorKind, &'static str),
    /// Error with kind, static description, and dynamic detail.
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    /// Multiple aggregated errors.
    Many(Vec<SyncError>),
}

/// Specific categories of errors that can occur during synchronization.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration errors
    ConfigError,

    // Schema & migration errors
    InvalidSchema,
    MigrationNotSupported,

    // Connection errors
    SourceConnectionFailed,
    WarehouseConnectionFailed,
    StorageIoError,

    // Query & execution errors
    SourceQueryFailed,
    WarehouseQueryFailed,

    // Data errors
    DataIntegrity,
    ConversionError,
    SerializationError,

    // State & workflow errors
    InvalidState,

    // Unknown / uncategorized
    Unknown,
}

/// Recovery tier of an error, consumed by the per-table retry policy.
///
/// Exactly one tier applies per [`ErrorKind`]:
/// - [`Fault::Config`]: static configuration contradiction; the table is
///   skipped and collected for the end-of-run summary, never retried.
/// - [`Fault::SkipTable`]: the table cannot be processed safely this run;
///   it is skipped with a logged error and the run continues.
/// - [`Fault::Retry`]: transient connectivity; the attempt is repeated with
///   backoff up to the retry budget, then escalated to fatal.
/// - [`Fault::Fatal`]: unclassified or unrecoverable; aborts the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Config,
    SkipTable,
    Retry,
    Fatal,
}

impl ErrorKind {
    /// Returns the recovery tier for this error kind.
    pub fn fault(&self) -> Fault {
        match self {
            ErrorKind::ConfigError => Fault::Config,
            ErrorKind::InvalidSchema
            | ErrorKind::MigrationNotSupported
            | ErrorKind::DataIntegrity
            | ErrorKind::ConversionError
            | ErrorKind::SerializationError
            | ErrorKind::SourceQueryFailed
            | ErrorKind::WarehouseQueryFailed => Fault::SkipTable,
            ErrorKind::SourceConnectionFailed
            | ErrorKind::WarehouseConnectionFailed
            | ErrorKind::StorageIoError => Fault::Retry,
            ErrorKind::InvalidState | ErrorKind::Unknown => Fault::Fatal,
        }
    }
}

impl SyncError {
    /// Creates a [`SyncError`] containing multiple aggregated errors.
    pub fn many(errors: Vec<SyncError>) -> SyncError {
        SyncError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For multiple errors, returns the kind of the first error or
    /// [`ErrorKind::Unknown`] if the error list is empty.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
            ErrorRepr::Many(ref errors) => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns all [`ErrorKind`]s present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![kind],
            ErrorRepr::Many(ref errors) => errors
                .iter()
                .flat_map(|err| err.kinds())
                .collect::<Vec<_>>(),
        }
    }

    /// Returns the recovery tier of this error, delegating to the kind.
    pub fn fault(&self) -> Fault {
        self.kind().fault()
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            ErrorRepr::Many(ref errors) => errors.iter().find_map(|e| e.detail()),
            _ => None,
        }
    }
}

impl PartialEq for SyncError {
    fn eq(&self, other: &SyncError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::WithDescription(kind_a, _), ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::Many(errors_a), ErrorRepr::Many(errors_b)) => {
                errors_a.len() == errors_b.len()
                    && errors_a.iter().zip(errors_b.iter()).all(|(a, b)| a == b)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;

                Ok(())
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;
                f.write_str(" -> ")?;
                detail.fmt(f)?;

                Ok(())
            }
            ErrorRepr::Many(ref errors) => {
                if errors.is_empty() {
                    write!(f, "Multiple errors occurred (empty)")?;
                } else if errors.len() == 1 {
                    errors[0].fmt(f)?;
                } else {
                    write!(f, "Multiple errors occurred ({} total):", errors.len())?;
                    for (i, error) in errors.iter().enumerate() {
                        write!(f, "\n  {}: {}", i + 1, error)?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl error::Error for SyncError {}

/// Creates a [`SyncError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for SyncError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

/// Creates a [`SyncError`] from an error kind, static description, and dynamic detail.
impl From<(ErrorKind, &'static str, String)> for SyncError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

/// Creates a [`SyncError`] from a vector of errors for aggregation.
impl<E> From<Vec<E>> for SyncError
where
    E: Into<SyncError>,
{
    fn from(errors: Vec<E>) -> SyncError {
        SyncError {
            repr: ErrorRepr::Many(errors.into_iter().map(Into::into).collect()),
        }
    }
}

/// Converts [`std::io::Error`] to [`SyncError`] with [`ErrorKind::StorageIoError`].
impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::StorageIoError,
                "I/O error occurred",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`serde_json::Error`] to [`SyncError`] with [`ErrorKind::SerializationError`].
impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::SerializationError,
                "JSON serialization failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`apache_avro::Error`] to [`SyncError`] with [`ErrorKind::SerializationError`].
impl From<apache_avro::Error> for SyncError {
    fn from(err: apache_avro::Error) -> SyncError {
        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                ErrorKind::SerializationError,
                "Avro serialization failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`sqlx::Error`] to [`SyncError`] with appropriate error kind.
///
/// Driver-reported database errors are classified by SQLSTATE class where one
/// is available: constraint and data exceptions become [`ErrorKind::DataIntegrity`],
/// everything else reported by the server stays a query failure. Transport
/// level failures become connection errors so the retry policy picks them up.
impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> SyncError {
        let (kind, description) = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => (
                ErrorKind::SourceConnectionFailed,
                "Database connection failed",
            ),
            sqlx::Error::Configuration(_) => {
                (ErrorKind::ConfigError, "Database configuration invalid")
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // Integrity constraint violations (23xxx) and data exceptions
                // (22xxx) are value errors for this table only.
                Some(code) if code.starts_with("23") || code.starts_with("22") => {
                    (ErrorKind::DataIntegrity, "Database constraint violation")
                }
                // Connection exceptions (08xxx) and insufficient resources
                // (53xxx) are transient.
                Some(code) if code.starts_with("08") || code.starts_with("53") => (
                    ErrorKind::SourceConnectionFailed,
                    "Database connection failed",
                ),
                // Serialization failures / deadlocks (40xxx) roll the
                // transaction back; the table is skipped this run.
                Some(code) if code.starts_with("40") => {
                    (ErrorKind::DataIntegrity, "Transaction rolled back")
                }
                _ => (ErrorKind::SourceQueryFailed, "Database query failed"),
            },
            sqlx::Error::RowNotFound => (ErrorKind::InvalidState, "Expected row not found"),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                (ErrorKind::ConversionError, "Column decoding failed")
            }
            _ => (ErrorKind::Unknown, "Unexpected database error"),
        };

        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

/// Converts [`tiberius::error::Error`] to [`SyncError`] with appropriate error kind.
impl From<tiberius::error::Error> for SyncError {
    fn from(err: tiberius::error::Error) -> SyncError {
        use tiberius::error::Error;

        let (kind, description) = match &err {
            Error::Io { .. } | Error::Tls(_) | Error::Routing { .. } => (
                ErrorKind::SourceConnectionFailed,
                "SQL Server connection failed",
            ),
            Error::Server(token) => {
                // Class 16 and below are statement errors; higher severities
                // indicate resource or connection level problems.
                if token.class() >= 17 {
                    (
                        ErrorKind::SourceConnectionFailed,
                        "SQL Server resource error",
                    )
                } else {
                    (ErrorKind::SourceQueryFailed, "SQL Server query failed")
                }
            }
            Error::Encoding(_) | Error::Conversion(_) => {
                (ErrorKind::ConversionError, "SQL Server value conversion failed")
            }
            _ => (ErrorKind::Unknown, "Unexpected SQL Server error"),
        };

        SyncError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_error_creation() {
        let err = SyncError::from((ErrorKind::SourceConnectionFailed, "Connection failed"));
        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);
        assert_eq!(err.detail(), None);
        assert_eq!(err.kinds(), vec![ErrorKind::SourceConnectionFailed]);
    }

    #[test]
    fn error_with_detail() {
        let err = SyncError::from((
            ErrorKind::SourceQueryFailed,
            "Query failed",
            "Table 'users' doesn't exist".to_string(),
        ));
        assert_eq!(err.kind(), ErrorKind::SourceQueryFailed);
        assert_eq!(err.detail(), Some("Table 'users' doesn't exist"));
    }

    #[test]
    fn multiple_errors_aggregate_kinds() {
        let errors = vec![
            SyncError::from((ErrorKind::InvalidSchema, "Bad schema")),
            SyncError::from((ErrorKind::ConversionError, "Type mismatch")),
        ];
        let multi_err = SyncError::many(errors);

        assert_eq!(multi_err.kind(), ErrorKind::InvalidSchema);
        assert_eq!(
            multi_err.kinds(),
            vec![ErrorKind::InvalidSchema, ErrorKind::ConversionError]
        );
    }

    #[test]
    fn empty_multiple_errors() {
        let multi_err = SyncError::many(vec![]);
        assert_eq!(multi_err.kind(), ErrorKind::Unknown);
        assert_eq!(multi_err.detail(), None);
    }

    #[test]
    fn fault_tiers() {
        assert_eq!(ErrorKind::ConfigError.fault(), Fault::Config);
        assert_eq!(ErrorKind::InvalidSchema.fault(), Fault::SkipTable);
        assert_eq!(ErrorKind::MigrationNotSupported.fault(), Fault::SkipTable);
        assert_eq!(ErrorKind::DataIntegrity.fault(), Fault::SkipTable);
        assert_eq!(ErrorKind::SourceQueryFailed.fault(), Fault::SkipTable);
        assert_eq!(ErrorKind::SourceConnectionFailed.fault(), Fault::Retry);
        assert_eq!(ErrorKind::StorageIoError.fault(), Fault::Retry);
        assert_eq!(ErrorKind::Unknown.fault(), Fault::Fatal);
    }

    #[test]
    fn error_display() {
        let err = SyncError::from((ErrorKind::WarehouseConnectionFailed, "Connection failed"));
        let display_str = format!("{err}");
        assert!(display_str.contains("ConnectionFailed"));
        assert!(display_str.contains("Connection failed"));
    }
}
