use chrono::NaiveDateTime;
use std::fmt;
use tracing::{info, warn};

use crate::conversions::normalize::TIMESTAMP_FORMAT;
use crate::conversions::Cell;

pub mod store;

/// Timestamp formats accepted when parsing a stored index value.
///
/// Values are written with microsecond precision, but older entries may have
/// been recorded without a fractional part.
const TIMESTAMP_PARSE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// A single index value in integer or timestamp domain.
///
/// The index store keeps values string-encoded, so parsing is best-effort:
/// anything that is neither an integer nor a timestamp is carried opaquely
/// and treated as unverifiable.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Int(i64),
    Timestamp(NaiveDateTime),
    Raw(String),
}

impl IndexValue {
    /// Parses a string-encoded index value from the index store.
    pub fn parse(encoded: &str) -> IndexValue {
        if let Ok(i) = encoded.parse::<i64>() {
            return IndexValue::Int(i);
        }

        for format in TIMESTAMP_PARSE_FORMATS {
            if let Ok(ts) = NaiveDateTime::parse_from_str(encoded, format) {
                return IndexValue::Timestamp(ts);
            }
        }

        IndexValue::Raw(encoded.to_owned())
    }

    /// Encodes the value for storage and for rendering into a where clause.
    pub fn encode(&self) -> String {
        match self {
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
            IndexValue::Raw(s) => s.clone(),
        }
    }

    /// Converts a cell read from a `MAX(index_column)` aggregate into an
    /// index value. NULL means the source table is empty or the index column
    /// is entirely NULL.
    pub fn from_cell(cell: &Cell) -> Option<IndexValue> {
        match cell {
            Cell::Null => None,
            Cell::I64(i) => Some(IndexValue::Int(*i)),
            Cell::U64(u) => i64::try_from(*u)
                .map(IndexValue::Int)
                .ok()
                .or_else(|| Some(IndexValue::Raw(u.to_string()))),
            Cell::TimeStamp(ts) => Some(IndexValue::Timestamp(*ts)),
            Cell::TimeStampTz(ts) => Some(IndexValue::Timestamp(ts.naive_utc())),
            Cell::String(s) => Some(IndexValue::Raw(s.clone())),
            Cell::Numeric(n) => Some(IndexValue::Raw(n.to_string())),
            Cell::Date(d) => Some(IndexValue::Raw(d.format("%Y-%m-%d").to_string())),
            other => Some(IndexValue::Raw(format!("{other:?}"))),
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// The delta window `(old, new]` computed for one table run.
///
/// `old_value` is `None` on a first run, when a full refresh is in effect, or
/// when the window could not be verified; in all three cases the lower bound
/// is omitted and the run dumps everything up to `new_value`.
#[derive(Debug, Clone)]
pub struct IndexWindow {
    old_value: Option<IndexValue>,
    new_value: Option<IndexValue>,
    index_column: Option<String>,
    full_refresh: bool,
}

impl IndexWindow {
    /// Computes the delta window for one table run.
    ///
    /// Verification of `new >= old` is best-effort: integers compare
    /// numerically, timestamps chronologically, and any other combination is
    /// "cannot verify", which clears the lower bound and reprocesses the
    /// table rather than failing the run.
    pub fn compute(
        table: &str,
        index_column: Option<String>,
        full_refresh: bool,
        append_only: bool,
        old_value: Option<IndexValue>,
        new_value: Option<IndexValue>,
    ) -> IndexWindow {
        if full_refresh {
            if old_value.is_some() || new_value.is_some() {
                info!(
                    table,
                    "index found but a full refresh was forced; old index value \
                     will be ignored, new index value will still be recorded"
                );
            }

            return IndexWindow {
                old_value: None,
                new_value,
                index_column,
                full_refresh,
            };
        }

        if append_only && index_column.is_none() {
            return IndexWindow {
                old_value: None,
                new_value,
                index_column,
                full_refresh,
            };
        }

        let Some(old) = old_value else {
            info!(table, "no previous index found, dumping entire table");
            return IndexWindow {
                old_value: None,
                new_value,
                index_column,
                full_refresh,
            };
        };

        let Some(new) = new_value else {
            warn!(
                table,
                old_index = %old,
                "index expected but not found, dumping full table"
            );
            return IndexWindow {
                old_value: None,
                new_value: None,
                index_column,
                full_refresh,
            };
        };

        let verified = match (&old, &new) {
            (IndexValue::Int(old_i), IndexValue::Int(new_i)) => {
                if old_i > new_i {
                    warn!(
                        table,
                        old_index = old_i,
                        new_index = new_i,
                        "index value has decreased, may need a full refresh"
                    );
                }
                old_i <= new_i
            }
            (IndexValue::Timestamp(old_ts), IndexValue::Timestamp(new_ts)) => {
                if old_ts > new_ts {
                    warn!(
                        table,
                        old_index = %old,
                        new_index = %new,
                        "index value has decreased, may need a full refresh"
                    );
                }
                old_ts <= new_ts
            }
            _ => {
                warn!(
                    table,
                    old_index = %old,
                    new_index = %new,
                    "could not check index values of mismatched or unknown types"
                );
                false
            }
        };

        IndexWindow {
            old_value: verified.then_some(old),
            new_value: Some(new),
            index_column,
            full_refresh,
        }
    }

    /// The new index value to record after a successful load.
    pub fn new_value(&self) -> Option<&IndexValue> {
        self.new_value.as_ref()
    }

    /// Renders the WHERE clause filtering the extraction query.
    ///
    /// Empty when no index column is configured, when a full refresh is in
    /// effect, or when the source has no index value at all. The lower bound
    /// is omitted on a first run and on an unverified window.
    pub fn where_clause(&self) -> String {
        let Some(column) = &self.index_column else {
            return String::new();
        };

        if self.full_refresh {
            return String::new();
        }

        let Some(new) = &self.new_value else {
            // Either the source table is empty or the index column is all NULL.
            return String::new();
        };

        let mut clause = String::from("\nWHERE ");
        if let Some(old) = &self.old_value {
            clause.push_str(&format!("{} > '{}' AND ", column, old.encode()));
        }
        clause.push_str(&format!("{} <= '{}'", column, new.encode()));
        clause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").unwrap()
    }

    #[test]
    fn parse_roundtrips_integers_and_timestamps() {
        assert_eq!(IndexValue::parse("42"), IndexValue::Int(42));
        assert_eq!(
            IndexValue::parse("2021-05-01 10:20:30.000123"),
            IndexValue::Timestamp(ts("2021-05-01 10:20:30.000123"))
        );
        assert_eq!(
            IndexValue::parse("2021-05-01 10:20:30"),
            IndexValue::Timestamp(ts("2021-05-01 10:20:30.0"))
        );
        assert_eq!(
            IndexValue::parse("not-an-index"),
            IndexValue::Raw("not-an-index".to_owned())
        );
    }

    #[test]
    fn encode_renders_microseconds() {
        let value = IndexValue::Timestamp(
            NaiveDate::from_ymd_opt(2021, 5, 1)
                .unwrap()
                .and_hms_micro_opt(10, 20, 30, 123)
                .unwrap(),
        );
        assert_eq!(value.encode(), "2021-05-01 10:20:30.000123");
    }

    #[test]
    fn where_clause_with_both_bounds() {
        let window = IndexWindow::compute(
            "t",
            Some("updated_at".to_owned()),
            false,
            false,
            Some(IndexValue::Int(10)),
            Some(IndexValue::Int(20)),
        );
        assert_eq!(
            window.where_clause(),
            "\nWHERE updated_at > '10' AND updated_at <= '20'"
        );
    }

    #[test]
    fn where_clause_without_prior_index_omits_lower_bound() {
        let window = IndexWindow::compute(
            "t",
            Some("id".to_owned()),
            false,
            false,
            None,
            Some(IndexValue::Int(20)),
        );
        assert_eq!(window.where_clause(), "\nWHERE id <= '20'");
    }

    #[test]
    fn where_clause_empty_on_full_refresh() {
        let window = IndexWindow::compute(
            "t",
            Some("id".to_owned()),
            true,
            false,
            Some(IndexValue::Int(10)),
            Some(IndexValue::Int(20)),
        );
        assert_eq!(window.where_clause(), "");
        // The new value is still recorded after the load.
        assert_eq!(window.new_value(), Some(&IndexValue::Int(20)));
    }

    #[test]
    fn where_clause_empty_without_index_column() {
        let window = IndexWindow::compute("t", None, false, false, None, None);
        assert_eq!(window.where_clause(), "");
    }

    #[test]
    fn where_clause_empty_when_source_has_no_index() {
        let window = IndexWindow::compute(
            "t",
            Some("id".to_owned()),
            false,
            false,
            Some(IndexValue::Int(10)),
            None,
        );
        assert_eq!(window.where_clause(), "");
    }

    #[test]
    fn inverted_window_drops_lower_bound() {
        let window = IndexWindow::compute(
            "t",
            Some("id".to_owned()),
            false,
            false,
            Some(IndexValue::Int(30)),
            Some(IndexValue::Int(20)),
        );
        assert_eq!(window.where_clause(), "\nWHERE id <= '20'");
    }

    #[test]
    fn unverifiable_window_drops_lower_bound() {
        let window = IndexWindow::compute(
            "t",
            Some("id".to_owned()),
            false,
            false,
            Some(IndexValue::Raw("garbage".to_owned())),
            Some(IndexValue::Int(20)),
        );
        assert_eq!(window.where_clause(), "\nWHERE id <= '20'");
    }

    #[test]
    fn timestamp_window_renders_chronological_bounds() {
        let window = IndexWindow::compute(
            "t",
            Some("updated_at".to_owned()),
            false,
            false,
            Some(IndexValue::Timestamp(ts("2021-05-01 00:00:00.0"))),
            Some(IndexValue::Timestamp(ts("2021-05-02 00:00:00.0"))),
        );
        assert_eq!(
            window.where_clause(),
            "\nWHERE updated_at > '2021-05-01 00:00:00.000000' AND \
             updated_at <= '2021-05-02 00:00:00.000000'"
        );
    }
}
