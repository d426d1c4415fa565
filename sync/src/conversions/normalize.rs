use bigdecimal::ToPrimitive;
use unicode_normalization::UnicodeNormalization;

use crate::conversions::{AvroBucket, Cell};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::{bail, sync_error};

/// Maximum width of a warehouse varchar column, in bytes.
///
/// The COPY command truncates oversized values itself, but clamping here
/// keeps a pathologically large value from blocking the whole row.
pub const MAX_VARCHAR_SIZE: usize = 65535;

/// Timestamp rendering used for warehouse-bound text and index values.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.6f";

/// A cell normalized for Avro encoding under a serialization bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketValue {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
}

/// Strips a string down to the warehouse's supported character set.
///
/// Applies NFKD compatibility decomposition and drops every non-ASCII
/// character, then clamps the result to [`MAX_VARCHAR_SIZE`]. The destination
/// session encoding rejects some multi-byte sequences, so the stripping is
/// lossy on purpose.
pub fn clean_text(input: &str) -> String {
    let mut cleaned: String = input.nfkd().filter(char::is_ascii).collect();
    cleaned.truncate(MAX_VARCHAR_SIZE);
    cleaned
}

/// Renders a cell as warehouse-bound text.
///
/// UUIDs become their canonical string form, composite values become JSON
/// text, temporal values become ISO-8601, decimals keep their full precision
/// as digits, and binary data is interpreted as UTF-8 with invalid sequences
/// replaced before stripping.
fn text_value(cell: Cell) -> String {
    match cell {
        Cell::Null => String::new(),
        Cell::Bool(b) => b.to_string(),
        Cell::String(s) => clean_text(&s),
        Cell::I64(i) => i.to_string(),
        Cell::U64(u) => u.to_string(),
        Cell::F64(f) => f.to_string(),
        Cell::Numeric(n) => n.to_string(),
        Cell::Date(d) => d.format(DATE_FORMAT).to_string(),
        Cell::Time(t) => t.format(TIME_FORMAT).to_string(),
        Cell::TimeStamp(t) => t.format(TIMESTAMP_FORMAT).to_string(),
        Cell::TimeStampTz(t) => t.naive_utc().format(TIMESTAMP_FORMAT).to_string(),
        Cell::Uuid(u) => u.to_string(),
        Cell::Json(j) => clean_text(&j.to_string()),
        Cell::Bytes(b) => clean_text(&String::from_utf8_lossy(&b)),
    }
}

/// Normalizes a cell into the value shape its serialization bucket encodes.
///
/// NULL always stays NULL regardless of bucket. A cell that cannot be
/// represented in its column's bucket is a conversion error; the mismatch
/// means the engine's bucket table and the driver decoding disagree.
pub fn to_bucket_value(cell: Cell, bucket: AvroBucket) -> SyncResult<BucketValue> {
    if cell.is_null() {
        return Ok(BucketValue::Null);
    }

    match bucket {
        AvroBucket::Boolean => match cell {
            Cell::Bool(b) => Ok(BucketValue::Boolean(b)),
            Cell::I64(i) => Ok(BucketValue::Boolean(i != 0)),
            Cell::U64(u) => Ok(BucketValue::Boolean(u != 0)),
            other => bucket_mismatch(other, bucket),
        },
        AvroBucket::Int => match cell {
            Cell::I64(i) => i32::try_from(i).map(BucketValue::Int).map_err(|_| {
                sync_error!(
                    ErrorKind::ConversionError,
                    "Integer out of range for int bucket",
                    i
                )
            }),
            Cell::U64(u) => i32::try_from(u).map(BucketValue::Int).map_err(|_| {
                sync_error!(
                    ErrorKind::ConversionError,
                    "Integer out of range for int bucket",
                    u
                )
            }),
            other => bucket_mismatch(other, bucket),
        },
        AvroBucket::Long => match cell {
            Cell::I64(i) => Ok(BucketValue::Long(i)),
            Cell::U64(u) => i64::try_from(u).map(BucketValue::Long).map_err(|_| {
                sync_error!(
                    ErrorKind::ConversionError,
                    "Unsigned value out of range for long bucket",
                    u
                )
            }),
            Cell::Bool(b) => Ok(BucketValue::Long(b as i64)),
            other => bucket_mismatch(other, bucket),
        },
        AvroBucket::Double => match cell {
            Cell::F64(f) => Ok(BucketValue::Double(f)),
            Cell::I64(i) => Ok(BucketValue::Double(i as f64)),
            Cell::U64(u) => Ok(BucketValue::Double(u as f64)),
            Cell::Numeric(n) => n.to_f64().map(BucketValue::Double).ok_or_else(|| {
                sync_error!(
                    ErrorKind::ConversionError,
                    "Numeric value not representable as double"
                )
            }),
            other => bucket_mismatch(other, bucket),
        },
        // Decimals and strings both travel as text.
        AvroBucket::Decimal | AvroBucket::String => Ok(BucketValue::Text(text_value(cell))),
    }
}

fn bucket_mismatch(cell: Cell, bucket: AvroBucket) -> SyncResult<BucketValue> {
    bail!(
        ErrorKind::ConversionError,
        "Cell does not fit its serialization bucket",
        format!("cell {cell:?} cannot encode as {bucket:?}")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{NaiveDate, NaiveTime};
    use std::str::FromStr;

    #[test]
    fn clean_text_strips_non_ascii() {
        assert_eq!(clean_text("héllo wörld"), "hello world");
        assert_eq!(clean_text("Ångström"), "Angstrom");
        assert_eq!(clean_text("数据"), "");
        assert_eq!(clean_text("plain"), "plain");
    }

    #[test]
    fn clean_text_clamps_width() {
        let oversized = "x".repeat(MAX_VARCHAR_SIZE + 10);
        assert_eq!(clean_text(&oversized).len(), MAX_VARCHAR_SIZE);
    }

    #[test]
    fn null_stays_null_in_every_bucket() {
        for bucket in [
            AvroBucket::String,
            AvroBucket::Int,
            AvroBucket::Long,
            AvroBucket::Double,
            AvroBucket::Boolean,
            AvroBucket::Decimal,
        ] {
            assert_eq!(
                to_bucket_value(Cell::Null, bucket).unwrap(),
                BucketValue::Null
            );
        }
    }

    #[test]
    fn decimal_bucket_keeps_precision_as_text() {
        let n = BigDecimal::from_str("12345678901234567890.123456789").unwrap();
        let value = to_bucket_value(Cell::Numeric(n), AvroBucket::Decimal).unwrap();
        assert_eq!(
            value,
            BucketValue::Text("12345678901234567890.123456789".to_string())
        );
    }

    #[test]
    fn temporal_values_render_iso() {
        let date = NaiveDate::from_ymd_opt(2020, 3, 7).unwrap();
        let ts = date.and_time(NaiveTime::from_hms_micro_opt(1, 2, 3, 450).unwrap());

        let value = to_bucket_value(Cell::TimeStamp(ts), AvroBucket::String).unwrap();
        assert_eq!(value, BucketValue::Text("2020-03-07 01:02:03.000450".to_string()));

        let value = to_bucket_value(Cell::Date(date), AvroBucket::String).unwrap();
        assert_eq!(value, BucketValue::Text("2020-03-07".to_string()));
    }

    #[test]
    fn unsigned_widens_into_long_until_overflow() {
        let value = to_bucket_value(Cell::U64(42), AvroBucket::Long).unwrap();
        assert_eq!(value, BucketValue::Long(42));

        assert!(to_bucket_value(Cell::U64(u64::MAX), AvroBucket::Long).is_err());
    }

    #[test]
    fn bucket_mismatch_is_conversion_error() {
        let err = to_bucket_value(Cell::String("a".into()), AvroBucket::Double).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }
}
