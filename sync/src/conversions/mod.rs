use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

pub mod normalize;

/// A single value read from a source database row.
///
/// Cells are engine-agnostic: each connector decodes its driver's native
/// values into this shared representation, and the serialization pipeline
/// encodes cells into Avro according to the column's serialization bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    String(String),
    I64(i64),
    U64(u64),
    F64(f64),
    Numeric(BigDecimal),
    Date(NaiveDate),
    Time(NaiveTime),
    TimeStamp(NaiveDateTime),
    TimeStampTz(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Cell {
    /// Returns `true` if the cell holds SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }
}

/// One row of a source query result, values ordered as the query's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<Cell>,
}

impl Row {
    pub fn new(values: Vec<Cell>) -> Self {
        Self { values }
    }
}

/// Serialization bucket of a source column.
///
/// Every native type of every engine classifies into exactly one bucket; the
/// bucket chooses the Avro field encoding. Decimals are always encoded as
/// strings to avoid precision loss in transit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvroBucket {
    String,
    Int,
    Long,
    Double,
    Boolean,
    Decimal,
}

impl AvroBucket {
    /// Name of the Avro primitive type this bucket encodes as.
    pub fn avro_type_name(&self) -> &'static str {
        match self {
            AvroBucket::String => "string",
            AvroBucket::Int => "int",
            AvroBucket::Long => "long",
            AvroBucket::Double => "double",
            AvroBucket::Boolean => "boolean",
            // Decimals travel as strings; the warehouse casts them on load.
            AvroBucket::Decimal => "string",
        }
    }
}
