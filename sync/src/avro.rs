use apache_avro::types::Value;
use apache_avro::{Schema, Writer};
use serde_json::json;

use crate::connectors::RowStream;
use crate::conversions::normalize::{to_bucket_value, BucketValue};
use crate::conversions::{AvroBucket, Row};
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sync_error;

/// Default maximum size of one chunk file, in bytes.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 100 * 1024 * 1024;

/// Avro type names that cannot be used as a record name.
const RESERVED_NAMES: &[&str] = &[
    "null", "boolean", "int", "long", "float", "double", "bytes", "string", "record", "enum",
    "array", "map", "fixed",
];

/// One serialization field: column name plus its bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct AvroField {
    pub name: String,
    pub bucket: AvroBucket,
}

/// The outcome of writing one size-bounded chunk.
#[derive(Debug)]
pub struct ChunkOutcome {
    /// Finished Avro container file contents.
    pub data: Vec<u8>,
    /// Number of rows serialized into this chunk.
    pub row_count: usize,
    /// `true` when the row stream was fully drained into this chunk.
    pub complete: bool,
}

/// Builds the record schema for a table's serialization fields.
///
/// Every field is a `["null", <bucket>]` union so NULLs survive regardless of
/// source nullability. A record name colliding with an Avro type name gets a
/// suffix; the name is not otherwise meaningful.
pub fn record_schema(table: &str, fields: &[AvroField]) -> SyncResult<Schema> {
    let mut name = table.to_owned();
    if RESERVED_NAMES.contains(&name.as_str()) {
        name.push_str("zzz");
    }

    let field_schemas: Vec<serde_json::Value> = fields
        .iter()
        .map(|field| {
            json!({
                "name": field.name,
                "type": ["null", field.bucket.avro_type_name()],
            })
        })
        .collect();

    let schema_json = json!({
        "type": "record",
        "name": name,
        "fields": field_schemas,
    });

    Ok(Schema::parse_str(&schema_json.to_string())?)
}

/// Serializes rows from the stream into one Avro container file, stopping
/// once the written size reaches `max_bytes` or the stream is drained.
///
/// The stream is consumed in a single pass; calling this again with the same
/// stream continues where the previous chunk stopped.
pub async fn write_chunk(
    schema: &Schema,
    fields: &[AvroField],
    rows: &mut RowStream,
    max_bytes: usize,
) -> SyncResult<ChunkOutcome> {
    let mut writer = Writer::new(schema, Vec::new());
    let mut row_count = 0usize;
    let mut written = 0usize;
    let mut complete = false;

    loop {
        let Some(row) = rows.next().await else {
            complete = true;
            break;
        };

        let value = record_value(row?, fields)?;
        written += writer.append(value)?;
        row_count += 1;

        if written >= max_bytes {
            break;
        }
    }

    let data = writer.into_inner()?;

    Ok(ChunkOutcome {
        data,
        row_count,
        complete,
    })
}

/// Converts one row into an Avro record value matching the chunk schema.
fn record_value(row: Row, fields: &[AvroField]) -> SyncResult<Value> {
    if row.values.len() != fields.len() {
        return Err(sync_error!(
            ErrorKind::ConversionError,
            "Row width does not match the described schema",
            format!("{} values for {} fields", row.values.len(), fields.len())
        ));
    }

    let mut record = Vec::with_capacity(fields.len());
    for (cell, field) in row.values.into_iter().zip(fields) {
        let value = match to_bucket_value(cell, field.bucket)? {
            BucketValue::Null => Value::Union(0, Box::new(Value::Null)),
            BucketValue::Boolean(b) => Value::Union(1, Box::new(Value::Boolean(b))),
            BucketValue::Int(i) => Value::Union(1, Box::new(Value::Int(i))),
            BucketValue::Long(l) => Value::Union(1, Box::new(Value::Long(l))),
            BucketValue::Double(d) => Value::Union(1, Box::new(Value::Double(d))),
            BucketValue::Text(s) => Value::Union(1, Box::new(Value::String(s))),
        };
        record.push((field.name.clone(), value));
    }

    Ok(Value::Record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::row_channel;
    use crate::conversions::Cell;
    use apache_avro::Reader;

    fn fields() -> Vec<AvroField> {
        vec![
            AvroField {
                name: "id".to_owned(),
                bucket: AvroBucket::Long,
            },
            AvroField {
                name: "name".to_owned(),
                bucket: AvroBucket::String,
            },
        ]
    }

    fn row(id: i64, name: Option<&str>) -> Row {
        Row::new(vec![
            Cell::I64(id),
            name.map(|n| Cell::String(n.to_owned())).unwrap_or(Cell::Null),
        ])
    }

    fn read_rows(data: &[u8]) -> Vec<(i64, Option<String>)> {
        let reader = Reader::new(data).unwrap();
        reader
            .map(|value| {
                let Value::Record(fields) = value.unwrap() else {
                    panic!("expected record");
                };
                let id = match &fields[0].1 {
                    Value::Union(_, inner) => match **inner {
                        Value::Long(id) => id,
                        _ => panic!("expected long id"),
                    },
                    _ => panic!("expected union"),
                };
                let name = match &fields[1].1 {
                    Value::Union(_, inner) => match &**inner {
                        Value::String(s) => Some(s.clone()),
                        Value::Null => None,
                        _ => panic!("expected string or null"),
                    },
                    _ => panic!("expected union"),
                };
                (id, name)
            })
            .collect()
    }

    #[test]
    fn record_schema_avoids_reserved_names() {
        let schema = record_schema("string", &fields()).unwrap();
        assert!(schema.canonical_form().contains("stringzzz"));

        let schema = record_schema("orders", &fields()).unwrap();
        assert!(schema.canonical_form().contains("orders"));
    }

    #[tokio::test]
    async fn single_chunk_roundtrip_preserves_rows_and_order() {
        let schema = record_schema("orders", &fields()).unwrap();
        let (tx, mut stream) = row_channel();

        tokio::spawn(async move {
            for i in 0..10 {
                let name = if i % 3 == 0 { None } else { Some("name") };
                tx.send(Ok(row(i, name))).await.unwrap();
            }
        });

        let chunk = write_chunk(&schema, &fields(), &mut stream, usize::MAX)
            .await
            .unwrap();

        assert!(chunk.complete);
        assert_eq!(chunk.row_count, 10);

        let rows = read_rows(&chunk.data);
        assert_eq!(rows.len(), 10);
        for (i, (id, name)) in rows.iter().enumerate() {
            assert_eq!(*id, i as i64);
            if i % 3 == 0 {
                assert!(name.is_none());
            } else {
                assert_eq!(name.as_deref(), Some("name"));
            }
        }
    }

    #[tokio::test]
    async fn bounded_chunks_deserialize_back_to_all_rows_in_order() {
        let schema = record_schema("orders", &fields()).unwrap();
        let (tx, mut stream) = row_channel();

        let total = 500;
        tokio::spawn(async move {
            for i in 0..total {
                tx.send(Ok(row(i, Some("abcdefghijklmnopqrstuvwxyz"))))
                    .await
                    .unwrap();
            }
        });

        // A tiny bound forces several files, exercising manifest-mode
        // chunking without a hundred-megabyte fixture.
        let max_bytes = 64;

        let mut all_rows = Vec::new();
        let mut chunks = 0;
        loop {
            let chunk = write_chunk(&schema, &fields(), &mut stream, max_bytes)
                .await
                .unwrap();
            if chunk.row_count > 0 {
                all_rows.extend(read_rows(&chunk.data));
                chunks += 1;
            }
            if chunk.complete {
                break;
            }
        }

        assert!(chunks > 1, "expected the size bound to split the output");
        assert_eq!(all_rows.len(), total as usize);
        for (i, (id, _)) in all_rows.iter().enumerate() {
            assert_eq!(*id, i as i64);
        }
    }

    #[tokio::test]
    async fn empty_stream_produces_empty_complete_chunk() {
        let schema = record_schema("orders", &fields()).unwrap();
        let (tx, mut stream) = row_channel();
        drop(tx);

        let chunk = write_chunk(&schema, &fields(), &mut stream, usize::MAX)
            .await
            .unwrap();

        assert!(chunk.complete);
        assert_eq!(chunk.row_count, 0);
    }

    #[tokio::test]
    async fn row_width_mismatch_is_a_conversion_error() {
        let schema = record_schema("orders", &fields()).unwrap();
        let (tx, mut stream) = row_channel();

        tokio::spawn(async move {
            tx.send(Ok(Row::new(vec![Cell::I64(1)]))).await.unwrap();
        });

        let err = write_chunk(&schema, &fields(), &mut stream, usize::MAX)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConversionError);
    }
}
