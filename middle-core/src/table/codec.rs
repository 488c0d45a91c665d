//! Row encoding for the bulk stream and decoding of fetched rows.
//!
//! The wire format is the text variant of a COPY stream: fields separated by
//! tabs, `\N` for `NULL`, and backslash escapes for backslash, tab, newline
//! and carriage return. Node lists, member lists, tags and attributes travel
//! as JSON text.

use serde::Serialize;
use thiserror::Error;

use crate::backing::Value;
use crate::model::{
    Attributes, Coordinate, Member, PointRecord, PrimitiveId, RelationRecord, Tags, WayRecord,
};

use super::{ColumnType, CopyTarget, TableKind};

const NULL_FIELD: &[u8] = b"\\N";

/// Why a record could not be encoded.
#[derive(Debug, Error)]
pub enum EncodeReason {
    /// The point carries the unset sentinel instead of a location.
    #[error("location is unset")]
    UnsetCoordinate,
    /// A text field contained a NUL byte, which the stream cannot carry.
    #[error("{field} contains a NUL byte")]
    NulByte {
        /// Offending field.
        field: &'static str,
    },
    /// JSON serialisation failed.
    #[error("failed to serialise {field}: {source}")]
    Json {
        /// Field being serialised.
        field: &'static str,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// A record that could not be turned into a row. Other buffered rows are
/// unaffected.
#[derive(Debug, Error)]
#[error("cannot encode {table} row {id}: {reason}")]
pub struct EncodeError {
    /// Offending primitive id.
    pub id: PrimitiveId,
    /// Table the row was destined for.
    pub table: TableKind,
    /// What was wrong.
    #[source]
    pub reason: EncodeReason,
}

/// A stored row that could not be read back.
#[derive(Debug, Error)]
#[error("cannot decode {table} row{}: {reason}", .id.map(|id| format!(" {id}")).unwrap_or_default())]
pub struct DecodeError {
    /// Table the row came from.
    pub table: TableKind,
    /// Row id, when known.
    pub id: Option<PrimitiveId>,
    /// What was wrong.
    pub reason: String,
}

/// An encoded, table-tagged row ready for the bulk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRow {
    table: TableKind,
    id: PrimitiveId,
    bytes: Vec<u8>,
}

impl CopyRow {
    /// Encode `values` in wire order.
    pub fn from_values(table: TableKind, id: PrimitiveId, values: &[Value]) -> Self {
        let mut bytes = Vec::with_capacity(64);
        for (index, value) in values.iter().enumerate() {
            if index > 0 {
                bytes.push(b'\t');
            }
            match value {
                Value::Null => bytes.extend_from_slice(NULL_FIELD),
                Value::Integer(number) => bytes.extend_from_slice(number.to_string().as_bytes()),
                Value::Text(text) => escape_into(&mut bytes, text),
            }
        }
        Self { table, id, bytes }
    }

    /// Destination table.
    pub const fn table(&self) -> TableKind {
        self.table
    }

    /// Primitive id the row encodes.
    pub const fn id(&self) -> PrimitiveId {
        self.id
    }

    /// Encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

fn escape_into(out: &mut Vec<u8>, text: &str) {
    for byte in text.bytes() {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            other => out.push(other),
        }
    }
}

fn unescape(field: &[u8]) -> Result<String, String> {
    let mut out = Vec::with_capacity(field.len());
    let mut bytes = field.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != b'\\' {
            out.push(byte);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b't') => out.push(b'\t'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(other) => return Err(format!("unknown escape '\\{}'", char::from(other))),
            None => return Err("dangling escape at end of field".to_owned()),
        }
    }
    String::from_utf8(out).map_err(|err| format!("field is not UTF-8: {err}"))
}

/// Split an encoded row back into typed values following `target`.
pub fn decode_copy_row(row: &[u8], target: &CopyTarget) -> Result<Vec<Value>, String> {
    let fields: Vec<&[u8]> = row.split(|byte| *byte == b'\t').collect();
    if fields.len() != target.columns.len() {
        return Err(format!(
            "expected {} fields, found {}",
            target.columns.len(),
            fields.len()
        ));
    }
    fields
        .into_iter()
        .zip(target.columns)
        .map(|(field, column)| {
            if field == NULL_FIELD {
                if column.required {
                    return Err(format!("{} must not be null", column.name));
                }
                return Ok(Value::Null);
            }
            let text = unescape(field)?;
            match column.ty {
                ColumnType::Integer => text
                    .parse::<i64>()
                    .map(Value::Integer)
                    .map_err(|err| format!("{} is not an integer: {err}", column.name)),
                ColumnType::Text | ColumnType::Json => Ok(Value::Text(text)),
            }
        })
        .collect()
}

struct Encoder {
    table: TableKind,
    id: PrimitiveId,
}

impl Encoder {
    fn fail(&self, reason: EncodeReason) -> EncodeError {
        EncodeError {
            id: self.id,
            table: self.table,
            reason,
        }
    }

    fn check_text(&self, field: &'static str, text: &str) -> Result<(), EncodeError> {
        if text.contains('\0') {
            return Err(self.fail(EncodeReason::NulByte { field }));
        }
        Ok(())
    }

    fn json<T: Serialize>(&self, field: &'static str, value: &T) -> Result<Value, EncodeError> {
        serde_json::to_string(value)
            .map(Value::Text)
            .map_err(|source| self.fail(EncodeReason::Json { field, source }))
    }

    fn tags(&self, tags: &Tags) -> Result<Value, EncodeError> {
        if tags.is_empty() {
            return Ok(Value::Null);
        }
        for (key, value) in tags {
            self.check_text("tag key", key)?;
            self.check_text("tag value", value)?;
        }
        self.json("tags", tags)
    }

    fn attributes(
        &self,
        attributes: Option<&Attributes>,
        enabled: bool,
    ) -> Result<Value, EncodeError> {
        match attributes {
            Some(attributes) if enabled => {
                if let Some(user) = &attributes.user {
                    self.check_text("user", user)?;
                }
                self.json("attrs", attributes)
            }
            _ => Ok(Value::Null),
        }
    }
}

/// Column values of a point row: id, lat, lon, tags.
pub fn point_values(point: &PointRecord) -> Result<Vec<Value>, EncodeError> {
    let encoder = Encoder {
        table: TableKind::Points,
        id: point.id,
    };
    if point.location.is_unset() {
        return Err(encoder.fail(EncodeReason::UnsetCoordinate));
    }
    Ok(vec![
        Value::Integer(point.id),
        Value::from(point.location.y()),
        Value::from(point.location.x()),
        encoder.tags(&point.tags)?,
    ])
}

/// Column values of a way row: id, nodes, tags, attrs.
pub fn way_values(way: &WayRecord, attributes: bool) -> Result<Vec<Value>, EncodeError> {
    let encoder = Encoder {
        table: TableKind::Ways,
        id: way.id,
    };
    Ok(vec![
        Value::Integer(way.id),
        encoder.json("nodes", &way.nodes)?,
        encoder.tags(&way.tags)?,
        encoder.attributes(way.attributes.as_ref(), attributes)?,
    ])
}

/// Column values of a relation row: id, members, tags, attrs.
pub fn relation_values(
    relation: &RelationRecord,
    attributes: bool,
) -> Result<Vec<Value>, EncodeError> {
    let encoder = Encoder {
        table: TableKind::Relations,
        id: relation.id,
    };
    for member in &relation.members {
        encoder.check_text("member role", &member.role)?;
    }
    Ok(vec![
        Value::Integer(relation.id),
        encoder.json("members", &relation.members)?,
        encoder.tags(&relation.tags)?,
        encoder.attributes(relation.attributes.as_ref(), attributes)?,
    ])
}

struct Decoder {
    table: TableKind,
    id: Option<PrimitiveId>,
}

impl Decoder {
    fn fail(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError {
            table: self.table,
            id: self.id,
            reason: reason.into(),
        }
    }

    fn integer(&self, cell: Option<&Value>, field: &str) -> Result<i64, DecodeError> {
        cell.and_then(Value::as_i64)
            .ok_or_else(|| self.fail(format!("{field} is not an integer")))
    }

    fn json<T: serde::de::DeserializeOwned>(
        &self,
        cell: Option<&Value>,
        field: &str,
    ) -> Result<Option<T>, DecodeError> {
        match cell {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Text(text)) => serde_json::from_str(text)
                .map(Some)
                .map_err(|err| self.fail(format!("{field} is not valid JSON: {err}"))),
            Some(Value::Integer(_)) => Err(self.fail(format!("{field} is not text"))),
        }
    }
}

/// Build a coordinate from `(lat, lon)` fixed-point cells.
pub(crate) fn coordinate_from_cells(
    id: Option<PrimitiveId>,
    lat: Option<&Value>,
    lon: Option<&Value>,
) -> Result<Coordinate, DecodeError> {
    let decoder = Decoder {
        table: TableKind::Points,
        id,
    };
    let y = decoder.integer(lat, "lat")?;
    let x = decoder.integer(lon, "lon")?;
    let (Ok(x), Ok(y)) = (i32::try_from(x), i32::try_from(y)) else {
        return Err(decoder.fail("location out of range"));
    };
    Coordinate::from_fixed(x, y).ok_or_else(|| decoder.fail("location out of range"))
}

/// Rebuild a way from `(nodes, tags, attrs)` cells.
pub(crate) fn way_from_cells(id: PrimitiveId, cells: &[Value]) -> Result<WayRecord, DecodeError> {
    let decoder = Decoder {
        table: TableKind::Ways,
        id: Some(id),
    };
    let mut cells = cells.iter();
    let nodes = decoder
        .json::<Vec<PrimitiveId>>(cells.next(), "nodes")?
        .ok_or_else(|| decoder.fail("nodes is null"))?;
    Ok(WayRecord {
        id,
        nodes,
        tags: decoder.json(cells.next(), "tags")?.unwrap_or_default(),
        attributes: decoder.json(cells.next(), "attrs")?,
    })
}

/// Rebuild a relation from `(members, tags, attrs)` cells.
pub(crate) fn relation_from_cells(
    id: PrimitiveId,
    cells: &[Value],
) -> Result<RelationRecord, DecodeError> {
    let decoder = Decoder {
        table: TableKind::Relations,
        id: Some(id),
    };
    let mut cells = cells.iter();
    let members = decoder
        .json::<Vec<Member>>(cells.next(), "members")?
        .ok_or_else(|| decoder.fail("members is null"))?;
    Ok(RelationRecord {
        id,
        members,
        tags: decoder.json(cells.next(), "tags")?.unwrap_or_default(),
        attributes: decoder.json(cells.next(), "attrs")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MemberKind;
    use crate::table::TableDescriptor;
    use rstest::rstest;

    fn tagged(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[rstest]
    fn way_row_uses_copy_text_format() {
        let mut way = WayRecord::new(7, vec![1, 2, 3]);
        way.tags = tagged(&[("name", "Main\tStreet\\")]);
        let values = way_values(&way, false).expect("encode way");
        let row = CopyRow::from_values(TableKind::Ways, way.id, &values);
        assert_eq!(
            row.as_bytes(),
            b"7\t[1,2,3]\t{\"name\":\"Main\\\\tStreet\\\\\\\\\"}\t\\N".as_slice()
        );
    }

    #[rstest]
    fn encoded_rows_decode_against_their_target() {
        let mut relation = RelationRecord::new(
            4,
            vec![
                Member::new(MemberKind::Way, 12, "outer"),
                Member::new(MemberKind::Point, 3, "label\nline"),
            ],
        );
        relation.tags = tagged(&[("type", "multipolygon")]);
        let values = relation_values(&relation, false).expect("encode relation");
        let row = CopyRow::from_values(TableKind::Relations, relation.id, &values);
        let target = TableDescriptor::new("osm", TableKind::Relations).copy_target();

        let decoded = decode_copy_row(row.as_bytes(), &target).expect("decode row");
        assert_eq!(decoded, values);
        let rebuilt = relation_from_cells(4, decoded.get(1..).unwrap_or_default())
            .expect("rebuild relation");
        assert_eq!(rebuilt, relation);
    }

    #[rstest]
    fn unset_points_are_rejected_with_their_id() {
        let point = PointRecord::new(99, Coordinate::UNSET);
        let err = point_values(&point).expect_err("unset location");
        assert_eq!(err.id, 99);
        assert_eq!(err.table, TableKind::Points);
        assert!(matches!(err.reason, EncodeReason::UnsetCoordinate));
    }

    #[rstest]
    #[case(tagged(&[("na\0me", "x")]), "tag key")]
    #[case(tagged(&[("name", "x\0")]), "tag value")]
    fn nul_bytes_in_tags_are_rejected(#[case] tags: Tags, #[case] expected: &str) {
        let mut way = WayRecord::new(5, vec![1]);
        way.tags = tags;
        let err = way_values(&way, false).expect_err("NUL byte");
        assert!(matches!(err.reason, EncodeReason::NulByte { field } if field == expected));
    }

    #[rstest]
    fn attributes_are_only_written_when_enabled() {
        let mut way = WayRecord::new(5, vec![1]);
        way.attributes = Some(Attributes {
            version: Some(3),
            ..Attributes::default()
        });
        let without = way_values(&way, false).expect("encode");
        let with = way_values(&way, true).expect("encode");
        assert_eq!(without.get(3), Some(&Value::Null));
        assert_eq!(with.get(3), Some(&Value::Text(r#"{"version":3}"#.to_owned())));
    }

    #[rstest]
    #[case(b"1\t2\t3".as_slice(), "expected 4 fields")]
    #[case(b"x\t1\t2\t\\N".as_slice(), "id is not an integer")]
    #[case(b"1\t\\N\t2\t\\N".as_slice(), "lat must not be null")]
    #[case(b"1\t2\t3\t\\q".as_slice(), "unknown escape")]
    fn malformed_rows_are_reported(#[case] row: &[u8], #[case] expected: &str) {
        let target = TableDescriptor::new("osm", TableKind::Points).copy_target();
        let err = decode_copy_row(row, &target).expect_err("malformed row");
        assert!(err.contains(expected), "unexpected error: {err}");
    }
}
