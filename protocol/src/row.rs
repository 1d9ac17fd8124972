//! Row payload encoding for FETCH responses (spec §4.5, §6.1).
//!
//! ```txt
//! 4B field_count (LE)
//! per field: 2B name_len (LE) | name | 1B type tag | 4B value_len (LE) | value
//! ```
//! This is exactly what `Arena::store_framed` stores, so a FETCH hit is
//! served by a single reference into arena memory with no re-encoding.

use byteorder::{ByteOrder, LittleEndian};
use common::err::{CResult, CacheError};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int64(i64),
    Float64(f64),
    Bytes(Vec<u8>),
    Decimal(Vec<u8>),
    Bool(bool),
}

impl Value {
    fn type_tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int64(_) => 1,
            Value::Float64(_) => 2,
            Value::Bytes(_) => 3,
            Value::Decimal(_) => 4,
            Value::Bool(_) => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Field {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub fields: Vec<Field>,
}

impl Row {
    pub fn new(fields: Vec<Field>) -> Self {
        Row { fields }
    }
}

/// Encodes a row per §4.5. Caller (the refresh driver) is responsible for
/// enforcing the max-field-count and max-field-name-length caps before
/// calling this; this function does not re-validate them.
pub fn encode_row(row: &Row) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + row.fields.len() * 16);
    let mut count_buf = [0u8; 4];
    LittleEndian::write_u32(&mut count_buf, row.fields.len() as u32);
    out.extend_from_slice(&count_buf);

    for field in &row.fields {
        let name_bytes = field.name.as_bytes();
        let mut name_len_buf = [0u8; 2];
        LittleEndian::write_u16(&mut name_len_buf, name_bytes.len() as u16);
        out.extend_from_slice(&name_len_buf);
        out.extend_from_slice(name_bytes);

        out.push(field.value.type_tag());

        let value_bytes: Vec<u8> = match &field.value {
            Value::Null => Vec::new(),
            Value::Int64(v) => v.to_le_bytes().to_vec(),
            Value::Float64(v) => v.to_le_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
            Value::Decimal(b) => b.clone(),
            Value::Bool(b) => vec![*b as u8],
        };
        let mut val_len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut val_len_buf, value_bytes.len() as u32);
        out.extend_from_slice(&val_len_buf);
        out.extend_from_slice(&value_bytes);
    }
    out
}

/// Decodes a row per §4.5. Used by tests and by the reference client, not
/// by the hot fetch path (which serves bytes verbatim from the arena).
pub fn decode_row(buf: &[u8]) -> CResult<Row> {
    if buf.len() < 4 {
        return Err(CacheError::Protocol("row buffer shorter than field count".to_string()));
    }
    let field_count = LittleEndian::read_u32(&buf[0..4]) as usize;
    let mut pos = 4usize;
    let mut fields = Vec::with_capacity(field_count);

    for _ in 0..field_count {
        if buf.len() < pos + 2 {
            return Err(CacheError::Protocol("truncated name length".to_string()));
        }
        let name_len = LittleEndian::read_u16(&buf[pos..pos + 2]) as usize;
        pos += 2;

        if buf.len() < pos + name_len {
            return Err(CacheError::Protocol("truncated field name".to_string()));
        }
        let name = String::from_utf8(buf[pos..pos + name_len].to_vec())
            .map_err(|e| CacheError::Protocol(e.to_string()))?;
        pos += name_len;

        if buf.len() < pos + 1 {
            return Err(CacheError::Protocol("truncated type tag".to_string()));
        }
        let tag = buf[pos];
        pos += 1;

        if buf.len() < pos + 4 {
            return Err(CacheError::Protocol("truncated value length".to_string()));
        }
        let val_len = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
        pos += 4;

        if buf.len() < pos + val_len {
            return Err(CacheError::Protocol("truncated value".to_string()));
        }
        let val_bytes = &buf[pos..pos + val_len];
        let value = match tag {
            0 => Value::Null,
            1 => Value::Int64(i64::from_le_bytes(
                val_bytes.try_into().map_err(|_| CacheError::Protocol("bad int64 len".to_string()))?,
            )),
            2 => Value::Float64(f64::from_le_bytes(
                val_bytes.try_into().map_err(|_| CacheError::Protocol("bad float64 len".to_string()))?,
            )),
            3 => Value::Bytes(val_bytes.to_vec()),
            4 => Value::Decimal(val_bytes.to_vec()),
            5 => Value::Bool(val_bytes.first().copied().unwrap_or(0) != 0),
            other => return Err(CacheError::Protocol(format!("unknown type tag {other}"))),
        };
        pos += val_len;
        fields.push(Field { name, value });
    }

    Ok(Row { fields })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_row() -> Row {
        Row::new(vec![
            Field::new("id", Value::Int64(42)),
            Field::new("name", Value::Bytes(b"alpha".to_vec())),
            Field::new("score", Value::Float64(3.5)),
            Field::new("active", Value::Bool(true)),
            Field::new("note", Value::Null),
        ])
    }

    #[test]
    fn round_trips_all_type_tags() {
        let row = sample_row();
        let encoded = encode_row(&row);
        let decoded = decode_row(&encoded).unwrap();
        assert_eq!(row, decoded);
    }

    #[test]
    fn single_int_field_matches_scenario_1_shape() {
        // spec §8 scenario 1: one configured int column, encoded field_count == 1.
        let row = Row::new(vec![Field::new("id", Value::Int64(42))]);
        let encoded = encode_row(&row);
        assert_eq!(&encoded[0..4], &1u32.to_le_bytes());
    }

    #[test]
    fn max_field_count_round_trips() {
        let fields: Vec<Field> = (0..99)
            .map(|i| Field::new(format!("f{i}"), Value::Int64(i as i64)))
            .collect();
        let row = Row::new(fields);
        let encoded = encode_row(&row);
        let decoded = decode_row(&encoded).unwrap();
        assert_eq!(decoded.fields.len(), 99);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let mut encoded = encode_row(&sample_row());
        encoded.truncate(encoded.len() - 3);
        assert!(decode_row(&encoded).is_err());
    }
}
