//! # Wire Codec
//!
//! Bit-exact (big-endian) framing for tuples shipped between peers:
//! `u16` table-name length, name bytes, `u32` tuple length, tuple body.
//! The tuple body is the concatenation of each column's per-type binary
//! encoding, in schema order.
//!
//! i2/i4 values are sized correctly on the wire — i2 encodes as 2 bytes,
//! i4 as 4 — rather than widened through a single 8-byte integer encoder,
//! so the framing never lies about its own length.

use std::sync::Arc;

use crate::error::{Error, Result, UsageError};
use crate::value::{DataType, Datum, Schema, Tuple};

/// Encodes one column value per its type's wire rules.
fn encode_datum(out: &mut Vec<u8>, d: &Datum) {
    match d {
        Datum::Bool(v) => out.push(u8::from(*v)),
        Datum::Char(v) => out.push(*v),
        Datum::I2(v) => out.extend_from_slice(&v.to_be_bytes()),
        Datum::I4(v) => out.extend_from_slice(&v.to_be_bytes()),
        Datum::I8(v) => out.extend_from_slice(&v.to_be_bytes()),
        Datum::F64(v) => out.extend_from_slice(&v.to_bits().to_be_bytes()),
        Datum::String(s) => {
            let bytes = s.as_bytes();
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(bytes);
        }
    }
}

/// Encodes a tuple's body (no framing) per its schema's column types.
pub fn encode_tuple_body(tuple: &Tuple) -> Vec<u8> {
    let mut out = Vec::new();
    for v in tuple.values() {
        encode_datum(&mut out, v);
    }
    out
}

fn decode_datum(ty: DataType, buf: &[u8], pos: &mut usize) -> Result<Datum> {
    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        let slice = buf
            .get(*pos..*pos + n)
            .ok_or_else(|| Error::TransportDrop("tuple body truncated mid-column".into()))?;
        *pos += n;
        Ok(slice)
    };
    Ok(match ty {
        DataType::Bool => Datum::Bool(take(pos, 1)?[0] != 0),
        DataType::Char => Datum::Char(take(pos, 1)?[0]),
        DataType::I2 => Datum::I2(i16::from_be_bytes(take(pos, 2)?.try_into().unwrap())),
        DataType::I4 => Datum::I4(i32::from_be_bytes(take(pos, 4)?.try_into().unwrap())),
        DataType::I8 => Datum::I8(i64::from_be_bytes(take(pos, 8)?.try_into().unwrap())),
        DataType::F64 => Datum::F64(f64::from_bits(u64::from_be_bytes(take(pos, 8)?.try_into().unwrap()))),
        DataType::String => {
            let len = u32::from_be_bytes(take(pos, 4)?.try_into().unwrap()) as usize;
            let bytes = take(pos, len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| Error::Usage(UsageError::Parse(format!("invalid utf8 in string column: {e}"))))?;
            Datum::String(Arc::from(s))
        }
    })
}

/// Decodes a tuple body against `schema`, consuming it fully — trailing
/// bytes are a framing error, not silently ignored.
pub fn decode_tuple_body(schema: Arc<Schema>, body: &[u8]) -> Result<Tuple> {
    let mut pos = 0;
    let mut values = Vec::with_capacity(schema.arity());
    for i in 0..schema.arity() {
        values.push(decode_datum(schema.column_type(i), body, &mut pos)?);
    }
    if pos != body.len() {
        return Err(Error::TransportDrop(format!(
            "tuple body has {} trailing bytes after decoding {} columns",
            body.len() - pos,
            schema.arity()
        )));
    }
    Ok(Tuple::make(schema, values))
}

/// Frames one message: `u16` name length, name bytes, `u32` body length,
/// body bytes. This is the unit the send state machine writes and the
/// receive state machine's `NameLen -> Name -> TupleLen -> Tuple` walk
/// reconstructs.
pub fn encode_message(table_name: &str, body: &[u8]) -> Vec<u8> {
    let name_bytes = table_name.as_bytes();
    let mut out = Vec::with_capacity(2 + name_bytes.len() + 4 + body.len());
    out.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(name_bytes);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataType;

    #[test]
    fn encodes_i4_and_string_with_correct_sizing() {
        let schema = Arc::new(Schema::new(vec![DataType::I4, DataType::String], None));
        let tuple = Tuple::make(schema, vec![Datum::I4(5), Datum::String(Arc::from("hi"))]);
        let body = encode_tuple_body(&tuple);
        let msg = encode_message("tbl", &body);
        // namelen(2) + "tbl"(3) + bodylen(4) + i4(4) + strlen(4) + "hi"(2) = 19
        assert_eq!(
            msg,
            vec![
                0x00, 0x03, b't', b'b', b'l', // name
                0x00, 0x00, 0x00, 0x0A, // body length = 10 (4 + 4 + 2)
                0x00, 0x00, 0x00, 0x05, // i4 = 5, 4 bytes
                0x00, 0x00, 0x00, 0x02, b'h', b'i', // string "hi"
            ]
        );
    }

    #[test]
    fn encodes_i2_as_two_bytes() {
        let schema = Arc::new(Schema::new(vec![DataType::I2], None));
        let tuple = Tuple::make(schema, vec![Datum::I2(-1)]);
        assert_eq!(encode_tuple_body(&tuple), vec![0xFF, 0xFF]);
    }

    #[test]
    fn round_trips_every_supported_type() {
        let schema = Arc::new(Schema::new(
            vec![DataType::Bool, DataType::Char, DataType::I2, DataType::I4, DataType::I8, DataType::F64, DataType::String],
            None,
        ));
        let tuple = Tuple::make(
            schema.clone(),
            vec![
                Datum::Bool(true),
                Datum::Char(b'x'),
                Datum::I2(-7),
                Datum::I4(12345),
                Datum::I8(-9_000_000_000),
                Datum::F64(3.5),
                Datum::String(Arc::from("round-trip")),
            ],
        );
        let body = encode_tuple_body(&tuple);
        let decoded = decode_tuple_body(schema, &body).unwrap();
        assert_eq!(decoded, tuple);
    }

    #[test]
    fn rejects_truncated_body() {
        let schema = Arc::new(Schema::new(vec![DataType::I8], None));
        let err = decode_tuple_body(schema, &[0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::TransportDrop(_)));
    }
}
