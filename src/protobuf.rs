//! Minimal reader for the protobuf-encoded message rows.
//!
//! Only what the message rows actually use is supported: fixed 64-bit,
//! length-delimited and fixed 32-bit fields, against a fixed field table.
//! Bare varint fields (wire type 0) are not implemented and fail the decode,
//! as does any field number missing from the table.

use std::collections::BTreeMap;

use base64::prelude::*;
use serde::{Serialize, Serializer};

use crate::error::DecodeError;

const WIRE_FIXED64: u8 = 1;
const WIRE_LENGTH_DELIMITED: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// Varints wider than this do not fit the 32 bits we decode into.
const MAX_VARINT_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    String,
    Bytes,
    Double,
    Float,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Bool,
}

impl Scalar {
    pub fn name(self) -> &'static str {
        match self {
            Scalar::String => "string",
            Scalar::Bytes => "bytes",
            Scalar::Double => "double",
            Scalar::Float => "float",
            Scalar::Int32 => "int32",
            Scalar::Uint32 => "uint32",
            Scalar::Int64 => "int64",
            Scalar::Uint64 => "uint64",
            Scalar::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    Scalar(Scalar),
    Nested(&'static FieldSpec),
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            FieldType::Scalar(scalar) => scalar.name(),
            FieldType::Nested(_) => "message",
        }
    }
}

#[derive(Debug)]
pub struct Field {
    pub number: u32,
    pub name: &'static str,
    pub ty: FieldType,
}

/// Field table for one message shape.
#[derive(Debug)]
pub struct FieldSpec {
    fields: &'static [Field],
}

impl FieldSpec {
    pub const fn new(fields: &'static [Field]) -> Self {
        Self { fields }
    }

    pub fn field(&self, number: u32) -> Option<&Field> {
        self.fields.iter().find(|field| field.number == number)
    }

    pub fn fields(&self) -> &[Field] {
        self.fields
    }
}

const fn scalar(number: u32, name: &'static str, scalar: Scalar) -> Field {
    Field {
        number,
        name,
        ty: FieldType::Scalar(scalar),
    }
}

/// Body of a single message. Fields 18 and 24 (repeated poll messages) are
/// left out on purpose.
pub static MESSAGE_SPEC: FieldSpec = FieldSpec::new(&[
    scalar(1, "body", Scalar::String),
    scalar(3, "caption", Scalar::String),
    scalar(5, "lng", Scalar::Double),
    scalar(6, "isLive", Scalar::Bool),
    scalar(7, "lat", Scalar::Double),
    scalar(8, "paymentAmount1000", Scalar::Int32),
    scalar(9, "paymentNoteMsgBody", Scalar::String),
    scalar(10, "canonicalUrl", Scalar::String),
    scalar(11, "matchedText", Scalar::String),
    scalar(12, "title", Scalar::String),
    scalar(13, "description", Scalar::String),
    scalar(14, "futureproofBuffer", Scalar::Bytes),
    scalar(15, "clientUrl", Scalar::String),
    scalar(16, "loc", Scalar::String),
    scalar(17, "pollName", Scalar::String),
    scalar(20, "pollSelectableOptionsCount", Scalar::Uint32),
    scalar(21, "messageSecret", Scalar::Bytes),
    scalar(22, "senderTimestampMs", Scalar::Int64),
    scalar(23, "pollUpdateParentKey", Scalar::String),
]);

/// A full message row: the message itself and the one it quotes.
pub static ROW_SPEC: FieldSpec = FieldSpec::new(&[
    Field {
        number: 1,
        name: "currentMsg",
        ty: FieldType::Nested(&MESSAGE_SPEC),
    },
    Field {
        number: 2,
        name: "quotedMsg",
        ty: FieldType::Nested(&MESSAGE_SPEC),
    },
]);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Bytes(#[serde(serialize_with = "serialize_base64")] Vec<u8>),
    Double(f64),
    Float(f32),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Message(DecodedRecord),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&DecodedRecord> {
        match self {
            Value::Message(record) => Some(record),
            _ => None,
        }
    }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
}

/// Decoded message, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DecodedRecord(BTreeMap<&'static str, Value>);

impl DecodedRecord {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shorthand for a string field.
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn message(&self, name: &str) -> Option<&DecodedRecord> {
        self.get(name).and_then(Value::as_message)
    }
}

// The cursor always points at the next byte to read, and is advanced as
// soon as data is consumed.
struct DecodeCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DecodeCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn length(&self) -> usize {
        self.data.len()
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .data
            .get(self.offset)
            .ok_or(DecodeError::UnexpectedEof {
                offset: self.offset,
                needed: 1,
            })?;
        self.offset += 1;
        Ok(byte)
    }

    fn read_varint(&mut self) -> Result<u32, DecodeError> {
        let mut number = 0u32;
        let mut parsed = 0;
        loop {
            if parsed >= MAX_VARINT_BYTES {
                return Err(DecodeError::VarintTooWide);
            }
            let byte = self.read_u8()?;
            number |= u32::from(byte & 0x7f) << (parsed * 7);
            parsed += 1;
            if byte & 0x80 == 0 {
                return Ok(number);
            }
        }
    }

    // A field claiming more bytes than remain would push the cursor past
    // the end of this (sub-)buffer; report it as the mismatch it would be.
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.offset.saturating_add(n);
        if end > self.length() {
            return Err(DecodeError::CursorMismatch {
                cursor: end,
                length: self.length(),
            });
        }
        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.offset != self.length() {
            return Err(DecodeError::CursorMismatch {
                cursor: self.offset,
                length: self.length(),
            });
        }
        Ok(())
    }
}

/// Decodes a little-endian base-128 varint from the start of `buf`,
/// returning the value and the number of bytes consumed.
pub fn decode_varint(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut cursor = DecodeCursor::new(buf);
    let value = cursor.read_varint()?;
    Ok((value, cursor.offset))
}

/// Decodes `buffer` against `spec`. Nested messages are decoded with their
/// own cursor over exactly their sub-slice.
pub fn decode(spec: &FieldSpec, buffer: &[u8]) -> Result<DecodedRecord, DecodeError> {
    let mut cursor = DecodeCursor::new(buffer);
    let mut record = DecodedRecord::default();

    while cursor.offset < cursor.length() {
        let header = cursor.read_u8()?;
        let number = u32::from(header >> 3);
        let wire_type = header & 0x7;
        let field = spec
            .field(number)
            .ok_or(DecodeError::UnknownField(number))?;
        let mismatch = || DecodeError::TypeMismatch {
            field: field.name,
            wire_type,
            declared: field.ty.name(),
        };

        let value = match wire_type {
            WIRE_FIXED64 => {
                let bytes = cursor.take_array::<8>()?;
                match field.ty {
                    FieldType::Scalar(Scalar::Double) => Value::Double(f64::from_le_bytes(bytes)),
                    FieldType::Scalar(Scalar::Int64) => Value::Int64(i64::from_le_bytes(bytes)),
                    FieldType::Scalar(Scalar::Uint64) => Value::Uint64(u64::from_le_bytes(bytes)),
                    _ => return Err(mismatch()),
                }
            }
            WIRE_LENGTH_DELIMITED => {
                let length = cursor.read_varint()? as usize;
                let body = cursor.take(length)?;
                match field.ty {
                    FieldType::Scalar(Scalar::String) => {
                        let text = std::str::from_utf8(body)
                            .map_err(|_| DecodeError::InvalidUtf8 { field: field.name })?;
                        Value::String(text.to_owned())
                    }
                    FieldType::Scalar(Scalar::Bytes) => Value::Bytes(body.to_vec()),
                    FieldType::Nested(nested) => Value::Message(decode(nested, body)?),
                    _ => return Err(mismatch()),
                }
            }
            WIRE_FIXED32 => {
                let bytes = cursor.take_array::<4>()?;
                match field.ty {
                    FieldType::Scalar(Scalar::Float) => Value::Float(f32::from_le_bytes(bytes)),
                    FieldType::Scalar(Scalar::Int32) => Value::Int32(i32::from_le_bytes(bytes)),
                    FieldType::Scalar(Scalar::Uint32) => Value::Uint32(u32::from_le_bytes(bytes)),
                    _ => return Err(mismatch()),
                }
            }
            other => return Err(DecodeError::UnimplementedWireType(other)),
        };
        record.0.insert(field.name, value);
    }

    cursor.finish()?;
    Ok(record)
}

/// Decodes a decrypted message row (`currentMsg` / `quotedMsg`).
pub fn decode_message_row(buffer: &[u8]) -> Result<DecodedRecord, DecodeError> {
    decode(&ROW_SPEC, buffer)
}
