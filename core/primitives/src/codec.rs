//! Binary codec for values and types.
//!
//! Every value encodes as a kind tag byte followed by a kind-specific
//! payload; compound values encode their children recursively, so any chunk
//! decodes without out-of-band schema. The integer codec is the signed
//! varint used by Number encoding: the sign is folded into the low bit
//! (non-negative folds even, negative folds odd, magnitude is the fold
//! shifted right by one) and the folded magnitude is written in 7-bit
//! little-endian groups with the high bit of each byte marking continuation.

use crate::hash::{self, Hash};
use crate::types::{self, Kind, StructField, TypeDesc, TypeRef};
use crate::value::{Blob, List, Map, Ref, Set, Struct, Value};

/// Widest encoded signed varint: a 64-bit fold needs ten 7-bit groups.
pub const MAX_VARINT_LEN: usize = 10;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unknown kind tag {0}")]
    BadTag(u8),
    #[error("invalid bool byte {0}")]
    BadBool(u8),
    #[error("varint does not fit in 64 bits")]
    VarintOverflow,
    #[error("length field out of range")]
    BadLength,
    #[error("string payload is not utf-8")]
    BadUtf8,
    #[error("number payload out of range")]
    BadNumber,
    #[error("trailing bytes after value")]
    TrailingBytes,
}

const TAG_BOOL: u8 = 0;
const TAG_NUMBER: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_BLOB: u8 = 3;
const TAG_VALUE: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;
const TAG_REF: u8 = 7;
const TAG_SET: u8 = 8;
const TAG_STRUCT: u8 = 9;
const TAG_TYPE: u8 = 10;
const TAG_CYCLE: u8 = 11;
const TAG_UNION: u8 = 12;

fn kind_tag(kind: Kind) -> u8 {
    match kind {
        Kind::Bool => TAG_BOOL,
        Kind::Number => TAG_NUMBER,
        Kind::String => TAG_STRING,
        Kind::Blob => TAG_BLOB,
        Kind::Value => TAG_VALUE,
        Kind::List => TAG_LIST,
        Kind::Map => TAG_MAP,
        Kind::Ref => TAG_REF,
        Kind::Set => TAG_SET,
        Kind::Struct => TAG_STRUCT,
        Kind::Type => TAG_TYPE,
        Kind::Cycle => TAG_CYCLE,
        Kind::Union => TAG_UNION,
    }
}

fn tag_kind(tag: u8) -> Result<Kind, DecodeError> {
    Ok(match tag {
        TAG_BOOL => Kind::Bool,
        TAG_NUMBER => Kind::Number,
        TAG_STRING => Kind::String,
        TAG_BLOB => Kind::Blob,
        TAG_VALUE => Kind::Value,
        TAG_LIST => Kind::List,
        TAG_MAP => Kind::Map,
        TAG_REF => Kind::Ref,
        TAG_SET => Kind::Set,
        TAG_STRUCT => Kind::Struct,
        TAG_TYPE => Kind::Type,
        TAG_CYCLE => Kind::Cycle,
        TAG_UNION => Kind::Union,
        other => return Err(DecodeError::BadTag(other)),
    })
}

pub mod varint {
    use super::DecodeError;

    fn fold(n: i64) -> u64 {
        ((n << 1) ^ (n >> 63)) as u64
    }

    fn unfold(folded: u64) -> i64 {
        ((folded >> 1) as i64) ^ -((folded & 1) as i64)
    }

    /// Appends the encoding of `n` to `out`; returns the number of bytes
    /// written.
    pub fn encode(n: i64, out: &mut Vec<u8>) -> usize {
        let mut folded = fold(n);
        let mut written = 0;
        loop {
            let byte = (folded & 0x7f) as u8;
            folded >>= 7;
            written += 1;
            if folded == 0 {
                out.push(byte);
                return written;
            }
            out.push(byte | 0x80);
        }
    }

    /// Number of bytes `encode(n)` writes.
    pub fn encoding_length(n: i64) -> usize {
        let mut folded = fold(n);
        let mut len = 1;
        while folded >= 0x80 {
            folded >>= 7;
            len += 1;
        }
        len
    }

    /// Decodes one varint from the front of `buf`; returns the value and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(i64, usize), DecodeError> {
        let mut folded: u64 = 0;
        for (i, &byte) in buf.iter().enumerate() {
            if i >= super::MAX_VARINT_LEN {
                return Err(DecodeError::VarintOverflow);
            }
            if i == 9 && byte > 1 {
                return Err(DecodeError::VarintOverflow);
            }
            folded |= u64::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok((unfold(folded), i + 1));
            }
        }
        Err(DecodeError::UnexpectedEof)
    }
}

/// Splits a finite f64 into `(mantissa, exponent)` with `f == mantissa *
/// 2^exponent` and the mantissa odd (or zero). The canonical split makes
/// equal numbers encode identically.
pub fn number_parts(f: f64) -> (i64, i64) {
    assert!(f.is_finite(), "non-finite numbers are not encodable");
    if f == 0.0 {
        return (0, 0);
    }
    let bits = f.to_bits();
    let negative = bits >> 63 == 1;
    let biased = ((bits >> 52) & 0x7ff) as i64;
    let fraction = bits & ((1u64 << 52) - 1);
    let (mut mantissa, mut exponent) = if biased == 0 {
        // Subnormal.
        (fraction as i64, -1074)
    } else {
        ((fraction | (1 << 52)) as i64, biased - 1075)
    };
    while mantissa & 1 == 0 {
        mantissa >>= 1;
        exponent += 1;
    }
    (if negative { -mantissa } else { mantissa }, exponent)
}

pub fn number_from_parts(mantissa: i64, exponent: i64) -> f64 {
    if mantissa == 0 {
        return 0.0;
    }
    (mantissa as f64) * pow2(exponent)
}

/// Exact power of two via the bit layout; saturates outside the f64 range so
/// the decoder can reject the result.
fn pow2(e: i64) -> f64 {
    match e {
        -1022..=1023 => f64::from_bits(((e + 1023) as u64) << 52),
        -1074..=-1023 => f64::from_bits(1u64 << (e + 1074)),
        _ if e < -1074 => 0.0,
        _ => f64::INFINITY,
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::BadLength)?;
        let slice = self.buf.get(self.pos..end).ok_or(DecodeError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<i64, DecodeError> {
        let (n, consumed) = varint::decode(&self.buf[self.pos..])?;
        self.pos += consumed;
        Ok(n)
    }

    fn length(&mut self) -> Result<usize, DecodeError> {
        let n = self.varint()?;
        usize::try_from(n).map_err(|_| DecodeError::BadLength)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.length()?;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::BadUtf8)
    }

    fn hash(&mut self) -> Result<Hash, DecodeError> {
        let raw = self.bytes(hash::BYTE_LEN)?;
        let mut out = [0u8; hash::BYTE_LEN];
        out.copy_from_slice(raw);
        Ok(Hash(out))
    }

    fn done(&self) -> Result<(), DecodeError> {
        if self.pos == self.buf.len() { Ok(()) } else { Err(DecodeError::TrailingBytes) }
    }
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    varint::encode(s.len() as i64, out);
    out.extend_from_slice(s.as_bytes());
}

pub fn encode_value(v: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(v, &mut out);
    out
}

fn write_value(v: &Value, out: &mut Vec<u8>) {
    match v {
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(u8::from(*b));
        }
        Value::Number(f) => {
            out.push(TAG_NUMBER);
            let (mantissa, exponent) = number_parts(*f);
            varint::encode(mantissa, out);
            varint::encode(exponent, out);
        }
        Value::String(s) => {
            out.push(TAG_STRING);
            write_string(s, out);
        }
        Value::Blob(b) => {
            out.push(TAG_BLOB);
            varint::encode(b.len() as i64, out);
            out.extend_from_slice(b.bytes());
        }
        Value::List(l) => {
            out.push(TAG_LIST);
            varint::encode(l.len() as i64, out);
            for item in l.iter() {
                write_value(item, out);
            }
        }
        Value::Set(s) => {
            out.push(TAG_SET);
            varint::encode(s.len() as i64, out);
            for item in s.iter() {
                write_value(item, out);
            }
        }
        Value::Map(m) => {
            out.push(TAG_MAP);
            varint::encode(m.len() as i64, out);
            for (k, val) in m.iter() {
                write_value(k, out);
                write_value(val, out);
            }
        }
        Value::Ref(r) => {
            out.push(TAG_REF);
            write_type(r.target_type(), out);
            out.extend_from_slice(r.target().as_bytes());
            varint::encode(r.height() as i64, out);
        }
        Value::Struct(s) => {
            out.push(TAG_STRUCT);
            write_string(s.name(), out);
            varint::encode(s.len() as i64, out);
            for (name, val) in s.iter() {
                write_string(name, out);
                write_value(val, out);
            }
        }
        Value::Type(t) => {
            out.push(TAG_TYPE);
            write_type(*t, out);
        }
    }
}

pub fn decode_value(buf: &[u8]) -> Result<Value, DecodeError> {
    let mut r = Reader::new(buf);
    let v = read_value(&mut r)?;
    r.done()?;
    Ok(v)
}

fn read_value(r: &mut Reader<'_>) -> Result<Value, DecodeError> {
    let tag = r.byte()?;
    Ok(match tag {
        TAG_BOOL => match r.byte()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => return Err(DecodeError::BadBool(other)),
        },
        TAG_NUMBER => {
            let mantissa = r.varint()?;
            let exponent = r.varint()?;
            let f = number_from_parts(mantissa, exponent);
            if !f.is_finite() {
                return Err(DecodeError::BadNumber);
            }
            Value::Number(f)
        }
        TAG_STRING => Value::String(r.string()?),
        TAG_BLOB => {
            let len = r.length()?;
            Value::Blob(Blob::new(r.bytes(len)?.to_vec()))
        }
        TAG_LIST => {
            let len = r.length()?;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(read_value(r)?);
            }
            Value::List(List::new(items))
        }
        TAG_SET => {
            let len = r.length()?;
            let mut items = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                items.push(read_value(r)?);
            }
            Value::Set(Set::new(items))
        }
        TAG_MAP => {
            let len = r.length()?;
            let mut entries = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                let k = read_value(r)?;
                let v = read_value(r)?;
                entries.push((k, v));
            }
            Value::Map(Map::new(entries))
        }
        TAG_REF => {
            let target_type = read_type(r)?;
            let target = r.hash()?;
            let height = u64::try_from(r.varint()?).map_err(|_| DecodeError::BadLength)?;
            Value::Ref(Ref::new(target, target_type, height))
        }
        TAG_STRUCT => {
            let name = r.string()?;
            let len = r.length()?;
            let mut fields = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                let field_name = r.string()?;
                let value = read_value(r)?;
                fields.push((field_name, value));
            }
            Value::Struct(Struct::new(&name, fields))
        }
        TAG_TYPE => Value::Type(read_type(r)?),
        other => return Err(DecodeError::BadTag(other)),
    })
}

pub fn encode_type(t: TypeRef) -> Vec<u8> {
    let mut out = Vec::new();
    write_type(t, &mut out);
    out
}

fn write_type(t: TypeRef, out: &mut Vec<u8>) {
    match t.desc() {
        TypeDesc::Primitive(kind) => out.push(kind_tag(kind)),
        TypeDesc::Compound(kind, elems) => {
            out.push(kind_tag(kind));
            if kind == Kind::Union {
                varint::encode(elems.len() as i64, out);
            }
            for elem in elems {
                write_type(elem, out);
            }
        }
        TypeDesc::Struct { name, fields } => {
            out.push(TAG_STRUCT);
            write_string(&name, out);
            varint::encode(fields.len() as i64, out);
            for field in fields {
                write_string(&field.name, out);
                out.push(u8::from(field.optional));
                write_type(field.type_ref, out);
            }
        }
        TypeDesc::Cycle(level) => {
            out.push(TAG_CYCLE);
            varint::encode(i64::from(level), out);
        }
    }
}

pub fn decode_type(buf: &[u8]) -> Result<TypeRef, DecodeError> {
    let mut r = Reader::new(buf);
    let t = read_type(&mut r)?;
    r.done()?;
    Ok(t)
}

fn read_type(r: &mut Reader<'_>) -> Result<TypeRef, DecodeError> {
    let tag = r.byte()?;
    let kind = tag_kind(tag)?;
    Ok(match kind {
        Kind::Bool => types::bool_type(),
        Kind::Number => types::number_type(),
        Kind::String => types::string_type(),
        Kind::Blob => types::blob_type(),
        Kind::Value => types::value_type(),
        Kind::Type => types::type_type(),
        Kind::List => types::list_type(read_type(r)?),
        Kind::Set => types::set_type(read_type(r)?),
        Kind::Ref => types::ref_type(read_type(r)?),
        Kind::Map => {
            let key = read_type(r)?;
            let value = read_type(r)?;
            types::map_type(key, value)
        }
        Kind::Union => {
            let len = r.length()?;
            let mut members = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                members.push(read_type(r)?);
            }
            types::union_type(&members)
        }
        Kind::Struct => {
            let name = r.string()?;
            let len = r.length()?;
            let mut fields = Vec::with_capacity(len.min(4096));
            for _ in 0..len {
                let field_name = r.string()?;
                let optional = match r.byte()? {
                    0 => false,
                    1 => true,
                    other => return Err(DecodeError::BadBool(other)),
                };
                let type_ref = read_type(r)?;
                fields.push(StructField { name: field_name, type_ref, optional });
            }
            types::struct_type(&name, fields)
        }
        Kind::Cycle => {
            let level = r.varint()?;
            types::cycle_type(u32::try_from(level).map_err(|_| DecodeError::BadLength)?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn varint_boundary_vectors() {
        let cases: &[(i64, &[u8])] = &[
            (0, &[0]),
            (1, &[2]),
            (-1, &[1]),
            (63, &[126]),
            (127, &[254, 1]),
            (-64, &[127]),
        ];
        for &(n, expected) in cases {
            let mut out = Vec::new();
            let written = varint::encode(n, &mut out);
            assert_eq!(out, expected, "encoding of {n}");
            assert_eq!(written, expected.len());
            assert_eq!(varint::encoding_length(n), expected.len());
            assert_eq!(varint::decode(expected).unwrap(), (n, expected.len()));
        }
    }

    #[test]
    fn varint_round_trips_wide_range() {
        let max_exact = (1i64 << 53) - 1;
        for n in [
            0,
            1,
            -1,
            300,
            -300,
            max_exact,
            -max_exact,
            i64::MAX,
            i64::MIN,
        ] {
            let mut out = Vec::new();
            let written = varint::encode(n, &mut out);
            assert_eq!(written, varint::encoding_length(n));
            assert!(written <= MAX_VARINT_LEN);
            assert_eq!(varint::decode(&out).unwrap(), (n, written));
        }
    }

    #[test]
    fn varint_rejects_truncation() {
        assert_matches!(varint::decode(&[0x80]), Err(DecodeError::UnexpectedEof));
        assert_matches!(varint::decode(&[]), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn number_parts_canonical() {
        assert_eq!(number_parts(0.0), (0, 0));
        assert_eq!(number_parts(1.0), (1, 0));
        assert_eq!(number_parts(-1.0), (-1, 0));
        assert_eq!(number_parts(8.0), (1, 3));
        assert_eq!(number_parts(0.5), (1, -1));
        assert_eq!(number_parts(3.5), (7, -1));
        for f in [0.0, 1.0, -2.5, 1e300, 5e-324, 123456789.123] {
            let (m, e) = number_parts(f);
            assert_eq!(number_from_parts(m, e), f);
        }
    }

    #[test]
    fn value_round_trips() {
        let values = [
            Value::Bool(true),
            Value::Number(42.5),
            Value::String("hello".to_string()),
            Value::Blob(Blob::new(vec![0, 1, 2, 255])),
            Value::List(List::new(vec![Value::Number(1.0), Value::String("x".into())])),
            Value::Set(Set::new(vec![Value::Number(1.0), Value::Number(2.0)])),
            Value::Map(Map::new(vec![(
                Value::String("k".into()),
                Value::Number(7.0),
            )])),
            Value::Ref(Ref::new(Hash::of(b"target"), types::string_type(), 3)),
            Value::Struct(Struct::new(
                "Point",
                vec![("x".to_string(), Value::Number(1.0)), ("y".to_string(), Value::Number(2.0))],
            )),
            Value::Type(types::list_type(types::number_type())),
        ];
        for v in values {
            let encoded = encode_value(&v);
            let decoded = decode_value(&encoded).unwrap();
            assert_eq!(decoded, v);
            // Round-tripping preserves the encoding, hence the hash.
            assert_eq!(encode_value(&decoded), encoded);
        }
    }

    #[test]
    fn type_round_trips() {
        let meta = types::struct_type("", vec![]);
        let ts = [
            types::bool_type(),
            types::map_type(types::string_type(), types::value_type()),
            types::union_type(&[types::number_type(), types::string_type()]),
            types::make_commit_type(types::string_type(), meta, &[], &[]),
            types::make_commit_type(types::number_type(), meta, &[types::string_type()], &[meta]),
        ];
        for t in ts {
            let encoded = encode_type(t);
            // Interning makes decode return the identical handle.
            assert_eq!(decode_type(&encoded).unwrap(), t);
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_matches!(decode_value(&[]), Err(DecodeError::UnexpectedEof));
        assert_matches!(decode_value(&[99]), Err(DecodeError::BadTag(99)));
        assert_matches!(decode_value(&[TAG_BOOL, 7]), Err(DecodeError::BadBool(7)));
        let mut ok = encode_value(&Value::Bool(true));
        ok.push(0);
        assert_matches!(decode_value(&ok), Err(DecodeError::TrailingBytes));
    }
}
