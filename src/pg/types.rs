//! Type OIDs and the values a query can bind or read back.
//!
//! Parameters always travel in binary. Result columns are decoded in
//! whichever format the server reports for them.

use bytes::{BufMut, BytesMut};

use super::error::{PgError, PgResult};
use super::protocol::Format;

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid(pub i32);

impl Oid {
    /// Lets the server infer a parameter's type.
    pub const UNSPECIFIED: Oid = Oid(0);
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    fn is_character(self) -> bool {
        [Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::CHAR, Oid::NAME].contains(&self)
    }
}

impl From<i32> for Oid {
    fn from(raw: i32) -> Self {
        Oid(raw)
    }
}

impl From<Oid> for i32 {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

/// A value bound as a parameter or read from a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    Json(String),
    /// A type without a dedicated variant, kept as the server sent it.
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Type announced in Parse when the caller supplies none.
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Json(_) => Oid::JSON,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Append the value as a Bind parameter: an i32 length followed by the
    /// binary payload, or a length of -1 for NULL.
    pub fn write_param(&self, buf: &mut BytesMut) {
        let payload: &[u8] = match self {
            PgValue::Null => {
                buf.put_i32(-1);
                return;
            }
            PgValue::Bool(v) => {
                buf.put_i32(1);
                buf.put_u8(u8::from(*v));
                return;
            }
            PgValue::Int2(v) => {
                buf.put_i32(2);
                buf.put_i16(*v);
                return;
            }
            PgValue::Int4(v) => {
                buf.put_i32(4);
                buf.put_i32(*v);
                return;
            }
            PgValue::Int8(v) => {
                buf.put_i32(8);
                buf.put_i64(*v);
                return;
            }
            PgValue::Float4(v) => {
                buf.put_i32(4);
                buf.put_f32(*v);
                return;
            }
            PgValue::Float8(v) => {
                buf.put_i32(8);
                buf.put_f64(*v);
                return;
            }
            PgValue::Text(s) | PgValue::Json(s) => s.as_bytes(),
            PgValue::Bytea(data) | PgValue::Raw { data, .. } => data,
            PgValue::Uuid(bytes) => bytes,
        };
        buf.put_i32(payload.len() as i32);
        buf.put_slice(payload);
    }

    /// Decode a non-NULL column value.
    pub fn decode(oid: Oid, format: Format, data: &[u8]) -> PgResult<Self> {
        match format {
            Format::Binary => decode_binary(oid, data),
            Format::Text => decode_text(oid, data),
        }
    }
}

fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<PgValue> {
    let value = match oid {
        Oid::BOOL => PgValue::Bool(width::<1>(oid, data)? != [0]),
        Oid::INT2 => PgValue::Int2(i16::from_be_bytes(width(oid, data)?)),
        Oid::INT4 => PgValue::Int4(i32::from_be_bytes(width(oid, data)?)),
        Oid::INT8 => PgValue::Int8(i64::from_be_bytes(width(oid, data)?)),
        Oid::FLOAT4 => PgValue::Float4(f32::from_be_bytes(width(oid, data)?)),
        Oid::FLOAT8 => PgValue::Float8(f64::from_be_bytes(width(oid, data)?)),
        Oid::UUID => PgValue::Uuid(width(oid, data)?),
        Oid::BYTEA => PgValue::Bytea(data.to_vec()),
        Oid::JSON => PgValue::Json(text(oid, data)?),
        // version byte
        Oid::JSONB => match data.split_first() {
            Some((_, json)) => PgValue::Json(text(oid, json)?),
            None => return Err(PgError::Type("empty jsonb value".into())),
        },
        _ if oid.is_character() => PgValue::Text(text(oid, data)?),
        _ => PgValue::Raw {
            oid,
            data: data.to_vec(),
        },
    };
    Ok(value)
}

fn decode_text(oid: Oid, data: &[u8]) -> PgResult<PgValue> {
    fn parse<T: std::str::FromStr>(oid: Oid, s: &str) -> PgResult<T>
    where
        T::Err: std::fmt::Display,
    {
        s.parse()
            .map_err(|e| PgError::Type(format!("cannot parse {s:?} as {oid:?}: {e}")))
    }

    let s = text(oid, data)?;
    let value = match oid {
        Oid::BOOL => PgValue::Bool(s == "t" || s == "true"),
        Oid::INT2 => PgValue::Int2(parse(oid, &s)?),
        Oid::INT4 => PgValue::Int4(parse(oid, &s)?),
        Oid::INT8 => PgValue::Int8(parse(oid, &s)?),
        Oid::FLOAT4 => PgValue::Float4(parse(oid, &s)?),
        Oid::FLOAT8 => PgValue::Float8(parse(oid, &s)?),
        Oid::JSON | Oid::JSONB => PgValue::Json(s),
        _ => PgValue::Text(s),
    };
    Ok(value)
}

fn width<const N: usize>(oid: Oid, data: &[u8]) -> PgResult<[u8; N]> {
    <[u8; N]>::try_from(data).map_err(|_| {
        PgError::Type(format!("{oid:?} needs {N} bytes, received {}", data.len()))
    })
}

fn text(oid: Oid, data: &[u8]) -> PgResult<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|e| PgError::Type(format!("{oid:?} is not valid UTF-8: {e}")))
}
