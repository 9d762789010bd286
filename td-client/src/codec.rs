//! MessagePack record encoding and incremental MessagePack / JSON-lines decoding.
//!
//! Records are packed one after another with no envelope. The service's packer
//! historically accepts integers in `-(2^63) < v < 2^64`; a record holding an
//! integer outside that range is re-packed once with every such integer turned
//! into its decimal string.

use std::io::{self, Cursor, Write};

use flate2::write::GzEncoder;
use flate2::Compression;
use num_bigint::BigInt;
use num_traits::ToPrimitive;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("integer {0} is outside the packable range")]
    IntegerOverflow(BigInt),
    #[error("failed to pack record: {0}")]
    Pack(String),
    #[error("malformed msgpack data at byte {offset}: {message}")]
    Malformed { offset: usize, message: String },
    #[error("truncated data: {0} bytes left after the last complete value")]
    Truncated(usize),
    #[error("invalid json at line {line}: {source}")]
    Json { line: usize, source: serde_json::Error },
    #[error("value is not a record")]
    NotARecord,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Boolean(bool),
    Integer(BigInt),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => v.to_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Integer(v) => v.to_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v.as_slice()),
            _ => None,
        }
    }
}

macro_rules! value_from_integer {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Integer(BigInt::from(v))
            }
        })*
    };
}

value_from_integer!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128);

impl From<BigInt> for Value {
    fn from(v: BigInt) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nil)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Nil,
            serde_json::Value::Bool(v) => Value::Boolean(v),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Value::Integer(v.into())
                } else if let Some(v) = n.as_u64() {
                    Value::Integer(v.into())
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(v) => Value::String(v),
            serde_json::Value::Array(v) => Value::Array(v.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(v) => {
                Value::Map(v.into_iter().map(|(k, v)| (Value::String(k), Value::from(v))).collect())
            }
        }
    }
}

/// One row: field names in insertion order mapped to values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field. An existing field keeps its position and gets the new value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut record = Record::new();
        for (k, v) in iter {
            record.insert(k, v);
        }
        record
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Map(record.fields.into_iter().map(|(k, v)| (Value::String(k), v)).collect())
    }
}

impl TryFrom<Value> for Record {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| match k {
                    Value::String(k) => Ok((k, v)),
                    _ => Err(Error::NotARecord),
                })
                .collect(),
            _ => Err(Error::NotARecord),
        }
    }
}

fn in_packable_range(v: &BigInt) -> bool {
    match v.to_i64() {
        Some(i) => i != i64::MIN,
        None => v.to_u64().is_some(),
    }
}

fn to_msgpack(value: &Value) -> Result<rmpv::Value, Error> {
    Ok(match value {
        Value::Nil => rmpv::Value::Nil,
        Value::Boolean(v) => rmpv::Value::Boolean(*v),
        Value::Integer(v) => {
            if !in_packable_range(v) {
                return Err(Error::IntegerOverflow(v.clone()));
            }
            match v.to_i64() {
                Some(i) => rmpv::Value::from(i),
                None => rmpv::Value::from(v.to_u64().ok_or_else(|| Error::IntegerOverflow(v.clone()))?),
            }
        }
        Value::Float(v) => rmpv::Value::F64(*v),
        Value::String(v) => rmpv::Value::String(v.as_str().into()),
        Value::Binary(v) => rmpv::Value::Binary(v.clone()),
        Value::Array(v) => rmpv::Value::Array(v.iter().map(to_msgpack).collect::<Result<_, _>>()?),
        Value::Map(v) => rmpv::Value::Map(
            v.iter()
                .map(|(k, v)| Ok((to_msgpack(k)?, to_msgpack(v)?)))
                .collect::<Result<_, Error>>()?,
        ),
    })
}

/// Replaces every integer outside the packable range with its decimal string.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Integer(v) if !in_packable_range(v) => Value::String(v.to_string()),
        Value::Array(v) => Value::Array(v.iter().map(normalize).collect()),
        Value::Map(v) => Value::Map(v.iter().map(|(k, v)| (normalize(k), normalize(v))).collect()),
        other => other.clone(),
    }
}

fn write_msgpack<W: Write>(wr: &mut W, value: &rmpv::Value) -> Result<(), Error> {
    rmpv::encode::write_value(wr, value).map_err(|e| Error::Pack(e.to_string()))
}

/// Packs one record into `wr`.
///
/// The record is converted completely before anything is written, so a record
/// that needs the string fallback never leaves partial output behind.
pub fn pack_record<W: Write>(wr: &mut W, record: &Record) -> Result<(), Error> {
    let value = Value::from(record.clone());
    let packed = match to_msgpack(&value) {
        Ok(packed) => packed,
        Err(Error::IntegerOverflow(v)) => {
            tracing::debug!("integer {v} out of range, packing the record with stringified integers");
            to_msgpack(&normalize(&value))?
        }
        Err(e) => return Err(e),
    };
    write_msgpack(wr, &packed)
}

pub fn pack_records<'a>(records: impl IntoIterator<Item = &'a Record>) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    for record in records {
        pack_record(&mut buf, record)?;
    }
    Ok(buf)
}

/// Same as [`pack_records`], gzip-framed. This is the `msgpack.gz` upload format.
pub fn pack_records_gz<'a>(records: impl IntoIterator<Item = &'a Record>) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for record in records {
        pack_record(&mut encoder, record)?;
    }
    Ok(encoder.finish()?)
}

fn from_msgpack(value: rmpv::Value, offset: usize) -> Result<Value, Error> {
    Ok(match value {
        rmpv::Value::Nil => Value::Nil,
        rmpv::Value::Boolean(v) => Value::Boolean(v),
        rmpv::Value::Integer(v) => match (v.as_i64(), v.as_u64()) {
            (Some(i), _) => Value::Integer(i.into()),
            (None, Some(u)) => Value::Integer(u.into()),
            (None, None) => {
                return Err(Error::Malformed {
                    offset,
                    message: "integer without a representation".to_string(),
                })
            }
        },
        rmpv::Value::F32(v) => Value::Float(v as f64),
        rmpv::Value::F64(v) => Value::Float(v),
        rmpv::Value::String(v) => Value::String(v.into_str().ok_or_else(|| Error::Malformed {
            offset,
            message: "string is not valid utf-8".to_string(),
        })?),
        rmpv::Value::Binary(v) => Value::Binary(v),
        rmpv::Value::Array(v) => Value::Array(
            v.into_iter()
                .map(|v| from_msgpack(v, offset))
                .collect::<Result<_, _>>()?,
        ),
        rmpv::Value::Map(v) => Value::Map(
            v.into_iter()
                .map(|(k, v)| Ok((from_msgpack(k, offset)?, from_msgpack(v, offset)?)))
                .collect::<Result<_, Error>>()?,
        ),
        rmpv::Value::Ext(_, data) => Value::Binary(data),
    })
}

fn is_incomplete(e: &rmpv::decode::Error) -> bool {
    match e {
        rmpv::decode::Error::InvalidMarkerRead(e) | rmpv::decode::Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Decodes one value from the front of `data`.
/// `Ok(None)` means `data` holds only the beginning of a value.
fn decode_front(data: &[u8], offset: usize) -> Result<Option<(Value, usize)>, Error> {
    if data.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(data);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(v) => Ok(Some((from_msgpack(v, offset)?, cursor.position() as usize))),
        Err(e) if is_incomplete(&e) => Ok(None),
        Err(e) => Err(Error::Malformed {
            offset,
            message: e.to_string(),
        }),
    }
}

/// Lazy iterator over a complete buffer of concatenated MessagePack values.
///
/// Forward-only; stops after the first error.
pub struct Unpack<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

pub fn unpack(data: &[u8]) -> Unpack<'_> {
    Unpack {
        data,
        offset: 0,
        failed: false,
    }
}

impl Iterator for Unpack<'_> {
    type Item = Result<Value, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let rest = &self.data[self.offset..];
        match decode_front(rest, self.offset) {
            Ok(Some((value, used))) => {
                self.offset += used;
                Some(Ok(value))
            }
            Ok(None) if rest.is_empty() => None,
            Ok(None) => {
                self.failed = true;
                Some(Err(Error::Truncated(rest.len())))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Incremental decoder fed with arbitrary chunks of a byte stream.
pub trait Decoder: Send {
    fn feed(&mut self, data: &[u8]);

    /// Next complete value, or `None` when more input is needed.
    fn next_value(&mut self) -> Result<Option<Value>, Error>;

    /// Called at end of input. Returns the value held back for lack of a
    /// terminator, if any, and fails on leftover bytes that do not form one.
    fn finish(&mut self) -> Result<Option<Value>, Error>;
}

/// Consumed input is tracked by a read position into `buf` and only dropped
/// when the next chunk arrives, so decoding a chunk is linear in its size.
#[derive(Debug, Default)]
pub struct MsgpackDecoder {
    buf: Vec<u8>,
    read: usize,
    offset: usize,
}

impl Decoder for MsgpackDecoder {
    fn feed(&mut self, data: &[u8]) {
        compact(&mut self.buf, &mut self.read);
        self.buf.extend_from_slice(data);
    }

    fn next_value(&mut self) -> Result<Option<Value>, Error> {
        match decode_front(&self.buf[self.read..], self.offset)? {
            Some((value, used)) => {
                self.read += used;
                self.offset += used;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn finish(&mut self) -> Result<Option<Value>, Error> {
        let rest = self.buf.len() - self.read;
        if rest == 0 {
            Ok(None)
        } else {
            Err(Error::Truncated(rest))
        }
    }
}

fn compact(buf: &mut Vec<u8>, read: &mut usize) {
    if *read == buf.len() {
        buf.clear();
    } else if *read > 0 {
        buf.drain(..*read);
    }
    *read = 0;
}

/// Newline-delimited JSON. Blank lines are skipped.
#[derive(Debug, Default)]
pub struct JsonLinesDecoder {
    buf: Vec<u8>,
    read: usize,
    line: usize,
}

fn parse_line(raw: &[u8], line: usize) -> Result<Option<Value>, Error> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let parsed: serde_json::Value = serde_json::from_slice(raw).map_err(|source| Error::Json { line, source })?;
    Ok(Some(parsed.into()))
}

impl Decoder for JsonLinesDecoder {
    fn feed(&mut self, data: &[u8]) {
        compact(&mut self.buf, &mut self.read);
        self.buf.extend_from_slice(data);
    }

    fn next_value(&mut self) -> Result<Option<Value>, Error> {
        while let Some(pos) = self.buf[self.read..].iter().position(|b| *b == b'\n') {
            let start = self.read;
            self.read = start + pos + 1;
            self.line += 1;
            if let Some(value) = parse_line(&self.buf[start..start + pos], self.line)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<Option<Value>, Error> {
        let start = self.read;
        self.read = self.buf.len();
        if start == self.buf.len() {
            return Ok(None);
        }
        self.line += 1;
        parse_line(&self.buf[start..], self.line)
    }
}
