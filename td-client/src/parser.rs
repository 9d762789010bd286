//! Turns delimited text and pre-encoded files into [`Record`]s for upload.
//!
//! Every column of a delimited file is converted by, in order of precedence,
//! a named converter, an explicit [`DType`], or a guess.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use num_bigint::BigInt;

use crate::codec::{self, Decoder, JsonLinesDecoder, Record, Value};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("cannot convert {value:?} in column {column} to {dtype}")]
    Convert {
        column: String,
        value: String,
        dtype: DType,
    },
    #[error("converter for column {column} rejected {value:?}: {message}")]
    Converter {
        column: String,
        value: String,
        message: String,
    },
    #[error("unknown column type: {0}")]
    UnknownType(String),
    #[error("row {row} has {actual} fields but {expected} columns are named")]
    ColumnCount {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Codec(#[from] codec::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DType {
    Bool,
    Int,
    Float,
    Str,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::Int => "int",
            DType::Float => "float",
            DType::Str => "str",
        };
        f.write_str(name)
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DType::Bool),
            "int" | "integer" | "long" => Ok(DType::Int),
            "float" | "double" => Ok(DType::Float),
            "str" | "string" => Ok(DType::Str),
            _ => Err(Error::UnknownType(s.to_string())),
        }
    }
}

pub type Converter = Arc<dyn Fn(&str) -> Result<Value, String> + Send + Sync>;

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "f" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn is_null(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("none") || raw.eq_ignore_ascii_case("null")
}

/// Best-effort typing of an unannotated field: int, float, bool, null, then string.
pub fn guess(raw: &str) -> Value {
    if let Ok(v) = BigInt::from_str(raw) {
        return Value::Integer(v);
    }
    // f64 also parses "nan" and "inf", which are better kept as text
    if raw.bytes().any(|b| b.is_ascii_digit()) {
        if let Ok(v) = f64::from_str(raw) {
            return Value::Float(v);
        }
    }
    if raw.eq_ignore_ascii_case("true") {
        return Value::Boolean(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Boolean(false);
    }
    if is_null(raw) {
        return Value::Nil;
    }
    Value::String(raw.to_string())
}

impl DType {
    /// Empty fields become nil for every type but `str`.
    pub fn convert(&self, column: &str, raw: &str) -> Result<Value, Error> {
        let trimmed = raw.trim();
        if *self != DType::Str && trimmed.is_empty() {
            return Ok(Value::Nil);
        }
        let converted = match self {
            DType::Bool => parse_bool(trimmed).map(Value::Boolean),
            DType::Int => BigInt::from_str(trimmed).ok().map(Value::Integer),
            DType::Float => f64::from_str(trimmed).ok().map(Value::Float),
            DType::Str => Some(Value::String(raw.to_string())),
        };
        converted.ok_or_else(|| Error::Convert {
            column: column.to_string(),
            value: raw.to_string(),
            dtype: *self,
        })
    }
}

/// Per-column typing rules.
#[derive(Clone, Default)]
pub struct FieldPolicy {
    dtypes: HashMap<String, DType>,
    converters: HashMap<String, Converter>,
}

impl fmt::Debug for FieldPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FieldPolicy")
            .field("dtypes", &self.dtypes)
            .field("converters", &self.converters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FieldPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dtype(mut self, column: impl Into<String>, dtype: DType) -> Self {
        self.dtypes.insert(column.into(), dtype);
        self
    }

    pub fn with_converter<F>(mut self, column: impl Into<String>, converter: F) -> Self
    where
        F: Fn(&str) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.converters.insert(column.into(), Arc::new(converter));
        self
    }

    pub fn convert(&self, column: &str, raw: &str) -> Result<Value, Error> {
        if let Some(converter) = self.converters.get(column) {
            return converter(raw).map_err(|message| Error::Converter {
                column: column.to_string(),
                value: raw.to_string(),
                message,
            });
        }
        match self.dtypes.get(column) {
            Some(dtype) => dtype.convert(column, raw),
            None => Ok(guess(raw)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CsvOptions {
    pub delimiter: u8,
    /// Whether the first row names the columns.
    pub has_header: bool,
    /// Column names. Replace the header row when both are present.
    pub columns: Option<Vec<String>>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            has_header: true,
            columns: None,
        }
    }
}

impl CsvOptions {
    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            ..Default::default()
        }
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn without_header(mut self) -> Self {
        self.has_header = false;
        self
    }
}

/// Source layouts accepted by file uploads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputFormat {
    Delimited(CsvOptions),
    /// One JSON object per line.
    Json,
    /// Concatenated MessagePack maps.
    Msgpack,
}

impl InputFormat {
    pub fn csv() -> Self {
        InputFormat::Delimited(CsvOptions::default())
    }

    pub fn tsv() -> Self {
        InputFormat::Delimited(CsvOptions::tsv())
    }
}

impl FromStr for InputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(InputFormat::csv()),
            "tsv" => Ok(InputFormat::tsv()),
            "json" | "jsonl" => Ok(InputFormat::Json),
            "msgpack" => Ok(InputFormat::Msgpack),
            _ => Err(Error::UnknownType(s.to_string())),
        }
    }
}

pub fn read_delimited(data: &[u8], options: &CsvOptions, policy: &FieldPolicy) -> Result<Vec<Record>, Error> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter)
        .has_headers(options.has_header)
        .flexible(true)
        .from_reader(data);

    let columns: Vec<String> = match &options.columns {
        Some(columns) => columns.clone(),
        None if options.has_header => reader.headers()?.iter().map(str::to_string).collect(),
        // no names at all: positional c0, c1, ...
        None => Vec::new(),
    };

    let mut records = Vec::new();
    for (i, row) in reader.records().enumerate() {
        let row = row?;
        if !columns.is_empty() && row.len() != columns.len() {
            return Err(Error::ColumnCount {
                row: i + 1,
                expected: columns.len(),
                actual: row.len(),
            });
        }
        let mut record = Record::new();
        for (j, raw) in row.iter().enumerate() {
            let column = match columns.get(j) {
                Some(name) => name.clone(),
                None => format!("c{j}"),
            };
            let value = policy.convert(&column, raw)?;
            record.insert(column, value);
        }
        records.push(record);
    }
    tracing::debug!("parsed {} delimited rows", records.len());
    Ok(records)
}

/// Parses a whole source into records. The field policy only applies to
/// delimited input; JSON and MessagePack values arrive typed.
pub fn parse(data: &[u8], format: &InputFormat, policy: &FieldPolicy) -> Result<Vec<Record>, Error> {
    match format {
        InputFormat::Delimited(options) => read_delimited(data, options, policy),
        InputFormat::Json => {
            let mut decoder = JsonLinesDecoder::default();
            decoder.feed(data);
            let mut records = Vec::new();
            while let Some(value) = decoder.next_value()? {
                records.push(Record::try_from(value)?);
            }
            if let Some(value) = decoder.finish()? {
                records.push(Record::try_from(value)?);
            }
            Ok(records)
        }
        InputFormat::Msgpack => codec::unpack(data)
            .map(|value| Ok(Record::try_from(value?)?))
            .collect(),
    }
}

#[cfg(test)]
mod test {
    use num_bigint::BigInt;

    use crate::codec::{pack_records, Record, Value};
    use crate::parser::{guess, parse, read_delimited, CsvOptions, DType, Error, FieldPolicy, InputFormat};

    #[test]
    fn guess_order() {
        assert_eq!(guess("42"), Value::from(42));
        assert_eq!(guess("-7"), Value::from(-7));
        assert_eq!(guess("1.5"), Value::from(1.5));
        assert_eq!(guess("TRUE"), Value::from(true));
        assert_eq!(guess("false"), Value::from(false));
        assert_eq!(guess(""), Value::Nil);
        assert_eq!(guess("null"), Value::Nil);
        assert_eq!(guess("None"), Value::Nil);
        assert_eq!(guess("hello"), Value::from("hello"));
        // ints win over floats and keep full precision
        let big = "123456789012345678901234567890";
        assert_eq!(guess(big), Value::Integer(big.parse::<BigInt>().unwrap()));
    }

    #[test]
    fn dtype_conversion() {
        assert_eq!(DType::Bool.convert("c", "yes").unwrap(), Value::from(true));
        assert_eq!(DType::Bool.convert("c", "Off").unwrap(), Value::from(false));
        assert_eq!(DType::Int.convert("c", " 12 ").unwrap(), Value::from(12));
        assert_eq!(DType::Float.convert("c", "3").unwrap(), Value::from(3.0));
        assert_eq!(DType::Str.convert("c", "12").unwrap(), Value::from("12"));
        assert_eq!(DType::Int.convert("c", "").unwrap(), Value::Nil);
        match DType::Int.convert("count", "abc") {
            Err(Error::Convert { column, value, dtype }) => {
                assert_eq!(column, "count");
                assert_eq!(value, "abc");
                assert_eq!(dtype, DType::Int);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!("integer".parse::<DType>().unwrap(), DType::Int);
        assert!(matches!("date".parse::<DType>(), Err(Error::UnknownType(_))));
    }

    #[test]
    fn converter_overrides_dtype() {
        let policy = FieldPolicy::new()
            .with_dtype("id", DType::Str)
            .with_converter("id", |raw| Ok(Value::from(format!("id-{raw}"))));
        assert_eq!(policy.convert("id", "1").unwrap(), Value::from("id-1"));
    }

    #[test]
    fn converter_errors_name_the_column() {
        let policy = FieldPolicy::new().with_converter("v", |_| Err("nope".to_string()));
        let err = policy.convert("v", "x").unwrap_err();
        assert_eq!(err.to_string(), "converter for column v rejected \"x\": nope");
    }

    #[test]
    fn csv_with_header_and_policy() {
        let data = b"time,name,score,active\n1700000000,alice,1.5,y\n1700000001,bob,,n\n";
        let policy = FieldPolicy::new()
            .with_dtype("name", DType::Str)
            .with_dtype("active", DType::Bool);
        let records = read_delimited(data, &CsvOptions::default(), &policy).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0],
            Record::new()
                .with("time", 1_700_000_000)
                .with("name", "alice")
                .with("score", 1.5)
                .with("active", true)
        );
        assert_eq!(records[1].get("score"), Some(&Value::Nil));
        assert_eq!(records[1].get("active"), Some(&Value::from(false)));
    }

    #[test]
    fn tsv_with_explicit_columns() {
        let data = b"1\tx\n2\ty\n";
        let options = CsvOptions::tsv()
            .without_header()
            .with_columns(vec!["id".to_string(), "tag".to_string()]);
        let records = read_delimited(data, &options, &FieldPolicy::new()).unwrap();
        assert_eq!(records[1], Record::new().with("id", 2).with("tag", "y"));
    }

    #[test]
    fn row_length_must_match_columns() {
        let data = b"a,b\n1,2\n3\n";
        match read_delimited(data, &CsvOptions::default(), &FieldPolicy::new()) {
            Err(Error::ColumnCount { row, expected, actual }) => assert_eq!((row, expected, actual), (2, 2, 1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn json_and_msgpack_sources() {
        let records = parse(b"{\"a\":1}\n{\"a\":2}", &InputFormat::Json, &FieldPolicy::new()).unwrap();
        assert_eq!(records, vec![Record::new().with("a", 1), Record::new().with("a", 2)]);

        let packed = pack_records(&records).unwrap();
        let decoded = parse(&packed, &"msgpack".parse().unwrap(), &FieldPolicy::new()).unwrap();
        assert_eq!(decoded, records);

        assert!(parse(b"[1,2]\n", &InputFormat::Json, &FieldPolicy::new()).is_err());
    }
}
