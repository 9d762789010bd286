//! Lazy record streams over open HTTP responses.
//!
//! A [`RecordReader`] owns its [`Response`] and pulls body chunks only when the
//! caller asks for the next value. It is single pass: once a value has been
//! returned it cannot be read again, and there is no way to rewind.

use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use flate2::write::GzDecoder;
use futures_util::Stream;

use crate::codec::{self, Decoder, JsonLinesDecoder, MsgpackDecoder, Record, Value};
use crate::http::error::Error;
use crate::http::response::Response;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Concatenated MessagePack values.
    Msgpack,
    /// One JSON value per line.
    Json,
    /// Body chunks passed through untouched, e.g. `csv` or `tsv` results.
    Raw,
}

/// A wire format name such as `msgpack`, `json` or `msgpack.gz`.
///
/// A `.gz` suffix means the body is gzip framed on top of the base encoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Format {
    name: String,
    encoding: Encoding,
    gzip: bool,
}

impl Format {
    pub fn msgpack() -> Self {
        Self::new("msgpack", Encoding::Msgpack, false)
    }

    pub fn msgpack_gz() -> Self {
        Self::new("msgpack.gz", Encoding::Msgpack, true)
    }

    pub fn json() -> Self {
        Self::new("json", Encoding::Json, false)
    }

    fn new(name: &str, encoding: Encoding, gzip: bool) -> Self {
        Self {
            name: name.to_string(),
            encoding,
            gzip,
        }
    }

    /// The name sent to the service.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn is_gzip(&self) -> bool {
        self.gzip
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let (base, gzip) = match name.strip_suffix(".gz") {
            Some(base) => (base, true),
            None => (name.as_str(), false),
        };
        let encoding = match base {
            "msgpack" => Encoding::Msgpack,
            "json" | "jsonl" => Encoding::Json,
            "csv" | "tsv" => Encoding::Raw,
            _ => return Err(Error::UnknownFormat(s.to_string())),
        };
        Ok(Self::new(&name, encoding, gzip))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.name.fmt(f)
    }
}

#[derive(Debug, Default)]
struct RawDecoder {
    chunks: VecDeque<Vec<u8>>,
}

impl Decoder for RawDecoder {
    fn feed(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.chunks.push_back(data.to_vec());
        }
    }

    fn next_value(&mut self) -> Result<Option<Value>, codec::Error> {
        Ok(self.chunks.pop_front().map(Value::Binary))
    }

    fn finish(&mut self) -> Result<Option<Value>, codec::Error> {
        Ok(None)
    }
}

fn decoder_for(encoding: Encoding) -> Box<dyn Decoder> {
    match encoding {
        Encoding::Msgpack => Box::<MsgpackDecoder>::default(),
        Encoding::Json => Box::<JsonLinesDecoder>::default(),
        Encoding::Raw => Box::<RawDecoder>::default(),
    }
}

pub struct RecordReader {
    response: Response,
    format: Format,
    decoder: Box<dyn Decoder>,
    gunzip: Option<GzDecoder<Vec<u8>>>,
    eof: bool,
    finished: bool,
}

impl fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecordReader")
            .field("format", &self.format)
            .field("eof", &self.eof)
            .field("finished", &self.finished)
            .finish()
    }
}

impl RecordReader {
    pub fn new(response: Response, format: Format) -> Self {
        Self {
            response,
            decoder: decoder_for(format.encoding),
            gunzip: format.gzip.then(|| GzDecoder::new(Vec::new())),
            format,
            eof: false,
            finished: false,
        }
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    /// Stops reading and releases the response.
    pub fn close(&mut self) {
        self.finished = true;
        self.response.close();
    }

    /// Next decoded value, or `None` when the body is exhausted.
    ///
    /// Raw formats yield each body chunk as [`Value::Binary`]. A decode error
    /// ends the stream and releases the response.
    pub async fn next(&mut self) -> Result<Option<Value>, Error> {
        if self.finished {
            return Ok(None);
        }
        match self.advance().await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Like [`RecordReader::next`], for streams whose values are field maps.
    pub async fn next_record(&mut self) -> Result<Option<Record>, Error> {
        match self.next().await? {
            Some(value) => Ok(Some(Record::try_from(value)?)),
            None => Ok(None),
        }
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Result<Value, Error>> + Send {
        async_stream::try_stream! {
            while let Some(value) = self.next().await? {
                yield value;
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Value>, Error> {
        loop {
            if let Some(value) = self.decoder.next_value()? {
                return Ok(Some(value));
            }
            if self.eof {
                self.finished = true;
                return Ok(self.decoder.finish()?);
            }
            match self.response.chunk().await? {
                Some(chunk) => {
                    let data = self.inflate(&chunk)?;
                    self.decoder.feed(&data);
                }
                None => {
                    let rest = self.finish_inflate()?;
                    self.decoder.feed(&rest);
                    self.eof = true;
                }
            }
        }
    }

    fn inflate(&mut self, chunk: &[u8]) -> Result<Vec<u8>, Error> {
        match self.gunzip.as_mut() {
            Some(gunzip) => {
                gunzip.write_all(chunk)?;
                Ok(std::mem::take(gunzip.get_mut()))
            }
            None => Ok(chunk.to_vec()),
        }
    }

    fn finish_inflate(&mut self) -> Result<Vec<u8>, Error> {
        match self.gunzip.as_mut() {
            Some(gunzip) => {
                gunzip.try_finish()?;
                Ok(std::mem::take(gunzip.get_mut()))
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use futures_util::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::codec::{pack_records, pack_records_gz, Record, Value};
    use crate::http::error::Error;
    use crate::http::response::Response;
    use crate::reader::{Encoding, Format, RecordReader};

    async fn serve(body: Vec<u8>) -> (MockServer, Response) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
        let response = reqwest::get(format!("{}/data", server.uri())).await.unwrap();
        (server, Response::new(response))
    }

    fn sample() -> Vec<Record> {
        (0..100)
            .map(|i| Record::new().with("id", i).with("name", format!("user{i}")))
            .collect()
    }

    #[test]
    fn parse_formats() {
        let f: Format = "msgpack.gz".parse().unwrap();
        assert_eq!(f.encoding(), Encoding::Msgpack);
        assert!(f.is_gzip());
        assert_eq!(f.name(), "msgpack.gz");

        let f: Format = "JSON".parse().unwrap();
        assert_eq!(f, Format::json());
        assert_eq!("tsv".parse::<Format>().unwrap().encoding(), Encoding::Raw);
        assert!(matches!("parquet".parse::<Format>(), Err(Error::UnknownFormat(_))));
    }

    #[tokio::test]
    async fn msgpack_records() {
        let records = sample();
        let (_server, response) = serve(pack_records(&records).unwrap()).await;
        let mut reader = RecordReader::new(response, Format::msgpack());
        let mut out = vec![];
        while let Some(record) = reader.next_record().await.unwrap() {
            out.push(record);
        }
        assert_eq!(out, records);
        // exhausted readers stay exhausted
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gzip_msgpack_records() {
        let records = sample();
        let (_server, response) = serve(pack_records_gz(&records).unwrap()).await;
        let reader = RecordReader::new(response, Format::msgpack_gz());
        let out: Vec<Value> = reader.into_stream().map(|v| v.unwrap()).collect().await;
        assert_eq!(out.len(), 100);
        assert_eq!(Record::try_from(out[42].clone()).unwrap(), records[42]);
    }

    #[tokio::test]
    async fn json_lines() {
        let (_server, response) = serve(b"[1,\"a\"]\n[2,\"b\"]\n".to_vec()).await;
        let mut reader = RecordReader::new(response, "json".parse().unwrap());
        assert_eq!(
            reader.next().await.unwrap(),
            Some(Value::Array(vec![Value::from(1), Value::from("a")]))
        );
        assert_eq!(
            reader.next().await.unwrap(),
            Some(Value::Array(vec![Value::from(2), Value::from("b")]))
        );
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn gzip_json_lines() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"k\":\"v\"}\n").unwrap();
        let (_server, response) = serve(encoder.finish().unwrap()).await;
        let mut reader = RecordReader::new(response, "json.gz".parse().unwrap());
        let record = reader.next_record().await.unwrap().unwrap();
        assert_eq!(record.get("k"), Some(&Value::from("v")));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_passthrough() {
        let (_server, response) = serve(b"a,b\n1,2\n".to_vec()).await;
        let mut reader = RecordReader::new(response, "csv".parse().unwrap());
        let mut body = vec![];
        while let Some(Value::Binary(chunk)) = reader.next().await.unwrap() {
            body.extend(chunk);
        }
        assert_eq!(body, b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn malformed_unit_errors_after_good_ones() {
        let mut body = pack_records(&sample()[..2]).unwrap();
        body.push(0xc1);
        let (_server, response) = serve(body).await;
        let mut reader = RecordReader::new(response, Format::msgpack());
        assert!(reader.next().await.unwrap().is_some());
        assert!(reader.next().await.unwrap().is_some());
        assert!(matches!(reader.next().await, Err(Error::Codec(_))));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_body_errors_at_end() {
        let body = pack_records(&sample()[..1]).unwrap();
        let (_server, response) = serve(body[..body.len() - 1].to_vec()).await;
        let mut reader = RecordReader::new(response, Format::msgpack());
        assert!(matches!(reader.next().await, Err(Error::Codec(_))));
    }

    #[tokio::test]
    async fn close_releases_response() {
        let (_server, response) = serve(pack_records(&sample()).unwrap()).await;
        let mut reader = RecordReader::new(response, Format::msgpack());
        assert!(reader.next().await.unwrap().is_some());
        reader.close();
        assert!(reader.next().await.unwrap().is_none());
    }
}
