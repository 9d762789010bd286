use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;

use crate::http::error::Error;

/// Upload input. A path is opened when the body is built, so nothing is read
/// before the request goes out.
pub enum Source {
    Path(PathBuf),
    Bytes(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Source::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Source::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Source::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl Source {
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Source::Reader(Box::new(reader))
    }

    /// Only paths carry a name, so only a `.gz` path is known to be compressed.
    pub fn is_gzip(&self) -> bool {
        match self {
            Source::Path(path) => path.extension().is_some_and(|ext| ext == "gz"),
            _ => false,
        }
    }

    /// Streaming request body plus its length when known up front.
    pub async fn into_body(self) -> Result<(reqwest::Body, Option<u64>), Error> {
        match self {
            Source::Path(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let size = file.metadata().await?.len();
                Ok((reqwest::Body::wrap_stream(ReaderStream::new(file)), Some(size)))
            }
            Source::Bytes(bytes) => {
                let size = bytes.len() as u64;
                Ok((reqwest::Body::from(bytes), Some(size)))
            }
            Source::Reader(reader) => Ok((reqwest::Body::wrap_stream(ReaderStream::new(reader)), None)),
        }
    }

    pub async fn read_all(self) -> Result<Vec<u8>, Error> {
        match self {
            Source::Path(path) => Ok(tokio::fs::read(path).await?),
            Source::Bytes(bytes) => Ok(bytes.to_vec()),
            Source::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(buf)
            }
        }
    }

    /// Whole content, gunzipped when the source is a `.gz` path.
    pub async fn read_decompressed(self) -> Result<Vec<u8>, Error> {
        let gzip = self.is_gzip();
        let data = self.read_all().await?;
        if !gzip {
            return Ok(data);
        }
        let mut out = Vec::new();
        GzDecoder::new(data.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Source::Path(path)
    }
}

impl From<&Path> for Source {
    fn from(path: &Path) -> Self {
        Source::Path(path.to_path_buf())
    }
}

impl From<Bytes> for Source {
    fn from(bytes: Bytes) -> Self {
        Source::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Source {
    fn from(bytes: Vec<u8>) -> Self {
        Source::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Source {
    fn from(bytes: &'static [u8]) -> Self {
        Source::Bytes(Bytes::from_static(bytes))
    }
}
