use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use crate::http::error::{Error, ErrorResponse};

/// A response whose body has not been read yet.
///
/// The connection is released when the body is consumed, when [`Response::close`]
/// is called, or when the value is dropped, whichever comes first.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    inner: Option<reqwest::Response>,
}

impl Response {
    pub(crate) fn new(inner: reqwest::Response) -> Self {
        Self {
            status: inner.status(),
            headers: inner.headers().clone(),
            inner: Some(inner),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Releases the underlying connection. Returns `true` only for the call
    /// that actually released it; later calls are no-ops.
    pub fn close(&mut self) -> bool {
        match self.inner.take() {
            Some(inner) => {
                drop(inner);
                true
            }
            None => false,
        }
    }

    fn take(&mut self) -> Result<reqwest::Response, Error> {
        self.inner.take().ok_or(Error::Closed)
    }

    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        Ok(self.take()?.bytes().await?)
    }

    pub async fn text(mut self) -> Result<String, Error> {
        Ok(self.take()?.text().await?)
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        let body = self.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Next chunk of the body. The response closes itself once the body is exhausted.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        let inner = match self.inner.as_mut() {
            Some(inner) => inner,
            None => return Ok(None),
        };
        match inner.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e.into())
            }
        }
    }

    /// Returns the response unchanged when it is a 2xx, otherwise reads the
    /// body and converts it into a classified [`ErrorResponse`].
    pub async fn check(self, message: &str) -> Result<Self, Error> {
        if self.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let body = self.text().await.unwrap_or_default();
        Err(ErrorResponse::new(status, message, body).into())
    }
}
