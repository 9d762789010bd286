use std::sync::{Arc, Mutex};

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, DATE, USER_AGENT};
use reqwest::{Method, RequestBuilder};
use time::macros::format_description;
use time::OffsetDateTime;

use td_gax::clock::Clock;
use td_gax::retry::{self, RetryError, RetrySetting};

use crate::http::error::{Error, ErrorResponse};
use crate::http::response::Response;
use crate::reader::{Format, RecordReader};

/// Query or form parameters, sent in the given order.
pub type Params<'a> = [(&'a str, String)];

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Form-encoded fields.
    Form(Vec<(String, String)>),
    Bytes(Bytes),
}

/// Everything the transport needs once configuration has been resolved.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Absolute endpoint without a trailing slash.
    pub endpoint: String,
    pub apikey: String,
    pub user_agent: String,
    pub retry: RetrySetting,
    pub retry_post_requests: bool,
}

/// Authenticated HTTP transport with the retry policy of the service.
///
/// * GET and DELETE are retried on connection errors and 5xx responses.
/// * POST is retried the same way only when `retry_post_requests` is set.
/// * PUT is never retried.
///
/// Every other status is handed back to the caller unread, so the caller decides
/// how to classify 4xx responses (see [`Response::check`]).
#[derive(Debug)]
pub struct ApiClient {
    endpoint: String,
    authorization: HeaderValue,
    user_agent: HeaderValue,
    retry: RetrySetting,
    retry_post_requests: bool,
    http: Mutex<Option<reqwest::Client>>,
    clock: Arc<dyn Clock>,
}

impl ApiClient {
    pub fn new(settings: ApiSettings, http: reqwest::Client, clock: Arc<dyn Clock>) -> Result<Self, Error> {
        let mut authorization = HeaderValue::from_str(&format!("TD1 {}", settings.apikey))
            .map_err(|_| Error::Validation("API key contains characters not allowed in a header".to_string()))?;
        authorization.set_sensitive(true);
        let user_agent = HeaderValue::from_str(&settings.user_agent)
            .map_err(|_| Error::Validation(format!("invalid user agent: {}", settings.user_agent)))?;
        Ok(Self {
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            authorization,
            user_agent,
            retry: settings.retry,
            retry_post_requests: settings.retry_post_requests,
            http: Mutex::new(Some(http)),
            clock,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    /// Drops the connection pool. Returns `true` for the call that released it.
    pub fn close(&self) -> bool {
        let mut http = self.http.lock().unwrap_or_else(|e| e.into_inner());
        http.take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.http.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    fn http(&self) -> Result<reqwest::Client, Error> {
        self.http
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::Closed)
    }

    /// Default headers, then the caller's, then authorization on top.
    fn headers(&self, extra: Option<&HeaderMap>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, self.user_agent.clone());
        if let Ok(date) = HeaderValue::from_str(&http_date(OffsetDateTime::now_utc())) {
            headers.insert(DATE, date);
        }
        if let Some(extra) = extra {
            for (name, value) in extra.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers
    }

    fn build(
        &self,
        http: &reqwest::Client,
        method: Method,
        path: &str,
        params: &Params<'_>,
        body: &RequestBody,
        headers: Option<&HeaderMap>,
    ) -> RequestBuilder {
        let mut builder = http.request(method, self.url(path)).headers(self.headers(headers));
        if !params.is_empty() {
            builder = builder.query(params);
        }
        match body {
            RequestBody::Empty => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Bytes(bytes) => builder.header(CONTENT_LENGTH, bytes.len()).body(bytes.clone()),
        }
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        params: &Params<'_>,
        body: RequestBody,
        headers: Option<&HeaderMap>,
        retryable: bool,
    ) -> Result<Response, Error> {
        let http = self.http()?;
        let description = format!("{method} {path}");
        let result = retry::invoke(
            &self.retry,
            self.clock.as_ref(),
            |e: &Error| retryable && e.is_retryable(),
            |attempt| {
                tracing::debug!(attempt, "{description}");
                let builder = self.build(&http, method.clone(), path, params, &body, headers);
                send(builder, description.clone())
            },
        )
        .await;
        result.map_err(|e| match e {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted {
                last,
                attempts,
                cumulative_delay,
            } => Error::RetryExhausted {
                attempts,
                cumulative_delay,
                source: Box::new(last),
            },
        })
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn get(&self, path: &str, params: &Params<'_>, headers: Option<&HeaderMap>) -> Result<Response, Error> {
        self.execute(Method::GET, path, params, RequestBody::Empty, headers, true)
            .await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete(
        &self,
        path: &str,
        params: &Params<'_>,
        headers: Option<&HeaderMap>,
    ) -> Result<Response, Error> {
        self.execute(Method::DELETE, path, params, RequestBody::Empty, headers, true)
            .await
    }

    /// `params` go into a form body unless `body` is given, in which case they
    /// are sent as query parameters.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn post(
        &self,
        path: &str,
        params: &Params<'_>,
        body: Option<Bytes>,
        headers: Option<&HeaderMap>,
    ) -> Result<Response, Error> {
        let (params, body) = match body {
            Some(bytes) => (params, RequestBody::Bytes(bytes)),
            None if params.is_empty() => (params, RequestBody::Empty),
            None => (
                &[][..],
                RequestBody::Form(params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()),
            ),
        };
        self.execute(Method::POST, path, params, body, headers, self.retry_post_requests)
            .await
    }

    /// Single attempt. Failures, including 5xx, surface immediately.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn put(
        &self,
        path: &str,
        body: impl Into<reqwest::Body>,
        size: Option<u64>,
        headers: Option<&HeaderMap>,
    ) -> Result<Response, Error> {
        let http = self.http()?;
        let mut builder = http
            .put(self.url(path))
            .headers(self.headers(headers))
            .body(body);
        if let Some(size) = size {
            builder = builder.header(CONTENT_LENGTH, size);
        }
        tracing::debug!("PUT {path}");
        send(builder, format!("PUT {path}")).await
    }

    /// Method-dispatching entry point for collaborators that hold a method value.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: &Params<'_>,
        body: Option<Bytes>,
        headers: Option<&HeaderMap>,
    ) -> Result<Response, Error> {
        match method {
            Method::GET if body.is_none() => self.get(path, params, headers).await,
            Method::DELETE if body.is_none() => self.delete(path, params, headers).await,
            Method::POST => self.post(path, params, body, headers).await,
            Method::PUT => {
                let body = body.unwrap_or_default();
                let size = body.len() as u64;
                self.put(path, body, Some(size), headers).await
            }
            other => Err(Error::Validation(format!("unsupported request: {other} {path}"))),
        }
    }

    /// GET whose successful body is decoded as a record stream.
    pub async fn get_records(
        &self,
        path: &str,
        params: &Params<'_>,
        format: Format,
        message: &str,
    ) -> Result<RecordReader, Error> {
        let response = self.get(path, params, None).await?.check(message).await?;
        Ok(RecordReader::new(response, format))
    }
}

/// One HTTP exchange. 5xx responses are read and turned into errors so the
/// retry loop can classify them; every other status is returned unread.
async fn send(builder: RequestBuilder, description: String) -> Result<Response, Error> {
    let response = builder.send().await?;
    let status = response.status();
    if status.is_server_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(ErrorResponse::new(status, format!("{description} failed"), body).into());
    }
    Ok(Response::new(response))
}

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
fn http_date(now: OffsetDateTime) -> String {
    let format = format_description!("[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT");
    now.format(&format).unwrap_or_default()
}
