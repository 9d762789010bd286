use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use td_gax::clock::{Clock, TokioClock};
use td_gax::retry::RetrySetting;

use crate::bulk_import::BulkImport;
use crate::http::api_client::{ApiClient, ApiSettings};
use crate::http::bulk_import_client::BulkImportClient;
use crate::http::database::DatabaseDetail;
use crate::http::database_client::DatabaseClient;
use crate::http::error::Error;
use crate::http::job::IssueJobRequest;
use crate::http::job_client::JobClient;
use crate::job::Job;

pub const DEFAULT_ENDPOINT: &str = "https://api.treasuredata.com";
pub const ENV_APIKEY: &str = "TD_API_KEY";
pub const ENV_ENDPOINT: &str = "TD_API_SERVER";
pub const ENV_HTTP_PROXY: &str = "HTTP_PROXY";

/// Explicit settings. Anything left as `None` falls back to the environment,
/// then to the built-in default.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub apikey: Option<String>,
    pub endpoint: Option<String>,
    /// `host:port`, optionally with `user:password@` and a scheme.
    pub http_proxy: Option<String>,
    pub user_agent: Option<String>,
    /// POST is retried like GET when set. Leave unset for non-idempotent calls.
    pub retry_post_requests: bool,
    pub retry: RetrySetting,
    pub connect_timeout: Option<Duration>,
    /// PEM bundle of extra root certificates.
    pub ca_bundle: Option<PathBuf>,
    pub clock: Arc<dyn Clock>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            apikey: None,
            endpoint: None,
            http_proxy: None,
            user_agent: None,
            retry_post_requests: false,
            retry: RetrySetting::default(),
            connect_timeout: None,
            ca_bundle: None,
            clock: Arc::new(TokioClock),
        }
    }
}

impl ClientConfig {
    pub fn with_apikey(mut self, apikey: impl Into<String>) -> Self {
        self.apikey = Some(apikey.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Explicit value, then the environment variable, then the default. Empty
/// environment values count as unset.
fn resolve(explicit: Option<&str>, env: &str, default: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(env).ok().filter(|v| !v.trim().is_empty()))
        .or_else(|| default.map(str::to_string))
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy URL without credentials.
    pub url: String,
    pub credentials: Option<(String, String)>,
}

fn parse_proxy(proxy: &str) -> Result<ProxyConfig, Error> {
    let proxy = proxy.trim();
    let with_scheme = if proxy.contains("://") {
        proxy.to_string()
    } else {
        format!("http://{proxy}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|e| Error::Validation(format!("invalid proxy {proxy}: {e}")))?;
    let credentials = match url.username() {
        "" => None,
        user => Some((user.to_string(), url.password().unwrap_or_default().to_string())),
    };
    // only fails for URLs without a host, which parse already rejected for http
    let _ = url.set_username("");
    let _ = url.set_password(None);
    Ok(ProxyConfig {
        url: url.as_str().trim_end_matches('/').to_string(),
        credentials,
    })
}

fn build_http(config: &ClientConfig, proxy: Option<&ProxyConfig>) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(proxy) = proxy {
        let mut p = reqwest::Proxy::all(proxy.url.as_str())?;
        if let Some((user, password)) = &proxy.credentials {
            p = p.basic_auth(user, password);
        }
        builder = builder.proxy(p);
    }
    if let Some(timeout) = config.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    if let Some(path) = &config.ca_bundle {
        let pem = std::fs::read(path)?;
        for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
            builder = builder.add_root_certificate(cert);
        }
    }
    Ok(builder.build()?)
}

/// Client for the query, bulk-import and database APIs.
///
/// Every operation group shares one transport and connection pool. Clients
/// should be reused rather than created per call.
#[derive(Clone, Debug)]
pub struct Client {
    api: Arc<ApiClient>,
    job_client: JobClient,
    bulk_import_client: BulkImportClient,
    database_client: DatabaseClient,
}

impl Client {
    /// Resolves the configuration once. The environment is not read afterwards.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let apikey = resolve(config.apikey.as_deref(), ENV_APIKEY, None)
            .ok_or_else(|| Error::Validation(format!("no API key given and {ENV_APIKEY} is not set")))?;
        let endpoint = resolve(config.endpoint.as_deref(), ENV_ENDPOINT, Some(DEFAULT_ENDPOINT))
            .map(|e| normalize_endpoint(&e))
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let proxy = resolve(config.http_proxy.as_deref(), ENV_HTTP_PROXY, None)
            .map(|p| parse_proxy(&p))
            .transpose()?;
        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| format!("TD-Client-Rust/{}", env!("CARGO_PKG_VERSION")));
        tracing::debug!(endpoint = %endpoint, proxy = ?proxy.as_ref().map(|p| p.url.as_str()), "creating client");

        let http = build_http(&config, proxy.as_ref())?;
        let settings = ApiSettings {
            endpoint,
            apikey,
            user_agent,
            retry: config.retry.clone(),
            retry_post_requests: config.retry_post_requests,
        };
        let api = Arc::new(ApiClient::new(settings, http, config.clock.clone())?);
        Ok(Self {
            job_client: JobClient::new(api.clone()),
            bulk_import_client: BulkImportClient::new(api.clone()),
            database_client: DatabaseClient::new(api.clone()),
            api,
        })
    }

    pub fn endpoint(&self) -> &str {
        self.api.endpoint()
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn job(&self) -> &JobClient {
        &self.job_client
    }

    pub fn bulk_import(&self) -> &BulkImportClient {
        &self.bulk_import_client
    }

    pub fn database(&self) -> &DatabaseClient {
        &self.database_client
    }

    /// Submits a query; wait on the returned job for the result.
    pub async fn query(&self, database: &str, request: &IssueJobRequest) -> Result<Job, Error> {
        self.job_client.query(database, request).await
    }

    pub async fn create_bulk_import(&self, name: &str, database: &str, table: &str) -> Result<BulkImport, Error> {
        self.bulk_import_client.create_session(name, database, table).await
    }

    pub async fn list_databases(&self) -> Result<BTreeMap<String, DatabaseDetail>, Error> {
        self.database_client.list().await
    }

    /// Releases the connection pool. Later requests fail with [`Error::Closed`].
    /// Returns `true` only for the call that released it.
    pub fn close(&self) -> bool {
        let closed = self.api.close();
        if closed {
            tracing::debug!(endpoint = self.api.endpoint(), "client closed");
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.api.is_closed()
    }
}
