use std::collections::BTreeMap;
use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use crate::codec::{self, Record};
use crate::http::api_client::ApiClient;
use crate::http::api_path;
use crate::http::database::{DatabaseDetail, ImportResult, ListDatabasesResponse};
use crate::http::error::Error;
use crate::source::Source;

#[derive(Clone, Debug)]
pub struct DatabaseClient {
    inner: Arc<ApiClient>,
}

impl DatabaseClient {
    pub fn new(inner: Arc<ApiClient>) -> Self {
        Self { inner }
    }

    /// Databases keyed by name.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn list(&self) -> Result<BTreeMap<String, DatabaseDetail>, Error> {
        let response = self
            .inner
            .get("/v3/database/list", &[], None)
            .await?
            .check("List databases failed")
            .await?;
        let body: ListDatabasesResponse = response.json().await?;
        Ok(body.databases.into_iter().map(|d| (d.name.clone(), d)).collect())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn create(&self, database: &str) -> Result<(), Error> {
        let path = api_path(&["v3", "database", "create", database])?;
        self.inner
            .post(&path, &[], None, None)
            .await?
            .check(&format!("Create database failed: {database}"))
            .await?;
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete(&self, database: &str) -> Result<(), Error> {
        let path = api_path(&["v3", "database", "delete", database])?;
        self.inner
            .post(&path, &[], None, None)
            .await?
            .check(&format!("Delete database failed: {database}"))
            .await?;
        Ok(())
    }

    /// One-shot import of a whole file into a table. `format` names the body
    /// layout, e.g. `msgpack.gz`. Not retried.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn import(&self, database: &str, table: &str, format: &str, source: Source) -> Result<ImportResult, Error> {
        let path = api_path(&["v3", "table", "import", database, table, format])?;
        let (body, size) = source.into_body().await?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        let response = self
            .inner
            .put(&path, body, size, Some(&headers))
            .await?
            .check("Import failed")
            .await?;
        let result: ImportResult = response.json().await?;
        tracing::debug!(database, table, elapsed = result.elapsed_time, "import finished");
        Ok(result)
    }

    pub async fn import_records(&self, database: &str, table: &str, records: &[Record]) -> Result<ImportResult, Error> {
        let data = codec::pack_records_gz(records)?;
        self.import(database, table, "msgpack.gz", Source::from(data)).await
    }
}
