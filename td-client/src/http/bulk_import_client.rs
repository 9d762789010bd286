use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};

use td_gax::clock::Clock;

use crate::bulk_import::BulkImport;
use crate::http::api_client::ApiClient;
use crate::http::api_path;
use crate::http::bulk_import::{BulkImportDetail, ListBulkImportsResponse, ListPartsResponse, PerformResponse};
use crate::http::error::Error;
use crate::http::job_client::JobClient;
use crate::reader::{Format, RecordReader};
use crate::source::Source;

/// Rejects names that cannot be used as a single path segment.
pub(crate) fn validate_name(kind: &str, name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::Validation(format!("{kind} name must not be empty")));
    }
    if name.contains('/') {
        return Err(Error::Validation(format!("{kind} name must not contain '/': {name}")));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct BulkImportClient {
    inner: Arc<ApiClient>,
}

impl BulkImportClient {
    pub fn new(inner: Arc<ApiClient>) -> Self {
        Self { inner }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock()
    }

    /// Job client over the same transport, for the jobs a perform starts.
    pub fn job_client(&self) -> JobClient {
        JobClient::new(self.inner.clone())
    }

    async fn post_empty(&self, path: &str, message: &str) -> Result<(), Error> {
        self.inner.post(path, &[], None, None).await?.check(message).await?;
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn create(&self, name: &str, database: &str, table: &str) -> Result<(), Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "create", name, database, table])?;
        self.post_empty(&path, "Create bulk import failed").await
    }

    /// Creates the session and returns a handle holding its initial state.
    pub async fn create_session(&self, name: &str, database: &str, table: &str) -> Result<BulkImport, Error> {
        self.create(name, database, table).await?;
        self.session(name).await
    }

    /// Handle for an existing session.
    pub async fn session(&self, name: &str) -> Result<BulkImport, Error> {
        let detail = self.show(name).await?;
        Ok(BulkImport::new(self.clone(), detail))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn show(&self, name: &str) -> Result<BulkImportDetail, Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "show", name])?;
        let response = self
            .inner
            .get(&path, &[], None)
            .await?
            .check("Show bulk import failed")
            .await?;
        response.json().await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn list(&self) -> Result<Vec<BulkImportDetail>, Error> {
        let response = self
            .inner
            .get("/v3/bulk_import/list", &[], None)
            .await?
            .check("List bulk imports failed")
            .await?;
        let body: ListBulkImportsResponse = response.json().await?;
        Ok(body.bulk_imports)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete(&self, name: &str) -> Result<(), Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "delete", name])?;
        self.post_empty(&path, "Delete bulk import failed").await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn freeze(&self, name: &str) -> Result<(), Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "freeze", name])?;
        self.post_empty(&path, "Freeze bulk import failed").await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn unfreeze(&self, name: &str) -> Result<(), Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "unfreeze", name])?;
        self.post_empty(&path, "Unfreeze bulk import failed").await
    }

    /// Starts the job that validates and converts the uploaded parts.
    /// Returns the job id.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn perform(&self, name: &str) -> Result<String, Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "perform", name])?;
        let response = self
            .inner
            .post(&path, &[], None, None)
            .await?
            .check("Perform bulk import failed")
            .await?;
        let body: PerformResponse = response.json().await?;
        body.job_id
            .ok_or_else(|| Error::Validation("the service returned no job id".to_string()))
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn commit(&self, name: &str) -> Result<(), Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "commit", name])?;
        self.post_empty(&path, "Commit bulk import failed").await
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn list_parts(&self, name: &str) -> Result<Vec<String>, Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "list_parts", name])?;
        let response = self
            .inner
            .get(&path, &[], None)
            .await?
            .check("List bulk import parts failed")
            .await?;
        let body: ListPartsResponse = response.json().await?;
        Ok(body.parts)
    }

    /// Uploads a part as is. The data must already be `msgpack.gz`. Not retried.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn upload_part(&self, name: &str, part_name: &str, source: Source) -> Result<(), Error> {
        validate_name("bulk import", name)?;
        validate_name("part", part_name)?;
        let path = api_path(&["v3", "bulk_import", "upload_part", name, part_name])?;
        let (body, size) = source.into_body().await?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        self.inner
            .put(&path, body, size, Some(&headers))
            .await?
            .check("Upload a part failed")
            .await?;
        tracing::debug!(bulk_import = name, part = part_name, "part uploaded");
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn delete_part(&self, name: &str, part_name: &str) -> Result<(), Error> {
        validate_name("bulk import", name)?;
        validate_name("part", part_name)?;
        let path = api_path(&["v3", "bulk_import", "delete_part", name, part_name])?;
        self.post_empty(&path, "Delete a part failed").await
    }

    /// Records rejected by the last perform.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn error_records(&self, name: &str) -> Result<RecordReader, Error> {
        validate_name("bulk import", name)?;
        let path = api_path(&["v3", "bulk_import", "error_records", name])?;
        self.inner
            .get_records(&path, &[], Format::msgpack_gz(), "Failed to get bulk import error records")
            .await
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use serde_json::json;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use td_gax::clock::ManualClock;

    use crate::codec::{pack_records_gz, Record, Value};
    use crate::http::api_client::test::create_api_client;
    use crate::http::bulk_import::BulkImportStatus;
    use crate::http::bulk_import_client::BulkImportClient;
    use crate::http::error::{Error, ErrorKind};
    use crate::source::Source;

    fn create_bulk_import_client(server: &MockServer) -> BulkImportClient {
        BulkImportClient::new(Arc::new(create_api_client(&server.uri(), &ManualClock::new(), false)))
    }

    #[tokio::test]
    async fn invalid_part_names_never_reach_the_network() {
        let server = MockServer::start().await;
        let client = create_bulk_import_client(&server);
        for part in ["", "a/b"] {
            let result = client.upload_part("session", part, Source::from(vec![1u8])).await;
            assert!(matches!(result, Err(Error::Validation(_))), "{part}");
            assert!(matches!(client.delete_part("session", part).await, Err(Error::Validation(_))));
        }
        assert!(matches!(client.show("").await, Err(Error::Validation(_))));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_part_puts_raw_bytes() {
        let server = MockServer::start().await;
        let data = pack_records_gz(&[Record::new().with("time", 1)]).unwrap();
        Mock::given(method("PUT"))
            .and(path("/v3/bulk_import/upload_part/session/part-1"))
            .and(header("content-type", "application/octet-stream"))
            .and(body_bytes(data.clone()))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let client = create_bulk_import_client(&server);
        client.upload_part("session", "part-1", Source::from(data)).await.unwrap();
    }

    #[tokio::test]
    async fn show_list_and_parts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/show/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "session", "database": "db", "table": "tbl", "status": "uploading", "upload_frozen": false
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "bulk_imports": [{"name": "session", "status": "committed", "upload_frozen": true}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/list_parts/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"name": "session", "parts": ["p1", "p2"]})))
            .mount(&server)
            .await;
        let client = create_bulk_import_client(&server);

        let detail = client.show("session").await.unwrap();
        assert_eq!(detail.table, "tbl");
        assert_eq!(detail.status, BulkImportStatus::Uploading);
        let all = client.list().await.unwrap();
        assert_eq!(all[0].status, BulkImportStatus::Committed);
        assert_eq!(client.list_parts("session").await.unwrap(), vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn create_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/bulk_import/create/session/db/tbl"))
            .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
            .mount(&server)
            .await;
        let client = create_bulk_import_client(&server);
        match client.create("session", "db", "tbl").await {
            Err(Error::Response(e)) => assert_eq!(e.kind, ErrorKind::AlreadyExists),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_records_stream() {
        let server = MockServer::start().await;
        let rejected = vec![Record::new().with("time", "not a number")];
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/error_records/session"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(pack_records_gz(&rejected).unwrap()))
            .mount(&server)
            .await;
        let client = create_bulk_import_client(&server);
        let mut reader = client.error_records("session").await.unwrap();
        let record = reader.next_record().await.unwrap().unwrap();
        assert_eq!(record.get("time"), Some(&Value::from("not a number")));
        assert!(reader.next().await.unwrap().is_none());
    }
}
