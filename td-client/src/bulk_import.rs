//! Bulk-import sessions.
//!
//! A session moves through `uploading -> performing -> ready -> committing ->
//! committed`. Parts are uploaded while the session is unfrozen, `perform`
//! validates and converts them in a job, and `commit` makes the result visible
//! in the target table.

use td_gax::poll::{poll_until, PollError, PollSetting};

use crate::codec::{self, Record};
use crate::http::bulk_import::{BulkImportDetail, BulkImportStatus};
use crate::http::bulk_import_client::BulkImportClient;
use crate::http::error::Error;
use crate::job::{Job, OnTick};
use crate::parser::{self, FieldPolicy, InputFormat};
use crate::reader::RecordReader;
use crate::source::Source;

/// Handle to one session. The local state is a cache refreshed after every
/// operation that changes the session.
#[derive(Debug, Clone)]
pub struct BulkImport {
    client: BulkImportClient,
    detail: BulkImportDetail,
}

impl BulkImport {
    pub(crate) fn new(client: BulkImportClient, detail: BulkImportDetail) -> Self {
        Self { client, detail }
    }

    pub fn name(&self) -> &str {
        self.detail.name.as_str()
    }

    pub fn database(&self) -> &str {
        self.detail.database.as_str()
    }

    pub fn table(&self) -> &str {
        self.detail.table.as_str()
    }

    pub fn status(&self) -> BulkImportStatus {
        self.detail.status
    }

    pub fn upload_frozen(&self) -> bool {
        self.detail.upload_frozen
    }

    pub fn job_id(&self) -> Option<&str> {
        self.detail.job_id.as_deref()
    }

    pub fn detail(&self) -> &BulkImportDetail {
        &self.detail
    }

    pub async fn update(&mut self) -> Result<&BulkImportDetail, Error> {
        self.detail = self.client.show(&self.detail.name).await?;
        tracing::trace!(bulk_import = %self.detail.name, status = %self.detail.status, frozen = self.detail.upload_frozen, "bulk import refreshed");
        Ok(&self.detail)
    }

    pub async fn freeze(&mut self) -> Result<(), Error> {
        self.client.freeze(&self.detail.name).await?;
        self.update().await?;
        Ok(())
    }

    pub async fn unfreeze(&mut self) -> Result<(), Error> {
        self.client.unfreeze(&self.detail.name).await?;
        self.update().await?;
        Ok(())
    }

    /// Starts converting the uploaded parts.
    ///
    /// The session is refreshed first and must be frozen, otherwise nothing is
    /// sent. With `wait`, the returned job has finished or the wait timed out;
    /// the session is refreshed again in both cases.
    pub async fn perform(&mut self, wait: Option<&PollSetting>) -> Result<Job, Error> {
        self.perform_with(wait, None).await
    }

    /// Same as [`BulkImport::perform`], calling `on_tick` after every sleep
    /// of the job wait. It is never called without `wait`.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn perform_with(&mut self, wait: Option<&PollSetting>, on_tick: Option<OnTick<'_>>) -> Result<Job, Error> {
        self.update().await?;
        if !self.detail.upload_frozen {
            return Err(Error::Validation(format!(
                "bulk import {} must be frozen before perform",
                self.detail.name
            )));
        }
        let job_id = self.client.perform(&self.detail.name).await?;
        tracing::debug!(bulk_import = %self.detail.name, job_id = %job_id, "perform started");
        let mut job = self.client.job_client().job(job_id);
        let waited = match wait {
            Some(setting) => job.wait_with(setting, on_tick).await.map(|_| ()),
            None => Ok(()),
        };
        let refreshed = self.update().await.map(|_| ());
        waited?;
        refreshed?;
        Ok(job)
    }

    /// Makes the performed data visible. With `wait`, returns once the session
    /// reports `committed`; a timeout leaves the commit running remotely.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn commit(&mut self, wait: Option<&PollSetting>) -> Result<(), Error> {
        self.client.commit(&self.detail.name).await?;
        let setting = match wait {
            Some(setting) => setting,
            None => {
                self.update().await?;
                return Ok(());
            }
        };
        let client = &self.client;
        let name = self.detail.name.as_str();
        // every fetched state is kept, so a failed wait still leaves the last one seen
        let mut latest = None;
        let outcome = poll_until(
            setting.clone(),
            client.clock(),
            || client.show(name),
            |detail: &BulkImportDetail| {
                latest = Some(detail.clone());
                detail.status == BulkImportStatus::Committed
            },
        )
        .await
        .map(|_| ())
        .map_err(|e| match e {
            PollError::Timeout(t) => Error::WaitTimeout {
                operation: format!("commit of bulk import {name}"),
                elapsed: t.elapsed,
            },
            PollError::Operation(e) => e,
        });
        if let Some(detail) = latest {
            self.detail = detail;
        }
        outcome
    }

    pub async fn delete(self) -> Result<(), Error> {
        self.client.delete(&self.detail.name).await
    }

    /// Current part names. Does not refresh the session.
    pub async fn list_parts(&self) -> Result<Vec<String>, Error> {
        self.client.list_parts(&self.detail.name).await
    }

    /// Uploads pre-encoded `msgpack.gz` data as one part.
    pub async fn upload_part(&mut self, part_name: &str, source: impl Into<Source>) -> Result<(), Error> {
        self.client
            .upload_part(&self.detail.name, part_name, source.into())
            .await?;
        self.update().await?;
        Ok(())
    }

    /// Encodes `records` as `msgpack.gz` and uploads them as one part.
    pub async fn upload_records(&mut self, part_name: &str, records: &[Record]) -> Result<(), Error> {
        let data = codec::pack_records_gz(records)?;
        tracing::debug!(part = part_name, records = records.len(), bytes = data.len(), "packed part");
        self.upload_part(part_name, data).await
    }

    /// Reads a csv, tsv, json-lines or msgpack file, types its fields and
    /// uploads the result as one part. A `.gz` path is decompressed first.
    pub async fn upload_file(
        &mut self,
        part_name: &str,
        source: impl Into<Source>,
        format: &InputFormat,
        policy: &FieldPolicy,
    ) -> Result<(), Error> {
        let data = source.into().read_decompressed().await?;
        let records = parser::parse(&data, format, policy)?;
        self.upload_records(part_name, &records).await
    }

    pub async fn delete_part(&mut self, part_name: &str) -> Result<(), Error> {
        self.client.delete_part(&self.detail.name, part_name).await?;
        self.update().await?;
        Ok(())
    }

    pub async fn error_records(&self) -> Result<RecordReader, Error> {
        self.client.error_records(&self.detail.name).await
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    use flate2::read::GzDecoder;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use td_gax::clock::ManualClock;
    use td_gax::poll::PollSetting;

    use crate::bulk_import::BulkImport;
    use crate::codec::{unpack, Record, Value};
    use crate::http::api_client::test::create_api_client;
    use crate::http::bulk_import::BulkImportStatus;
    use crate::http::bulk_import_client::BulkImportClient;
    use crate::http::error::Error;
    use crate::parser::{DType, FieldPolicy, InputFormat};

    fn session_body(status: &str, frozen: bool, job_id: Option<&str>) -> serde_json::Value {
        json!({
            "name": "session", "database": "db", "table": "tbl", "status": status,
            "upload_frozen": frozen, "job_id": job_id,
            "valid_records": 0, "error_records": 0, "valid_parts": 0, "error_parts": 0
        })
    }

    async fn show_once(server: &MockServer, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/show/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .up_to_n_times(1)
            .mount(server)
            .await;
    }

    async fn ok(server: &MockServer, verb: &str, p: &str, calls: u64) {
        Mock::given(method(verb))
            .and(path(p))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(calls)
            .mount(server)
            .await;
    }

    async fn create_session(server: &MockServer, clock: &ManualClock) -> BulkImport {
        show_once(server, session_body("uploading", false, None)).await;
        let client = BulkImportClient::new(Arc::new(create_api_client(&server.uri(), clock, false)));
        client.session("session").await.unwrap()
    }

    fn gunzip_records(body: &[u8]) -> Vec<Record> {
        let mut raw = Vec::new();
        GzDecoder::new(body).read_to_end(&mut raw).unwrap();
        unpack(&raw).map(|v| Record::try_from(v.unwrap()).unwrap()).collect()
    }

    #[tokio::test]
    async fn perform_requires_frozen_upload() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;
        show_once(&server, session_body("uploading", false, None)).await;
        Mock::given(method("POST"))
            .and(path("/v3/bulk_import/perform/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "1"})))
            .expect(0)
            .mount(&server)
            .await;

        assert!(matches!(session.perform(None).await, Err(Error::Validation(_))));
        assert!(!session.upload_frozen());
    }

    #[tokio::test]
    async fn freeze_perform_wait_commit() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;

        ok(&server, "POST", "/v3/bulk_import/freeze/session", 1).await;
        show_once(&server, session_body("uploading", true, None)).await;
        session.freeze().await.unwrap();
        assert!(session.upload_frozen());

        // perform refreshes first, waits on the job, then refreshes again
        show_once(&server, session_body("uploading", true, None)).await;
        Mock::given(method("POST"))
            .and(path("/v3/bulk_import/perform/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "99", "bulk_import": "session"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/job/status/99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "99", "status": "running"})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/job/status/99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "99", "status": "success"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/job/show/99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "99", "status": "success"})))
            .expect(1)
            .mount(&server)
            .await;
        show_once(&server, session_body("ready", true, Some("99"))).await;
        let job = session.perform(Some(&PollSetting::default())).await.unwrap();
        assert_eq!(job.id(), "99");
        assert_eq!(session.status(), BulkImportStatus::Ready);
        assert_eq!(session.job_id(), Some("99"));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(5)]);

        ok(&server, "POST", "/v3/bulk_import/commit/session", 1).await;
        show_once(&server, session_body("committing", true, Some("99"))).await;
        show_once(&server, session_body("committing", true, Some("99"))).await;
        show_once(&server, session_body("committed", true, Some("99"))).await;
        session.commit(Some(&PollSetting::default())).await.unwrap();
        assert_eq!(session.status(), BulkImportStatus::Committed);
        assert_eq!(clock.sleeps().len(), 3);
    }

    #[tokio::test]
    async fn perform_refreshes_even_when_wait_times_out() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;

        show_once(&server, session_body("uploading", true, None)).await;
        Mock::given(method("POST"))
            .and(path("/v3/bulk_import/perform/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "7"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/job/status/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "7", "status": "running"})))
            .mount(&server)
            .await;
        show_once(&server, session_body("performing", true, Some("7"))).await;

        let setting = PollSetting::default().with_timeout(Duration::from_secs(1));
        assert!(matches!(
            session.perform(Some(&setting)).await,
            Err(Error::WaitTimeout { .. })
        ));
        assert_eq!(session.status(), BulkImportStatus::Performing);
        assert_eq!(session.job_id(), Some("7"));
    }

    #[tokio::test]
    async fn commit_wait_times_out() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;
        ok(&server, "POST", "/v3/bulk_import/commit/session", 1).await;
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/show/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body("committing", true, None)))
            .mount(&server)
            .await;

        let setting = PollSetting::default().with_timeout(Duration::from_secs(7));
        match session.commit(Some(&setting)).await {
            Err(Error::WaitTimeout { operation, elapsed }) => {
                assert_eq!(operation, "commit of bulk import session");
                assert_eq!(elapsed, Duration::from_secs(10));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(clock.sleeps().len(), 2);
        assert_eq!(session.status(), BulkImportStatus::Committing);
        assert!(session.upload_frozen());
    }

    #[tokio::test]
    async fn commit_keeps_last_state_when_a_check_fails() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;
        ok(&server, "POST", "/v3/bulk_import/commit/session", 1).await;
        show_once(&server, session_body("committing", true, Some("3"))).await;
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/show/session"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let result = session.commit(Some(&PollSetting::default())).await;
        assert_eq!(result.unwrap_err().status(), Some(403));
        assert_eq!(session.status(), BulkImportStatus::Committing);
        assert_eq!(session.job_id(), Some("3"));
    }

    #[tokio::test]
    async fn perform_calls_back_on_every_tick() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;
        show_once(&server, session_body("uploading", true, None)).await;
        Mock::given(method("POST"))
            .and(path("/v3/bulk_import/perform/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "8"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/job/status/8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "8", "status": "running"})))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/job/status/8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "8", "status": "success"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v3/job/show/8"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_id": "8", "status": "success"})))
            .expect(1)
            .mount(&server)
            .await;
        show_once(&server, session_body("ready", true, Some("8"))).await;

        let mut seen = Vec::new();
        let mut on_tick = |job: &crate::job::Job| -> Result<(), Error> {
            seen.push(job.id().to_string());
            Ok(())
        };
        let job = session
            .perform_with(Some(&PollSetting::default()), Some(&mut on_tick))
            .await
            .unwrap();
        assert_eq!(job.id(), "8");
        assert_eq!(seen, vec!["8", "8"]);
        assert_eq!(session.status(), BulkImportStatus::Ready);
    }

    #[tokio::test]
    async fn upload_records_then_refresh() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;
        ok(&server, "PUT", "/v3/bulk_import/upload_part/session/part-1", 1).await;
        let mut refreshed = session_body("uploading", false, None);
        refreshed["valid_parts"] = json!(1);
        show_once(&server, refreshed).await;

        let records = vec![
            Record::new().with("time", 1_700_000_000).with("v", "a"),
            Record::new().with("time", 1_700_000_001).with("v", "b"),
        ];
        session.upload_records("part-1", &records).await.unwrap();
        assert_eq!(session.detail().valid_parts, Some(1));

        let requests = server.received_requests().await.unwrap();
        let put = requests.iter().find(|r| r.method.as_str() == "PUT").unwrap();
        assert_eq!(gunzip_records(&put.body), records);
    }

    #[tokio::test]
    async fn upload_csv_file_with_policy() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;
        ok(&server, "PUT", "/v3/bulk_import/upload_part/session/csv", 1).await;
        show_once(&server, session_body("uploading", false, None)).await;

        let policy = FieldPolicy::new().with_dtype("code", DType::Str);
        let csv = b"time,code,price\n1700000000,007,1.25\n".to_vec();
        session
            .upload_file("csv", csv, &InputFormat::csv(), &policy)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let put = requests.iter().find(|r| r.method.as_str() == "PUT").unwrap();
        let uploaded = gunzip_records(&put.body);
        assert_eq!(uploaded[0].get("code"), Some(&Value::from("007")));
        assert_eq!(uploaded[0].get("price"), Some(&Value::from(1.25)));
    }

    #[tokio::test]
    async fn part_listing_does_not_refresh() {
        let server = MockServer::start().await;
        let clock = ManualClock::new();
        let mut session = create_session(&server, &clock).await;
        Mock::given(method("GET"))
            .and(path("/v3/bulk_import/list_parts/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"parts": ["a"]})))
            .mount(&server)
            .await;
        ok(&server, "POST", "/v3/bulk_import/delete_part/session/a", 1).await;
        show_once(&server, session_body("uploading", false, None)).await;

        assert_eq!(session.list_parts().await.unwrap(), vec!["a"]);
        session.delete_part("a").await.unwrap();

        let shows = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/v3/bulk_import/show/session")
            .count();
        // one for the handle, one after delete_part
        assert_eq!(shows, 2);
    }
}
