use std::sync::Arc;

use td_gax::clock::Clock;

use crate::http::api_client::ApiClient;
use crate::http::api_path;
use crate::http::error::Error;
use crate::http::job::{
    IssueJobRequest, IssueJobResponse, JobDetail, JobStatus, JobStatusResponse, KillJobResponse, ListJobsResponse,
};
use crate::job::Job;
use crate::reader::{Format, RecordReader};

#[derive(Clone, Debug)]
pub struct JobClient {
    inner: Arc<ApiClient>,
}

impl JobClient {
    pub fn new(inner: Arc<ApiClient>) -> Self {
        Self { inner }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock()
    }

    /// Submits a query and returns the id of the new job.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn issue(&self, database: &str, request: &IssueJobRequest) -> Result<String, Error> {
        let path = api_path(&["v3", "job", "issue", request.job_type.as_str(), database])?;
        let response = self
            .inner
            .post(&path, &request.to_params(), None, None)
            .await?
            .check("Query failed")
            .await?;
        let body: IssueJobResponse = response.json().await?;
        let job_id = body
            .job_id
            .ok_or_else(|| Error::Validation("the service returned no job id".to_string()))?;
        tracing::debug!(job_id = %job_id, database, "issued {} job", request.job_type.as_str());
        Ok(job_id)
    }

    /// Submits a query and returns a handle for waiting on it.
    pub async fn query(&self, database: &str, request: &IssueJobRequest) -> Result<Job, Error> {
        let job_id = self.issue(database, request).await?;
        Ok(Job::new(self.clone(), job_id))
    }

    /// Handle for a job submitted earlier.
    pub fn job(&self, job_id: impl Into<String>) -> Job {
        Job::new(self.clone(), job_id.into())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn show(&self, job_id: &str) -> Result<JobDetail, Error> {
        let path = api_path(&["v3", "job", "show", job_id])?;
        let response = self.inner.get(&path, &[], None).await?.check("Show job failed").await?;
        response.json().await
    }

    /// Status only, without the rest of the detail.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn status(&self, job_id: &str) -> Result<JobStatus, Error> {
        let path = api_path(&["v3", "job", "status", job_id])?;
        let response = self
            .inner
            .get(&path, &[], None)
            .await?
            .check("Get job status failed")
            .await?;
        let body: JobStatusResponse = response.json().await?;
        Ok(body.status)
    }

    /// Returns the status the job had when the kill was accepted.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn kill(&self, job_id: &str) -> Result<Option<JobStatus>, Error> {
        let path = api_path(&["v3", "job", "kill", job_id])?;
        let response = self
            .inner
            .post(&path, &[], None, None)
            .await?
            .check("Kill job failed")
            .await?;
        let body: KillJobResponse = response.json().await?;
        Ok(body.former_status)
    }

    /// Jobs in `[from, to]` of the newest-first listing.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn list(&self, from: u64, to: Option<u64>, status: Option<JobStatus>) -> Result<Vec<JobDetail>, Error> {
        let mut params = vec![("from", from.to_string())];
        if let Some(to) = to {
            params.push(("to", to.to_string()));
        }
        if let Some(status) = status {
            params.push(("status", status.to_string()));
        }
        let response = self
            .inner
            .get("/v3/job/list", &params, None)
            .await?
            .check("List jobs failed")
            .await?;
        let body: ListJobsResponse = response.json().await?;
        Ok(body.jobs)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn result(&self, job_id: &str, format: Format) -> Result<RecordReader, Error> {
        let path = api_path(&["v3", "job", "result", job_id])?;
        let params = [("format", format.name().to_string())];
        self.inner
            .get_records(&path, &params, format, "Get job result failed")
            .await
    }
}
