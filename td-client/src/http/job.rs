use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Booting,
    Running,
    Success,
    Error,
    Killed,
    /// A status this client does not know. Treated as still running.
    #[serde(other)]
    Unknown,
}

impl JobStatus {
    /// Success, error and killed are final; a finished job never changes again.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error | JobStatus::Killed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Booting => "booting",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Killed => "killed",
            JobStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JobType {
    Hive,
    #[default]
    Presto,
    Trino,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Hive => "hive",
            JobType::Presto => "presto",
            JobType::Trino => "trino",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct IssueJobRequest {
    pub job_type: JobType,
    pub query: String,
    /// -2 (very low) to 2 (very high).
    pub priority: i32,
    pub retry_limit: Option<u32>,
    /// Where the service writes the result, e.g. another database or a URL.
    pub result_url: Option<String>,
    /// Idempotency key. Issuing twice with one key yields a 409.
    pub domain_key: Option<String>,
    pub engine_version: Option<String>,
    pub pool_name: Option<String>,
}

impl IssueJobRequest {
    pub fn new(job_type: JobType, query: impl Into<String>) -> Self {
        Self {
            job_type,
            query: query.into(),
            ..Default::default()
        }
    }

    pub(crate) fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("query", self.query.clone()), ("priority", self.priority.to_string())];
        if let Some(v) = self.retry_limit {
            params.push(("retry_limit", v.to_string()));
        }
        if let Some(v) = &self.result_url {
            params.push(("result", v.clone()));
        }
        if let Some(v) = &self.domain_key {
            params.push(("domain_key", v.clone()));
        }
        if let Some(v) = &self.engine_version {
            params.push(("engine_version", v.clone()));
        }
        if let Some(v) = &self.pool_name {
            params.push(("pool_name", v.clone()));
        }
        params
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct IssueJobResponse {
    #[serde(deserialize_with = "crate::http::from_str_option")]
    pub job_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct JobStatusResponse {
    pub status: JobStatus,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct KillJobResponse {
    #[serde(default)]
    pub former_status: Option<JobStatus>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct ListJobsResponse {
    #[serde(default)]
    pub jobs: Vec<JobDetail>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct JobDebug {
    #[serde(default)]
    pub cmdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

/// Full job detail as returned by the show and list calls.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct JobDetail {
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub job_id: Option<String>,
    #[serde(rename = "type", default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub query: Option<serde_json::Value>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub priority: Option<i32>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub retry_limit: Option<u32>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub num_records: Option<u64>,
    #[serde(deserialize_with = "crate::http::from_str_option", default)]
    pub result_size: Option<u64>,
    /// JSON string of `[name, type]` pairs, present once a hive job succeeded.
    #[serde(default)]
    pub hive_result_schema: Option<serde_json::Value>,
    #[serde(deserialize_with = "crate::http::timestamp_option", default)]
    pub created_at: Option<OffsetDateTime>,
    #[serde(deserialize_with = "crate::http::timestamp_option", default)]
    pub start_at: Option<OffsetDateTime>,
    #[serde(deserialize_with = "crate::http::timestamp_option", default)]
    pub end_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub debug: Option<JobDebug>,
}

impl JobDetail {
    /// Column names and types of the result. Empty until the job succeeded.
    pub fn result_schema(&self) -> Result<Vec<(String, String)>, serde_json::Error> {
        match &self.hive_result_schema {
            Some(serde_json::Value::String(s)) if !s.is_empty() => serde_json::from_str(s),
            Some(v @ serde_json::Value::Array(_)) => serde_json::from_value(v.clone()),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod test {
    use time::macros::datetime;

    use crate::http::job::{IssueJobRequest, JobDetail, JobStatus, JobType};

    #[test]
    fn unknown_status_is_not_finished() {
        let status: JobStatus = serde_json::from_str("\"uploading_result\"").unwrap();
        assert_eq!(status, JobStatus::Unknown);
        assert!(!status.is_finished());
        assert!(JobStatus::Killed.is_finished());
    }

    #[test]
    fn detail_from_show_response() {
        let body = r#"{
            "job_id": "12345", "type": "hive", "status": "success", "database": "sample",
            "query": "select count(1) from www_access", "priority": 0, "retry_limit": 0,
            "num_records": 1, "result_size": 20, "url": "https://console/jobs/12345",
            "hive_result_schema": "[[\"cnt\", \"bigint\"]]",
            "created_at": "2013-04-01 12:34:56 UTC", "start_at": "2013-04-01 12:35:00 UTC", "end_at": null,
            "debug": {"cmdout": "started", "stderr": null}
        }"#;
        let detail: JobDetail = serde_json::from_str(body).unwrap();
        assert_eq!(detail.job_id.as_deref(), Some("12345"));
        assert_eq!(detail.status, JobStatus::Success);
        assert_eq!(detail.num_records, Some(1));
        assert_eq!(detail.created_at, Some(datetime!(2013-04-01 12:34:56 UTC)));
        assert_eq!(detail.end_at, None);
        assert_eq!(detail.result_schema().unwrap(), vec![("cnt".to_string(), "bigint".to_string())]);
    }

    #[test]
    fn numeric_job_id() {
        let detail: JobDetail = serde_json::from_str(r#"{"job_id": 42, "status": "queued"}"#).unwrap();
        assert_eq!(detail.job_id.as_deref(), Some("42"));
        assert!(detail.result_schema().unwrap().is_empty());
    }

    #[test]
    fn issue_params_skip_unset_fields() {
        let mut request = IssueJobRequest::new(JobType::Hive, "select 1");
        request.retry_limit = Some(3);
        request.pool_name = Some("batch".to_string());
        let params = request.to_params();
        let keys: Vec<&str> = params.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["query", "priority", "retry_limit", "pool_name"]);
    }
}
