use td_gax::poll::{PollSetting, Poller};

use crate::http::error::Error;
use crate::http::job::{JobDetail, JobStatus};
use crate::http::job_client::JobClient;
use crate::reader::{Format, RecordReader};

/// Per-tick hook for [`Job::wait_with`]. An error stops the wait and is returned as is.
pub type OnTick<'a> = &'a mut (dyn FnMut(&Job) -> Result<(), Error> + Send);

/// Handle to a submitted query job.
///
/// The cached detail is only trusted once the job has finished; until then
/// every check goes back to the service.
#[derive(Debug, Clone)]
pub struct Job {
    client: JobClient,
    job_id: String,
    status: Option<JobStatus>,
    detail: Option<JobDetail>,
}

impl Job {
    pub(crate) fn new(client: JobClient, job_id: String) -> Self {
        Self {
            client,
            job_id,
            status: None,
            detail: None,
        }
    }

    pub fn id(&self) -> &str {
        self.job_id.as_str()
    }

    /// Last status seen, without asking the service.
    pub fn last_status(&self) -> Option<JobStatus> {
        self.status
    }

    pub fn detail(&self) -> Option<&JobDetail> {
        self.detail.as_ref()
    }

    /// Fetches the full detail.
    pub async fn update(&mut self) -> Result<&JobDetail, Error> {
        let detail = self.client.show(&self.job_id).await?;
        tracing::trace!(job_id = %self.job_id, status = %detail.status, "job detail refreshed");
        self.status = Some(detail.status);
        Ok(self.detail.insert(detail))
    }

    /// Fetches the status alone. A finished status is never asked for again.
    pub async fn status(&mut self) -> Result<JobStatus, Error> {
        if let Some(status) = self.status.filter(JobStatus::is_finished) {
            return Ok(status);
        }
        let status = self.client.status(&self.job_id).await?;
        self.status = Some(status);
        Ok(status)
    }

    pub async fn is_finished(&mut self) -> Result<bool, Error> {
        Ok(self.status().await?.is_finished())
    }

    pub async fn is_success(&mut self) -> Result<bool, Error> {
        Ok(self.status().await? == JobStatus::Success)
    }

    pub async fn is_error(&mut self) -> Result<bool, Error> {
        Ok(self.status().await? == JobStatus::Error)
    }

    pub async fn is_killed(&mut self) -> Result<bool, Error> {
        Ok(self.status().await? == JobStatus::Killed)
    }

    pub async fn wait(&mut self, setting: &PollSetting) -> Result<&JobDetail, Error> {
        self.wait_with(setting, None).await
    }

    /// Polls until the job finishes, then refreshes the detail once.
    ///
    /// A tick checks the status, then the timeout, then sleeps one interval,
    /// then calls `on_tick`. Hitting the timeout returns [`Error::WaitTimeout`]
    /// and leaves the job running; use [`Job::kill`] to stop it.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn wait_with(
        &mut self,
        setting: &PollSetting,
        mut on_tick: Option<OnTick<'_>>,
    ) -> Result<&JobDetail, Error> {
        let mut poller = Poller::start(setting.clone(), self.client.clock());
        loop {
            let status = self.status().await?;
            if status.is_finished() {
                tracing::debug!(job_id = %self.job_id, %status, ticks = poller.ticks(), "job finished");
                return self.update().await;
            }
            poller.tick().await.map_err(|e| Error::WaitTimeout {
                operation: format!("job {}", self.job_id),
                elapsed: e.elapsed,
            })?;
            if let Some(f) = on_tick.as_deref_mut() {
                f(&*self)?;
            }
        }
    }

    /// Asks the service to stop the job and returns the status it had.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub async fn kill(&mut self) -> Result<Option<JobStatus>, Error> {
        let former = self.client.kill(&self.job_id).await?;
        self.status = None;
        self.detail = None;
        Ok(former)
    }

    pub async fn result(&self, format: Format) -> Result<RecordReader, Error> {
        self.client.result(&self.job_id, format).await
    }

    /// Column names and types, refreshing the detail when it is not final yet.
    pub async fn result_schema(&mut self) -> Result<Vec<(String, String)>, Error> {
        let finished = self.detail.as_ref().is_some_and(|d| d.status.is_finished());
        if !finished {
            self.update().await?;
        }
        match &self.detail {
            Some(detail) => Ok(detail.result_schema()?),
            None => Ok(Vec::new()),
        }
    }
}
