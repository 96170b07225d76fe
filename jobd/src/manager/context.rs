// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::pin::pin;
use std::time::{Duration, Instant};

use futures::future::select;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{next_state_event, AsyncJobManager};
use crate::error::{JobError, JobException};
use crate::job::{AsyncJob, AsyncJobJoinMap, JobId, JobJournal, JobStatus, JournalType, WakeupSpec};
use crate::job_engine::with_timeout;
use crate::message_bus::JOB_STATE;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WakeupReason {
    ChildCompleted,
    /// The join expired before the child finished.
    Timeout,
}

/// Why a suspended job is running again.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Wakeup {
    pub child: JobId,
    pub reason: WakeupReason,
    pub handler: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JoinWait {
    Resolved(AsyncJobJoinMap),
    TimedOut,
}

/// A child's outcome as seen by the joining parent.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinResult {
    pub child: JobId,
    /// `InProgress` when the join was removed before the child finished.
    pub status: JobStatus,
    pub result: Option<String>,
}

impl JoinResult {
    pub(crate) fn from_join(join: &AsyncJobJoinMap) -> Self {
        Self {
            child: join.join_job_id,
            status: join.join_status,
            result: join.join_result.clone(),
        }
    }

    pub fn value(&self) -> Option<Value> {
        self.result
            .as_deref()
            .and_then(|r| serde_json::from_str(r).ok())
    }

    pub fn exception(&self) -> Option<JobException> {
        if self.status != JobStatus::Failed {
            return None;
        }
        self.result.as_deref().and_then(JobException::from_result)
    }
}

/// Handle on the job being serviced, passed explicitly to every dispatcher
/// invocation. Cheap to clone; clones refer to the same job.
#[derive(Clone)]
pub struct AsyncJobExecutionContext {
    manager: AsyncJobManager,
    job: AsyncJob,
    wakeup: Option<Wakeup>,
}

impl std::fmt::Debug for AsyncJobExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncJobExecutionContext")
            .field("job", &self.job.id)
            .field("wakeup", &self.wakeup)
            .finish()
    }
}

impl AsyncJobExecutionContext {
    pub(crate) fn new(manager: AsyncJobManager, job: AsyncJob, wakeup: Option<Wakeup>) -> Self {
        Self {
            manager,
            job,
            wakeup,
        }
    }

    pub fn manager(&self) -> &AsyncJobManager {
        &self.manager
    }

    /// Snapshot taken when the job was dispatched.
    pub fn job(&self) -> &AsyncJob {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn command<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        Ok(self.job.command()?)
    }

    /// Set when this run continues a suspended job.
    pub fn wakeup(&self) -> Option<&Wakeup> {
        self.wakeup.as_ref()
    }

    /// Current persisted state of the job.
    pub async fn refresh(&self) -> Result<AsyncJob, JobError> {
        self.manager.query_job(self.job.id, false).await
    }

    pub async fn log_journal(
        &self,
        journal_type: JournalType,
        text: impl Into<String>,
        obj: Option<Value>,
    ) -> Result<JobJournal, JobError> {
        let obj_json = obj.map(|v| v.to_string());
        self.manager
            .log_job_journal(self.job.id, journal_type, text, obj_json)
            .await
    }

    pub async fn update_progress(
        &self,
        process_status: i32,
        partial: Option<Value>,
    ) -> Result<(), JobError> {
        self.manager
            .update_async_job_status(self.job.id, process_status, partial)
            .await
    }

    pub async fn update_attachment(
        &self,
        instance_type: impl Into<String>,
        instance_id: u64,
    ) -> Result<(), JobError> {
        self.manager
            .update_async_job_attachment(self.job.id, instance_type, instance_id)
            .await
    }

    pub async fn complete(
        &self,
        status: JobStatus,
        result_code: i32,
        result: Option<Value>,
    ) -> Result<bool, JobError> {
        self.manager
            .complete_async_job(self.job.id, status, result_code, result)
            .await
    }

    /// Submit a child job owned by the same account, linked to this job.
    pub async fn submit_child(&self, job: AsyncJob) -> Result<JobId, JobError> {
        let job = job
            .with_owner(self.job.account_id, self.job.user_id)
            .related_to(self.job.id);
        self.manager.submit_async_job(job).await
    }

    pub async fn join_job(&self, child: JobId) -> Result<AsyncJobJoinMap, JobError> {
        self.manager.join_job(self.job.id, child).await
    }

    /// Join and let a wakeup re-dispatch this job. The dispatcher should
    /// return [`JobOutcome::Suspended`](super::JobOutcome) afterwards.
    pub async fn join_job_with_wakeup(
        &self,
        child: JobId,
        spec: WakeupSpec,
    ) -> Result<AsyncJobJoinMap, JobError> {
        self.manager
            .join_job_with_wakeup(self.job.id, child, spec)
            .await
    }

    /// Wait for an existing join to resolve. Woken by `job.state`
    /// notifications, with a poll fallback. Holds no worker thread.
    pub async fn await_join(&self, child: JobId, timeout: Duration) -> Result<JoinWait, JobError> {
        let parent = self.job.id;
        // subscribe before the first look so no notification slips through
        let notifications = self.manager.bus().subscribe(JOB_STATE)?;
        let shutdown = self.manager.shutdown_signal();
        let poll = self.manager.config().default_wakeup_interval;
        let deadline = Instant::now() + timeout;

        loop {
            match self.manager.store().find_join(parent, child).await? {
                None => return Err(JobError::JoinNotFound { parent, child }),
                Some(join) if join.is_resolved() => return Ok(JoinWait::Resolved(join)),
                Some(_) => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || shutdown.is_triggered() {
                debug!("job-{}: join on job-{} timed out", parent, child);
                return Ok(JoinWait::TimedOut);
            }

            let child_event = pin!(next_state_event(&notifications, child));
            let stop = pin!(shutdown.triggered());
            let _ = with_timeout(remaining.min(poll), select(child_event, stop)).await;
        }
    }

    /// Remove the join and hand back the child's outcome. A failed child
    /// whose result carries a serialized [`JobException`] is turned back
    /// into the matching [`JobError`].
    pub async fn disjoin_job(&self, child: JobId) -> Result<JoinResult, JobError> {
        let result = self.manager.disjoin_job(self.job.id, child).await?;
        match result.exception() {
            Some(exc) => Err(exc.into_job_error()),
            None => Ok(result),
        }
    }

    /// Join, wait and disjoin in one call. On timeout the join is dropped
    /// and [`JobError::JoinTimedOut`] returned.
    pub async fn join_and_wait(&self, child: JobId, timeout: Duration) -> Result<JoinResult, JobError> {
        self.join_job(child).await?;
        match self.await_join(child, timeout).await? {
            JoinWait::Resolved(_) => self.disjoin_job(child).await,
            JoinWait::TimedOut => {
                self.manager.disjoin_job(self.job.id, child).await?;
                Err(JobError::JoinTimedOut {
                    parent: self.job.id,
                    child,
                })
            }
        }
    }
}

/// Continuation target handed from a wakeup to the job run.
#[derive(Debug)]
pub(crate) struct Resume {
    pub wakeup: Wakeup,
    pub dispatcher: String,
}
