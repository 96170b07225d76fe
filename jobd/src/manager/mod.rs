// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>
//! # Design: Async Job Manager
//!
//! ## Overview
//! The manager turns submitted [`AsyncJob`]s into dispatcher runs and keeps
//! the persisted records consistent while several instances share a store:
//!
//! - Submission persists the job as `Queued`. Jobs with a sync object go
//!   through the [`SyncQueueManager`] and only run while they hold the slot.
//! - A run claims the job with a versioned update (`Queued -> InProgress`),
//!   so a job scheduled twice still runs once.
//! - Completion writes the terminal state and resolves join records in one
//!   store step, then releases the sync slot and schedules the promoted job.
//! - A dispatcher that joined with a wakeup returns `Suspended`. The job
//!   keeps no worker and no owner until a completion, a bus notification or
//!   the heartbeat poll wakes it again, possibly on another instance.
//!
//! ## Lifecycle
//! ```text
//!         submit ──> Queued ──claim──> InProgress ──complete──> Succeeded
//!                      ^                  │   ^                 Failed
//!                      │ requeue          │   │ wakeup
//!                      │ (orphan)         v   │
//!                      └─────────────  suspended
//! ```
//!
//! The heartbeat loop records this instance's lease and sweeps wakeups,
//! stale sync slots, orphaned jobs and expired records.

pub mod config;
pub mod context;
pub mod dispatch;
pub mod reconcile;

#[cfg(test)]
mod tests;

use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::future::{select, Either, FutureExt};
use futures::lock::Mutex as AsyncMutex;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use time::OffsetDateTime;

pub use config::ManagerConfig;
pub use context::{AsyncJobExecutionContext, JoinResult, JoinWait, Wakeup, WakeupReason};
pub use dispatch::{
    ClosureDispatcher, DispatcherRegistry, EndPointDispatcher, JobDispatcher, JobOutcome,
};
pub use reconcile::{
    FailOrphans, LeaveOrphans, OrphanAction, OrphanPolicy, OrphanPolicyKind, RequeueOrphans,
};

use context::Resume;

use crate::error::{JobError, JobException, StoreError};
use crate::job::{
    result_code, AsyncJob, AsyncJobJoinMap, JobId, JobJournal, JobStatus, JournalType, WakeupSpec,
};
use crate::job_engine::{with_timeout, Executor, PeriodicLoop, ShutdownSignal};
use crate::message_bus::{
    BusMessage, JobStateEvent, MessageBus, Subscription, JOB_EVENT_PUBLISH, JOB_HEARTBEAT,
    JOB_STATE,
};
use crate::msid::Msid;
use crate::store::JobStore;
use crate::sync_queue::{Admission, SweepAction, SyncObject, SyncQueueManager};

/// Dispatcher name of pseudo jobs. Never registered, pseudo jobs never run.
pub const PSEUDO_DISPATCHER: &str = "pseudo";

fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Resolves once a `job.state` message for `job_id` arrives. Never resolves
/// when the bus is gone; callers race it against a timer.
pub(crate) async fn next_state_event(events: &Subscription, job_id: JobId) {
    while let Some(msg) = events.recv().await {
        if msg.payload["job_id"].as_u64() == Some(job_id) {
            return;
        }
    }
    std::future::pending::<()>().await
}

struct Inner {
    config: ManagerConfig,
    store: Arc<dyn JobStore>,
    bus: Arc<dyn MessageBus>,
    queues: SyncQueueManager,
    dispatchers: DispatcherRegistry,
    orphan_policy: RwLock<Arc<dyn OrphanPolicy>>,
    executor: Executor,
    callbacks: Arc<Executor>,
    enabled: AtomicBool,
    pseudo_lock: AsyncMutex<()>,
}

#[derive(Clone)]
pub struct AsyncJobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AsyncJobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncJobManager")
            .field("msid", &self.inner.config.msid)
            .field("enabled", &self.is_async_jobs_enabled())
            .field("executor", &self.inner.executor)
            .finish()
    }
}

impl AsyncJobManager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<dyn JobStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self, JobError> {
        let executor = Executor::new("jobd-worker", config.worker_threads)?;
        let callbacks = Arc::new(Executor::new("jobd-callback", config.callback_threads)?);
        let queues = SyncQueueManager::new(store.clone(), config.msid, config.queue_size_limit);
        let orphan_policy = RwLock::new(config.orphan_policy.policy());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                bus,
                queues,
                dispatchers: DispatcherRegistry::default(),
                orphan_policy,
                executor,
                callbacks,
                enabled: AtomicBool::new(true),
                pseudo_lock: AsyncMutex::new(()),
            }),
        })
    }

    pub fn msid(&self) -> Msid {
        self.inner.config.msid
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.inner.bus
    }

    pub fn sync_queues(&self) -> &SyncQueueManager {
        &self.inner.queues
    }

    /// Pool for endpoint answer callbacks, shared with the endpoints the
    /// dispatchers build.
    pub fn callbacks(&self) -> Arc<Executor> {
        self.inner.callbacks.clone()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.executor.shutdown_signal()
    }

    pub fn register_dispatcher(&self, name: impl Into<String>, dispatcher: Arc<dyn JobDispatcher>) {
        let name = name.into();
        debug!("registered dispatcher '{}'", name);
        self.inner.dispatchers.register(name, dispatcher);
    }

    pub fn set_orphan_policy(&self, policy: Arc<dyn OrphanPolicy>) {
        info!("orphan policy set to '{}'", policy.name());
        *self.inner.orphan_policy.write().unwrap() = policy;
    }

    // === lifecycle ===

    /// Expunge pseudo jobs of a previous run of this instance, take the
    /// lease and start the heartbeat loop and the `job.state` listener.
    pub async fn start(&self) -> Result<(), JobError> {
        let msid = self.msid();
        let expunged = self.inner.store.expunge_pseudo_jobs(msid).await?;
        if expunged > 0 {
            info!("expunged {} pseudo jobs of {}", expunged, msid);
        }
        self.inner.store.record_heartbeat(msid, now()).await?;

        let events = self.inner.bus.subscribe(JOB_STATE)?;
        let shutdown = self.shutdown_signal();
        let weak = Arc::downgrade(&self.inner);
        self.inner.executor.spawn("job.state listener", async move {
            loop {
                let next = pin!(events.recv());
                let stop = pin!(shutdown.triggered());
                let msg = match select(next, stop).await {
                    Either::Left((Some(msg), _)) => msg,
                    _ => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = AsyncJobManager { inner };
                if msg.sender != manager.msid() {
                    manager.on_state_event(msg).await;
                }
            }
            debug!("job.state listener stopped");
        });

        let weak = Arc::downgrade(&self.inner);
        self.inner.executor.dispatch(Box::new(PeriodicLoop::new(
            "job heartbeat",
            self.inner.config.heartbeat_interval,
            self.shutdown_signal(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        AsyncJobManager { inner }.heartbeat().await;
                    }
                }
                .boxed()
            },
        )));

        info!("async job manager {} started", msid);
        Ok(())
    }

    /// Stop intake and background loops, then block until every running
    /// job future has finished. Must not be called from a job.
    pub fn shutdown(&self) {
        info!("async job manager {} shutting down", self.msid());
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.executor.wait_until_finished();
        self.inner.callbacks.wait_until_finished();
        info!("async job manager {} stopped", self.msid());
    }

    // === intake switch ===

    pub fn enable_async_jobs(&self) {
        info!("async job intake enabled");
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    /// Reject new submissions. Jobs already running are not affected.
    pub fn disable_async_jobs(&self) {
        info!("async job intake disabled");
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_async_jobs_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    // === submission and queries ===

    pub async fn submit_async_job(&self, job: AsyncJob) -> Result<JobId, JobError> {
        let job = self.persist_new(job, None).await?;
        self.schedule(job.id);
        Ok(job.id)
    }

    /// Submit behind the sync queue of (`sync_obj_type`, `sync_obj_id`).
    /// Fails with [`JobError::QueueFull`] when the queue is at its limit;
    /// the job record is then kept as failed.
    pub async fn submit_async_job_with_sync(
        &self,
        job: AsyncJob,
        sync_obj_type: &str,
        sync_obj_id: u64,
    ) -> Result<JobId, JobError> {
        let sync_object = SyncObject::new(sync_obj_type, sync_obj_id);
        let job = self.persist_new(job, Some(sync_object.clone())).await?;

        let admission = match self.inner.queues.enqueue(&sync_object, job.id, None).await {
            Ok(admission) => admission,
            Err(e) => {
                let exc = JobException::internal(format!("enqueue on {} failed: {}", sync_object, e));
                self.fail_with(job.id, result_code::INTERNAL_ERROR, &exc).await?;
                return Err(e.into());
            }
        };
        match admission {
            Admission::Admitted(item) => {
                self.record_sync_item(job.id, item.id).await?;
                self.schedule(job.id);
            }
            Admission::Queued(item) => {
                self.record_sync_item(job.id, item.id).await?;
            }
            Admission::Rejected { limit, .. } => {
                let exc = JobException::resource_unavailable(format!(
                    "sync queue {} is full (limit {})",
                    sync_object, limit
                ));
                self.fail_with(job.id, result_code::QUEUE_REJECTED, &exc).await?;
                return Err(JobError::QueueFull { sync_object, limit });
            }
        }
        Ok(job.id)
    }

    async fn persist_new(
        &self,
        mut job: AsyncJob,
        sync_object: Option<SyncObject>,
    ) -> Result<AsyncJob, JobError> {
        if !self.is_async_jobs_enabled() {
            return Err(JobError::JobsDisabled);
        }
        if !self.inner.dispatchers.contains(&job.dispatcher) {
            warn!(
                "no dispatcher '{}', registered are: {}",
                job.dispatcher,
                self.inner.dispatchers.names().join(", ")
            );
            return Err(JobError::NoSuchDispatcher(job.dispatcher));
        }
        let now = now();
        job.status = JobStatus::Queued;
        job.process_status = 0;
        job.result_code = result_code::SUCCESS;
        job.result = None;
        job.created = now;
        job.last_updated = Some(now);
        job.last_polled = None;
        job.init_msid = Some(self.msid());
        job.executing_msid = None;
        job.complete_msid = None;
        job.sync_object = sync_object;
        job.sync_item_id = None;
        job.pseudo = false;
        job.suspended = false;

        let job = self.inner.store.insert_job(job).await?;
        debug!("job-{} submitted for '{}'", job.id, job.dispatcher);
        Ok(job)
    }

    async fn record_sync_item(&self, id: JobId, item_id: u64) -> Result<(), JobError> {
        self.modify_job(id, |job| {
            job.sync_item_id = Some(item_id);
            Ok(true)
        })
        .await?;
        Ok(())
    }

    /// Snapshot of a job. With `update_poll_time` the poll counts as a
    /// liveness ping from the client.
    pub async fn query_job(&self, id: JobId, update_poll_time: bool) -> Result<AsyncJob, JobError> {
        if !update_poll_time {
            return self.find(id).await;
        }
        let polled = now();
        let updated = self
            .modify_job(id, |job| {
                job.last_polled = Some(polled);
                Ok(true)
            })
            .await?;
        match updated {
            Some(job) => Ok(job),
            None => self.find(id).await,
        }
    }

    /// Wait until the job is terminal or `timeout` passed, returning the
    /// last snapshot either way.
    pub async fn wait_for_job(&self, id: JobId, timeout: Duration) -> Result<AsyncJob, JobError> {
        let events = self.inner.bus.subscribe(JOB_STATE)?;
        let poll = self.inner.config.default_wakeup_interval;
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.find(id).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if job.is_terminal() || remaining.is_zero() {
                return Ok(job);
            }
            let _ = with_timeout(remaining.min(poll), next_state_event(&events, id)).await;
        }
    }

    pub async fn list_journal(&self, id: JobId) -> Result<Vec<JobJournal>, JobError> {
        Ok(self.inner.store.list_journal(id).await?)
    }

    pub async fn count_pending_non_pseudo_jobs(&self, msid: Msid) -> Result<usize, JobError> {
        Ok(self.inner.store.count_pending_non_pseudo_jobs(msid).await?)
    }

    pub async fn find_instance_pending_async_jobs(
        &self,
        instance_type: &str,
        account_id: Option<u64>,
    ) -> Result<Vec<AsyncJob>, JobError> {
        Ok(self
            .inner
            .store
            .find_instance_pending_jobs(instance_type, account_id)
            .await?)
    }

    // === mutation entry points ===

    /// Set the terminal state. Allowed only while the job is in progress.
    /// Returns false when the job was already terminal: that call lost a
    /// race and changed nothing.
    pub async fn complete_async_job(
        &self,
        id: JobId,
        status: JobStatus,
        result_code: i32,
        result: Option<Value>,
    ) -> Result<bool, JobError> {
        let result = result.map(|v| v.to_string());
        self.finish(id, status, result_code, result, false).await
    }

    /// Update the fine-grained progress and optionally a partial result.
    /// The coarse status does not change.
    pub async fn update_async_job_status(
        &self,
        id: JobId,
        process_status: i32,
        result: Option<Value>,
    ) -> Result<(), JobError> {
        let result = result.map(|v| v.to_string());
        let updated = now();
        self.modify_job(id, |job| {
            if job.status != JobStatus::InProgress {
                return Err(JobError::InvalidTransition {
                    job_id: id,
                    status: job.status,
                    operation: "update status",
                });
            }
            job.process_status = process_status;
            if let Some(result) = &result {
                job.result = Some(result.clone());
            }
            job.last_updated = Some(updated);
            Ok(true)
        })
        .await?;
        self.publish_event(id, "progress", json!({ "process_status": process_status }));
        Ok(())
    }

    /// Attach the business entity the job concerns.
    pub async fn update_async_job_attachment(
        &self,
        id: JobId,
        instance_type: impl Into<String>,
        instance_id: u64,
    ) -> Result<(), JobError> {
        let instance_type = instance_type.into();
        let updated = now();
        self.modify_job(id, |job| {
            if job.is_terminal() {
                return Err(JobError::InvalidTransition {
                    job_id: id,
                    status: job.status,
                    operation: "update attachment",
                });
            }
            job.instance_type = Some(instance_type.clone());
            job.instance_id = Some(instance_id);
            job.last_updated = Some(updated);
            Ok(true)
        })
        .await?;
        Ok(())
    }

    pub async fn log_job_journal(
        &self,
        id: JobId,
        journal_type: JournalType,
        text: impl Into<String>,
        obj_json: Option<String>,
    ) -> Result<JobJournal, JobError> {
        let entry = match self
            .inner
            .store
            .append_journal(JobJournal::new(id, journal_type, text, obj_json))
            .await
        {
            Ok(entry) => entry,
            Err(StoreError::NotFound { .. }) => return Err(JobError::JobNotFound(id)),
            Err(StoreError::Terminal { .. }) => {
                let job = self.find(id).await?;
                return Err(JobError::InvalidTransition {
                    job_id: id,
                    status: job.status,
                    operation: "log journal",
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.publish_event(id, "journal", json!({ "journal_id": entry.id }));
        Ok(entry)
    }

    /// Complete a queued or running job as failed with the cancelled result
    /// code. A dispatcher still running keeps going, its own completion then
    /// becomes a no-op.
    pub async fn cancel_async_job(&self, id: JobId, reason: &str) -> Result<bool, JobError> {
        let exc = JobException::cancelled(reason);
        let cancelled = self.fail_with(id, result_code::CANCELLED, &exc).await?;
        if cancelled {
            info!("job-{} cancelled: {}", id, reason);
        }
        Ok(cancelled)
    }

    // === joins ===

    pub async fn join_job(&self, parent: JobId, child: JobId) -> Result<AsyncJobJoinMap, JobError> {
        self.insert_join(parent, child, None).await
    }

    /// Join with a wakeup: once `child` completes, or `spec.timeout` passes,
    /// the parent is re-dispatched to `spec.dispatcher`. Zero durations
    /// take the configured defaults.
    pub async fn join_job_with_wakeup(
        &self,
        parent: JobId,
        child: JobId,
        mut spec: WakeupSpec,
    ) -> Result<AsyncJobJoinMap, JobError> {
        if spec.interval.is_zero() {
            spec.interval = self.inner.config.default_wakeup_interval;
        }
        if spec.timeout.is_zero() {
            spec.timeout = self.inner.config.join_timeout;
        }
        self.insert_join(parent, child, Some(spec)).await
    }

    async fn insert_join(
        &self,
        parent: JobId,
        child: JobId,
        wakeup: Option<WakeupSpec>,
    ) -> Result<AsyncJobJoinMap, JobError> {
        let parent_job = self.find(parent).await?;
        if parent_job.is_terminal() || parent == child {
            return Err(JobError::InvalidTransition {
                job_id: parent,
                status: parent_job.status,
                operation: "join",
            });
        }
        self.find(child).await?;

        let mut join = AsyncJobJoinMap::new(parent, child, self.msid());
        if let Some(spec) = wakeup {
            join = join.with_wakeup(spec);
        }
        match self.inner.store.insert_join(join).await {
            Ok(join) => {
                debug!(
                    "job-{} joined job-{}{}",
                    parent,
                    child,
                    if join.is_resolved() { " (already finished)" } else { "" }
                );
                Ok(join)
            }
            Err(StoreError::Duplicate { .. }) => Err(JobError::DuplicateJoin { parent, child }),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the join record and return the child's outcome as stored in
    /// it. Failed children are returned as such, see
    /// [`AsyncJobExecutionContext::disjoin_job`] for the rethrowing form.
    pub async fn disjoin_job(&self, parent: JobId, child: JobId) -> Result<JoinResult, JobError> {
        match self.inner.store.remove_join(parent, child).await? {
            Some(join) => {
                debug!("job-{} disjoined job-{}", parent, child);
                Ok(JoinResult::from_join(&join))
            }
            None => Err(JobError::JoinNotFound { parent, child }),
        }
    }

    /// Resolve every unresolved join on `child` without completing the child
    /// itself, e.g. for an outcome reported by an external event. Returns
    /// the number of join records resolved.
    pub async fn complete_join(
        &self,
        child: JobId,
        status: JobStatus,
        result: Option<Value>,
    ) -> Result<usize, JobError> {
        if !status.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: child,
                status,
                operation: "complete join",
            });
        }
        let result = result.map(|v| v.to_string());
        let msid = self.msid();
        let mut resolved = Vec::new();
        for mut join in self.inner.store.find_joins_by_child(child).await? {
            loop {
                if join.is_resolved() {
                    break;
                }
                join.resolve(status, result.clone(), Some(msid), now());
                match self.inner.store.update_join(&join).await {
                    Ok(updated) => {
                        resolved.push(updated);
                        break;
                    }
                    Err(StoreError::VersionMismatch { .. }) => {
                        match self.inner.store.find_join(join.job_id, child).await? {
                            Some(fresh) => join = fresh,
                            None => break,
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let count = resolved.len();
        for join in resolved {
            self.notify_join(join).await;
        }
        Ok(count)
    }

    // === pseudo jobs ===

    /// The placeholder job of (`account_id`, `user_id`) on this instance,
    /// created on first use. Pseudo jobs are never dispatched and are
    /// expunged when the instance starts again.
    pub async fn pseudo_job(&self, account_id: u64, user_id: u64) -> Result<AsyncJob, JobError> {
        let _guard = self.inner.pseudo_lock.lock().await;
        let msid = self.msid();
        if let Some(job) = self
            .inner
            .store
            .find_pseudo_job(msid, account_id, user_id)
            .await?
        {
            return Ok(job);
        }
        let mut job =
            AsyncJob::new(PSEUDO_DISPATCHER, "pseudo", "{}").with_owner(account_id, user_id);
        job.pseudo = true;
        job.status = JobStatus::InProgress;
        job.init_msid = Some(msid);
        job.executing_msid = Some(msid);
        job.last_updated = Some(now());
        let job = self.inner.store.insert_job(job).await?;
        debug!("job-{} is the pseudo job of account {} user {}", job.id, account_id, user_id);
        Ok(job)
    }

    /// Execution context for code that was not started as a job, such as
    /// background sweeps.
    pub async fn pseudo_context(
        &self,
        account_id: u64,
        user_id: u64,
    ) -> Result<AsyncJobExecutionContext, JobError> {
        let job = self.pseudo_job(account_id, user_id).await?;
        Ok(AsyncJobExecutionContext::new(self.clone(), job, None))
    }

    // === background sweeps ===

    /// One heartbeat: renew the lease, then run every sweep. Failures are
    /// logged, the next heartbeat tries again.
    pub async fn heartbeat(&self) {
        let msid = self.msid();
        let at = now();
        if let Err(e) = self.inner.store.record_heartbeat(msid, at).await {
            error!("heartbeat of {} not recorded: {}", msid, e);
        }
        self.inner.bus.publish(
            msid,
            JOB_HEARTBEAT,
            json!({ "msid": msid, "at": at.unix_timestamp() }),
        );
        if let Err(e) = self.process_wakeups().await {
            error!("wakeup sweep failed: {}", e);
        }
        if let Err(e) = self.sweep_sync_queues().await {
            error!("sync queue sweep failed: {}", e);
        }
        if let Err(e) = self.reconcile_orphans().await {
            error!("orphan reconciliation failed: {}", e);
        }
        match self.expunge_expired().await {
            Ok(0) => {}
            Ok(n) => info!("expunged {} completed jobs", n),
            Err(e) => error!("expunge failed: {}", e),
        }
    }

    /// Wake parents whose join resolved or expired, push the poll time of
    /// the rest forward. Returns the number of parents woken.
    pub async fn process_wakeups(&self) -> Result<usize, JobError> {
        let at = now();
        let mut woken = 0;
        for join in self.inner.store.find_wakeup_candidates(at).await? {
            if join.is_resolved() || join.is_expired(at) {
                if self.try_wake(join).await? {
                    woken += 1;
                }
            } else if let Some(spec) = &join.wakeup {
                let mut polled = join.clone();
                polled.next_wakeup = Some(at + spec.interval);
                if let Err(e) = self.inner.store.update_join(&polled).await {
                    debug!(
                        "poll time of job-{} on job-{} not moved: {}",
                        join.job_id, join.join_job_id, e
                    );
                }
            }
        }
        Ok(woken)
    }

    /// Release slots held by finished or missing jobs and reschedule jobs
    /// that were admitted but never started.
    pub async fn sweep_sync_queues(&self) -> Result<usize, JobError> {
        let actions = self
            .inner
            .queues
            .sweep_stale(self.inner.config.stale_queue_item_after)
            .await?;
        for action in &actions {
            match action {
                SweepAction::Released {
                    promoted: Some(next),
                    ..
                } => self.schedule(next.content_id),
                SweepAction::Reschedule(id) => self.schedule(*id),
                SweepAction::Released { promoted: None, .. } => {}
            }
        }
        Ok(actions.len())
    }

    /// Non-terminal jobs owned by instances whose lease ran out. Besides
    /// the jobs they were executing this includes queued jobs they submitted
    /// but never started. Queued jobs behind a sync object are left to the
    /// sync queue sweep.
    pub async fn find_orphaned_jobs(&self) -> Result<Vec<AsyncJob>, JobError> {
        let cutoff = now() - self.inner.config.instance_dead_after;
        let msid = self.msid();
        let dead: Vec<Msid> = self
            .inner
            .store
            .find_dead_instances(cutoff)
            .await?
            .into_iter()
            .filter(|m| *m != msid)
            .collect();
        if dead.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .inner
            .store
            .find_jobs_owned_by(&dead)
            .await?
            .into_iter()
            .filter(|job| !job.is_terminal() && !job.pseudo)
            .filter(|job| !(job.status == JobStatus::Queued && job.sync_object.is_some()))
            .collect())
    }

    /// Apply the orphan policy to every orphaned job. Returns the number of
    /// jobs failed or requeued.
    pub async fn reconcile_orphans(&self) -> Result<usize, JobError> {
        let orphans = self.find_orphaned_jobs().await?;
        if orphans.is_empty() {
            return Ok(0);
        }
        let policy = self.inner.orphan_policy.read().unwrap().clone();
        let mut handled = 0;
        for job in orphans {
            let Some(owner) = job.executing_msid.or(job.init_msid) else {
                continue;
            };
            let unclaimed = job.executing_msid.is_none();
            match policy.decide(&job) {
                OrphanAction::Fail => {
                    warn!("job-{} orphaned by {}, failing it", job.id, owner);
                    let exc =
                        JobException::internal(format!("owning instance {} stopped heartbeating", owner));
                    if self.fail_with(job.id, result_code::ORPHANED, &exc).await? {
                        handled += 1;
                    }
                }
                OrphanAction::Requeue if unclaimed => {
                    // still queued; a repeated schedule loses the claim
                    info!("job-{} submitted by {} never started, scheduling it", job.id, owner);
                    self.schedule(job.id);
                    handled += 1;
                }
                OrphanAction::Requeue => {
                    let at = now();
                    let requeued = self
                        .modify_job(job.id, |j| {
                            if j.is_terminal() || j.executing_msid != Some(owner) {
                                return Ok(false);
                            }
                            j.status = JobStatus::Queued;
                            j.executing_msid = None;
                            j.suspended = false;
                            j.process_status = 0;
                            j.last_updated = Some(at);
                            Ok(true)
                        })
                        .await?;
                    if requeued.is_some() {
                        info!("job-{} orphaned by {}, requeued", job.id, owner);
                        self.schedule(job.id);
                        handled += 1;
                    }
                }
                OrphanAction::Leave => {
                    debug!("job-{} orphaned by {}, left for an operator", job.id, owner);
                }
            }
        }
        Ok(handled)
    }

    pub async fn expunge_expired(&self) -> Result<usize, JobError> {
        let cutoff = now() - self.inner.config.job_expire_after;
        Ok(self.inner.store.expunge_completed_before(cutoff).await?)
    }

    // === internals ===

    async fn find(&self, id: JobId) -> Result<AsyncJob, JobError> {
        self.inner
            .store
            .find_job(id)
            .await?
            .ok_or(JobError::JobNotFound(id))
    }

    /// Read-modify-write with the optimistic version check, retried until
    /// it lands. `change` returns false to leave the job alone.
    async fn modify_job<F>(&self, id: JobId, mut change: F) -> Result<Option<AsyncJob>, JobError>
    where
        F: FnMut(&mut AsyncJob) -> Result<bool, JobError> + Send,
    {
        loop {
            let mut job = self.find(id).await?;
            if !change(&mut job)? {
                return Ok(None);
            }
            match self.inner.store.update_job(&job).await {
                Ok(updated) => return Ok(Some(updated)),
                Err(StoreError::VersionMismatch { .. }) => {
                    debug!("job-{} changed concurrently, retrying", id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn fail_with(&self, id: JobId, code: i32, exc: &JobException) -> Result<bool, JobError> {
        let result = serde_json::to_string(exc)?;
        self.finish(id, JobStatus::Failed, code, Some(result), true)
            .await
    }

    /// The single terminal transition. Exactly one caller wins; the others
    /// see a terminal job and get `Ok(false)`.
    async fn finish(
        &self,
        id: JobId,
        status: JobStatus,
        code: i32,
        result: Option<String>,
        allow_queued: bool,
    ) -> Result<bool, JobError> {
        if !status.is_terminal() {
            return Err(JobError::InvalidTransition {
                job_id: id,
                status,
                operation: "complete with a non-terminal status",
            });
        }
        loop {
            let job = self.find(id).await?;
            if job.is_terminal() {
                warn!(
                    "job-{} already {:?}, ignoring completion as {:?}",
                    id, job.status, status
                );
                return Ok(false);
            }
            if job.status == JobStatus::Queued && !allow_queued {
                return Err(JobError::InvalidTransition {
                    job_id: id,
                    status: job.status,
                    operation: "complete",
                });
            }
            let mut done = job;
            done.status = status;
            done.result_code = code;
            done.result = result.clone();
            done.complete_msid = Some(self.msid());
            done.executing_msid = None;
            done.suspended = false;
            done.last_updated = Some(now());

            match self.inner.store.complete_job(&done).await {
                Ok(resolved) => {
                    debug!("job-{} {:?} with code {}", id, status, code);
                    self.after_completion(&done, resolved).await;
                    return Ok(true);
                }
                Err(StoreError::VersionMismatch { .. }) => {
                    debug!("job-{} changed while completing, retrying", id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Side effects of a committed terminal transition. The transition
    /// stands even if one of them fails; the sweeps repair what is left.
    async fn after_completion(&self, job: &AsyncJob, resolved: Vec<AsyncJobJoinMap>) {
        let event = JobStateEvent {
            job_id: job.id,
            status: job.status,
            result_code: job.result_code,
        };
        match serde_json::to_value(&event) {
            Ok(payload) => self.inner.bus.publish(self.msid(), JOB_STATE, payload),
            Err(e) => error!("job-{}: state event not published: {}", job.id, e),
        }

        if let Some(sync_object) = &job.sync_object {
            match self.inner.queues.release_for(sync_object, job.id).await {
                Ok(release) => {
                    if release.released.is_none() {
                        if let Err(e) = self.inner.queues.withdraw(sync_object, job.id).await {
                            error!("job-{}: not withdrawn from {}: {}", job.id, sync_object, e);
                        }
                    }
                    if let Some(next) = release.promoted {
                        self.schedule(next.content_id);
                    }
                }
                Err(e) => error!("job-{}: {} not released: {}", job.id, sync_object, e),
            }
        }

        for join in resolved {
            self.notify_join(join).await;
        }
    }

    async fn notify_join(&self, join: AsyncJobJoinMap) {
        let Some(spec) = &join.wakeup else {
            return;
        };
        for topic in &spec.topics {
            self.inner.bus.publish(
                self.msid(),
                topic,
                json!({ "job_id": join.job_id, "join_job_id": join.join_job_id }),
            );
        }
        let (parent, child) = (join.job_id, join.join_job_id);
        if let Err(e) = self.try_wake(join).await {
            error!("job-{}: wakeup after job-{} failed: {}", parent, child, e);
        }
    }

    async fn on_state_event(&self, msg: BusMessage) {
        let event: JobStateEvent = match serde_json::from_value(msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("malformed {} message from {}: {}", JOB_STATE, msg.sender, e);
                return;
            }
        };
        let joins = match self.inner.store.find_joins_by_child(event.job_id).await {
            Ok(joins) => joins,
            Err(e) => {
                error!("joins on job-{} not loaded: {}", event.job_id, e);
                return;
            }
        };
        for join in joins {
            if join.wakeup.is_some() && !join.woken && join.is_resolved() {
                let parent = join.job_id;
                if let Err(e) = self.try_wake(join).await {
                    error!("job-{}: wakeup failed: {}", parent, e);
                }
            }
        }
    }

    /// Claim the join's wakeup and resume its suspended parent on this
    /// instance. Returns false when there is nothing to do or another
    /// caller won.
    async fn try_wake(&self, mut join: AsyncJobJoinMap) -> Result<bool, JobError> {
        let Some(spec) = join.wakeup.clone() else {
            return Ok(false);
        };
        let msid = self.msid();
        let claimed = loop {
            if join.woken {
                return Ok(false);
            }
            let parent = match self.inner.store.find_job(join.job_id).await? {
                Some(parent) => parent,
                None => return Ok(false),
            };
            // a running parent picks the join up when it suspends
            if !parent.is_terminal() && !parent.suspended {
                return Ok(false);
            }
            let mut claim = join.clone();
            claim.woken = true;
            claim.last_updated = now();
            match self.inner.store.update_join(&claim).await {
                Ok(claimed) if parent.is_terminal() => {
                    debug!("job-{} finished before its wakeup, dropped", claimed.job_id);
                    return Ok(false);
                }
                Ok(claimed) => break (claimed, parent),
                Err(StoreError::VersionMismatch { .. }) => {
                    match self
                        .inner
                        .store
                        .find_join(join.job_id, join.join_job_id)
                        .await?
                    {
                        Some(fresh) => join = fresh,
                        None => return Ok(false),
                    }
                }
                Err(StoreError::NotFound { .. }) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        };
        let (claimed, parent) = claimed;

        let at = now();
        let resumed = self
            .modify_job(parent.id, |p| {
                if p.is_terminal() || !p.suspended {
                    return Ok(false);
                }
                p.suspended = false;
                p.executing_msid = Some(msid);
                p.last_updated = Some(at);
                Ok(true)
            })
            .await?;
        if resumed.is_none() {
            // another join already resumed the parent, keep this one pending
            let mut unclaimed = claimed;
            unclaimed.woken = false;
            if let Err(e) = self.inner.store.update_join(&unclaimed).await {
                debug!("job-{}: wakeup on job-{} not re-armed: {}", parent.id, unclaimed.join_job_id, e);
            }
            return Ok(false);
        }

        let reason = if claimed.is_resolved() {
            WakeupReason::ChildCompleted
        } else {
            WakeupReason::Timeout
        };
        let dispatcher = if spec.dispatcher.is_empty() {
            parent.dispatcher.clone()
        } else {
            spec.dispatcher.clone()
        };
        info!(
            "job-{} woken by job-{} ({:?}), resuming in '{}'",
            parent.id, claimed.join_job_id, reason, dispatcher
        );
        self.spawn_run(
            parent.id,
            Some(Resume {
                wakeup: Wakeup {
                    child: claimed.join_job_id,
                    reason,
                    handler: spec.handler,
                },
                dispatcher,
            }),
        );
        Ok(true)
    }

    fn publish_event(&self, id: JobId, event: &str, mut details: Value) {
        details["job_id"] = json!(id);
        details["event"] = json!(event);
        self.inner.bus.publish(self.msid(), JOB_EVENT_PUBLISH, details);
    }

    fn schedule(&self, id: JobId) {
        self.spawn_run(id, None);
    }

    fn spawn_run(&self, id: JobId, resume: Option<Resume>) {
        let manager = self.clone();
        let scheduled = self
            .inner
            .executor
            .spawn(format!("job-{}", id), async move { manager.run_job(id, resume).await });
        if !scheduled {
            warn!("job-{} not scheduled, manager is shutting down", id);
        }
    }

    /// Take ownership of a queued job. None if it is not startable here:
    /// already claimed, finished, or waiting behind its sync slot.
    async fn claim_job(&self, id: JobId) -> Result<Option<AsyncJob>, JobError> {
        let Some(job) = self.inner.store.find_job(id).await? else {
            warn!("job-{} vanished before it could start", id);
            return Ok(None);
        };
        if job.status != JobStatus::Queued {
            debug!("job-{} is {:?}, not starting it", id, job.status);
            return Ok(None);
        }
        if let Some(sync_object) = &job.sync_object {
            let holder = self.inner.queues.active_item(sync_object).await?;
            if holder.map(|item| item.content_id) != Some(id) {
                debug!("job-{} waits for {}", id, sync_object);
                return Ok(None);
            }
        }
        let msid = self.msid();
        let at = now();
        self.modify_job(id, |j| {
            if j.status != JobStatus::Queued {
                return Ok(false);
            }
            j.status = JobStatus::InProgress;
            j.executing_msid = Some(msid);
            j.last_updated = Some(at);
            Ok(true)
        })
        .await
    }

    async fn run_job(&self, id: JobId, resume: Option<Resume>) {
        let claimed = match resume {
            None => self.claim_job(id).await,
            Some(_) => self.find(id).await.map(Some),
        };
        let job = match claimed {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!("job-{} cannot start: {}", id, e);
                return;
            }
        };
        if job.is_terminal() {
            return;
        }
        let (dispatcher_name, wakeup) = match resume {
            Some(resume) => (resume.dispatcher, Some(resume.wakeup)),
            None => (job.dispatcher.clone(), None),
        };
        let Some(dispatcher) = self.inner.dispatchers.get(&dispatcher_name) else {
            let exc = JobException::internal(JobError::NoSuchDispatcher(dispatcher_name).to_string());
            if let Err(e) = self.fail_with(id, result_code::INTERNAL_ERROR, &exc).await {
                error!("job-{}: {}", id, e);
            }
            return;
        };

        debug!("job-{} running in '{}'", id, dispatcher_name);
        let ctx = AsyncJobExecutionContext::new(self.clone(), job, wakeup);
        let outcome = AssertUnwindSafe(dispatcher.run_job(&ctx))
            .catch_unwind()
            .await
            .map_err(|payload| panic_message(payload.as_ref()));

        let settled = match outcome {
            Ok(Ok(JobOutcome::Succeeded(result))) => self
                .complete_async_job(id, JobStatus::Succeeded, result_code::SUCCESS, result)
                .await
                .map(|_| ()),
            Ok(Ok(JobOutcome::Completed)) => self.ensure_completed(id).await,
            Ok(Ok(JobOutcome::Suspended)) => self.suspend(id).await,
            Ok(Err(exc)) => {
                debug!("job-{} failed: {}", id, exc);
                self.fail_with(id, exc.result_code(), &exc).await.map(|_| ())
            }
            Err(panic) => {
                error!("job-{}: dispatcher '{}' panicked: {}", id, dispatcher_name, panic);
                let exc = JobException::internal(format!("dispatcher panicked: {}", panic));
                self.fail_with(id, result_code::INTERNAL_ERROR, &exc)
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = settled {
            error!("job-{} not settled: {}", id, e);
        }
    }

    async fn ensure_completed(&self, id: JobId) -> Result<(), JobError> {
        let job = self.find(id).await?;
        if !job.is_terminal() {
            warn!("job-{}: dispatcher reported completion but the job is {:?}", id, job.status);
            let exc = JobException::internal("dispatcher returned without completing the job");
            self.fail_with(id, result_code::INTERNAL_ERROR, &exc).await?;
        }
        Ok(())
    }

    /// Park a job that returned `Suspended`, then wake it right away if one
    /// of its joins resolved while it was still running.
    async fn suspend(&self, id: JobId) -> Result<(), JobError> {
        let at = now();
        let parked = self
            .modify_job(id, |job| {
                if job.status != JobStatus::InProgress {
                    return Ok(false);
                }
                job.suspended = true;
                job.executing_msid = None;
                job.last_updated = Some(at);
                Ok(true)
            })
            .await?;
        if parked.is_none() {
            return Ok(());
        }

        let pending: Vec<AsyncJobJoinMap> = self
            .inner
            .store
            .find_joins_by_parent(id)
            .await?
            .into_iter()
            .filter(|join| join.wakeup.is_some() && !join.woken)
            .collect();
        if pending.is_empty() {
            let exc = JobException::internal("suspended without a pending wakeup join");
            self.fail_with(id, result_code::INTERNAL_ERROR, &exc).await?;
            return Ok(());
        }
        debug!("job-{} suspended on {} join(s)", id, pending.len());

        let at = now();
        for join in pending {
            if (join.is_resolved() || join.is_expired(at)) && self.try_wake(join).await? {
                break;
            }
        }
        Ok(())
    }
}
