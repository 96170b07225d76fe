// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Persistence collaborator. Everything cluster-visible goes through this
//! trait; updates are conditional on the record's `version` and fail with
//! [`StoreError::VersionMismatch`](crate::error::StoreError) when another
//! writer got there first.

pub mod memory;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StoreResult;
use crate::job::{AsyncJob, AsyncJobJoinMap, JobId, JobJournal};
use crate::msid::Msid;
use crate::sync_queue::{Admission, Release, SyncObject, SyncQueueItem};

pub use memory::MemoryJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    // === jobs ===

    /// Assigns the id and returns the stored record.
    async fn insert_job(&self, job: AsyncJob) -> StoreResult<AsyncJob>;

    async fn find_job(&self, id: JobId) -> StoreResult<Option<AsyncJob>>;

    /// Write `job` if the stored version still equals `job.version`.
    async fn update_job(&self, job: &AsyncJob) -> StoreResult<AsyncJob>;

    /// Write a terminal `job` (version checked) and, in the same step, copy
    /// its outcome into every join record naming it as child. Returns the
    /// resolved join records.
    async fn complete_job(&self, job: &AsyncJob) -> StoreResult<Vec<AsyncJobJoinMap>>;

    /// Jobs executing on one of `msids`, plus jobs initialized by one of
    /// them that nobody has claimed yet.
    async fn find_jobs_owned_by(&self, msids: &[Msid]) -> StoreResult<Vec<AsyncJob>>;

    /// Non-terminal, non-pseudo jobs owned by `msid`, or initialized by it
    /// and not yet picked up.
    async fn count_pending_non_pseudo_jobs(&self, msid: Msid) -> StoreResult<usize>;

    async fn find_instance_pending_jobs(
        &self,
        instance_type: &str,
        account_id: Option<u64>,
    ) -> StoreResult<Vec<AsyncJob>>;

    async fn find_pseudo_job(
        &self,
        msid: Msid,
        account_id: u64,
        user_id: u64,
    ) -> StoreResult<Option<AsyncJob>>;

    async fn expunge_pseudo_jobs(&self, msid: Msid) -> StoreResult<usize>;

    /// Remove terminal jobs last updated before `cutoff`, with their journals.
    async fn expunge_completed_before(&self, cutoff: OffsetDateTime) -> StoreResult<usize>;

    // === journal ===

    /// Append to a job that is not terminal, checked in the same step.
    /// Fails with `NotFound` for a missing job and `Terminal` for a
    /// finished one.
    async fn append_journal(&self, entry: JobJournal) -> StoreResult<JobJournal>;

    async fn list_journal(&self, job_id: JobId) -> StoreResult<Vec<JobJournal>>;

    // === sync queues ===

    /// Insert-and-check as one atomic step.
    async fn enqueue_sync_item(
        &self,
        sync_object: &SyncObject,
        content_type: &str,
        content_id: JobId,
        limit: usize,
        msid: Msid,
    ) -> StoreResult<Admission>;

    /// Remove the active item (only if owned by `content_id` when given) and
    /// promote the next waiting one. A free slot is a no-op.
    async fn release_sync_item(
        &self,
        sync_object: &SyncObject,
        content_id: Option<JobId>,
        msid: Msid,
    ) -> StoreResult<Release>;

    /// Drop a waiting (not active) item, e.g. when its job is cancelled
    /// before it reached the head of the queue.
    async fn withdraw_sync_item(
        &self,
        sync_object: &SyncObject,
        content_id: JobId,
    ) -> StoreResult<Option<SyncQueueItem>>;

    async fn find_active_sync_item(&self, sync_object: &SyncObject)
        -> StoreResult<Option<SyncQueueItem>>;

    async fn find_active_sync_items(&self) -> StoreResult<Vec<SyncQueueItem>>;

    /// Active plus waiting items.
    async fn sync_queue_depth(&self, sync_object: &SyncObject) -> StoreResult<usize>;

    async fn touch_sync_item(&self, item_id: u64, msid: Msid) -> StoreResult<()>;

    // === joins ===

    /// Fails with `Duplicate` if a live record for the pair exists. Resolves
    /// the record on insert when the child is already terminal.
    async fn insert_join(&self, join: AsyncJobJoinMap) -> StoreResult<AsyncJobJoinMap>;

    async fn find_join(&self, job_id: JobId, join_job_id: JobId)
        -> StoreResult<Option<AsyncJobJoinMap>>;

    async fn update_join(&self, join: &AsyncJobJoinMap) -> StoreResult<AsyncJobJoinMap>;

    async fn remove_join(&self, job_id: JobId, join_job_id: JobId)
        -> StoreResult<Option<AsyncJobJoinMap>>;

    async fn find_joins_by_child(&self, join_job_id: JobId) -> StoreResult<Vec<AsyncJobJoinMap>>;

    async fn find_joins_by_parent(&self, job_id: JobId) -> StoreResult<Vec<AsyncJobJoinMap>>;

    /// Unwoken records with a wakeup spec that are resolved, expired or due
    /// for a poll at `now`.
    async fn find_wakeup_candidates(&self, now: OffsetDateTime)
        -> StoreResult<Vec<AsyncJobJoinMap>>;

    // === instance liveness ===

    async fn record_heartbeat(&self, msid: Msid, now: OffsetDateTime) -> StoreResult<()>;

    /// Instances whose last heartbeat is older than `cutoff`.
    async fn find_dead_instances(&self, cutoff: OffsetDateTime) -> StoreResult<Vec<Msid>>;
}
