// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Per-resource admission control. At most one item per sync object is
//! active, the rest wait in FIFO order and the depth is bounded.

pub mod item;

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use time::OffsetDateTime;

use crate::error::StoreResult;
use crate::job::{JobId, JobStatus};
use crate::msid::Msid;
use crate::store::JobStore;

pub use item::{Admission, ItemState, Release, SyncObject, SyncQueueItem};

pub const ASYNC_JOB_CONTENT: &str = "AsyncJob";

/// What the stale sweep decided for an active slot.
#[derive(Clone, Debug, PartialEq)]
pub enum SweepAction {
    /// Owner is gone or finished, the slot was released.
    Released {
        item: SyncQueueItem,
        promoted: Option<SyncQueueItem>,
    },
    /// Owner was admitted but never started, it needs scheduling.
    Reschedule(JobId),
}

#[derive(Clone)]
pub struct SyncQueueManager {
    store: Arc<dyn JobStore>,
    msid: Msid,
    default_limit: usize,
}

impl SyncQueueManager {
    pub fn new(store: Arc<dyn JobStore>, msid: Msid, default_limit: usize) -> Self {
        Self {
            store,
            msid,
            default_limit,
        }
    }

    /// Atomic insert-and-check against `limit` (or the default limit).
    pub async fn enqueue(
        &self,
        sync_object: &SyncObject,
        job_id: JobId,
        limit: Option<usize>,
    ) -> StoreResult<Admission> {
        let limit = limit.unwrap_or(self.default_limit);
        let admission = self
            .store
            .enqueue_sync_item(sync_object, ASYNC_JOB_CONTENT, job_id, limit, self.msid)
            .await?;
        match &admission {
            Admission::Admitted(_) => debug!("job-{} holds {}", job_id, sync_object),
            Admission::Queued(item) => debug!(
                "job-{} waits on {} (item {})",
                job_id, sync_object, item.id
            ),
            Admission::Rejected { depth, limit } => warn!(
                "job-{} rejected on {}: depth {} at limit {}",
                job_id, sync_object, depth, limit
            ),
        }
        Ok(admission)
    }

    /// Release whatever holds the slot. Releasing a free slot is a no-op.
    pub async fn release(&self, sync_object: &SyncObject) -> StoreResult<Release> {
        self.store.release_sync_item(sync_object, None, self.msid).await
    }

    /// Release only if `job_id` holds the slot.
    pub async fn release_for(
        &self,
        sync_object: &SyncObject,
        job_id: JobId,
    ) -> StoreResult<Release> {
        let release = self
            .store
            .release_sync_item(sync_object, Some(job_id), self.msid)
            .await?;
        if let Some(next) = &release.promoted {
            debug!(
                "{} passed from job-{} to job-{}",
                sync_object, job_id, next.content_id
            );
        }
        Ok(release)
    }

    /// Remove `job_id` from the waiting part of the queue.
    pub async fn withdraw(
        &self,
        sync_object: &SyncObject,
        job_id: JobId,
    ) -> StoreResult<Option<SyncQueueItem>> {
        let withdrawn = self.store.withdraw_sync_item(sync_object, job_id).await?;
        if withdrawn.is_some() {
            debug!("job-{} withdrawn from {}", job_id, sync_object);
        }
        Ok(withdrawn)
    }

    pub async fn active_item(&self, sync_object: &SyncObject) -> StoreResult<Option<SyncQueueItem>> {
        self.store.find_active_sync_item(sync_object).await
    }

    pub async fn depth(&self, sync_object: &SyncObject) -> StoreResult<usize> {
        self.store.sync_queue_depth(sync_object).await
    }

    /// Inspect every active slot. A slot whose job is missing or terminal is
    /// released; a slot whose job is still queued after `stale_after` is
    /// handed back for scheduling. Slots of running jobs are left alone.
    pub async fn sweep_stale(&self, stale_after: Duration) -> StoreResult<Vec<SweepAction>> {
        let now = OffsetDateTime::now_utc();
        let mut actions = Vec::new();
        for item in self.store.find_active_sync_items().await? {
            let job = self.store.find_job(item.content_id).await?;
            match job {
                Some(job) if !job.is_terminal() => {
                    let since = item.last_processed.unwrap_or(item.created);
                    if job.status == JobStatus::Queued && since + stale_after <= now {
                        info!(
                            "job-{} admitted on {} but never started, rescheduling",
                            job.id, item.sync_object
                        );
                        self.store.touch_sync_item(item.id, self.msid).await?;
                        actions.push(SweepAction::Reschedule(job.id));
                    }
                }
                _ => {
                    let release = self
                        .store
                        .release_sync_item(&item.sync_object, Some(item.content_id), self.msid)
                        .await?;
                    if let Some(released) = release.released {
                        info!(
                            "released {} held by finished or missing job-{}",
                            released.sync_object, released.content_id
                        );
                        actions.push(SweepAction::Released {
                            item: released,
                            promoted: release.promoted,
                        });
                    }
                }
            }
        }
        Ok(actions)
    }
}
