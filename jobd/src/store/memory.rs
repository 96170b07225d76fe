// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use super::JobStore;
use crate::error::{StoreError, StoreResult};
use crate::job::{AsyncJob, AsyncJobJoinMap, JobId, JobJournal};
use crate::msid::Msid;
use crate::sync_queue::{Admission, ItemState, Release, SyncObject, SyncQueueItem};

#[derive(Debug)]
struct SyncQueue {
    id: u64,
    items: Vec<SyncQueueItem>,
}

#[derive(Debug, Default)]
struct Tables {
    next_job_id: u64,
    next_queue_id: u64,
    next_item_id: u64,
    next_join_id: u64,
    next_journal_id: u64,
    jobs: BTreeMap<JobId, AsyncJob>,
    journal: Vec<JobJournal>,
    queues: HashMap<SyncObject, SyncQueue>,
    joins: BTreeMap<(JobId, JobId), AsyncJobJoinMap>,
    heartbeats: HashMap<Msid, OffsetDateTime>,
}

fn next(counter: &mut u64) -> u64 {
    *counter += 1;
    *counter
}

/// Reference store: one mutex over all tables, so every trait method is a
/// single atomic step.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.tables.lock().unwrap().jobs.len()
    }
}

fn check_version(entity: &'static str, id: u64, stored: u64, expected: u64) -> StoreResult<()> {
    if stored != expected {
        return Err(StoreError::VersionMismatch {
            entity,
            id,
            expected,
        });
    }
    Ok(())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, mut job: AsyncJob) -> StoreResult<AsyncJob> {
        let mut tables = self.tables.lock().unwrap();
        job.id = next(&mut tables.next_job_id);
        job.version = 0;
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: JobId) -> StoreResult<Option<AsyncJob>> {
        Ok(self.tables.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &AsyncJob) -> StoreResult<AsyncJob> {
        let mut tables = self.tables.lock().unwrap();
        let stored = tables.jobs.get_mut(&job.id).ok_or(StoreError::NotFound {
            entity: "job",
            id: job.id,
        })?;
        check_version("job", job.id, stored.version, job.version)?;
        let mut updated = job.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn complete_job(&self, job: &AsyncJob) -> StoreResult<Vec<AsyncJobJoinMap>> {
        let mut guard = self.tables.lock().unwrap();
        let tables = &mut *guard;
        let stored = tables.jobs.get_mut(&job.id).ok_or(StoreError::NotFound {
            entity: "job",
            id: job.id,
        })?;
        check_version("job", job.id, stored.version, job.version)?;
        let mut updated = job.clone();
        updated.version += 1;
        *stored = updated;

        let now = OffsetDateTime::now_utc();
        let mut resolved = Vec::new();
        for join in tables.joins.values_mut() {
            if join.join_job_id == job.id && !join.is_resolved() {
                join.resolve(job.status, job.result.clone(), job.complete_msid, now);
                join.version += 1;
                resolved.push(join.clone());
            }
        }
        Ok(resolved)
    }

    async fn find_jobs_owned_by(&self, msids: &[Msid]) -> StoreResult<Vec<AsyncJob>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .jobs
            .values()
            .filter(|j| match j.executing_msid {
                Some(m) => msids.contains(&m),
                None => j.init_msid.is_some_and(|m| msids.contains(&m)),
            })
            .cloned()
            .collect())
    }

    async fn count_pending_non_pseudo_jobs(&self, msid: Msid) -> StoreResult<usize> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .jobs
            .values()
            .filter(|j| !j.is_terminal() && !j.pseudo)
            .filter(|j| match j.executing_msid {
                Some(m) => m == msid,
                None => j.init_msid == Some(msid),
            })
            .count())
    }

    async fn find_instance_pending_jobs(
        &self,
        instance_type: &str,
        account_id: Option<u64>,
    ) -> StoreResult<Vec<AsyncJob>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .jobs
            .values()
            .filter(|j| !j.is_terminal() && !j.pseudo)
            .filter(|j| j.instance_type.as_deref() == Some(instance_type))
            .filter(|j| account_id.map_or(true, |a| j.account_id == a))
            .cloned()
            .collect())
    }

    async fn find_pseudo_job(
        &self,
        msid: Msid,
        account_id: u64,
        user_id: u64,
    ) -> StoreResult<Option<AsyncJob>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .jobs
            .values()
            .find(|j| {
                j.pseudo
                    && !j.is_terminal()
                    && j.init_msid == Some(msid)
                    && j.account_id == account_id
                    && j.user_id == user_id
            })
            .cloned())
    }

    async fn expunge_pseudo_jobs(&self, msid: Msid) -> StoreResult<usize> {
        let mut tables = self.tables.lock().unwrap();
        let doomed: Vec<JobId> = tables
            .jobs
            .values()
            .filter(|j| j.pseudo && j.init_msid == Some(msid))
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            tables.jobs.remove(id);
        }
        tables.joins.retain(|(parent, _), _| !doomed.contains(parent));
        tables.journal.retain(|e| !doomed.contains(&e.job_id));
        Ok(doomed.len())
    }

    async fn expunge_completed_before(&self, cutoff: OffsetDateTime) -> StoreResult<usize> {
        let mut tables = self.tables.lock().unwrap();
        let doomed: Vec<JobId> = tables
            .jobs
            .values()
            .filter(|j| j.is_terminal() && j.last_updated.unwrap_or(j.created) < cutoff)
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            tables.jobs.remove(id);
        }
        tables.joins.retain(|(parent, _), _| !doomed.contains(parent));
        tables.journal.retain(|e| !doomed.contains(&e.job_id));
        Ok(doomed.len())
    }

    async fn append_journal(&self, mut entry: JobJournal) -> StoreResult<JobJournal> {
        let mut tables = self.tables.lock().unwrap();
        let job = tables.jobs.get(&entry.job_id).ok_or(StoreError::NotFound {
            entity: "job",
            id: entry.job_id,
        })?;
        if job.is_terminal() {
            return Err(StoreError::Terminal {
                entity: "job",
                id: entry.job_id,
            });
        }
        entry.id = next(&mut tables.next_journal_id);
        tables.journal.push(entry.clone());
        Ok(entry)
    }

    async fn list_journal(&self, job_id: JobId) -> StoreResult<Vec<JobJournal>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .journal
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn enqueue_sync_item(
        &self,
        sync_object: &SyncObject,
        content_type: &str,
        content_id: JobId,
        limit: usize,
        msid: Msid,
    ) -> StoreResult<Admission> {
        let mut guard = self.tables.lock().unwrap();
        let tables = &mut *guard;
        let next_queue_id = &mut tables.next_queue_id;
        let queue = tables
            .queues
            .entry(sync_object.clone())
            .or_insert_with(|| SyncQueue {
                id: next(next_queue_id),
                items: Vec::new(),
            });

        if queue.items.iter().any(|i| i.content_id == content_id) {
            return Err(StoreError::Duplicate {
                entity: "sync queue item",
                detail: format!("job-{} already queued on {}", content_id, sync_object),
            });
        }
        let depth = queue.items.len();
        if depth >= limit {
            if queue.items.is_empty() {
                tables.queues.remove(sync_object);
            }
            return Ok(Admission::Rejected { depth, limit });
        }

        let now = OffsetDateTime::now_utc();
        let active = queue.items.iter().any(|i| i.is_active());
        let item = SyncQueueItem {
            id: next(&mut tables.next_item_id),
            queue_id: queue.id,
            sync_object: sync_object.clone(),
            content_type: content_type.to_string(),
            content_id,
            state: if active {
                ItemState::Waiting
            } else {
                ItemState::Active
            },
            created: now,
            last_processed: if active { None } else { Some(now) },
            last_processed_msid: if active { None } else { Some(msid) },
        };
        queue.items.push(item.clone());
        Ok(if active {
            Admission::Queued(item)
        } else {
            Admission::Admitted(item)
        })
    }

    async fn release_sync_item(
        &self,
        sync_object: &SyncObject,
        content_id: Option<JobId>,
        msid: Msid,
    ) -> StoreResult<Release> {
        let mut tables = self.tables.lock().unwrap();
        let Some(queue) = tables.queues.get_mut(sync_object) else {
            return Ok(Release::default());
        };
        let Some(pos) = queue.items.iter().position(|i| i.is_active()) else {
            return Ok(Release::default());
        };
        if content_id.is_some_and(|c| queue.items[pos].content_id != c) {
            return Ok(Release::default());
        }
        let released = queue.items.remove(pos);

        let now = OffsetDateTime::now_utc();
        let promoted = queue
            .items
            .iter_mut()
            .min_by_key(|i| i.fifo_key())
            .map(|next| {
                next.state = ItemState::Active;
                next.last_processed = Some(now);
                next.last_processed_msid = Some(msid);
                next.clone()
            });
        if queue.items.is_empty() {
            tables.queues.remove(sync_object);
        }
        Ok(Release {
            released: Some(released),
            promoted,
        })
    }

    async fn withdraw_sync_item(
        &self,
        sync_object: &SyncObject,
        content_id: JobId,
    ) -> StoreResult<Option<SyncQueueItem>> {
        let mut tables = self.tables.lock().unwrap();
        let Some(queue) = tables.queues.get_mut(sync_object) else {
            return Ok(None);
        };
        let Some(pos) = queue
            .items
            .iter()
            .position(|i| i.content_id == content_id && !i.is_active())
        else {
            return Ok(None);
        };
        let item = queue.items.remove(pos);
        if queue.items.is_empty() {
            tables.queues.remove(sync_object);
        }
        Ok(Some(item))
    }

    async fn find_active_sync_item(
        &self,
        sync_object: &SyncObject,
    ) -> StoreResult<Option<SyncQueueItem>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .queues
            .get(sync_object)
            .and_then(|q| q.items.iter().find(|i| i.is_active()).cloned()))
    }

    async fn find_active_sync_items(&self) -> StoreResult<Vec<SyncQueueItem>> {
        let tables = self.tables.lock().unwrap();
        let mut items: Vec<SyncQueueItem> = tables
            .queues
            .values()
            .flat_map(|q| q.items.iter().filter(|i| i.is_active()).cloned())
            .collect();
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn sync_queue_depth(&self, sync_object: &SyncObject) -> StoreResult<usize> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.queues.get(sync_object).map_or(0, |q| q.items.len()))
    }

    async fn touch_sync_item(&self, item_id: u64, msid: Msid) -> StoreResult<()> {
        let mut tables = self.tables.lock().unwrap();
        let item = tables
            .queues
            .values_mut()
            .flat_map(|q| q.items.iter_mut())
            .find(|i| i.id == item_id)
            .ok_or(StoreError::NotFound {
                entity: "sync queue item",
                id: item_id,
            })?;
        item.last_processed = Some(OffsetDateTime::now_utc());
        item.last_processed_msid = Some(msid);
        Ok(())
    }

    async fn insert_join(&self, mut join: AsyncJobJoinMap) -> StoreResult<AsyncJobJoinMap> {
        let mut tables = self.tables.lock().unwrap();
        let key = (join.job_id, join.join_job_id);
        if tables.joins.contains_key(&key) {
            return Err(StoreError::Duplicate {
                entity: "join",
                detail: format!("job-{} already joins job-{}", key.0, key.1),
            });
        }
        if let Some(child) = tables.jobs.get(&join.join_job_id) {
            if child.is_terminal() {
                let (status, result, msid) =
                    (child.status, child.result.clone(), child.complete_msid);
                join.resolve(status, result, msid, OffsetDateTime::now_utc());
            }
        }
        join.id = next(&mut tables.next_join_id);
        join.version = 0;
        tables.joins.insert(key, join.clone());
        Ok(join)
    }

    async fn find_join(
        &self,
        job_id: JobId,
        join_job_id: JobId,
    ) -> StoreResult<Option<AsyncJobJoinMap>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.joins.get(&(job_id, join_job_id)).cloned())
    }

    async fn update_join(&self, join: &AsyncJobJoinMap) -> StoreResult<AsyncJobJoinMap> {
        let mut tables = self.tables.lock().unwrap();
        let stored = tables
            .joins
            .get_mut(&(join.job_id, join.join_job_id))
            .ok_or(StoreError::NotFound {
                entity: "join",
                id: join.id,
            })?;
        check_version("join", join.id, stored.version, join.version)?;
        let mut updated = join.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn remove_join(
        &self,
        job_id: JobId,
        join_job_id: JobId,
    ) -> StoreResult<Option<AsyncJobJoinMap>> {
        let mut tables = self.tables.lock().unwrap();
        Ok(tables.joins.remove(&(job_id, join_job_id)))
    }

    async fn find_joins_by_child(&self, join_job_id: JobId) -> StoreResult<Vec<AsyncJobJoinMap>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .joins
            .values()
            .filter(|j| j.join_job_id == join_job_id)
            .cloned()
            .collect())
    }

    async fn find_joins_by_parent(&self, job_id: JobId) -> StoreResult<Vec<AsyncJobJoinMap>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .joins
            .range((job_id, 0)..=(job_id, JobId::MAX))
            .map(|(_, j)| j.clone())
            .collect())
    }

    async fn find_wakeup_candidates(
        &self,
        now: OffsetDateTime,
    ) -> StoreResult<Vec<AsyncJobJoinMap>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .joins
            .values()
            .filter(|j| j.wakeup.is_some() && !j.woken)
            .filter(|j| {
                j.is_resolved() || j.is_expired(now) || j.next_wakeup.is_some_and(|t| t <= now)
            })
            .cloned()
            .collect())
    }

    async fn record_heartbeat(&self, msid: Msid, now: OffsetDateTime) -> StoreResult<()> {
        self.tables.lock().unwrap().heartbeats.insert(msid, now);
        Ok(())
    }

    async fn find_dead_instances(&self, cutoff: OffsetDateTime) -> StoreResult<Vec<Msid>> {
        let tables = self.tables.lock().unwrap();
        let mut dead: Vec<Msid> = tables
            .heartbeats
            .iter()
            .filter(|(_, seen)| **seen < cutoff)
            .map(|(msid, _)| *msid)
            .collect();
        dead.sort();
        Ok(dead)
    }
}
