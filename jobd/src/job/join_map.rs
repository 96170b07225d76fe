// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use time::OffsetDateTime;

use super::{JobId, JobStatus};
use crate::msid::Msid;

/// How a suspended parent gets re-dispatched once its join resolves.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WakeupSpec {
    /// Free-form marker handed back to the parent on wakeup.
    pub handler: String,
    /// Dispatcher that runs the continuation. Empty means the parent's own.
    pub dispatcher: String,
    /// Extra bus topics notified when the join resolves.
    pub topics: SmallVec<[String; 2]>,
    /// Poll fallback in case a bus notification is missed.
    pub interval: Duration,
    /// Wake the parent with a timeout indication after this long.
    pub timeout: Duration,
}

impl WakeupSpec {
    pub fn new(dispatcher: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            handler: String::new(),
            dispatcher: dispatcher.into(),
            topics: SmallVec::new(),
            interval,
            timeout,
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }
}

/// Dependency edge: `job_id` waits for `join_job_id`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AsyncJobJoinMap {
    pub id: u64,
    pub job_id: JobId,
    pub join_job_id: JobId,
    /// Mirrors the child's terminal status, `InProgress` until then.
    pub join_status: JobStatus,
    pub join_result: Option<String>,
    pub join_msid: Msid,
    pub complete_msid: Option<Msid>,

    pub wakeup: Option<WakeupSpec>,
    pub next_wakeup: Option<OffsetDateTime>,
    pub expiration: Option<OffsetDateTime>,
    pub woken: bool,

    pub created: OffsetDateTime,
    pub last_updated: OffsetDateTime,
    pub version: u64,
}

impl AsyncJobJoinMap {
    pub fn new(job_id: JobId, join_job_id: JobId, join_msid: Msid) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: 0,
            job_id,
            join_job_id,
            join_status: JobStatus::InProgress,
            join_result: None,
            join_msid,
            complete_msid: None,
            wakeup: None,
            next_wakeup: None,
            expiration: None,
            woken: false,
            created: now,
            last_updated: now,
            version: 0,
        }
    }

    pub fn with_wakeup(mut self, spec: WakeupSpec) -> Self {
        self.next_wakeup = Some(self.created + spec.interval);
        self.expiration = Some(self.created + spec.timeout);
        self.wakeup = Some(spec);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.join_status.is_terminal()
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }

    /// Copy the child's terminal outcome into this record.
    pub fn resolve(
        &mut self,
        status: JobStatus,
        result: Option<String>,
        msid: Option<Msid>,
        now: OffsetDateTime,
    ) {
        self.join_status = status;
        self.join_result = result;
        self.complete_msid = msid;
        self.last_updated = now;
    }
}
