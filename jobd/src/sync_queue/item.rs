// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::job::JobId;
use crate::msid::Msid;

/// The resource whose operations must be serialized, e.g. `vm-42`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SyncObject {
    pub obj_type: String,
    pub obj_id: u64,
}

impl SyncObject {
    pub fn new(obj_type: impl Into<String>, obj_id: u64) -> Self {
        Self {
            obj_type: obj_type.into(),
            obj_id,
        }
    }
}

impl std::fmt::Display for SyncObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.obj_type, self.obj_id)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    Waiting,
    Active,
}

/// One admission ticket into a sync object's queue.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncQueueItem {
    pub id: u64,
    pub queue_id: u64,
    pub sync_object: SyncObject,
    pub content_type: String,
    pub content_id: JobId,
    pub state: ItemState,
    /// Enqueue time, primary FIFO key.
    pub created: OffsetDateTime,
    pub last_processed: Option<OffsetDateTime>,
    pub last_processed_msid: Option<Msid>,
}

impl SyncQueueItem {
    pub fn is_active(&self) -> bool {
        self.state == ItemState::Active
    }

    /// FIFO order: enqueue time, ties broken by ascending job id.
    pub fn fifo_key(&self) -> (OffsetDateTime, JobId) {
        (self.created, self.content_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    /// The item holds the slot and its job may run right away.
    Admitted(SyncQueueItem),
    /// Waiting behind the active item.
    Queued(SyncQueueItem),
    /// Depth already at the limit, nothing was inserted.
    Rejected { depth: usize, limit: usize },
}

/// Outcome of releasing a slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Release {
    pub released: Option<SyncQueueItem>,
    /// The next waiting item, now active.
    pub promoted: Option<SyncQueueItem>,
}
