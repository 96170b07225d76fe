// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use super::reconcile::OrphanPolicyKind;
use crate::msid::Msid;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub msid: Msid,
    /// Workers running job futures and background loops.
    pub worker_threads: usize,
    /// Workers running endpoint answer callbacks.
    pub callback_threads: usize,
    /// Default depth limit of every sync queue.
    pub queue_size_limit: usize,
    pub heartbeat_interval: Duration,
    /// Poll fallback for joins when no bus notification arrives.
    pub default_wakeup_interval: Duration,
    /// Default expiration of an asynchronous join.
    pub join_timeout: Duration,
    /// An admitted job still queued after this long gets rescheduled.
    pub stale_queue_item_after: Duration,
    /// An instance without heartbeat for this long is considered dead.
    pub instance_dead_after: Duration,
    /// Terminal jobs older than this are expunged.
    pub job_expire_after: Duration,
    pub orphan_policy: OrphanPolicyKind,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(2);
        Self {
            msid: Msid::current(),
            worker_threads: 8,
            callback_threads: 4,
            queue_size_limit: 10,
            heartbeat_interval,
            default_wakeup_interval: Duration::from_secs(3),
            join_timeout: Duration::from_secs(10 * 60),
            stale_queue_item_after: Duration::from_secs(5 * 60),
            instance_dead_after: heartbeat_interval * 3,
            job_expire_after: Duration::from_secs(24 * 60 * 60),
            orphan_policy: OrphanPolicyKind::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_msid(mut self, msid: Msid) -> Self {
        self.msid = msid;
        self
    }

    pub fn with_queue_size_limit(mut self, limit: usize) -> Self {
        self.queue_size_limit = limit;
        self
    }

    /// Also moves `instance_dead_after` to three missed heartbeats.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.instance_dead_after = interval * 3;
        self
    }

    pub fn with_wakeup_interval(mut self, interval: Duration) -> Self {
        self.default_wakeup_interval = interval;
        self
    }

    pub fn with_orphan_policy(mut self, policy: OrphanPolicyKind) -> Self {
        self.orphan_policy = policy;
        self
    }
}
