// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::OnceLock;
use std::time::Duration;

use crate::manager::ManagerConfig;
use crate::msid::Msid;

pub use crate::manager::OrphanPolicyKind;

#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub msid: Msid,
    pub worker_threads: usize,
    pub callback_threads: usize,
    pub queue_size_limit: usize,
    pub heartbeat_interval: Duration,
    pub orphan_policy: OrphanPolicyKind,
}

// Set once in main(), read by everything that builds a manager afterwards.
pub static CONFIG: OnceLock<GlobalConfig> = OnceLock::new();

pub fn initialize_global_config(config: GlobalConfig) {
    if CONFIG.set(config).is_err() {
        eprintln!("Failed to initialize global config");
        std::process::exit(1);
    }
}

pub fn get_config<'a>() -> &'a GlobalConfig {
    CONFIG.get().unwrap()
}

impl GlobalConfig {
    /// Manager settings derived from the process-wide values. Everything
    /// not exposed on the command line keeps its default.
    pub fn to_manager_config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::default()
            .with_msid(self.msid)
            .with_queue_size_limit(self.queue_size_limit)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_orphan_policy(self.orphan_policy);
        config.worker_threads = self.worker_threads;
        config.callback_threads = self.callback_threads;
        config
    }
}
