// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use jobd::job::{AsyncJob, JobId};
use jobd::manager::{AsyncJobManager, JobDispatcher, ManagerConfig};
use jobd::message_bus::LocalMessageBus;
use jobd::store::MemoryJobStore;
use jobd::Msid;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fast timings so sweeps and polls happen within a test's lifetime.
pub fn test_config(msid: u64) -> ManagerConfig {
    let mut config = ManagerConfig::default()
        .with_msid(Msid(msid))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_wakeup_interval(Duration::from_millis(20));
    config.worker_threads = 4;
    config.callback_threads = 2;
    config
}

/// Several manager instances sharing one store and one bus, the way
/// orchestrator processes share the database and the message broker.
pub struct Cluster {
    pub store: Arc<MemoryJobStore>,
    pub bus: Arc<LocalMessageBus>,
    pub nodes: Vec<AsyncJobManager>,
}

impl Cluster {
    pub fn new(size: usize) -> Self {
        Self::with_config(size, |c| c)
    }

    pub fn with_config(size: usize, configure: impl Fn(ManagerConfig) -> ManagerConfig) -> Self {
        init_logging();
        let store = Arc::new(MemoryJobStore::new());
        let bus = Arc::new(LocalMessageBus::new());
        let nodes = (1..=size as u64)
            .map(|msid| {
                AsyncJobManager::new(configure(test_config(msid)), store.clone(), bus.clone())
                    .unwrap_or_else(|e| panic!("failed to create manager {msid}: {e}"))
            })
            .collect();
        Self { store, bus, nodes }
    }

    pub fn node(&self, index: usize) -> &AsyncJobManager {
        &self.nodes[index]
    }

    pub fn register_everywhere(&self, name: &str, dispatcher: Arc<dyn JobDispatcher>) {
        for node in &self.nodes {
            node.register_dispatcher(name, dispatcher.clone());
        }
    }

    pub fn start_all(&self) {
        for node in &self.nodes {
            block_on(node.start()).unwrap_or_else(|e| panic!("failed to start {}: {e}", node.msid()));
        }
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

pub fn submit(manager: &AsyncJobManager, dispatcher: &str) -> JobId {
    block_on(manager.submit_async_job(AsyncJob::new(dispatcher, "test", "{}")))
        .unwrap_or_else(|e| panic!("submit to '{dispatcher}' failed: {e}"))
}

pub fn wait_done(manager: &AsyncJobManager, id: JobId) -> AsyncJob {
    let job = block_on(manager.wait_for_job(id, Duration::from_secs(10)))
        .unwrap_or_else(|e| panic!("job-{id} not readable: {e}"));
    assert!(job.is_terminal(), "job-{} still {:?} after 10s", id, job.status);
    job
}

pub fn wait_until(manager: &AsyncJobManager, id: JobId, pred: impl Fn(&AsyncJob) -> bool) -> AsyncJob {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = block_on(manager.query_job(id, false))
            .unwrap_or_else(|e| panic!("job-{id} not readable: {e}"));
        if pred(&job) {
            return job;
        }
        assert!(Instant::now() < deadline, "job-{} stuck as {:?}", id, job.status);
        thread::sleep(Duration::from_millis(5));
    }
}
