// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use jobd::job::JobId;
use jobd::job_engine::sleep;
use jobd::manager::{ClosureDispatcher, JobDispatcher, JobOutcome};
use jobd::JobException;
use serde_json::Value;

/// Jobs behind a gate block until it is opened. Opening is final.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Gate {
    fn default() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self) {
        self.tx.close();
    }

    pub async fn passed(&self) {
        // nothing is ever sent, recv returns once the channel is closed
        let _ = self.rx.recv().await;
    }
}

pub fn gated(gate: &Gate, result: Value) -> Arc<dyn JobDispatcher> {
    let gate = gate.clone();
    Arc::new(ClosureDispatcher::from_async("gated", move |_ctx| {
        let gate = gate.clone();
        let result = result.clone();
        async move {
            gate.passed().await;
            Ok(JobOutcome::Succeeded(Some(result)))
        }
    }))
}

pub fn succeeding(result: Value) -> Arc<dyn JobDispatcher> {
    Arc::new(ClosureDispatcher::from_async("succeeding", move |_ctx| {
        let result = result.clone();
        async move { Ok(JobOutcome::Succeeded(Some(result))) }
    }))
}

pub fn failing(exc: JobException) -> Arc<dyn JobDispatcher> {
    Arc::new(ClosureDispatcher::from_async("failing", move |_ctx| {
        let exc = exc.clone();
        async move { Err(exc) }
    }))
}

/// Observes how runs overlap per sync object.
#[derive(Debug, Default)]
pub struct Recorder {
    active: Mutex<HashMap<String, usize>>,
    max_active: AtomicUsize,
    finished: Mutex<Vec<JobId>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of simultaneous runs seen on any one sync object.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> Vec<JobId> {
        self.finished.lock().unwrap().clone()
    }

    fn enter(&self, key: &str) {
        let mut active = self.active.lock().unwrap();
        let count = active.entry(key.to_string()).or_insert(0);
        *count += 1;
        self.max_active.fetch_max(*count, Ordering::SeqCst);
    }

    fn leave(&self, key: &str, job_id: JobId) {
        self.finished.lock().unwrap().push(job_id);
        if let Some(count) = self.active.lock().unwrap().get_mut(key) {
            *count -= 1;
        }
    }
}

/// Holds each run for `hold` and reports it to `recorder`.
pub fn recording(recorder: &Arc<Recorder>, hold: Duration) -> Arc<dyn JobDispatcher> {
    let recorder = recorder.clone();
    Arc::new(ClosureDispatcher::from_async("recording", move |ctx| {
        let recorder = recorder.clone();
        async move {
            let key = ctx
                .job()
                .sync_object
                .as_ref()
                .map(|o| o.to_string())
                .unwrap_or_default();
            recorder.enter(&key);
            sleep(hold).await;
            recorder.leave(&key, ctx.job_id());
            Ok(JobOutcome::Succeeded(None))
        }
    }))
}
