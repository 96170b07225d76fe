// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use async_channel::{Receiver, Sender};
use futures::executor::ThreadPool;
use log::{debug, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};

/// A unit of work the executor can run.
pub trait WorkItem: Send + 'static {
    /// Free-form description, used for logging or debugging
    fn desc(&self) -> &str;

    /// Creates the future that executes this work item
    fn create_task(&self) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

impl std::fmt::Debug for dyn WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("desc", &self.desc())
            .finish()
    }
}

/// Fires once the owning executor is closed. Cloneable, never sends a value.
#[derive(Debug, Clone)]
pub struct ShutdownSignal(Receiver<()>);

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.0.is_closed()
    }

    /// Resolves when the executor closes.
    pub async fn triggered(&self) {
        // recv only ever returns Err(closed); nobody sends on this channel
        let _ = self.0.recv().await;
    }
}

struct InFlight {
    count: Mutex<usize>,
    cvar: Condvar,
}

/// Decrements the in-flight counter when the task ends, also on unwind.
struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn new(in_flight: Arc<InFlight>) -> Self {
        *in_flight.count.lock().unwrap() += 1;
        Self(in_flight)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(|e| e.into_inner());
        *count -= 1;
        if *count == 0 {
            self.0.cvar.notify_all();
        }
    }
}

/// Bounded thread pool with shutdown signalling and in-flight tracking.
pub struct Executor {
    name: String,
    pool: ThreadPool,
    in_flight: Arc<InFlight>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.name)
            .field("in_flight", &self.in_flight_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Executor {
    pub fn new(name: impl Into<String>, pool_size: usize) -> std::io::Result<Self> {
        let name = name.into();
        let pool = ThreadPool::builder()
            .pool_size(pool_size.max(1))
            .name_prefix(format!("{}-", name))
            .create()?;
        let (tx, rx) = async_channel::bounded(1);
        Ok(Self {
            name,
            pool,
            in_flight: Arc::new(InFlight {
                count: Mutex::new(0),
                cvar: Condvar::new(),
            }),
            shutdown_tx: Mutex::new(Some(tx)),
            shutdown_rx: rx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a work item. Returns false if the executor is already closed.
    pub fn dispatch(&self, item: Box<dyn WorkItem>) -> bool {
        let desc = item.desc().to_string();
        self.spawn(desc, item.create_task())
    }

    /// Run a future. Returns false if the executor is already closed.
    pub fn spawn<F>(&self, desc: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.try_spawn(desc, task).is_ok()
    }

    /// Like [`Executor::spawn`], but hands the task back when the executor
    /// is closed so the caller can still run it elsewhere.
    pub fn try_spawn<F>(&self, desc: impl Into<String>, task: F) -> Result<(), F>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let desc = desc.into();
        if self.is_closed() {
            warn!("{}: rejecting '{}', executor closed", self.name, desc);
            return Err(task);
        }
        let guard = InFlightGuard::new(self.in_flight.clone());
        self.pool.spawn_ok(async move {
            let _guard = guard;
            debug!("Executing: {}", desc);
            task.await;
        });
        Ok(())
    }

    /// Await `result` on this executor and hand it to `callback`.
    ///
    /// When the executor is already closed the work moves to a dedicated
    /// thread, so the callback still runs exactly once and never on the
    /// caller's thread.
    pub fn deliver<T, F>(&self, desc: String, result: F, callback: Box<dyn FnOnce(T) + Send>)
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let task = async move {
            let result = result.await;
            callback(result);
        };
        if let Err(task) = self.try_spawn(desc.clone(), task) {
            warn!("{}: callback pool closed, completing on a helper thread", desc);
            std::thread::spawn(move || futures::executor::block_on(task));
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown_rx.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown_rx.is_closed()
    }

    pub fn in_flight_count(&self) -> usize {
        *self.in_flight.count.lock().unwrap()
    }

    /// Stop accepting work and fire the shutdown signal. Running tasks continue.
    pub fn close(&self) {
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            tx.close();
            debug!("{}: closed", self.name);
        }
    }

    /// Close, then block until every spawned task has finished.
    pub fn wait_until_finished(&self) {
        self.close();
        let mut count = self.in_flight.count.lock().unwrap();
        while *count > 0 {
            count = self.in_flight.cvar.wait(count).unwrap();
        }
        debug!("{}: all tasks finished", self.name);
    }
}
