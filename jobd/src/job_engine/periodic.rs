// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_io::Timer;
use futures::future::{select, BoxFuture, Either};
use log::{debug, info};

use super::work_item::{ShutdownSignal, WorkItem};

type Tick = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs `tick` every `interval` until the shutdown signal fires.
pub struct PeriodicLoop {
    desc: String,
    interval: Duration,
    shutdown: ShutdownSignal,
    tick: Tick,
}

impl PeriodicLoop {
    pub fn new<F>(
        desc: impl Into<String>,
        interval: Duration,
        shutdown: ShutdownSignal,
        tick: F,
    ) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            desc: desc.into(),
            interval,
            shutdown,
            tick: Arc::new(tick),
        }
    }
}

impl WorkItem for PeriodicLoop {
    fn desc(&self) -> &str {
        &self.desc
    }

    fn create_task(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let desc = self.desc.clone();
        let interval = self.interval;
        let shutdown = self.shutdown.clone();
        let tick = self.tick.clone();
        Box::pin(async move {
            info!("Starting loop '{}' every {:?}", desc, interval);
            loop {
                if shutdown.is_triggered() {
                    break;
                }
                let stop = std::pin::pin!(shutdown.triggered());
                match select(Timer::after(interval), stop).await {
                    Either::Left(_) => {
                        debug!("Tick '{}'", desc);
                        tick().await;
                    }
                    Either::Right(_) => break,
                }
            }
            info!("Loop '{}' ended", desc);
        })
    }
}
