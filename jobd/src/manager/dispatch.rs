// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use agent_commands::Command;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use log::debug;
use serde_json::Value;

use super::context::AsyncJobExecutionContext;
use crate::endpoint::EndPoint;
use crate::error::{JobError, JobException};
use crate::job::JournalType;

/// How a dispatcher left the job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Complete the job as succeeded with this result.
    Succeeded(Option<Value>),
    /// The dispatcher already completed the job through the context.
    Completed,
    /// Parked on an asynchronous join, a wakeup re-dispatches the job.
    Suspended,
}

/// Business logic behind a dispatcher name.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn run_job(&self, ctx: &AsyncJobExecutionContext) -> Result<JobOutcome, JobException>;
}

type DispatchFn = dyn Fn(AsyncJobExecutionContext) -> BoxFuture<'static, Result<JobOutcome, JobException>>
    + Send
    + Sync;

/// Dispatcher from a closure, handy for small handlers and tests.
pub struct ClosureDispatcher {
    desc: String,
    task_creator: Box<DispatchFn>,
}

impl ClosureDispatcher {
    pub fn new<F>(desc: impl Into<String>, f: F) -> Self
    where
        F: Fn(AsyncJobExecutionContext) -> BoxFuture<'static, Result<JobOutcome, JobException>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            desc: desc.into(),
            task_creator: Box::new(f),
        }
    }

    /// Same as [`ClosureDispatcher::new`] for closures returning a plain
    /// `async` block.
    pub fn from_async<F, Fut>(desc: impl Into<String>, f: F) -> Self
    where
        F: Fn(AsyncJobExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JobOutcome, JobException>> + Send + 'static,
    {
        Self::new(desc, move |ctx| f(ctx).boxed())
    }
}

#[async_trait]
impl JobDispatcher for ClosureDispatcher {
    async fn run_job(&self, ctx: &AsyncJobExecutionContext) -> Result<JobOutcome, JobException> {
        debug!("job-{} handled by '{}'", ctx.job_id(), self.desc);
        (self.task_creator)(ctx.clone()).await
    }
}

/// Runs jobs whose `cmd_info` is an agent [`Command`] by sending it to one
/// endpoint. A negative answer fails the job as resource unavailable.
pub struct EndPointDispatcher {
    endpoint: Arc<dyn EndPoint>,
}

impl EndPointDispatcher {
    pub fn new(endpoint: Arc<dyn EndPoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl JobDispatcher for EndPointDispatcher {
    async fn run_job(&self, ctx: &AsyncJobExecutionContext) -> Result<JobOutcome, JobException> {
        let cmd: Command = ctx.command()?;
        debug!(
            "job-{}: sending {} to host {}",
            ctx.job_id(),
            cmd,
            self.endpoint.id()
        );
        ctx.log_journal(
            JournalType::Info,
            format!("sending {} to host {}", cmd, self.endpoint.id()),
            None,
        )
        .await?;

        let answer = self.endpoint.send_message(cmd).await;
        if !answer.result {
            ctx.log_journal(JournalType::Failure, answer.details.clone(), None)
                .await?;
            return Err(JobError::ResourceUnavailable(answer.details).into());
        }
        let result = serde_json::to_value(&answer).map_err(JobError::from)?;
        Ok(JobOutcome::Succeeded(Some(result)))
    }
}

#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: RwLock<HashMap<String, Arc<dyn JobDispatcher>>>,
}

impl DispatcherRegistry {
    pub fn register(&self, name: impl Into<String>, dispatcher: Arc<dyn JobDispatcher>) {
        self.dispatchers
            .write()
            .unwrap()
            .insert(name.into(), dispatcher);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobDispatcher>> {
        self.dispatchers.read().unwrap().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dispatchers.read().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dispatchers.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}
