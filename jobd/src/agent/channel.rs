// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;
use std::time::Duration;

use agent_commands::{Answer, Command};
use log::{debug, info, warn};

use super::retry::RetryPolicy;
use super::transport::{AgentTransport, CommandRouter, IdentityRouter};
use crate::endpoint::HostAddress;
use crate::error::AgentError;
use crate::job_engine::{sleep, with_timeout, Executor};

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(60);

pub type ResultCallback = Box<dyn FnOnce(Result<Answer, AgentError>) + Send + 'static>;

pub struct AgentDispatchChannel {
    host: HostAddress,
    transport: Arc<dyn AgentTransport>,
    router: Arc<dyn CommandRouter>,
    timeout: Duration,
    retry: RetryPolicy,
    callbacks: Arc<Executor>,
}

impl std::fmt::Debug for AgentDispatchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDispatchChannel")
            .field("host", &self.host)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl AgentDispatchChannel {
    pub fn new(
        host: HostAddress,
        transport: Arc<dyn AgentTransport>,
        callbacks: Arc<Executor>,
    ) -> Self {
        Self {
            host,
            transport,
            router: Arc::new(IdentityRouter),
            timeout: DEFAULT_AGENT_TIMEOUT,
            retry: RetryPolicy::none(),
            callbacks,
        }
    }

    pub fn with_router(mut self, router: Arc<dyn CommandRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn host(&self) -> &HostAddress {
        &self.host
    }

    pub fn callbacks(&self) -> &Arc<Executor> {
        &self.callbacks
    }

    /// The command's own wait hint wins over the channel default.
    pub fn timeout_for(&self, cmd: &Command) -> Duration {
        if cmd.wait > 0 {
            Duration::from_secs(cmd.wait as u64)
        } else {
            self.timeout
        }
    }

    /// Route, then forward with the timeout. Transport failures and timeouts
    /// come back as errors, never as negative answers.
    pub async fn send(&self, cmd: &Command) -> Result<Answer, AgentError> {
        let target = self.router.route(&self.host, cmd);
        if target.id != self.host.id {
            info!(
                "{} for host {} redirected to host {}",
                cmd, self.host.id, target.id
            );
        }
        let timeout = self.timeout_for(cmd);

        let mut attempt = 1;
        loop {
            debug!("sending {} to host {} (attempt {})", cmd, target.id, attempt);
            let result = match with_timeout(timeout, self.transport.send(&target, cmd)).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::OperationTimedOut {
                    host: target.id,
                    timeout,
                }),
            };
            match result {
                Err(e) if self.retry.should_retry(cmd, &e, attempt) => {
                    let delay = self.retry.backoff.delay(attempt);
                    warn!("{} to host {} failed ({}), retrying in {:?}", cmd, target.id, e, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("{} to host {} failed: {}", cmd, target.id, e);
                    return Err(e);
                }
                Ok(answer) => return Ok(answer),
            }
        }
    }

    /// Send on the callback pool. The callback runs exactly once, also when
    /// the send fails, and never on the caller's thread.
    pub fn send_async(self: &Arc<Self>, cmd: Command, callback: ResultCallback) {
        let channel = self.clone();
        let desc = format!("{} to host {}", cmd, self.host.id);
        self.callbacks
            .deliver(desc, async move { channel.send(&cmd).await }, callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Backoff;
    use agent_commands::CommandBody;
    use async_trait::async_trait;
    use futures::channel::oneshot;
    use futures::executor::block_on;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Fails with `Unavailable` for the first `failures` calls, hangs when
    /// `hang` is set, records the hosts it was asked to reach.
    #[derive(Default)]
    struct FlakyTransport {
        failures: u32,
        hang: bool,
        calls: AtomicU32,
        targets: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl AgentTransport for FlakyTransport {
        async fn send(&self, host: &HostAddress, cmd: &Command) -> Result<Answer, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.targets.lock().unwrap().push(host.id);
            if self.hang {
                sleep(Duration::from_secs(30)).await;
            }
            if n < self.failures {
                return Err(AgentError::Unavailable {
                    host: host.id,
                    reason: "connection refused".into(),
                });
            }
            Ok(Answer::success(cmd.name().to_string()))
        }
    }

    struct Failover;

    impl CommandRouter for Failover {
        fn route(&self, nominal: &HostAddress, _cmd: &Command) -> HostAddress {
            HostAddress::new(nominal.id + 100, "standby")
        }
    }

    fn channel(transport: Arc<FlakyTransport>) -> AgentDispatchChannel {
        let callbacks = Arc::new(Executor::new("cb", 2).unwrap());
        AgentDispatchChannel::new(HostAddress::new(1, "10.0.0.1"), transport, callbacks)
    }

    fn ready() -> Command {
        Command::new(CommandBody::Ready { host_id: 1 })
    }

    #[test]
    fn timeout_is_a_typed_error() {
        let transport = Arc::new(FlakyTransport {
            hang: true,
            ..Default::default()
        });
        let ch = channel(transport).with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = block_on(ch.send(&ready())).unwrap_err();
        assert_eq!(
            err,
            AgentError::OperationTimedOut {
                host: 1,
                timeout: Duration::from_millis(50)
            }
        );
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn command_wait_overrides_channel_timeout() {
        let ch = channel(Arc::new(FlakyTransport::default())).with_timeout(Duration::from_secs(5));
        assert_eq!(ch.timeout_for(&ready()), Duration::from_secs(5));
        assert_eq!(ch.timeout_for(&ready().with_wait(2)), Duration::from_secs(2));
    }

    #[test]
    fn idempotent_commands_are_retried_after_unavailable() {
        let transport = Arc::new(FlakyTransport {
            failures: 2,
            ..Default::default()
        });
        let ch = channel(transport.clone())
            .with_retry(RetryPolicy::new(3, Backoff::Linear { base: Duration::from_millis(1) }));
        let answer = block_on(ch.send(&ready().idempotent())).unwrap();
        assert!(answer.result);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn other_commands_are_sent_once() {
        let transport = Arc::new(FlakyTransport {
            failures: 1,
            ..Default::default()
        });
        let ch = channel(transport.clone()).with_retry(RetryPolicy::new(3, Backoff::None));
        let err = block_on(ch.send(&ready())).unwrap_err();
        assert!(matches!(err, AgentError::Unavailable { host: 1, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn router_picks_the_real_destination() {
        let transport = Arc::new(FlakyTransport::default());
        let ch = channel(transport.clone()).with_router(Arc::new(Failover));
        block_on(ch.send(&ready())).unwrap();
        assert_eq!(*transport.targets.lock().unwrap(), vec![101]);
    }

    #[test]
    fn async_send_reports_errors_through_the_callback() {
        let transport = Arc::new(FlakyTransport {
            failures: 1,
            ..Default::default()
        });
        let ch = Arc::new(channel(transport));
        let (tx, rx) = oneshot::channel();
        ch.send_async(
            ready(),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        assert!(block_on(rx).unwrap().is_err());
    }
}
