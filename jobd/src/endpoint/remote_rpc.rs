// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use agent_commands::{Answer, Command};
use async_trait::async_trait;
use futures::channel::oneshot;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AnswerCallback, EndPoint, HostAddress, HostId};
use crate::agent::AgentRegistry;
use crate::error::AgentError;
use crate::job_engine::{with_timeout, Executor};
use crate::msid::Msid;

pub const AGENT_COMMAND_SERVICE: &str = "agent.command";

pub type RpcCallback = Box<dyn FnOnce(Result<Value, AgentError>) + Send + 'static>;

/// Call-and-callback transport to peer orchestrator instances. The callback
/// runs exactly once and never on the calling thread.
pub trait RpcProvider: Send + Sync {
    fn call(&self, peer: Msid, service: &str, request: Value, callback: RpcCallback);
}

#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, request: Value) -> Result<Value, AgentError>;
}

/// Routes calls to handlers registered in this process. Stands in for a
/// cluster RPC framework in single-node setups and tests.
pub struct LoopbackRpc {
    handlers: RwLock<HashMap<(Msid, String), Arc<dyn RpcHandler>>>,
    executor: Arc<Executor>,
}

impl LoopbackRpc {
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            executor,
        }
    }

    pub fn register(&self, peer: Msid, service: impl Into<String>, handler: Arc<dyn RpcHandler>) {
        self.handlers
            .write()
            .unwrap()
            .insert((peer, service.into()), handler);
    }

    /// Forget every handler of `peer`, as if the instance went away.
    pub fn unregister_peer(&self, peer: Msid) {
        self.handlers.write().unwrap().retain(|(p, _), _| *p != peer);
    }
}

impl RpcProvider for LoopbackRpc {
    fn call(&self, peer: Msid, service: &str, request: Value, callback: RpcCallback) {
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&(peer, service.to_string()))
            .cloned();
        let desc = format!("rpc {} on {}", service, peer);
        let unknown = format!("no '{}' service on {}", service, peer);
        let task = async move {
            let result = match handler {
                Some(handler) => handler.handle(request).await,
                None => Err(AgentError::Transport(unknown)),
            };
            callback(result);
        };
        if let Err(task) = self.executor.try_spawn(desc, task) {
            std::thread::spawn(move || futures::executor::block_on(task));
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentCommandRequest {
    pub host: HostId,
    pub command: Command,
}

/// Serves [`AGENT_COMMAND_SERVICE`] for the hosts whose agents are connected
/// to this instance.
pub struct AgentCommandService {
    registry: Arc<AgentRegistry>,
}

impl AgentCommandService {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl RpcHandler for AgentCommandService {
    async fn handle(&self, request: Value) -> Result<Value, AgentError> {
        let request: AgentCommandRequest =
            serde_json::from_value(request).map_err(|e| AgentError::Transport(e.to_string()))?;
        let endpoint = self
            .registry
            .endpoint(request.host)
            .ok_or_else(|| AgentError::Unavailable {
                host: request.host,
                reason: "agent not connected to this instance".to_string(),
            })?;
        let answer = endpoint.send_message(request.command).await;
        serde_json::to_value(answer).map_err(|e| AgentError::Transport(e.to_string()))
    }
}

/// Reaches a host through the peer instance that owns its agent.
pub struct RemoteRpcEndPoint {
    host: HostAddress,
    peer: Msid,
    rpc: Arc<dyn RpcProvider>,
    timeout: Duration,
    callbacks: Arc<Executor>,
}

impl RemoteRpcEndPoint {
    pub fn new(
        host: HostAddress,
        peer: Msid,
        rpc: Arc<dyn RpcProvider>,
        timeout: Duration,
        callbacks: Arc<Executor>,
    ) -> Self {
        Self {
            host,
            peer,
            rpc,
            timeout,
            callbacks,
        }
    }

    pub fn peer(&self) -> Msid {
        self.peer
    }
}

async fn call_peer(
    rpc: Arc<dyn RpcProvider>,
    peer: Msid,
    host: HostId,
    timeout: Duration,
    cmd: Command,
) -> Answer {
    let request = match serde_json::to_value(AgentCommandRequest { host, command: cmd }) {
        Ok(v) => v,
        Err(e) => return Answer::failure(format!("cannot encode command: {}", e)),
    };
    let (tx, rx) = oneshot::channel();
    rpc.call(
        peer,
        AGENT_COMMAND_SERVICE,
        request,
        Box::new(move |result| {
            // the receiver is gone when the caller already timed out
            let _ = tx.send(result);
        }),
    );
    let answer = match with_timeout(timeout, rx).await {
        Ok(Ok(Ok(value))) => serde_json::from_value(value)
            .unwrap_or_else(|e| Answer::failure(format!("malformed answer from {}: {}", peer, e))),
        Ok(Ok(Err(e))) => Answer::failure(e.to_string()),
        Ok(Err(_)) => Answer::failure(format!("{} dropped the call", peer)),
        Err(elapsed) => Answer::failure(format!("call to {} for host {} {}", peer, host, elapsed)),
    };
    if !answer.result {
        warn!("remote dispatch via {} for host {}: {}", peer, host, answer.details);
    } else {
        debug!("remote dispatch via {} for host {} succeeded", peer, host);
    }
    answer
}

#[async_trait]
impl EndPoint for RemoteRpcEndPoint {
    fn host(&self) -> &HostAddress {
        &self.host
    }

    async fn send_message(&self, cmd: Command) -> Answer {
        call_peer(self.rpc.clone(), self.peer, self.host.id, self.timeout, cmd).await
    }

    fn send_message_async(&self, cmd: Command, callback: AnswerCallback) {
        let desc = format!("{} via {}", cmd, self.peer);
        self.callbacks.deliver(
            desc,
            call_peer(self.rpc.clone(), self.peer, self.host.id, self.timeout, cmd),
            callback,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentTransport;
    use crate::job_engine::sleep;
    use agent_commands::CommandBody;
    use futures::executor::block_on;
    use std::time::Instant;

    struct Accepting;

    #[async_trait]
    impl AgentTransport for Accepting {
        async fn send(&self, host: &HostAddress, cmd: &Command) -> Result<Answer, AgentError> {
            Ok(Answer::success(format!("{} on {}", cmd, host.id)))
        }
    }

    struct Stuck;

    #[async_trait]
    impl RpcHandler for Stuck {
        async fn handle(&self, _request: Value) -> Result<Value, AgentError> {
            sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    fn pool() -> Arc<Executor> {
        Arc::new(Executor::new("rpc", 2).unwrap())
    }

    fn endpoint(rpc: Arc<LoopbackRpc>, timeout: Duration) -> RemoteRpcEndPoint {
        RemoteRpcEndPoint::new(HostAddress::new(9, "10.0.0.9"), Msid(2), rpc, timeout, pool())
    }

    #[test]
    fn peer_forwards_to_its_agent() {
        let registry = Arc::new(AgentRegistry::new(Arc::new(Accepting), pool()));
        registry.connect(HostAddress::new(9, "10.0.0.9"));
        let rpc = Arc::new(LoopbackRpc::new(pool()));
        rpc.register(
            Msid(2),
            AGENT_COMMAND_SERVICE,
            Arc::new(AgentCommandService::new(registry)),
        );

        let ep = endpoint(rpc, Duration::from_secs(5));
        let answer = block_on(ep.send_message(Command::new(CommandBody::Ready { host_id: 9 })));
        assert!(answer.result, "{}", answer.details);
        assert_eq!(answer.details, "ready on 9");
    }

    #[test]
    fn unknown_peer_is_a_negative_answer() {
        let rpc = Arc::new(LoopbackRpc::new(pool()));
        let ep = endpoint(rpc, Duration::from_secs(5));
        let (tx, rx) = oneshot::channel();
        ep.send_message_async(
            Command::new(CommandBody::Ready { host_id: 9 }),
            Box::new(move |a| {
                let _ = tx.send(a);
            }),
        );
        let answer = block_on(rx).unwrap();
        assert!(!answer.result);
        assert!(answer.details.contains("agent.command"));
    }

    #[test]
    fn slow_peer_times_out() {
        let rpc = Arc::new(LoopbackRpc::new(pool()));
        rpc.register(Msid(2), AGENT_COMMAND_SERVICE, Arc::new(Stuck));
        let ep = endpoint(rpc, Duration::from_millis(50));
        let started = Instant::now();
        let answer = block_on(ep.send_message(Command::new(CommandBody::Ready { host_id: 9 })));
        assert!(!answer.result);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
