// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::Arc;

use agent_commands::{Answer, Command};
use async_trait::async_trait;
use log::debug;

use super::{AnswerCallback, EndPoint, HostAddress};
use crate::job_engine::Executor;

/// Something in this process that can carry out agent commands.
#[async_trait]
pub trait LocalResource: Send + Sync {
    async fn execute(&self, cmd: &Command) -> Answer;
}

/// Executes commands in-process, without an agent hop.
pub struct LocalEndPoint {
    host: HostAddress,
    resource: Arc<dyn LocalResource>,
    callbacks: Arc<Executor>,
}

impl LocalEndPoint {
    pub fn new(
        host: HostAddress,
        resource: Arc<dyn LocalResource>,
        callbacks: Arc<Executor>,
    ) -> Self {
        Self {
            host,
            resource,
            callbacks,
        }
    }
}

#[async_trait]
impl EndPoint for LocalEndPoint {
    fn host(&self) -> &HostAddress {
        &self.host
    }

    async fn send_message(&self, cmd: Command) -> Answer {
        debug!("local {}: executing {}", self.host.id, cmd);
        self.resource.execute(&cmd).await
    }

    fn send_message_async(&self, cmd: Command, callback: AnswerCallback) {
        let resource = self.resource.clone();
        let desc = format!("local {} {}", self.host.id, cmd);
        self.callbacks
            .deliver(desc, async move { resource.execute(&cmd).await }, callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_commands::CommandBody;
    use futures::channel::oneshot;
    use futures::executor::block_on;

    struct Echo;

    #[async_trait]
    impl LocalResource for Echo {
        async fn execute(&self, cmd: &Command) -> Answer {
            Answer::success(cmd.name().to_string())
        }
    }

    #[test]
    fn local_endpoint_runs_both_forms() {
        let callbacks = Arc::new(Executor::new("cb", 1).unwrap());
        let ep = LocalEndPoint::new(HostAddress::new(1, "localhost"), Arc::new(Echo), callbacks);
        let cmd = Command::new(CommandBody::Ready { host_id: 1 });

        assert_eq!(block_on(ep.send_message(cmd.clone())).details, "ready");

        let (tx, rx) = oneshot::channel();
        ep.send_message_async(
            cmd,
            Box::new(move |a| {
                let _ = tx.send(a);
            }),
        );
        assert_eq!(block_on(rx).unwrap().details, "ready");
        assert_eq!(ep.id(), 1);
        assert_eq!(ep.host_addr(), "localhost");
    }
}
