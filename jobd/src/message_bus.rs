// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Topic based notification bus used for heartbeats, state changes and join
//! wakeups. Delivery is best effort: a missed message is covered by the
//! wakeup poll.

use std::sync::Mutex;

use async_channel::{Receiver, Sender};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;
use crate::job::{JobId, JobStatus};
use crate::msid::Msid;

pub const JOB_HEARTBEAT: &str = "job.heartbeat";
pub const JOB_STATE: &str = "job.state";
pub const JOB_EVENT_PUBLISH: &str = "job.eventpublish";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub sender: Msid,
    pub payload: Value,
}

/// Payload of [`JOB_STATE`] messages.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobStateEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result_code: i32,
}

pub trait MessageBus: Send + Sync {
    fn publish(&self, sender: Msid, topic: &str, payload: Value);

    /// Subscribe to every topic matching `pattern`, where `*` matches any
    /// run of characters.
    fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;
}

#[derive(Debug, Clone)]
pub struct Subscription(Receiver<BusMessage>);

impl Subscription {
    /// Next message, or None once the bus is gone.
    pub async fn recv(&self) -> Option<BusMessage> {
        self.0.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<BusMessage> {
        self.0.try_recv().ok()
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, BusError> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped)).map_err(|e| BusError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// In-process bus. Subscribers whose receiver was dropped are pruned on the
/// next publish.
#[derive(Default)]
pub struct LocalMessageBus {
    subscribers: Mutex<Vec<(Regex, Sender<BusMessage>)>>,
}

impl LocalMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl MessageBus for LocalMessageBus {
    fn publish(&self, sender: Msid, topic: &str, payload: Value) {
        let message = BusMessage {
            topic: topic.to_string(),
            sender,
            payload,
        };
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (re, tx) in subscribers.iter() {
            if re.is_match(topic) {
                if let Err(e) = tx.try_send(message.clone()) {
                    warn!("dropping message on '{}': {}", topic, e);
                }
            }
        }
        debug!("published '{}' from {}", topic, sender);
    }

    fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        let re = compile_pattern(pattern)?;
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().unwrap().push((re, tx));
        Ok(Subscription(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use serde_json::json;

    #[test]
    fn wildcard_patterns_match_topics() {
        let bus = LocalMessageBus::new();
        let all_jobs = bus.subscribe("job.*").unwrap();
        let state = bus.subscribe(JOB_STATE).unwrap();

        bus.publish(Msid(1), JOB_HEARTBEAT, json!({}));
        bus.publish(Msid(1), JOB_STATE, json!({"job_id": 3}));

        assert_eq!(all_jobs.try_recv().unwrap().topic, JOB_HEARTBEAT);
        assert_eq!(all_jobs.try_recv().unwrap().topic, JOB_STATE);
        let msg = block_on(state.recv()).unwrap();
        assert_eq!(msg.payload["job_id"], 3);
        assert!(state.try_recv().is_none());
    }

    #[test]
    fn dots_are_literal() {
        let bus = LocalMessageBus::new();
        let sub = bus.subscribe("job.state").unwrap();
        bus.publish(Msid(1), "jobxstate", json!(null));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = LocalMessageBus::new();
        let sub = bus.subscribe("*").unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        bus.publish(Msid(1), JOB_HEARTBEAT, json!({}));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
