// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

//! Logical connections to remote execution agents.
//!
//! An [`AgentDispatchChannel`] knows one host, the transport that reaches it,
//! a router that may redirect a command to a different host, the timeout and
//! the retry policy. Synchronous sends fail with a typed [`AgentError`] so
//! callers can tell "unreachable" from "rejected"; asynchronous sends always
//! complete through a callback on the callback pool.

pub mod channel;
pub mod registry;
pub mod retry;
pub mod transport;

pub use channel::{AgentDispatchChannel, ResultCallback, DEFAULT_AGENT_TIMEOUT};
pub use registry::AgentRegistry;
pub use retry::{Backoff, RetryPolicy};
pub use transport::{AgentTransport, CommandRouter, IdentityRouter};
