// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use agent_commands::Command;

use crate::error::AgentError;

pub const DEFAULT_EXPONENTIAL_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    /// delay = base * attempt
    Linear { base: Duration },
    /// delay = base * multiplier^(attempt - 1)
    Exponential { base: Duration, multiplier: f64 },
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential {
            base,
            multiplier: DEFAULT_EXPONENTIAL_MULTIPLIER,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { base } => base.saturating_mul(attempt),
            Backoff::Exponential { base, multiplier } => {
                let factor = if *multiplier > 0.0 {
                    *multiplier
                } else {
                    DEFAULT_EXPONENTIAL_MULTIPLIER
                };
                base.mul_f64(factor.powi(attempt as i32 - 1))
            }
        }
    }
}

/// How often a dispatch is attempted. Only idempotent commands are ever
/// resent, and only after the agent was unreachable: a timed out command may
/// still be running on the agent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::None,
        }
    }

    pub fn new(attempts: u32, backoff: Backoff) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn should_retry(&self, cmd: &Command, err: &AgentError, attempt: u32) -> bool {
        cmd.idempotent && matches!(err, AgentError::Unavailable { .. }) && attempt < self.attempts
    }
}
