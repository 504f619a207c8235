//! Retry policy for failed and crashed streams.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::command::{StreamAction, StreamCommand};

/// Linear backoff capped at a maximum delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay added per retry, in seconds.
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    /// Upper bound of the delay, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_step_secs() -> u64 {
    2
}

fn default_max_delay_secs() -> u64 {
    30
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            step_secs: default_step_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Outcome of applying the policy to a failed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redispatch `command` (already carrying the incremented count) after `delay`.
    Retry {
        command: StreamCommand,
        delay: Duration,
    },
    /// Retries are exhausted.
    Abandon,
    /// The command is not retryable.
    Skip,
}

impl RetryPolicy {
    /// Delay before the retry numbered `retry_count` (1-based).
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let secs = self
            .step_secs
            .saturating_mul(retry_count as u64)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    pub fn decide(&self, command: &StreamCommand) -> RetryDecision {
        if command.action != StreamAction::Start {
            return RetryDecision::Skip;
        }
        if command.retry_count >= command.max_retry {
            return RetryDecision::Abandon;
        }

        let mut next = command.clone();
        next.retry_count += 1;
        RetryDecision::Retry {
            delay: self.delay_for_retry(next.retry_count),
            command: next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_linear_and_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(3), Duration::from_secs(6));
        assert_eq!(policy.delay_for_retry(15), Duration::from_secs(30));
        assert_eq!(policy.delay_for_retry(100), Duration::from_secs(30));
    }

    #[test]
    fn test_retries_until_max() {
        let policy = RetryPolicy::default();
        let mut cmd = StreamCommand::start("s1", "rtmp://x").with_max_retry(3);
        let mut delays = Vec::new();

        while let RetryDecision::Retry { command, delay } = policy.decide(&cmd) {
            delays.push(delay.as_secs());
            cmd = command;
        }

        assert_eq!(delays, vec![2, 4, 6]);
        assert_eq!(cmd.retry_count, 3);
        assert_eq!(policy.decide(&cmd), RetryDecision::Abandon);
    }

    #[test]
    fn test_stop_is_never_retried() {
        let cmd = StreamCommand::stop("s1").with_max_retry(3);
        assert_eq!(RetryPolicy::default().decide(&cmd), RetryDecision::Skip);
    }

    #[test]
    fn test_zero_max_retry_abandons_immediately() {
        let cmd = StreamCommand::start("s1", "rtmp://x");
        assert_eq!(RetryPolicy::default().decide(&cmd), RetryDecision::Abandon);
    }
}
