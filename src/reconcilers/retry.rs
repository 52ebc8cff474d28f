//! Retry and backoff decisions
//!
//! The attempt counter is stored on the record and incremented by every
//! Retryable outcome of the current transition; success resets it. Elapsed
//! wall-clock time plays no part, so scheduler downtime neither burns nor
//! refills a record's retry budget.

use std::collections::HashMap;
use std::time::Duration;

use crate::adapters::Outcome;
use crate::config::EngineConfig;
use crate::resource::ResourceKind;

/// Backoff shape and retry budget for one kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Driver calls allowed for one transition before it is failed
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// `base * 2^(attempt-1)`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// What the executor does with a driver outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Take the success edge
    Advance,
    /// Keep the phase, record the reason, come back after `delay`
    Retry {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    /// Move to the failed phase; no automatic retry
    Fail { attempt: u32, reason: String },
}

/// Classifies outcomes against per-kind retry policies
#[derive(Clone, Debug)]
pub struct RetryController {
    default_policy: RetryPolicy,
    overrides: HashMap<ResourceKind, RetryPolicy>,
}

impl RetryController {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            default_policy,
            overrides: HashMap::new(),
        }
    }

    /// Default policy from configuration, with each kind's own attempt budget
    pub fn from_config(config: &EngineConfig) -> Self {
        let default_policy = RetryPolicy {
            base_delay: config.backoff_base(),
            max_delay: config.backoff_max(),
            max_attempts: config.max_attempts,
        };
        ResourceKind::ALL
            .iter()
            .fold(Self::new(default_policy), |controller, kind| {
                let max_attempts = kind.default_max_attempts(config.max_attempts);
                if max_attempts == default_policy.max_attempts {
                    controller
                } else {
                    controller.with_policy(
                        *kind,
                        RetryPolicy {
                            max_attempts,
                            ..default_policy
                        },
                    )
                }
            })
    }

    pub fn with_policy(mut self, kind: ResourceKind, policy: RetryPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    pub fn policy(&self, kind: ResourceKind) -> RetryPolicy {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Decide on an outcome given the attempts already recorded on the record
    pub fn decide(&self, kind: ResourceKind, previous_attempts: u32, outcome: Outcome) -> Decision {
        match outcome {
            Outcome::Success => Decision::Advance,
            Outcome::Fatal(reason) => Decision::Fail {
                attempt: previous_attempts.saturating_add(1),
                reason,
            },
            Outcome::Retryable(reason) => {
                let policy = self.policy(kind);
                let attempt = previous_attempts.saturating_add(1);
                if attempt >= policy.max_attempts {
                    Decision::Fail {
                        attempt,
                        reason: format!("giving up after {attempt} attempts: {reason}"),
                    }
                } else {
                    Decision::Retry {
                        attempt,
                        delay: policy.backoff(attempt),
                        reason,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let p = policy(10);
        let delays: Vec<u64> = (1..=7).map(|a| p.backoff(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn retryable_escalates_on_the_last_attempt() {
        let controller = RetryController::new(policy(3));
        let kind = ResourceKind::Database;

        assert!(matches!(
            controller.decide(kind, 0, Outcome::retryable("down")),
            Decision::Retry { attempt: 1, .. }
        ));
        assert!(matches!(
            controller.decide(kind, 1, Outcome::retryable("down")),
            Decision::Retry { attempt: 2, .. }
        ));
        let Decision::Fail { attempt, reason } = controller.decide(kind, 2, Outcome::retryable("down"))
        else {
            panic!("third attempt should fail");
        };
        assert_eq!(attempt, 3);
        assert!(reason.contains("down"));
    }

    #[test]
    fn fatal_and_success_ignore_the_budget() {
        let controller = RetryController::new(policy(3));
        assert_eq!(
            controller.decide(ResourceKind::Database, 0, Outcome::Success),
            Decision::Advance
        );
        assert!(matches!(
            controller.decide(ResourceKind::Database, 0, Outcome::fatal("bad config")),
            Decision::Fail { attempt: 1, .. }
        ));
    }

    #[test]
    fn billing_kinds_get_a_smaller_budget() {
        let config = EngineConfig {
            max_attempts: 10,
            ..EngineConfig::default()
        };
        let controller = RetryController::from_config(&config);
        assert_eq!(controller.policy(ResourceKind::ChargeOrder).max_attempts, 5);
        assert_eq!(controller.policy(ResourceKind::SubscriptionRenewal).max_attempts, 5);
        assert_eq!(controller.policy(ResourceKind::Application).max_attempts, 10);
    }

    #[test]
    fn single_attempt_budget_fails_immediately() {
        let controller = RetryController::new(policy(1));
        assert!(matches!(
            controller.decide(ResourceKind::CronTrigger, 0, Outcome::retryable("flaky")),
            Decision::Fail { attempt: 1, .. }
        ));
    }
}
