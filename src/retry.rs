use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::store::TaskHistory;
use crate::{HISTORY_STATUS_FAILED, HISTORY_STATUS_INFLIGHT, HISTORY_STATUS_RESCHEDULED};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Same delay before every retry.
    #[default]
    Fixed,
    Exponential,
    ExponentialJitter,
}

/// Retry policy: how many attempts a task gets and how long to wait
/// between them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub strategy: WaitStrategy,
    /// Base delay in seconds (the full delay for the fixed strategy).
    #[serde(default = "default_delay_secs")]
    pub delay_secs: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_secs() -> f64 {
    300.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> f64 {
    3600.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: WaitStrategy::Fixed,
            delay_secs: 300.0,
            multiplier: 2.0,
            max_delay_secs: 3600.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt `attempt_index` (0-based).
    pub fn interval(&self, attempt_index: u32) -> Duration {
        let delay_secs = match self.strategy {
            WaitStrategy::Fixed => self.delay_secs,
            WaitStrategy::Exponential => {
                let base_delay = self.delay_secs * self.multiplier.powi(attempt_index as i32);
                base_delay.min(self.max_delay_secs)
            }
            WaitStrategy::ExponentialJitter => {
                let base_delay = self.delay_secs * self.multiplier.powi(attempt_index as i32);
                let capped_delay = base_delay.min(self.max_delay_secs);

                let mut rng = rand::thread_rng();
                rng.gen_range(0.0..=capped_delay)
            }
        };

        Duration::from_secs_f64(delay_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be >= 1".to_string());
        }

        if self.multiplier < 1.0 {
            return Err("multiplier must be >= 1".to_string());
        }

        if self.delay_secs < 0.0 || self.max_delay_secs < 0.0 {
            return Err("delay values must be >= 0".to_string());
        }

        Ok(())
    }
}

/// Decides whether a failed task may be rescheduled, and after what delay.
///
/// The ceiling is evaluated against *persisted* history, never in-memory
/// counters, so retry budgets survive process restarts.
pub struct TaskRetryManager {
    policy: RetryPolicy,
}

impl TaskRetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Number of attempts charged against the retry budget: failed,
    /// rescheduled, and currently open attempts. `ABORTED` rows are crash
    /// recoveries, not consumer failures, and are free.
    pub fn attempts_charged(history: &[TaskHistory]) -> u32 {
        history
            .iter()
            .filter(|h| {
                h.status == HISTORY_STATUS_FAILED
                    || h.status == HISTORY_STATUS_RESCHEDULED
                    || h.status == HISTORY_STATUS_INFLIGHT
            })
            .count() as u32
    }

    /// Whether another attempt may be scheduled, given the full persisted
    /// history (including the open row of the attempt being closed).
    pub fn can_schedule(&self, history: &[TaskHistory]) -> bool {
        Self::attempts_charged(history) < self.policy.max_attempts
    }

    /// Back-off before the next attempt, given the same history.
    pub fn interval_for(&self, history: &[TaskHistory]) -> Duration {
        let attempt_index = Self::attempts_charged(history).saturating_sub(1);
        self.policy.interval(attempt_index)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}
