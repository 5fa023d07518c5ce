//! Retry queue and failure classification.
//!
//! Only failures a descriptor classifies as retriable are queued. Attempt
//! counting includes the first attempt, so with `max_attempts = 3` a key is
//! tried three times before it becomes `MaxRetriesExceeded`.

use crate::core::config::SchedulerConfig;
use crate::core::time::Tick;
use crate::descriptor::value::Key;
use crate::graph::plan::OpKind;
use std::collections::BTreeMap;
use std::time::Duration;

/// A queued retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub key: Key,
    pub op: OpKind,
    /// Failed attempts so far.
    pub attempt: u32,
    pub deadline: Tick,
}

/// What to do after a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Queue another attempt after `delay`.
    Retry { delay: Duration },
    /// Retriable, but the attempt ceiling is reached.
    Exhausted,
    /// Not retriable.
    Terminal,
}

/// Backoff and ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub exponential: bool,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` failed attempts.
    pub fn backoff(&self, failures: u32) -> Duration {
        if !self.exponential || failures <= 1 {
            return self.base_backoff;
        }
        let shift = (failures - 1).min(31);
        self.base_backoff
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Classify a failure given the attempts made so far (including this one).
    pub fn decide(&self, failures: u32, retriable: bool) -> RetryDecision {
        if !retriable {
            RetryDecision::Terminal
        } else if failures >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.backoff(failures),
            }
        }
    }
}

impl From<&SchedulerConfig> for RetryPolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            base_backoff: config.retry_backoff,
            exponential: config.exponential_backoff,
            max_backoff: config.max_retry_backoff,
        }
    }
}

/// Retries keyed by node; at most one entry per key.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: BTreeMap<Key, RetryEntry>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a retry, replacing any earlier entry for the key.
    pub fn schedule(&mut self, entry: RetryEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn cancel(&mut self, key: &str) -> Option<RetryEntry> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&RetryEntry> {
        self.entries.get(key)
    }

    /// Remove and return every entry due at `now`, earliest deadline first.
    pub fn take_due(&mut self, now: Tick) -> Vec<RetryEntry> {
        let due: Vec<Key> = self
            .entries
            .values()
            .filter(|e| now.is_at_or_after(e.deadline))
            .map(|e| e.key.clone())
            .collect();
        let mut taken: Vec<RetryEntry> = due
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .collect();
        taken.sort_by(|a, b| a.deadline.cmp(&b.deadline).then_with(|| a.key.cmp(&b.key)));
        taken
    }

    pub fn next_deadline(&self) -> Option<Tick> {
        self.entries.values().map(|e| e.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
