//! Retry strategy for SMTP delivery failures.
//!
//! This crate decides two things for the dispatch scheduler:
//! whether a failed send is worth retrying at all, and how long to wait
//! before the next attempt.
//!
//! Failures are classified from the SMTP reply code: permanent errors are
//! 5xx, transient errors are 4xx plus anything that never produced a reply
//! (connection reset, timeout). Delays come from an indexed schedule that
//! clamps to its last entry, so the default `[60, 300, 900]` produces
//! 1 min, 5 min, 15 min, 15 min, ...
//!
//! # Example
//!
//! ```
//! use postino_retry::{FailureClass, RetryStrategy, classify_smtp_code};
//! use std::time::Duration;
//!
//! let strategy = RetryStrategy::default();
//! assert_eq!(classify_smtp_code(Some(451)), FailureClass::Transient);
//! assert!(strategy.should_retry(0));
//! assert_eq!(strategy.delay_for(1), Duration::from_secs(300));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of retry attempts before a transient failure turns terminal.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay schedule in seconds: 1 min, 5 min, 15 min.
pub const DEFAULT_RETRY_DELAYS: [u64; 3] = [60, 300, 900];

/// Whether a failed send may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Worth retrying: 4xx replies, timeouts, connection failures.
    Transient,
    /// Terminal: 5xx replies.
    Permanent,
}

/// Classify an SMTP reply code. `None` (no reply at all) is transient.
pub fn classify_smtp_code(code: Option<u16>) -> FailureClass {
    match code {
        Some(code) if (500..600).contains(&code) => FailureClass::Permanent,
        _ => FailureClass::Transient,
    }
}

/// Retry schedule configuration.
///
/// `delays` is indexed by the retry count and clamps to its last entry;
/// an empty schedule disables retries regardless of `max_retries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategy {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Delay schedule in seconds, indexed by retry count.
    pub delays: Vec<u64>,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delays: DEFAULT_RETRY_DELAYS.to_vec(),
        }
    }
}

impl RetryStrategy {
    /// Strategy with a custom schedule; `max_retries` defaults to the
    /// schedule length.
    pub fn with_delays(delays: Vec<u64>) -> Self {
        let max_retries = delays.len() as u32;
        Self { max_retries, delays }
    }

    /// True while another attempt is allowed after `retry_count` retries.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        !self.delays.is_empty() && retry_count < self.max_retries
    }

    /// Delay before the attempt following `retry_count` prior retries.
    ///
    /// Indexes the schedule and clamps to the last entry. An empty schedule
    /// yields zero (callers gate on [`RetryStrategy::should_retry`] first).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let Some(last) = self.delays.last() else {
            return Duration::ZERO;
        };
        let seconds = self
            .delays
            .get(retry_count as usize)
            .copied()
            .unwrap_or(*last);
        Duration::from_secs(seconds)
    }

    /// Absolute Unix timestamp of the next attempt after `retry_count`
    /// prior retries.
    pub fn next_attempt_ts(&self, now_ts: i64, retry_count: u32) -> i64 {
        now_ts + self.delay_for(retry_count).as_secs() as i64
    }
}
