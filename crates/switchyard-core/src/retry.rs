// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy shared by event forwarding and step execution.
//!
//! A policy is attached at registration time (to a forwarding function, a
//! workflow or a single step) and never changes afterwards.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether a failure can succeed if tried again later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network trouble, rate limiting, timeouts.
    Retriable,
    /// Validation, auth, bad payloads. Needs a human or a code change.
    NonRetriable,
}

impl ErrorClass {
    /// True for [`ErrorClass::Retriable`].
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorClass::Retriable)
    }
}

/// Strategy for computing the delay before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// `base_delay * 2^(retry - 1)`.
    #[default]
    ExponentialBackoff,
}

/// Deployment profile selecting the default retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Fast feedback: a failure is final on the first attempt.
    Development,
    /// Retries with exponential backoff.
    #[default]
    Production,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "unknown mode '{other}', expected 'development' or 'production'"
            )),
        }
    }
}

/// Retry policy for a forwarding function or a workflow step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Zero behaves as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// How the delay grows between retries.
    pub strategy: BackoffStrategy,
    /// Error codes that are never retried, whatever their reported class.
    pub permanent_codes: BTreeSet<String>,
}

impl RetryPolicy {
    /// Create a policy with exponential backoff.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            strategy: BackoffStrategy::ExponentialBackoff,
            permanent_codes: BTreeSet::new(),
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Default policy for an execution mode.
    pub fn for_mode(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::Development => Self::no_retry(),
            ExecutionMode::Production => Self::new(3, Duration::from_secs(1)),
        }
    }

    /// Mark an error code as never retriable.
    pub fn with_permanent_code(mut self, code: impl Into<String>) -> Self {
        self.permanent_codes.insert(code.into());
        self
    }

    /// Attempts actually allowed, never less than one.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Classify a failure by its error code.
    ///
    /// Codes listed in `permanent_codes` are non-retriable; every other code
    /// keeps the class the failing side reported.
    pub fn classify(&self, code: &str, reported: ErrorClass) -> ErrorClass {
        if self.permanent_codes.contains(code) {
            ErrorClass::NonRetriable
        } else {
            reported
        }
    }

    /// Whether a failure on `attempt` (1-indexed) should be tried again.
    pub fn should_retry(&self, attempt: u32, class: ErrorClass) -> bool {
        class.is_retriable() && attempt < self.effective_max_attempts()
    }

    /// Delay before retrying after a failure on `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.strategy {
            BackoffStrategy::ExponentialBackoff => {
                2u32.saturating_pow(attempt.saturating_sub(1))
            }
        };
        self.base_delay.saturating_mul(multiplier)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::for_mode(ExecutionMode::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_presets() {
        let dev = RetryPolicy::for_mode(ExecutionMode::Development);
        assert_eq!(dev.effective_max_attempts(), 1);
        assert!(!dev.should_retry(1, ErrorClass::Retriable));

        let prod = RetryPolicy::for_mode(ExecutionMode::Production);
        assert_eq!(prod.max_attempts, 3);
        assert!(prod.should_retry(1, ErrorClass::Retriable));
        assert!(prod.should_retry(2, ErrorClass::Retriable));
        assert!(!prod.should_retry(3, ErrorClass::Retriable));
    }

    #[test]
    fn test_zero_attempts_behaves_as_one() {
        let policy = RetryPolicy::new(0, Duration::from_millis(10));
        assert_eq!(policy.effective_max_attempts(), 1);
        assert!(!policy.should_retry(1, ErrorClass::Retriable));
    }

    #[test]
    fn test_non_retriable_never_retried() {
        let policy = RetryPolicy::new(10, Duration::from_millis(10));
        assert!(!policy.should_retry(1, ErrorClass::NonRetriable));
    }

    #[test]
    fn test_permanent_codes_override_class() {
        let policy = RetryPolicy::default().with_permanent_code("INVALID_AMOUNT");
        assert_eq!(
            policy.classify("INVALID_AMOUNT", ErrorClass::Retriable),
            ErrorClass::NonRetriable
        );
        assert_eq!(
            policy.classify("UPSTREAM_DOWN", ErrorClass::Retriable),
            ErrorClass::Retriable
        );
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!(
            "Development".parse::<ExecutionMode>(),
            Ok(ExecutionMode::Development)
        );
        assert_eq!("prod".parse::<ExecutionMode>(), Ok(ExecutionMode::Production));
        assert!("staging".parse::<ExecutionMode>().is_err());
    }
}
