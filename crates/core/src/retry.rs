//! Retry policies and the sliding-window failure counter.
//!
//! A [`RetryPolicy`] is resolved once per task when the task is created and
//! then travels with it. The [`FailureTracker`] counts failures inside the
//! policy's window to decide when a task should be auto-disabled.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Built-in failure limit used when nothing else is configured.
pub const DEFAULT_DISABLE_FAILURES: u32 = 999_999_999;
/// Built-in hard timeout (seconds) used when nothing else is configured.
pub const DEFAULT_DISABLE_HARD_TIMEOUT: u64 = 999_999_999;
/// Built-in failure window (seconds).
pub const DEFAULT_FAILURE_WINDOW: u64 = 3600;

/// Convert a second count into a [`TimeDelta`], saturating instead of panicking.
pub fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

/// Failure-tolerance parameters of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated inside the window before the task is disabled.
    /// `None` means unlimited.
    pub disable_failures: Option<u32>,
    /// Seconds a task may stay RUNNING before it is force-failed.
    pub disable_hard_timeout: u64,
    /// Width of the failure window in seconds.
    pub failure_window: u64,
    /// `true`: every dependency must be DONE. `false`: any one is enough.
    pub upstream_status_when_all: bool,
}

impl RetryPolicy {
    pub fn new(
        disable_failures: u32,
        disable_hard_timeout: u64,
        failure_window: u64,
        upstream_status_when_all: bool,
    ) -> Self {
        Self {
            disable_failures: Some(disable_failures),
            disable_hard_timeout,
            failure_window,
            upstream_status_when_all,
        }
    }

    /// Drop the failure limit so the task is never auto-disabled.
    pub fn with_unlimited_failures(mut self) -> Self {
        self.disable_failures = None;
        self
    }

    /// Return a copy with every field present in `overrides` replaced.
    pub fn apply(&self, overrides: &RetryPolicyOverride) -> Self {
        Self {
            disable_failures: overrides.disable_failures.or(self.disable_failures),
            disable_hard_timeout: overrides
                .disable_hard_timeout
                .unwrap_or(self.disable_hard_timeout),
            failure_window: overrides.failure_window.unwrap_or(self.failure_window),
            upstream_status_when_all: overrides
                .upstream_status_when_all
                .unwrap_or(self.upstream_status_when_all),
        }
    }

    pub fn hard_timeout(&self) -> TimeDelta {
        seconds(self.disable_hard_timeout)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_DISABLE_FAILURES,
            DEFAULT_DISABLE_HARD_TIMEOUT,
            DEFAULT_FAILURE_WINDOW,
            false,
        )
    }
}

/// A partial retry policy as supplied by callers.
///
/// Absent fields fall back to the scheduler's default policy. Deserializes
/// from a JSON object keyed by the [`RetryPolicy`] field names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyOverride {
    pub disable_failures: Option<u32>,
    pub disable_hard_timeout: Option<u64>,
    #[serde(alias = "disable_window")]
    pub failure_window: Option<u64>,
    pub upstream_status_when_all: Option<bool>,
}

impl RetryPolicyOverride {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl From<RetryPolicy> for RetryPolicyOverride {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            disable_failures: policy.disable_failures,
            disable_hard_timeout: Some(policy.disable_hard_timeout),
            failure_window: Some(policy.failure_window),
            upstream_status_when_all: Some(policy.upstream_status_when_all),
        }
    }
}

/// Sliding-window failure counter.
///
/// Timestamps older than the window are ignored when counting and dropped
/// whenever a new failure is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureTracker {
    window: u64,
    failures: VecDeque<DateTime<Utc>>,
}

impl FailureTracker {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            failures: VecDeque::new(),
        }
    }

    /// Rebuild a tracker from persisted timestamps.
    pub fn from_timestamps(window: u64, timestamps: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
        let mut failures: Vec<_> = timestamps.into_iter().collect();
        failures.sort();
        Self {
            window,
            failures: failures.into(),
        }
    }

    /// Window width in seconds.
    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn add_failure(&mut self, now: DateTime<Utc>) {
        self.failures.push_back(now);
        self.expire(now);
    }

    /// Failures recorded within the window ending at `now`.
    pub fn num_failures(&self, now: DateTime<Utc>) -> usize {
        self.failures
            .iter()
            .filter(|ts| self.in_window(**ts, now))
            .count()
    }

    /// True once the in-window count is strictly greater than `limit`.
    pub fn has_excessive_failures(&self, limit: Option<u32>, now: DateTime<Utc>) -> bool {
        match limit {
            Some(limit) => self.num_failures(now) > limit as usize,
            None => false,
        }
    }

    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.failures.back().copied()
    }

    pub fn timestamps(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.failures.iter()
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }

    fn in_window(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(ts) < seconds(self.window)
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        while let Some(&oldest) = self.failures.front() {
            if self.in_window(oldest, now) {
                break;
            }
            self.failures.pop_front();
        }
    }
}
