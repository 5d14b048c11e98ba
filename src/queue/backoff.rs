// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential backoff schedule for delivery retries.
//!
//! The schedule is a pure function of the attempt count, so retry timing is
//! unit-testable without sleeping. The drain loop owns the actual waiting:
//! an item is simply not eligible until its delay has elapsed.
//!
//! # Example
//!
//! ```
//! use community_sync::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(30), 3);
//! assert_eq!(policy.delay_for(0), Duration::from_millis(500));
//! assert_eq!(policy.delay_for(1), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(2));
//! assert_eq!(policy.delay_for(30), Duration::from_secs(30)); // capped
//! ```

use std::time::Duration;

use crate::config::SyncConfig;
use crate::queue_item::QueuedItem;

/// Deterministic retry schedule: `base * 2^attempts`, capped.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts }
    }

    #[must_use]
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            config.max_attempts,
        )
    }

    /// Delay before the next attempt, given how many attempts have been made.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts.min(32));
        let delay_ms = (self.base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.cap)
    }

    /// Whether an item's backoff window has elapsed at `now` (epoch millis).
    ///
    /// Items that were never attempted are always eligible.
    #[must_use]
    pub fn is_eligible(&self, item: &QueuedItem, now_millis: i64) -> bool {
        if item.last_attempt_at == 0 {
            return true;
        }
        // attempts has already been incremented for the failed attempt
        let delay = self.delay_for(item.attempts.saturating_sub(1));
        now_millis >= item.last_attempt_at + delay.as_millis() as i64
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_item::ItemKind;
    use serde_json::json;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), 3)
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(63), Duration::from_secs(5));
    }

    #[test]
    fn test_no_overflow_on_huge_attempt_counts() {
        let policy = policy();
        // Must not panic or wrap
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_never_attempted_is_eligible() {
        let item = QueuedItem::new("c".into(), json!({}), ItemKind::Message, 1);
        assert!(policy().is_eligible(&item, 0));
    }

    #[test]
    fn test_eligibility_respects_window() {
        let policy = policy();
        let mut item = QueuedItem::new("c".into(), json!({}), ItemKind::Message, 1);
        item.attempts = 1;
        item.last_attempt_at = 10_000;

        // delay_for(0) = 100ms after the attempt at t=10s
        assert!(!policy.is_eligible(&item, 10_050));
        assert!(policy.is_eligible(&item, 10_100));

        item.attempts = 2;
        assert!(!policy.is_eligible(&item, 10_150));
        assert!(policy.is_eligible(&item, 10_200));
    }
}
