//! Revisit throttle: suppresses probing of chronically failing hosts

use crate::proxy::models::ValidationRecord;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Default number of consecutive failures before a host is silenced
pub const DEFAULT_ERROR_THRESHOLD: u32 = 3;

/// Default silent window in days
pub const DEFAULT_SILENT_DAYS: i64 = 7;

/// Persisted per-host failure records
#[async_trait]
pub trait ThrottleStore: Send + Sync {
    /// Fetch the record for a host, if any
    async fn get(&self, host_key: &str) -> Result<Option<ValidationRecord>>;

    /// Increment the failure counter (creating it at 1) and stamp `now`
    async fn upsert_failure(&self, host_key: &str, now: DateTime<Utc>) -> Result<()>;

    /// Delete the record after a successful probe
    async fn clear(&self, host_key: &str) -> Result<()>;
}

/// Decides whether a host is inside its silent window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub error_threshold: u32,
    pub silent_window: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            silent_window: Duration::days(DEFAULT_SILENT_DAYS),
        }
    }
}

impl ThrottlePolicy {
    pub fn new(error_threshold: u32, silent_window: Duration) -> Self {
        Self {
            error_threshold,
            silent_window,
        }
    }

    pub fn should_skip(&self, record: &ValidationRecord, now: DateTime<Utc>) -> bool {
        record.failure_count >= self.error_threshold
            && now.signed_duration_since(record.last_checked_at) < self.silent_window
    }
}

/// In-memory throttle store, used for ephemeral runs and tests
#[derive(Debug, Default)]
pub struct MemoryThrottle {
    records: DashMap<String, ValidationRecord>,
}

impl MemoryThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a record
    pub fn insert(&self, record: ValidationRecord) {
        self.records.insert(record.host_key.clone(), record);
    }

    pub fn record(&self, host_key: &str) -> Option<ValidationRecord> {
        self.records.get(host_key).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ThrottleStore for MemoryThrottle {
    async fn get(&self, host_key: &str) -> Result<Option<ValidationRecord>> {
        Ok(self.record(host_key))
    }

    async fn upsert_failure(&self, host_key: &str, now: DateTime<Utc>) -> Result<()> {
        self.records
            .entry(host_key.to_string())
            .and_modify(|r| {
                r.failure_count = r.failure_count.saturating_add(1);
                r.last_checked_at = now;
            })
            .or_insert_with(|| ValidationRecord::new(host_key, 1, now));
        Ok(())
    }

    async fn clear(&self, host_key: &str) -> Result<()> {
        self.records.remove(host_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_skips_recent_failures() {
        let policy = ThrottlePolicy::default();
        let now = Utc::now();
        let record = ValidationRecord::new("http://a.example", 3, now - Duration::days(1));
        assert!(policy.should_skip(&record, now));
    }

    #[test]
    fn test_policy_below_threshold() {
        let policy = ThrottlePolicy::default();
        let now = Utc::now();
        let record = ValidationRecord::new("http://a.example", 2, now);
        assert!(!policy.should_skip(&record, now));
    }

    #[test]
    fn test_policy_window_expired() {
        let policy = ThrottlePolicy::new(3, Duration::days(7));
        let now = Utc::now();
        let record = ValidationRecord::new("http://a.example", 10, now - Duration::days(8));
        assert!(!policy.should_skip(&record, now));
    }

    #[tokio::test]
    async fn test_memory_throttle_upsert_and_clear() {
        let store = MemoryThrottle::new();
        let now = Utc::now();
        assert!(store.get("k").await.unwrap().is_none());

        store.upsert_failure("k", now).await.unwrap();
        store.upsert_failure("k", now).await.unwrap();
        let record = store.get("k").await.unwrap().unwrap();
        assert_eq!(record.failure_count, 2);
        assert_eq!(record.last_checked_at, now);

        store.clear("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
