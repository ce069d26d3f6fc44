//! Periodic progress reporting for a pipeline stage

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

/// Default reporting interval in seconds
pub const DEFAULT_PROGRESS_SECS: u64 = 5;

/// Atomic counters shared between a stage's workers and its reporter
#[derive(Debug, Default)]
pub struct StageCounters {
    total: AtomicUsize,
    processed: AtomicUsize,
    succeeded: AtomicUsize,
}

/// Point-in-time copy of [`StageCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
}

impl StageCounters {
    pub fn new(total: usize) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicUsize::new(total),
            ..Default::default()
        })
    }

    pub fn record(&self, success: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
        }
    }
}

/// Background task logging a stage's counters until stopped
pub struct ProgressReporter {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn spawn(stage: &'static str, counters: Arc<StageCounters>, every: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let every = every.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let s = counters.snapshot();
                        info!(stage, processed = s.processed, total = s.total, succeeded = s.succeeded, "progress");
                    }
                }
            }
        });

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Signal the reporter and wait for it to exit
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_record() {
        let counters = StageCounters::new(3);
        counters.record(true);
        counters.record(false);
        assert_eq!(
            counters.snapshot(),
            ProgressSnapshot {
                total: 3,
                processed: 2,
                succeeded: 1
            }
        );
    }

    #[tokio::test]
    async fn test_reporter_stops() {
        let counters = StageCounters::new(1);
        let reporter = ProgressReporter::spawn("test", Arc::clone(&counters), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tokio::time::timeout(Duration::from_secs(1), reporter.stop())
            .await
            .expect("reporter did not stop");
    }
}
