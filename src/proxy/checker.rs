//! Liveness prober: decides which candidates are live aggregator instances

use crate::proxy::limiter::{retry, RequestLimiter, RetryPolicy};
use crate::proxy::models::{CandidateHost, ValidatedHost};
use crate::proxy::net::Network;
use crate::proxy::progress::{ProgressReporter, StageCounters, DEFAULT_PROGRESS_SECS};
use crate::proxy::throttle::{ThrottlePolicy, ThrottleStore};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default number of concurrent probes
const DEFAULT_CONCURRENCY: usize = 20;

/// Default timeout for the TCP pre-check in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default content fingerprint of a proxypool instance
pub const DEFAULT_KEYWORDS: [&str; 2] = ["proxypool", "/clash/proxies"];

/// Configuration for the liveness prober
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Number of concurrent probes
    pub concurrency: usize,
    /// Retry policy for the TCP pre-check and the HTTP GET
    pub retry: RetryPolicy,
    /// Run a TCP connect before the HTTP request
    pub tcp_check: bool,
    pub connect_timeout: Duration,
    /// Every keyword must be present in the page for a host to be live
    pub keywords: Vec<String>,
    pub throttle: ThrottlePolicy,
    pub progress_interval: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            tcp_check: true,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            throttle: ThrottlePolicy::default(),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_SECS),
        }
    }
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_tcp_check(mut self, enabled: bool) -> Self {
        self.tcp_check = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_throttle(mut self, throttle: ThrottlePolicy) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Why a probed candidate is not live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotLiveReason {
    /// TCP pre-check failed every attempt
    Unreachable(String),
    /// HTTP request failed every attempt
    RequestFailed(String),
    /// Page lacks some of the fingerprint keywords
    KeywordMismatch { matched: usize, required: usize },
}

/// Result of probing one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Live(ValidatedHost),
    NotLive(NotLiveReason),
    /// Inside the silent window; no network call was made
    Skipped,
}

impl ProbeOutcome {
    pub fn is_live(&self) -> bool {
        matches!(self, ProbeOutcome::Live(_))
    }
}

/// Aggregate result of a probing stage
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub live: Vec<ValidatedHost>,
    pub probed: usize,
    pub skipped: usize,
    pub unreachable: usize,
    pub request_failed: usize,
    pub mismatched: usize,
}

/// Count how many keywords occur in `text`
pub fn matched_keywords(text: &str, keywords: &[String]) -> usize {
    keywords.iter().filter(|k| text.contains(k.as_str())).count()
}

/// Concurrent, rate-limited liveness prober
#[derive(Clone)]
pub struct LivenessProber {
    config: ProbeConfig,
    network: Arc<dyn Network>,
    throttle: Arc<dyn ThrottleStore>,
    limiter: RequestLimiter,
}

impl LivenessProber {
    pub fn new(
        config: ProbeConfig,
        network: Arc<dyn Network>,
        throttle: Arc<dyn ThrottleStore>,
        limiter: RequestLimiter,
    ) -> Self {
        Self {
            config,
            network,
            throttle,
            limiter,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe a single candidate
    pub async fn probe(&self, candidate: &CandidateHost) -> ProbeOutcome {
        let key = candidate.key();

        match self.throttle.get(&key).await {
            Ok(Some(record)) if self.config.throttle.should_skip(&record, Utc::now()) => {
                debug!(host = %key, failures = record.failure_count, "inside silent window, skipping");
                return ProbeOutcome::Skipped;
            }
            Ok(_) => {}
            Err(e) => warn!(host = %key, error = %e, "throttle lookup failed, treating host as unseen"),
        }

        let outcome = self.probe_network(candidate).await;
        match &outcome {
            ProbeOutcome::Live(_) => self.record_success(&key).await,
            ProbeOutcome::NotLive(_) => self.record_failure(&key).await,
            ProbeOutcome::Skipped => {}
        }
        outcome
    }

    async fn probe_network(&self, candidate: &CandidateHost) -> ProbeOutcome {
        let start = Instant::now();

        if self.config.tcp_check {
            let connected = retry(self.config.retry, |_| async move {
                self.limiter.acquire().await;
                self.network
                    .connect(candidate.connect_host(), candidate.port, self.config.connect_timeout)
                    .await
            })
            .await;
            if let Err(e) = connected {
                debug!(host = %candidate, error = %e, "tcp pre-check failed");
                return ProbeOutcome::NotLive(NotLiveReason::Unreachable(e.to_string()));
            }
        }

        let url = candidate.base_url();
        let url = url.as_str();
        let body = retry(self.config.retry, |_| async move {
            self.limiter.acquire().await;
            self.network.get(url).await
        })
        .await;
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                debug!(host = %candidate, error = %e, "request failed");
                return ProbeOutcome::NotLive(NotLiveReason::RequestFailed(e.to_string()));
            }
        };

        let text = body.text();
        let required = self.config.keywords.len();
        let matched = matched_keywords(&text, &self.config.keywords);
        if matched < required {
            debug!(host = %candidate, matched, required, "content fingerprint mismatch");
            return ProbeOutcome::NotLive(NotLiveReason::KeywordMismatch { matched, required });
        }

        let elapsed = start.elapsed().as_millis() as u64;
        info!(host = %candidate, elapsed_ms = elapsed, "live instance");
        ProbeOutcome::Live(ValidatedHost::new(candidate.clone(), elapsed))
    }

    async fn record_success(&self, key: &str) {
        if let Err(e) = self.throttle.clear(key).await {
            warn!(host = %key, error = %e, "failed to clear throttle record");
        }
    }

    async fn record_failure(&self, key: &str) {
        if let Err(e) = self.throttle.upsert_failure(key, Utc::now()).await {
            warn!(host = %key, error = %e, "failed to record probe failure");
        }
    }

    /// Probe every candidate; returns once all of them are resolved
    pub async fn probe_all(&self, candidates: Vec<CandidateHost>) -> ProbeReport {
        let counters = StageCounters::new(candidates.len());
        let reporter =
            ProgressReporter::spawn("probe", Arc::clone(&counters), self.config.progress_interval);

        let live: DashMap<String, ValidatedHost> = DashMap::new();
        let skipped = AtomicUsize::new(0);
        let unreachable = AtomicUsize::new(0);
        let request_failed = AtomicUsize::new(0);
        let mismatched = AtomicUsize::new(0);

        stream::iter(candidates)
            .for_each_concurrent(self.config.concurrency, |candidate| {
                let counters = Arc::clone(&counters);
                let (live, skipped, unreachable, request_failed, mismatched) =
                    (&live, &skipped, &unreachable, &request_failed, &mismatched);
                async move {
                    let outcome = self.probe(&candidate).await;
                    counters.record(outcome.is_live());
                    let counter = match outcome {
                        ProbeOutcome::Live(host) => {
                            live.insert(host.key(), host);
                            return;
                        }
                        ProbeOutcome::Skipped => skipped,
                        ProbeOutcome::NotLive(NotLiveReason::Unreachable(_)) => unreachable,
                        ProbeOutcome::NotLive(NotLiveReason::RequestFailed(_)) => request_failed,
                        ProbeOutcome::NotLive(NotLiveReason::KeywordMismatch { .. }) => mismatched,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await;

        reporter.stop().await;

        let skipped = skipped.into_inner();
        let report = ProbeReport {
            live: live.into_iter().map(|(_, host)| host).collect(),
            probed: counters.snapshot().processed - skipped,
            skipped,
            unreachable: unreachable.into_inner(),
            request_failed: request_failed.into_inner(),
            mismatched: mismatched.into_inner(),
        };
        info!(
            live = report.live.len(),
            probed = report.probed,
            skipped = report.skipped,
            unreachable = report.unreachable,
            request_failed = report.request_failed,
            mismatched = report.mismatched,
            "probe stage complete"
        );
        report
    }
}
