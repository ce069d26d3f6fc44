//! One batch pass: normalize, probe, harvest, dedup
//!
//! Each stage runs to completion before the next one starts.

use crate::proxy::checker::{LivenessProber, ProbeConfig, DEFAULT_KEYWORDS};
use crate::proxy::crawler::{HarvestConfig, SubscriptionEndpoint, SubscriptionHarvester};
use crate::proxy::dedup::{DedupConfig, ProxyDeduplicator};
use crate::proxy::limiter::{Backoff, RequestLimiter, RetryPolicy, DEFAULT_ATTEMPTS, DEFAULT_BACKOFF_SECS};
use crate::proxy::net::{Network, NetworkConfig};
use crate::proxy::parser::CandidateParser;
use crate::proxy::progress::DEFAULT_PROGRESS_SECS;
use crate::proxy::throttle::{ThrottlePolicy, ThrottleStore, DEFAULT_ERROR_THRESHOLD, DEFAULT_SILENT_DAYS};
use crate::Result;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default size of the worker pool
const DEFAULT_CONCURRENCY: usize = 20;

/// Default request issue rate per second
const DEFAULT_RATE: u32 = 10;

/// Default HTTP timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default TCP connect timeout in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// File receiving validated host URLs
pub const HOSTS_FILE: &str = "hosts.txt";

/// File receiving proxy links
pub const PROXIES_FILE: &str = "proxies.txt";

/// Configuration for a whole run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker pool size; also the rate limiter burst
    pub concurrency: usize,
    /// Network operations issued per second across all workers
    pub rate_per_second: u32,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub backoff_step: Duration,
    pub progress_interval: Duration,
    pub keywords: Vec<String>,
    pub endpoints: Vec<SubscriptionEndpoint>,
    pub error_threshold: u32,
    pub silent_window: chrono::Duration,
    pub tcp_check: bool,
    pub reachability: bool,
    pub accept_invalid_certs: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            rate_per_second: DEFAULT_RATE,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            attempts: DEFAULT_ATTEMPTS,
            backoff_step: Duration::from_secs(DEFAULT_BACKOFF_SECS),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_SECS),
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            endpoints: SubscriptionEndpoint::defaults(),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            silent_window: chrono::Duration::days(DEFAULT_SILENT_DAYS),
            tcp_check: true,
            reachability: true,
            accept_invalid_certs: true,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_rate(mut self, per_second: u32) -> Self {
        self.rate_per_second = per_second;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, attempts: u32, backoff_step: Duration) -> Self {
        self.attempts = attempts;
        self.backoff_step = backoff_step;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<SubscriptionEndpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_throttle(mut self, error_threshold: u32, silent_window: chrono::Duration) -> Self {
        self.error_threshold = error_threshold;
        self.silent_window = silent_window;
        self
    }

    pub fn with_tcp_check(mut self, enabled: bool) -> Self {
        self.tcp_check = enabled;
        self
    }

    pub fn with_reachability(mut self, enabled: bool) -> Self {
        self.reachability = enabled;
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = if self.backoff_step.is_zero() {
            Backoff::None
        } else {
            Backoff::Linear(self.backoff_step)
        };
        RetryPolicy::new(self.attempts, backoff)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig::new()
            .with_timeout(self.request_timeout)
            .with_accept_invalid_certs(self.accept_invalid_certs)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig::new()
            .with_concurrency(self.concurrency)
            .with_retry(self.retry_policy())
            .with_tcp_check(self.tcp_check)
            .with_connect_timeout(self.connect_timeout)
            .with_keywords(self.keywords.clone())
            .with_throttle(ThrottlePolicy::new(self.error_threshold, self.silent_window))
            .with_progress_interval(self.progress_interval)
    }

    pub fn harvest_config(&self) -> HarvestConfig {
        HarvestConfig::new()
            .with_concurrency(self.concurrency)
            .with_retry(self.retry_policy())
            .with_endpoints(self.endpoints.clone())
            .with_progress_interval(self.progress_interval)
    }

    pub fn dedup_config(&self) -> DedupConfig {
        DedupConfig::new()
            .with_reachability(self.reachability)
            .with_concurrency(self.concurrency)
            .with_retry(self.retry_policy())
            .with_connect_timeout(self.connect_timeout)
            .with_progress_interval(self.progress_interval)
    }
}

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total_lines: usize,
    pub valid_lines: usize,
    pub unique_candidates: usize,
    pub skipped_by_throttle: usize,
    pub probed: usize,
    pub live_hosts: usize,
    pub endpoints_ok: usize,
    pub endpoints_failed: usize,
    pub raw_proxies: usize,
    pub duplicate_proxies: usize,
    pub unsupported_proxies: usize,
    pub malformed_proxies: usize,
    pub evicted_proxies: usize,
    pub unique_proxies: usize,
}

/// Outputs of a run
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    /// Base URLs of the validated hosts
    pub hosts: Vec<String>,
    /// Link form of every final proxy
    pub proxies: Vec<String>,
    pub stats: RunStats,
}

/// The staged validation-and-harvest pass
pub struct Pipeline {
    prober: LivenessProber,
    harvester: SubscriptionHarvester,
    deduplicator: ProxyDeduplicator,
}

impl Pipeline {
    /// Build the stages around one shared network and rate limiter
    pub fn new(config: PipelineConfig, network: Arc<dyn Network>, throttle: Arc<dyn ThrottleStore>) -> Self {
        let limiter = RequestLimiter::new(config.rate_per_second, config.concurrency);
        Self {
            prober: LivenessProber::new(config.probe_config(), Arc::clone(&network), throttle, limiter.clone()),
            harvester: SubscriptionHarvester::new(config.harvest_config(), Arc::clone(&network), limiter.clone()),
            deduplicator: ProxyDeduplicator::new(config.dedup_config(), network, limiter),
        }
    }

    /// Run every stage over the raw input lines
    pub async fn run<I, S>(&self, lines: I) -> PipelineReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized = CandidateParser::normalize(lines);
        let mut stats = RunStats {
            total_lines: normalized.total_lines,
            valid_lines: normalized.valid_lines,
            unique_candidates: normalized.unique_count(),
            ..Default::default()
        };

        let probe = self.prober.probe_all(normalized.candidates).await;
        stats.skipped_by_throttle = probe.skipped;
        stats.probed = probe.probed;
        stats.live_hosts = probe.live.len();

        let harvest = self.harvester.harvest(&probe.live).await;
        stats.endpoints_ok = harvest.endpoints_ok;
        stats.endpoints_failed = harvest.endpoints_failed;
        stats.raw_proxies = harvest.proxies.len();

        let dedup = self.deduplicator.run(&harvest.proxies).await;
        stats.duplicate_proxies = dedup.duplicates;
        stats.unsupported_proxies = dedup.unsupported;
        stats.malformed_proxies = harvest.malformed + dedup.malformed;
        stats.evicted_proxies = dedup.evicted;
        stats.unique_proxies = dedup.proxies.len();

        info!(?stats, "run complete");
        PipelineReport {
            hosts: probe.live.iter().map(|h| h.candidate.base_url()).collect(),
            proxies: dedup.proxies.into_iter().map(|p| p.raw_form).collect(),
            stats,
        }
    }
}

/// Write `hosts.txt` and `proxies.txt` into `dir`, creating it when needed
pub fn write_outputs<P: AsRef<Path>>(dir: P, report: &PipelineReport) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let hosts_path = dir.join(HOSTS_FILE);
    let proxies_path = dir.join(PROXIES_FILE);
    CandidateParser::save_to_file(&report.hosts, &hosts_path)?;
    CandidateParser::save_to_file(&report.proxies, &proxies_path)?;
    Ok((hosts_path, proxies_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.rate_per_second, DEFAULT_RATE);
        assert_eq!(config.error_threshold, 3);
        assert_eq!(config.silent_window, chrono::Duration::days(7));
        assert_eq!(config.endpoints.len(), 3);
    }

    #[test]
    fn test_stage_configs_follow_pipeline_config() {
        let config = PipelineConfig::new()
            .with_concurrency(7)
            .with_retry(2, Duration::ZERO)
            .with_tcp_check(false)
            .with_reachability(false)
            .with_keywords(vec!["k".to_string()]);

        assert_eq!(config.retry_policy(), RetryPolicy::new(2, Backoff::None));

        let probe = config.probe_config();
        assert_eq!(probe.concurrency, 7);
        assert!(!probe.tcp_check);
        assert_eq!(probe.keywords, vec!["k"]);

        assert_eq!(config.harvest_config().concurrency, 7);
        assert!(!config.dedup_config().reachability);
    }

    #[test]
    fn test_linear_backoff_policy() {
        let config = PipelineConfig::new().with_retry(3, Duration::from_secs(1));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(3, Backoff::Linear(Duration::from_secs(1)))
        );
    }
}
