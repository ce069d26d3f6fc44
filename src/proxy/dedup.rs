//! Proxy deduplicator: collapses harvested proxies by identity and prunes
//! unreachable servers

use crate::error::LinkError;
use crate::proxy::limiter::{retry, RequestLimiter, RetryPolicy};
use crate::proxy::links::decode_raw;
use crate::proxy::models::{Fingerprint, ProxyEntry, RawProxy};
use crate::proxy::net::Network;
use crate::proxy::progress::{ProgressReporter, StageCounters, DEFAULT_PROGRESS_SECS};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default number of concurrent reachability checks
const DEFAULT_CONCURRENCY: usize = 50;

/// Default timeout for a reachability connect in seconds
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Configuration for the deduplicator
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Evict entries whose server does not accept a TCP connection
    pub reachability: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            reachability: true,
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_SECS),
        }
    }
}

impl DedupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reachability(mut self, enabled: bool) -> Self {
        self.reachability = enabled;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Unique proxies keyed by fingerprint, safe for concurrent inserts
#[derive(Debug, Default)]
pub struct UniqueProxies {
    entries: DashMap<Fingerprint, ProxyEntry>,
    duplicates: AtomicUsize,
}

impl UniqueProxies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry; returns false when its fingerprint was already present
    pub fn insert(&self, entry: ProxyEntry) -> bool {
        match self.entries.entry(entry.fingerprint()) {
            Entry::Occupied(_) => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates.load(Ordering::Relaxed)
    }

    pub fn into_entries(self) -> Vec<ProxyEntry> {
        self.entries.into_iter().map(|(_, entry)| entry).collect()
    }
}

/// Aggregate result of the dedup stage
#[derive(Debug, Clone, Default)]
pub struct DedupReport {
    pub proxies: Vec<ProxyEntry>,
    pub duplicates: usize,
    /// Types other than ss, ssr, vmess and trojan
    pub unsupported: usize,
    /// Supported types whose identity fields could not be read
    pub malformed: usize,
    /// Unique entries removed by the reachability pass
    pub evicted: usize,
}

/// Deduplicates harvested proxies and optionally checks their reachability
#[derive(Clone)]
pub struct ProxyDeduplicator {
    config: DedupConfig,
    network: Arc<dyn Network>,
    limiter: RequestLimiter,
}

impl ProxyDeduplicator {
    pub fn new(config: DedupConfig, network: Arc<dyn Network>, limiter: RequestLimiter) -> Self {
        Self {
            config,
            network,
            limiter,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Collapse raw proxies by fingerprint, first seen wins
    pub fn dedup(&self, raw: &[RawProxy]) -> DedupReport {
        let unique = UniqueProxies::new();
        let mut report = DedupReport::default();

        for proxy in raw {
            match decode_raw(proxy) {
                Ok(entry) => {
                    unique.insert(entry);
                }
                Err(LinkError::Unsupported(kind)) => {
                    debug!(kind = %kind, "dropping unsupported proxy type");
                    report.unsupported += 1;
                }
                Err(e) => {
                    debug!(error = %e, "dropping undecodable proxy");
                    report.malformed += 1;
                }
            }
        }

        report.duplicates = unique.duplicates();
        report.proxies = unique.into_entries();
        report
    }

    /// TCP-connect to one entry's server
    pub async fn is_reachable(&self, entry: &ProxyEntry) -> bool {
        let host = entry.server.as_str();
        let port = entry.port;
        retry(self.config.retry, |_| async move {
            self.limiter.acquire().await;
            self.network.connect(host, port, self.config.connect_timeout).await
        })
        .await
        .is_ok()
    }

    /// Keep only entries whose server accepts a connection
    ///
    /// Returns after every entry is resolved, with the evicted count.
    pub async fn prune_unreachable(&self, entries: Vec<ProxyEntry>) -> (Vec<ProxyEntry>, usize) {
        let total = entries.len();
        let counters = StageCounters::new(total);
        let reporter =
            ProgressReporter::spawn("reachability", Arc::clone(&counters), self.config.progress_interval);

        let kept: Vec<ProxyEntry> = stream::iter(entries)
            .map(|entry| {
                let counters = Arc::clone(&counters);
                async move {
                    let reachable = self.is_reachable(&entry).await;
                    counters.record(reachable);
                    if !reachable {
                        debug!(server = %entry.server, port = entry.port, "evicting unreachable proxy");
                    }
                    reachable.then_some(entry)
                }
            })
            .buffer_unordered(self.config.concurrency)
            .filter_map(|entry| async move { entry })
            .collect()
            .await;

        reporter.stop().await;
        let evicted = total - kept.len();
        (kept, evicted)
    }

    /// Dedup, then run the reachability pass when enabled
    pub async fn run(&self, raw: &[RawProxy]) -> DedupReport {
        let mut report = self.dedup(raw);
        if self.config.reachability {
            let (kept, evicted) = self.prune_unreachable(std::mem::take(&mut report.proxies)).await;
            report.proxies = kept;
            report.evicted = evicted;
        }

        info!(
            raw = raw.len(),
            unique = report.proxies.len(),
            duplicates = report.duplicates,
            unsupported = report.unsupported,
            malformed = report.malformed,
            evicted = report.evicted,
            "dedup stage complete"
        );
        report
    }
}
