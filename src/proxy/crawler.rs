//! Subscription harvester: fetches proxy feeds published by validated hosts
//!
//! Two payload shapes are understood:
//! - link feeds, a base64 blob of newline-separated `scheme://` links
//! - proxy documents, a YAML/JSON mapping with a `proxies` list of records

use crate::error::DecodeError;
use crate::proxy::limiter::{retry, RequestLimiter, RetryPolicy};
use crate::proxy::links::decode_base64_text;
use crate::proxy::models::{ProxyKind, ProxyRecord, RawProxy, ValidatedHost};
use crate::proxy::net::Network;
use crate::proxy::progress::{ProgressReporter, StageCounters, DEFAULT_PROGRESS_SECS};
use crate::Result;
use anyhow::anyhow;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default number of concurrent subscription fetches
const DEFAULT_CONCURRENCY: usize = 20;

/// Payload shape served by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointFormat {
    /// Base64 blob of links with the given scheme
    Links(ProxyKind),
    /// Structured document with a `proxies` list
    Document,
}

impl fmt::Display for EndpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointFormat::Links(kind) => write!(f, "{kind}"),
            EndpointFormat::Document => write!(f, "document"),
        }
    }
}

/// A subscription path on an aggregator host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEndpoint {
    pub path: String,
    pub format: EndpointFormat,
}

impl SubscriptionEndpoint {
    pub fn links(path: &str, kind: ProxyKind) -> Self {
        Self {
            path: path.to_string(),
            format: EndpointFormat::Links(kind),
        }
    }

    pub fn document(path: &str) -> Self {
        Self {
            path: path.to_string(),
            format: EndpointFormat::Document,
        }
    }

    /// Endpoints served by a stock proxypool instance
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::links("/vmess/sub", ProxyKind::Vmess),
            Self::links("/trojan/sub", ProxyKind::Trojan),
            Self::document("/clash/proxies"),
        ]
    }
}

impl FromStr for SubscriptionEndpoint {
    type Err = anyhow::Error;

    /// Parse `path=format`, where format is `document` or a proxy kind
    fn from_str(s: &str) -> Result<Self> {
        let (path, format) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid endpoint {s:?}, expected PATH=FORMAT"))?;
        let path = path.trim();
        if !path.starts_with('/') {
            return Err(anyhow!("endpoint path must start with '/': {path:?}"));
        }
        let format = match format.trim() {
            "document" | "clash" => EndpointFormat::Document,
            other => EndpointFormat::Links(ProxyKind::from_name(other).ok_or_else(|| {
                anyhow!("unknown endpoint format {other:?}; use document, ss, ssr, vmess or trojan")
            })?),
        };
        Ok(Self {
            path: path.to_string(),
            format,
        })
    }
}

impl fmt::Display for SubscriptionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.path, self.format)
    }
}

/// Configuration for the subscription harvester
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub endpoints: Vec<SubscriptionEndpoint>,
    pub progress_interval: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            endpoints: SubscriptionEndpoint::defaults(),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_SECS),
        }
    }
}

impl HarvestConfig {
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

    pub fn with_endpoints(mut self, endpoints: Vec<SubscriptionEndpoint>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Result of fetching a single endpoint
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// `host/path` that was fetched
    pub source: String,
    pub proxies: Vec<RawProxy>,
    /// Document records that could not be read
    pub malformed: usize,
    pub error: Option<String>,
}

impl FetchResult {
    pub fn success(source: String, payload: DecodedPayload) -> Self {
        Self {
            source,
            proxies: payload.proxies,
            malformed: payload.malformed,
            error: None,
        }
    }

    pub fn failure(source: String, error: String) -> Self {
        Self {
            source,
            proxies: Vec::new(),
            malformed: 0,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate result of a harvest stage
#[derive(Debug, Clone, Default)]
pub struct HarvestReport {
    /// Raw proxies from every host; duplicates expected
    pub proxies: Vec<RawProxy>,
    pub endpoints_ok: usize,
    pub endpoints_failed: usize,
    /// Document records dropped before dedup
    pub malformed: usize,
}

/// Proxies decoded from one payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPayload {
    pub proxies: Vec<RawProxy>,
    /// Records skipped because they did not deserialize
    pub malformed: usize,
}

impl From<Vec<RawProxy>> for DecodedPayload {
    fn from(proxies: Vec<RawProxy>) -> Self {
        Self {
            proxies,
            malformed: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProxyDocument {
    #[serde(default)]
    proxies: Option<Vec<serde_yaml::Value>>,
}

/// Decode a base64 link feed, keeping lines with the expected scheme
pub fn decode_link_feed(body: &str, kind: ProxyKind) -> std::result::Result<Vec<RawProxy>, DecodeError> {
    let text = decode_base64_text(body)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with(kind.prefix()))
        .map(|line| RawProxy::Link(line.to_string()))
        .collect())
}

/// Decode a structured proxy document
///
/// Records that do not deserialize are skipped and counted; a missing or
/// empty `proxies` list is an error.
pub fn decode_proxy_document(body: &str) -> std::result::Result<DecodedPayload, DecodeError> {
    let doc: ProxyDocument = serde_yaml::from_str(body)?;
    let records = doc.proxies.unwrap_or_default();
    if records.is_empty() {
        return Err(DecodeError::EmptyDocument);
    }

    let total = records.len();
    let proxies: Vec<RawProxy> = records
        .into_iter()
        .filter_map(|value| serde_yaml::from_value::<ProxyRecord>(value).ok())
        .map(RawProxy::Record)
        .collect();
    if proxies.len() < total {
        debug!(total, kept = proxies.len(), "skipped malformed document records");
    }
    Ok(DecodedPayload {
        malformed: total - proxies.len(),
        proxies,
    })
}

/// Fetches subscriptions from validated hosts
#[derive(Clone)]
pub struct SubscriptionHarvester {
    config: HarvestConfig,
    network: Arc<dyn Network>,
    limiter: RequestLimiter,
}

impl SubscriptionHarvester {
    pub fn new(config: HarvestConfig, network: Arc<dyn Network>, limiter: RequestLimiter) -> Self {
        Self {
            config,
            network,
            limiter,
        }
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    /// Fetch and decode one endpoint of one host
    pub async fn fetch_endpoint(
        &self,
        host: &ValidatedHost,
        endpoint: &SubscriptionEndpoint,
    ) -> Result<DecodedPayload> {
        let url = host.candidate.url_for(&endpoint.path);
        let url = url.as_str();
        let body = retry(self.config.retry, |_| async move {
            self.limiter.acquire().await;
            self.network.get(url).await
        })
        .await?;

        let text = body.text();
        let payload = match endpoint.format {
            EndpointFormat::Links(kind) => decode_link_feed(&text, kind)?.into(),
            EndpointFormat::Document => decode_proxy_document(&text)?,
        };
        Ok(payload)
    }

    /// Fetch every configured endpoint of every host
    pub async fn harvest(&self, hosts: &[ValidatedHost]) -> HarvestReport {
        let jobs: Vec<(&ValidatedHost, &SubscriptionEndpoint)> = hosts
            .iter()
            .flat_map(|host| self.config.endpoints.iter().map(move |endpoint| (host, endpoint)))
            .collect();

        let counters = StageCounters::new(jobs.len());
        let reporter =
            ProgressReporter::spawn("harvest", Arc::clone(&counters), self.config.progress_interval);

        let results: Vec<FetchResult> = stream::iter(jobs)
            .map(|(host, endpoint)| {
                let counters = Arc::clone(&counters);
                async move {
                    let source = host.candidate.url_for(&endpoint.path);
                    let result = match self.fetch_endpoint(host, endpoint).await {
                        Ok(payload) => {
                            debug!(
                                source = %source,
                                count = payload.proxies.len(),
                                malformed = payload.malformed,
                                "fetched subscription"
                            );
                            FetchResult::success(source, payload)
                        }
                        Err(e) => {
                            debug!(source = %source, error = %e, "subscription skipped");
                            FetchResult::failure(source, e.to_string())
                        }
                    };
                    counters.record(result.is_success());
                    result
                }
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        reporter.stop().await;

        let mut report = HarvestReport::default();
        for result in results {
            if result.is_success() {
                report.endpoints_ok += 1;
                report.malformed += result.malformed;
                report.proxies.extend(result.proxies);
            } else {
                report.endpoints_failed += 1;
            }
        }
        info!(
            hosts = hosts.len(),
            endpoints_ok = report.endpoints_ok,
            endpoints_failed = report.endpoints_failed,
            raw_proxies = report.proxies.len(),
            malformed = report.malformed,
            "harvest stage complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::limiter::Backoff;
    use crate::proxy::models::{CandidateHost, Scheme};
    use crate::proxy::net::HttpBody;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::collections::HashMap;

    struct StubNetwork {
        pages: HashMap<String, String>,
    }

    #[async_trait]
    impl Network for StubNetwork {
        async fn connect(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn get(&self, url: &str) -> Result<HttpBody> {
            let page = self.pages.get(url).ok_or_else(|| anyhow!("404 for {url}"))?;
            Ok(HttpBody {
                status: 200,
                content_type: None,
                bytes: page.as_bytes().to_vec(),
            })
        }
    }

    fn harvester(pages: &[(&str, String)]) -> SubscriptionHarvester {
        let network = StubNetwork {
            pages: pages.iter().map(|(u, p)| (u.to_string(), p.clone())).collect(),
        };
        let config = HarvestConfig::new().with_retry(RetryPolicy::new(2, Backoff::None));
        SubscriptionHarvester::new(config, Arc::new(network), RequestLimiter::new(1000, 100))
    }

    fn host(name: &str) -> ValidatedHost {
        ValidatedHost::new(CandidateHost::new(Scheme::Http, name, 80), 1)
    }

    #[test]
    fn test_endpoint_from_str() {
        let endpoint: SubscriptionEndpoint = "/vmess/sub=vmess".parse().unwrap();
        assert_eq!(endpoint, SubscriptionEndpoint::links("/vmess/sub", ProxyKind::Vmess));

        let endpoint: SubscriptionEndpoint = "/clash/proxies=document".parse().unwrap();
        assert_eq!(endpoint.format, EndpointFormat::Document);
        assert_eq!(endpoint.to_string(), "/clash/proxies=document");

        assert!("/x".parse::<SubscriptionEndpoint>().is_err());
        assert!("x=vmess".parse::<SubscriptionEndpoint>().is_err());
        assert!("/x=vless".parse::<SubscriptionEndpoint>().is_err());
    }

    #[test]
    fn test_harvest_config_default() {
        let config = HarvestConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.endpoints.len(), 3);
    }

    #[test]
    fn test_decode_link_feed_filters_prefix() {
        let body = STANDARD.encode("vmess://AAA\nvmess://BBB\nnotaproxy\n");
        let proxies = decode_link_feed(&body, ProxyKind::Vmess).unwrap();
        assert_eq!(
            proxies,
            vec![
                RawProxy::Link("vmess://AAA".to_string()),
                RawProxy::Link("vmess://BBB".to_string())
            ]
        );
    }

    #[test]
    fn test_decode_link_feed_other_scheme_dropped() {
        let body = STANDARD.encode("trojan://pw@h:443\r\nvmess://AAA\r\n");
        let proxies = decode_link_feed(&body, ProxyKind::Trojan).unwrap();
        assert_eq!(proxies, vec![RawProxy::Link("trojan://pw@h:443".to_string())]);
    }

    #[test]
    fn test_decode_link_feed_bad_base64() {
        assert!(matches!(
            decode_link_feed("<html>not found</html>", ProxyKind::Vmess),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn test_decode_proxy_document() {
        let body = r#"
proxies:
  - {name: a, type: ss, server: 1.2.3.4, port: 8388, cipher: aes-128-gcm, password: pw}
  - {name: b, type: vmess, server: v.example, port: 443, uuid: u, alterId: 0}
  - just-a-string
"#;
        let payload = decode_proxy_document(body).unwrap();
        assert_eq!(payload.malformed, 1);
        let proxies = payload.proxies;
        assert_eq!(proxies.len(), 2);
        assert!(matches!(&proxies[0], RawProxy::Record(r) if r.kind == "ss"));
    }

    #[test]
    fn test_decode_proxy_document_json() {
        let body = r#"{"proxies":[{"type":"trojan","server":"t.example","port":443,"password":"pw"}]}"#;
        assert_eq!(decode_proxy_document(body).unwrap().proxies.len(), 1);
    }

    #[test]
    fn test_decode_proxy_document_empty_or_missing() {
        assert!(matches!(decode_proxy_document("proxies: []"), Err(DecodeError::EmptyDocument)));
        assert!(matches!(decode_proxy_document("other: 1"), Err(DecodeError::EmptyDocument)));
        assert!(matches!(decode_proxy_document("proxies: [unclosed"), Err(DecodeError::Document(_))));
    }

    #[tokio::test]
    async fn test_harvest_vmess_feed() {
        let feed = STANDARD.encode("vmess://AAA\nvmess://BBB\nnotaproxy\n");
        let harvester = harvester(&[("http://a.example/vmess/sub", feed)]);
        let report = harvester.harvest(&[host("a.example")]).await;

        assert_eq!(
            report.proxies,
            vec![
                RawProxy::Link("vmess://AAA".to_string()),
                RawProxy::Link("vmess://BBB".to_string())
            ]
        );
        assert_eq!(report.endpoints_ok, 1);
        assert_eq!(report.endpoints_failed, 2);
    }

    #[tokio::test]
    async fn test_harvest_bad_endpoint_keeps_others() {
        let harvester = harvester(&[
            ("http://a.example/vmess/sub", "%%% not base64 %%%".to_string()),
            (
                "http://a.example/trojan/sub",
                STANDARD.encode("trojan://pw@t.example:443#x\n"),
            ),
            ("http://a.example/clash/proxies", "proxies: []".to_string()),
        ]);
        let report = harvester.harvest(&[host("a.example")]).await;
        assert_eq!(report.proxies.len(), 1);
        assert_eq!(report.endpoints_ok, 1);
        assert_eq!(report.endpoints_failed, 2);
    }

    #[tokio::test]
    async fn test_harvest_counts_unreadable_records() {
        let document = "proxies:\n  - {type: ss, server: 123, port: 8388, cipher: c, password: p}\n  - {type: ss, server: s.example, port: 8388, cipher: c, password: p}\n";
        let harvester = harvester(&[("http://a.example/clash/proxies", document.to_string())]);
        let report = harvester.harvest(&[host("a.example")]).await;
        assert_eq!(report.proxies.len(), 1);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.endpoints_ok, 1);
    }
}
