//! Network access used by the probing, harvesting and reachability stages

use crate::Result;
use anyhow::bail;
use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{header, Client};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Default timeout for HTTP requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default user agent for HTTP requests
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// How many leading bytes are searched for a `<meta charset>` declaration
const CHARSET_SNIFF_LEN: usize = 1024;

static META_CHARSET_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([A-Za-z0-9_\-:.]+)"#)
        .expect("Invalid meta charset regex")
});

/// A successful HTTP response body
#[derive(Debug, Clone, Default)]
pub struct HttpBody {
    pub status: u16,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl HttpBody {
    /// Body decoded according to its declared charset
    pub fn text(&self) -> String {
        decode_body(&self.bytes, self.content_type.as_deref())
    }
}

/// Outbound network operations
#[async_trait]
pub trait Network: Send + Sync {
    /// Open and drop a TCP connection to `host:port`
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<()>;

    /// GET `url`; non-success statuses are errors
    async fn get(&self, url: &str) -> Result<HttpBody>;
}

/// Configuration for the reqwest-backed network
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub timeout: Duration,
    pub user_agent: String,
    /// Aggregator instances commonly run with self-signed certificates
    pub accept_invalid_certs: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_invalid_certs: true,
        }
    }
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

/// Production [`Network`] built on reqwest and tokio sockets
#[derive(Debug, Clone)]
pub struct ReqwestNetwork {
    client: Client,
}

impl ReqwestNetwork {
    pub fn new() -> Result<Self> {
        Self::with_config(NetworkConfig::default())
    }

    pub fn with_config(config: NetworkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Network for ReqwestNetwork {
    async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => bail!("connect to {host}:{port} timed out after {timeout:?}"),
        }
    }

    async fn get(&self, url: &str) -> Result<HttpBody> {
        debug!(url, "HTTP GET");
        let response = self.client.get(url).send().await?.error_for_status()?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?.to_vec();

        Ok(HttpBody {
            status,
            content_type,
            bytes,
        })
    }
}

/// Extract the `charset` parameter of a `Content-Type` value
pub fn charset_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
            .filter(|v| !v.is_empty())
    })
}

fn sniff_meta_charset(bytes: &[u8]) -> Option<String> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(CHARSET_SNIFF_LEN)]);
    META_CHARSET_REGEX
        .captures(&head)
        .map(|caps| caps[1].to_string())
}

/// Decode a response body to text
///
/// The charset comes from the `Content-Type` header, then from a
/// `<meta charset>` declaration, and falls back to UTF-8. Malformed byte
/// sequences are dropped instead of failing the decode.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = content_type
        .and_then(charset_from_content_type)
        .or_else(|| sniff_meta_charset(bytes))
        .and_then(|label| Encoding::for_label(label.as_bytes()))
        .unwrap_or(UTF_8);

    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!(encoding = encoding.name(), "dropped malformed byte sequences");
        text.chars().filter(|&c| c != char::REPLACEMENT_CHARACTER).collect()
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn test_network_config_builder() {
        let config = NetworkConfig::new()
            .with_timeout(Duration::from_secs(3))
            .with_user_agent("probe".to_string())
            .with_accept_invalid_certs(false);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.user_agent, "probe");
        assert!(!config.accept_invalid_certs);
    }

    #[test]
    fn test_charset_from_content_type() {
        assert_eq!(
            charset_from_content_type("text/html; charset=GBK").as_deref(),
            Some("GBK")
        );
        assert_eq!(
            charset_from_content_type("text/html;Charset=\"utf-8\"").as_deref(),
            Some("utf-8")
        );
        assert_eq!(charset_from_content_type("text/html"), None);
    }

    #[test]
    fn test_decode_gbk_from_header() {
        // "代理池" in GBK
        let bytes = [0xB4, 0xFA, 0xC0, 0xED, 0xB3, 0xD8];
        assert_eq!(decode_body(&bytes, Some("text/html; charset=gbk")), "代理池");
    }

    #[test]
    fn test_decode_gbk_from_meta() {
        let mut bytes = b"<html><head><meta charset=\"gb2312\"></head><body>".to_vec();
        bytes.extend_from_slice(&[0xB4, 0xFA, 0xC0, 0xED]);
        let text = decode_body(&bytes, Some("text/html"));
        assert!(text.contains("代理"));
    }

    #[test]
    fn test_decode_drops_malformed_sequences() {
        let bytes = b"proxy\xFF\xFEpool";
        assert_eq!(decode_body(bytes, None), "proxypool");
    }

    #[test]
    fn test_decode_unknown_label_falls_back_to_utf8() {
        assert_eq!(decode_body("héllo".as_bytes(), Some("text/plain; charset=nope")), "héllo");
    }
}
