//! Data models for candidate hosts, throttle records and harvested proxies

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// URL scheme of a candidate host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    /// Parse a URL scheme, accepting only `http` and `https`
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            _ => None,
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unverified host extracted from the input list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateHost {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl CandidateHost {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_lowercase(),
            port,
        }
    }

    pub fn is_default_port(&self) -> bool {
        self.port == self.scheme.default_port()
    }

    /// Dedup and throttle key: `scheme://host`, plus `:port` when not the default
    pub fn key(&self) -> String {
        if self.is_default_port() {
            format!("{}://{}", self.scheme, self.host)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// Base URL the liveness probe is issued against
    pub fn base_url(&self) -> String {
        format!("{}/", self.key())
    }

    /// URL of a path on this host
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.key(), path)
        } else {
            format!("{}/{}", self.key(), path)
        }
    }

    /// Host name usable for a socket connect (IPv6 brackets removed)
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for CandidateHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A candidate that matched the content fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatedHost {
    pub candidate: CandidateHost,
    pub checked_at: DateTime<Utc>,
    pub response_time_ms: u64,
}

impl ValidatedHost {
    pub fn new(candidate: CandidateHost, response_time_ms: u64) -> Self {
        Self {
            candidate,
            checked_at: Utc::now(),
            response_time_ms,
        }
    }

    pub fn key(&self) -> String {
        self.candidate.key()
    }
}

/// Revisit-throttle record for a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub host_key: String,
    pub failure_count: u32,
    pub last_checked_at: DateTime<Utc>,
}

impl ValidationRecord {
    pub fn new(host_key: impl Into<String>, failure_count: u32, last_checked_at: DateTime<Utc>) -> Self {
        Self {
            host_key: host_key.into(),
            failure_count,
            last_checked_at,
        }
    }
}

/// Supported proxy protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProxyKind {
    Ss,
    Ssr,
    Vmess,
    Trojan,
}

impl ProxyKind {
    pub const ALL: [ProxyKind; 4] = [ProxyKind::Ss, ProxyKind::Ssr, ProxyKind::Vmess, ProxyKind::Trojan];

    /// Look up a kind by its protocol name (`ss`, `ssr`, `vmess`, `trojan`)
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "ss" | "shadowsocks" => Some(ProxyKind::Ss),
            "ssr" | "shadowsocksr" => Some(ProxyKind::Ssr),
            "vmess" => Some(ProxyKind::Vmess),
            "trojan" => Some(ProxyKind::Trojan),
            _ => None,
        }
    }

    /// Detect the kind from a link's scheme prefix
    pub fn from_link(link: &str) -> Option<Self> {
        let (scheme, _) = link.split_once("://")?;
        match scheme.to_ascii_lowercase().as_str() {
            "ss" => Some(ProxyKind::Ss),
            "ssr" => Some(ProxyKind::Ssr),
            "vmess" => Some(ProxyKind::Vmess),
            "trojan" => Some(ProxyKind::Trojan),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProxyKind::Ss => "ss",
            ProxyKind::Ssr => "ssr",
            ProxyKind::Vmess => "vmess",
            ProxyKind::Trojan => "trojan",
        }
    }

    /// Link prefix, e.g. `vmess://`
    pub fn prefix(&self) -> &'static str {
        match self {
            ProxyKind::Ss => "ss://",
            ProxyKind::Ssr => "ssr://",
            ProxyKind::Vmess => "vmess://",
            ProxyKind::Trojan => "trojan://",
        }
    }

    /// Credential fields that, together with server and port, identify a proxy
    pub fn identity_fields(&self) -> &'static [&'static str] {
        match self {
            ProxyKind::Ss => &["password", "cipher"],
            ProxyKind::Ssr => &["password", "cipher", "protocol", "obfs"],
            ProxyKind::Vmess => &["id", "alterId"],
            ProxyKind::Trojan => &["password", "sni"],
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Composite identity of a proxy; display names never take part in it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint {
    pub kind: ProxyKind,
    /// Lowercased server name
    pub server: String,
    pub port: u16,
    /// Values of [`ProxyKind::identity_fields`], in that order
    pub identity: Vec<String>,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.kind, self.server, self.port)?;
        for value in &self.identity {
            write!(f, "|{value:?}")?;
        }
        Ok(())
    }
}

/// A decoded proxy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEntry {
    pub kind: ProxyKind,
    pub server: String,
    pub port: u16,
    /// Type-specific fields (`password`, `cipher`, `id`, `alterId`, `sni`, ...)
    pub credentials: BTreeMap<String, String>,
    pub name: Option<String>,
    /// Link form of the proxy, as published or as rendered from a record
    pub raw_form: String,
}

impl ProxyEntry {
    pub fn credential(&self, field: &str) -> &str {
        self.credentials.get(field).map(String::as_str).unwrap_or("")
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            kind: self.kind,
            server: self.server.to_lowercase(),
            port: self.port,
            identity: self
                .kind
                .identity_fields()
                .iter()
                .map(|field| self.credential(field).to_string())
                .collect(),
        }
    }
}

impl fmt::Display for ProxyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw_form)
    }
}

/// Record of a structured proxy document (`proxies:` list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    pub port: serde_yaml::Value,
    #[serde(default)]
    pub name: Option<String>,
    /// Every other field, kept verbatim
    #[serde(flatten)]
    pub fields: BTreeMap<String, serde_yaml::Value>,
}

impl ProxyRecord {
    /// Scalar field rendered as a string; `None` for absent or non-scalar values
    pub fn field(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(scalar_to_string)
    }
}

pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A proxy as harvested, before identity fields are extracted
#[derive(Debug, Clone, PartialEq)]
pub enum RawProxy {
    /// A `scheme://...` link from a subscription feed
    Link(String),
    /// A record from a structured proxy document
    Record(ProxyRecord),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_key_omits_default_port() {
        let host = CandidateHost::new(Scheme::Https, "A.Example", 443);
        assert_eq!(host.host, "a.example");
        assert_eq!(host.key(), "https://a.example");
        assert_eq!(host.base_url(), "https://a.example/");

        let host = CandidateHost::new(Scheme::Http, "a.example", 8080);
        assert_eq!(host.key(), "http://a.example:8080");
    }

    #[test]
    fn test_candidate_url_for() {
        let host = CandidateHost::new(Scheme::Http, "a.example", 8080);
        assert_eq!(host.url_for("/vmess/sub"), "http://a.example:8080/vmess/sub");
        assert_eq!(host.url_for("clash/proxies"), "http://a.example:8080/clash/proxies");
    }

    #[test]
    fn test_connect_host_strips_ipv6_brackets() {
        let host = CandidateHost::new(Scheme::Http, "[::1]", 80);
        assert_eq!(host.connect_host(), "::1");
    }

    #[test]
    fn test_proxy_kind_lookup() {
        assert_eq!(ProxyKind::from_name("VMess"), Some(ProxyKind::Vmess));
        assert_eq!(ProxyKind::from_link("trojan://pw@h:1"), Some(ProxyKind::Trojan));
        assert_eq!(ProxyKind::from_link("vless://x"), None);
        assert_eq!(ProxyKind::from_name("http"), None);
    }

    #[test]
    fn test_fingerprint_ignores_name() {
        let mut credentials = BTreeMap::new();
        credentials.insert("id".to_string(), "uuid-1".to_string());
        credentials.insert("alterId".to_string(), "0".to_string());
        let a = ProxyEntry {
            kind: ProxyKind::Vmess,
            server: "Srv.Example".to_string(),
            port: 443,
            credentials: credentials.clone(),
            name: Some("first".to_string()),
            raw_form: "vmess://a".to_string(),
        };
        let b = ProxyEntry {
            name: Some("second".to_string()),
            server: "srv.example".to_string(),
            raw_form: "vmess://b".to_string(),
            ..a.clone()
        };
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().to_string(), r#"vmess|srv.example|443|"uuid-1"|"0""#);
    }

    #[test]
    fn test_fingerprint_separator_inside_fields() {
        let entry = |password: &str, sni: &str| ProxyEntry {
            kind: ProxyKind::Trojan,
            server: "t.example".to_string(),
            port: 443,
            credentials: BTreeMap::from([
                ("password".to_string(), password.to_string()),
                ("sni".to_string(), sni.to_string()),
            ]),
            name: None,
            raw_form: String::new(),
        };
        let a = entry("a|", "b");
        let b = entry("a", "|b");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint().to_string(), b.fingerprint().to_string());
    }

    #[test]
    fn test_record_field_renders_scalars() {
        let record: ProxyRecord =
            serde_yaml::from_str("{type: vmess, server: s, port: 443, uuid: u, alterId: 2, tls: true}")
                .unwrap();
        assert_eq!(record.field("uuid").as_deref(), Some("u"));
        assert_eq!(record.field("alterId").as_deref(), Some("2"));
        assert_eq!(record.field("tls").as_deref(), Some("true"));
        assert_eq!(record.field("missing"), None);
    }
}
