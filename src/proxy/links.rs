//! Proxy link codec
//!
//! Extracts identity fields from `ss://`, `ssr://`, `vmess://` and `trojan://`
//! links, converts structured document records into the same shape and
//! renders records back into links for output.

use crate::error::{DecodeError, LinkError};
use crate::proxy::models::{scalar_to_string, ProxyEntry, ProxyKind, ProxyRecord, RawProxy};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use url::Url;

/// Decode base64 in any of the standard or URL-safe alphabets, padded or not
pub fn decode_base64(input: &str) -> Result<Vec<u8>, DecodeError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = compact.trim_end_matches('=');
    let bytes = if trimmed.contains(['-', '_']) {
        URL_SAFE_NO_PAD.decode(trimmed)?
    } else {
        STANDARD_NO_PAD.decode(trimmed)?
    };
    Ok(bytes)
}

/// Decode base64 into a UTF-8 string
pub fn decode_base64_text(input: &str) -> Result<String, DecodeError> {
    Ok(String::from_utf8(decode_base64(input)?)?)
}

fn encode_url_safe(input: &str) -> String {
    URL_SAFE_NO_PAD.encode(input.as_bytes())
}

fn unescape(input: &str) -> String {
    percent_decode_str(input).decode_utf8_lossy().into_owned()
}

fn escape(input: &str) -> String {
    utf8_percent_encode(input, NON_ALPHANUMERIC).to_string()
}

/// Split `host:port`, accepting bracketed IPv6 hosts
fn split_host_port(kind: ProxyKind, input: &str) -> Result<(String, u16), LinkError> {
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| LinkError::malformed(kind, "missing port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(LinkError::malformed(kind, "missing server"));
    }
    let port = parse_port(kind, port)?;
    Ok((host.to_string(), port))
}

fn parse_port(kind: ProxyKind, input: &str) -> Result<u16, LinkError> {
    match input.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(LinkError::malformed(kind, format!("invalid port {input:?}"))),
    }
}

fn insert_non_empty(map: &mut BTreeMap<String, String>, key: &str, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        map.insert(key.to_string(), value);
    }
}

fn require(kind: ProxyKind, map: &BTreeMap<String, String>, field: &str) -> Result<(), LinkError> {
    if map.contains_key(field) {
        Ok(())
    } else {
        Err(LinkError::malformed(kind, format!("missing {field}")))
    }
}

/// Decode a harvested proxy into a [`ProxyEntry`]
pub fn decode_raw(raw: &RawProxy) -> Result<ProxyEntry, LinkError> {
    match raw {
        RawProxy::Link(link) => parse_link(link),
        RawProxy::Record(record) => from_record(record),
    }
}

/// Parse a proxy link
pub fn parse_link(link: &str) -> Result<ProxyEntry, LinkError> {
    let link = link.trim();
    let kind = ProxyKind::from_link(link).ok_or_else(|| {
        let scheme = link.split_once("://").map_or(link, |(s, _)| s);
        LinkError::Unsupported(scheme.to_string())
    })?;
    let body = &link[kind.prefix().len()..];

    let mut entry = match kind {
        ProxyKind::Vmess => parse_vmess(body)?,
        ProxyKind::Trojan => parse_trojan(link)?,
        ProxyKind::Ss => parse_ss(body)?,
        ProxyKind::Ssr => parse_ssr(body)?,
    };
    entry.raw_form = link.to_string();
    Ok(entry)
}

fn json_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_vmess(body: &str) -> Result<ProxyEntry, LinkError> {
    let kind = ProxyKind::Vmess;
    let text = decode_base64_text(body)?;
    let doc: Value = serde_json::from_str(&text)
        .map_err(|e| LinkError::malformed(kind, format!("invalid json: {e}")))?;

    let server = json_string(doc.get("add"))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LinkError::malformed(kind, "missing server"))?;
    let port = json_string(doc.get("port"))
        .ok_or_else(|| LinkError::malformed(kind, "missing port"))
        .and_then(|p| parse_port(kind, &p))?;

    let mut credentials = BTreeMap::new();
    insert_non_empty(&mut credentials, "id", json_string(doc.get("id")));
    credentials.insert(
        "alterId".to_string(),
        json_string(doc.get("aid")).filter(|a| !a.is_empty()).unwrap_or_else(|| "0".to_string()),
    );
    for field in ["net", "tls", "sni", "host", "path"] {
        insert_non_empty(&mut credentials, field, json_string(doc.get(field)));
    }
    require(kind, &credentials, "id")?;

    Ok(ProxyEntry {
        kind,
        server,
        port,
        credentials,
        name: json_string(doc.get("ps")).filter(|n| !n.is_empty()),
        raw_form: String::new(),
    })
}

fn parse_trojan(link: &str) -> Result<ProxyEntry, LinkError> {
    let kind = ProxyKind::Trojan;
    let url = Url::parse(link).map_err(|e| LinkError::malformed(kind, e.to_string()))?;
    let server = url
        .host_str()
        .filter(|h| !h.is_empty())
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .ok_or_else(|| LinkError::malformed(kind, "missing server"))?;
    let port = url
        .port()
        .ok_or_else(|| LinkError::malformed(kind, "missing port"))?;

    let mut credentials = BTreeMap::new();
    insert_non_empty(&mut credentials, "password", Some(unescape(url.username())));
    require(kind, &credentials, "password")?;
    let sni = url
        .query_pairs()
        .find(|(k, _)| k == "sni" || k == "peer")
        .map(|(_, v)| v.into_owned());
    insert_non_empty(&mut credentials, "sni", sni);

    Ok(ProxyEntry {
        kind,
        server,
        port,
        credentials,
        name: url.fragment().map(unescape).filter(|n| !n.is_empty()),
        raw_form: String::new(),
    })
}

fn parse_ss(body: &str) -> Result<ProxyEntry, LinkError> {
    let kind = ProxyKind::Ss;
    let (body, name) = match body.split_once('#') {
        Some((b, n)) => (b, Some(unescape(n)).filter(|n| !n.is_empty())),
        None => (body, None),
    };

    // SIP002 puts only the user info in base64; the legacy form encodes everything
    let decoded;
    let (user_info, host_port) = match body.rsplit_once('@') {
        Some((user, rest)) => {
            let user = unescape(user);
            decoded = if user.contains(':') {
                user
            } else {
                decode_base64_text(&user)?
            };
            let host_port = rest.split(['/', '?']).next().unwrap_or_default();
            (decoded.as_str(), host_port)
        }
        None => {
            let encoded = body.split('?').next().unwrap_or_default();
            decoded = decode_base64_text(encoded)?;
            decoded
                .rsplit_once('@')
                .ok_or_else(|| LinkError::malformed(kind, "missing server"))?
        }
    };

    let (cipher, password) = user_info
        .split_once(':')
        .ok_or_else(|| LinkError::malformed(kind, "missing cipher"))?;
    let (server, port) = split_host_port(kind, host_port)?;

    let mut credentials = BTreeMap::new();
    insert_non_empty(&mut credentials, "cipher", Some(cipher.to_string()));
    insert_non_empty(&mut credentials, "password", Some(password.to_string()));
    require(kind, &credentials, "cipher")?;

    Ok(ProxyEntry {
        kind,
        server,
        port,
        credentials,
        name,
        raw_form: String::new(),
    })
}

fn parse_ssr(body: &str) -> Result<ProxyEntry, LinkError> {
    let kind = ProxyKind::Ssr;
    let text = decode_base64_text(body)?;
    let (main, query) = match text.split_once("/?").or_else(|| text.split_once('?')) {
        Some((m, q)) => (m, q),
        None => (text.as_str(), ""),
    };

    // server:port:protocol:method:obfs:base64(password), server may hold colons
    let mut parts = main.rsplitn(6, ':');
    let mut next = |what: &str| {
        parts
            .next()
            .ok_or_else(|| LinkError::malformed(kind, format!("missing {what}")))
    };
    let password = decode_base64_text(next("password")?)?;
    let obfs = next("obfs")?.to_string();
    let cipher = next("cipher")?.to_string();
    let protocol = next("protocol")?.to_string();
    let port = parse_port(kind, next("port")?)?;
    let server = next("server")?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    if server.is_empty() {
        return Err(LinkError::malformed(kind, "missing server"));
    }

    let mut credentials = BTreeMap::new();
    credentials.insert("password".to_string(), password);
    credentials.insert("cipher".to_string(), cipher);
    credentials.insert("protocol".to_string(), protocol);
    credentials.insert("obfs".to_string(), obfs);

    let mut name = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = decode_base64_text(&value).unwrap_or_default();
        match key.as_ref() {
            "remarks" => name = Some(value).filter(|v| !v.is_empty()),
            "obfsparam" => insert_non_empty(&mut credentials, "obfsparam", Some(value)),
            "protoparam" => insert_non_empty(&mut credentials, "protoparam", Some(value)),
            _ => {}
        }
    }

    Ok(ProxyEntry {
        kind,
        server,
        port,
        credentials,
        name,
        raw_form: String::new(),
    })
}

/// Convert a structured document record and render its link form
pub fn from_record(record: &ProxyRecord) -> Result<ProxyEntry, LinkError> {
    let kind = ProxyKind::from_name(&record.kind)
        .ok_or_else(|| LinkError::Unsupported(record.kind.clone()))?;
    let server = record.server.trim().to_string();
    if server.is_empty() {
        return Err(LinkError::malformed(kind, "missing server"));
    }
    let port = scalar_to_string(&record.port)
        .ok_or_else(|| LinkError::malformed(kind, "missing port"))
        .and_then(|p| parse_port(kind, &p))?;

    let mut credentials = BTreeMap::new();
    match kind {
        ProxyKind::Ss => {
            insert_non_empty(&mut credentials, "cipher", record.field("cipher"));
            insert_non_empty(&mut credentials, "password", record.field("password"));
            require(kind, &credentials, "cipher")?;
        }
        ProxyKind::Ssr => {
            for field in ["cipher", "password", "protocol", "obfs"] {
                insert_non_empty(&mut credentials, field, record.field(field));
                require(kind, &credentials, field)?;
            }
            insert_non_empty(&mut credentials, "obfsparam", record.field("obfs-param"));
            insert_non_empty(&mut credentials, "protoparam", record.field("protocol-param"));
        }
        ProxyKind::Vmess => {
            insert_non_empty(&mut credentials, "id", record.field("uuid"));
            require(kind, &credentials, "id")?;
            credentials.insert(
                "alterId".to_string(),
                record.field("alterId").unwrap_or_else(|| "0".to_string()),
            );
            insert_non_empty(&mut credentials, "net", record.field("network"));
            if record.field("tls").as_deref() == Some("true") {
                credentials.insert("tls".to_string(), "tls".to_string());
            }
            insert_non_empty(
                &mut credentials,
                "sni",
                record.field("servername").or_else(|| record.field("sni")),
            );
        }
        ProxyKind::Trojan => {
            insert_non_empty(&mut credentials, "password", record.field("password"));
            require(kind, &credentials, "password")?;
            insert_non_empty(&mut credentials, "sni", record.field("sni"));
        }
    }

    let mut entry = ProxyEntry {
        kind,
        server,
        port,
        credentials,
        name: record.name.clone().filter(|n| !n.is_empty()),
        raw_form: String::new(),
    };
    entry.raw_form = render_link(&entry);
    Ok(entry)
}

/// Render the link form of an entry
pub fn render_link(entry: &ProxyEntry) -> String {
    let name = entry.name.as_deref().unwrap_or_default();
    match entry.kind {
        ProxyKind::Vmess => {
            let net = match entry.credential("net") {
                "" => "tcp",
                net => net,
            };
            let doc = json!({
                "v": "2",
                "ps": name,
                "add": entry.server,
                "port": entry.port.to_string(),
                "id": entry.credential("id"),
                "aid": entry.credential("alterId"),
                "net": net,
                "type": "none",
                "host": entry.credential("host"),
                "path": entry.credential("path"),
                "tls": entry.credential("tls"),
                "sni": entry.credential("sni"),
            });
            format!("vmess://{}", base64::engine::general_purpose::STANDARD.encode(doc.to_string()))
        }
        ProxyKind::Trojan => {
            let mut link = format!(
                "trojan://{}@{}:{}",
                escape(entry.credential("password")),
                bracket_ipv6(&entry.server),
                entry.port
            );
            if !entry.credential("sni").is_empty() {
                link.push_str(&format!("?sni={}", escape(entry.credential("sni"))));
            }
            if !name.is_empty() {
                link.push_str(&format!("#{}", escape(name)));
            }
            link
        }
        ProxyKind::Ss => {
            let user_info = format!("{}:{}", entry.credential("cipher"), entry.credential("password"));
            let mut link = format!(
                "ss://{}@{}:{}",
                encode_url_safe(&user_info),
                bracket_ipv6(&entry.server),
                entry.port
            );
            if !name.is_empty() {
                link.push_str(&format!("#{}", escape(name)));
            }
            link
        }
        ProxyKind::Ssr => {
            let mut body = format!(
                "{}:{}:{}:{}:{}:{}/?remarks={}",
                entry.server,
                entry.port,
                entry.credential("protocol"),
                entry.credential("cipher"),
                entry.credential("obfs"),
                encode_url_safe(entry.credential("password")),
                encode_url_safe(name),
            );
            if !entry.credential("obfsparam").is_empty() {
                body.push_str(&format!("&obfsparam={}", encode_url_safe(entry.credential("obfsparam"))));
            }
            if !entry.credential("protoparam").is_empty() {
                body.push_str(&format!("&protoparam={}", encode_url_safe(entry.credential("protoparam"))));
            }
            format!("ssr://{}", encode_url_safe(&body))
        }
    }
}

fn bracket_ipv6(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}
