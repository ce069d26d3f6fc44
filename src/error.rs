//! Error types for the recoverable failure classes of a harvest run
//!
//! Only [`InputError`] is meant to abort a run. The other variants are
//! absorbed at the smallest scope (per endpoint, per proxy link) and only
//! surface through counters and log records.

use crate::proxy::models::ProxyKind;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to read the candidate list
#[derive(Debug, Error)]
pub enum InputError {
    #[error("cannot read input file {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("input file {0:?} is empty")]
    Empty(PathBuf),
}

/// Failure to decode a subscription payload
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("malformed proxy document: {0}")]
    Document(#[from] serde_yaml::Error),
    #[error("proxy document has no proxies")]
    EmptyDocument,
}

/// Failure to extract identity fields from a proxy link or record
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("unsupported proxy type: {0}")]
    Unsupported(String),
    #[error("invalid {kind} proxy: {reason}")]
    Malformed { kind: ProxyKind, reason: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl LinkError {
    pub(crate) fn malformed(kind: ProxyKind, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }
}
