//! Validation-and-harvest pipeline stages
//!
//! This module provides functionality for:
//! - Normalizing candidate URLs into unique hosts
//! - Probing candidates for live aggregator instances under a revisit throttle
//! - Harvesting subscription feeds from validated hosts
//! - Deduplicating harvested proxies and pruning unreachable ones

pub mod checker;
pub mod crawler;
pub mod dedup;
pub mod limiter;
pub mod links;
pub mod models;
pub mod net;
pub mod parser;
pub mod progress;
pub mod throttle;

pub use checker::{LivenessProber, NotLiveReason, ProbeConfig, ProbeOutcome, ProbeReport};
pub use crawler::{
    DecodedPayload, EndpointFormat, HarvestConfig, HarvestReport, SubscriptionEndpoint,
    SubscriptionHarvester,
};
pub use dedup::{DedupConfig, DedupReport, ProxyDeduplicator, UniqueProxies};
pub use limiter::{retry, Backoff, RequestLimiter, RetryPolicy};
pub use models::{
    CandidateHost, Fingerprint, ProxyEntry, ProxyKind, ProxyRecord, RawProxy, Scheme,
    ValidatedHost, ValidationRecord,
};
pub use net::{HttpBody, Network, NetworkConfig, ReqwestNetwork};
pub use parser::{CandidateParser, NormalizedCandidates};
pub use progress::{ProgressReporter, StageCounters};
pub use throttle::{MemoryThrottle, ThrottlePolicy, ThrottleStore};
