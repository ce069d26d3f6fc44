//! Sub Harvest - aggregator validation and subscription harvesting
//!
//! Reads a list of candidate URLs, finds the live instances of a proxy
//! aggregator service by content fingerprint, harvests the subscriptions they
//! publish and produces a deduplicated set of reachable proxies.

pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod proxy;

pub use error::{DecodeError, InputError, LinkError};
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport, RunStats};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
