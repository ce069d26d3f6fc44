use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sub_harvest::{
    database::SqliteThrottle,
    logging::init_logging,
    pipeline::{write_outputs, Pipeline, PipelineConfig},
    proxy::{CandidateParser, ReqwestNetwork, SubscriptionEndpoint},
};
use tracing::info;

/// `--database` value selecting a throwaway store
const MEMORY_DATABASE: &str = ":memory:";

/// Finds live proxypool instances and harvests their subscriptions
#[derive(Parser)]
#[command(name = "sub-harvest")]
#[command(about = "Finds live proxypool instances and harvests their subscriptions")]
struct Cli {
    /// Input file with one candidate URL per line
    #[arg(short, long, default_value = "domains.txt")]
    input: PathBuf,

    /// Directory receiving hosts.txt and proxies.txt
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Throttle database file path, or :memory: for a throwaway store
    #[arg(short, long, default_value = "proxy.db")]
    database: PathBuf,

    /// Consecutive failures before a host is silenced
    #[arg(short = 'e', long, default_value = "3")]
    error_threshold: u32,

    /// Days a silenced host is skipped after its last check
    #[arg(short = 'r', long, default_value = "7")]
    refresh_days: i64,

    /// Number of concurrent workers
    #[arg(short = 'n', long, default_value = "20")]
    concurrency: usize,

    /// Network operations per second across all workers
    #[arg(long, default_value = "10")]
    rate: u32,

    /// HTTP timeout in seconds
    #[arg(long, default_value = "10")]
    timeout: u64,

    /// Attempts per network operation
    #[arg(long, default_value = "3")]
    retries: u32,

    /// Keyword every live page must contain (can specify multiple)
    #[arg(long = "keyword")]
    keywords: Vec<String>,

    /// Subscription endpoint as PATH=FORMAT, FORMAT being document or a proxy type
    #[arg(long = "endpoint")]
    endpoints: Vec<SubscriptionEndpoint>,

    /// Skip the TCP pre-check before probing a host
    #[arg(long)]
    no_tcp_check: bool,

    /// Keep proxies without checking their server accepts connections
    #[arg(long)]
    no_reachability: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new()
            .with_concurrency(self.concurrency)
            .with_rate(self.rate)
            .with_request_timeout(Duration::from_secs(self.timeout))
            .with_retry(self.retries.max(1), Duration::from_secs(1))
            .with_throttle(self.error_threshold, chrono::Duration::days(self.refresh_days))
            .with_tcp_check(!self.no_tcp_check)
            .with_reachability(!self.no_reachability);

        if !self.keywords.is_empty() {
            config = config.with_keywords(self.keywords.clone());
        }
        if !self.endpoints.is_empty() {
            config = config.with_endpoints(self.endpoints.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let lines = CandidateParser::read_lines(&cli.input)?;
    info!(lines = lines.len(), input = ?cli.input, "loaded candidates");

    let config = cli.pipeline_config();
    let throttle = if cli.database.as_os_str() == MEMORY_DATABASE {
        SqliteThrottle::in_memory().await?
    } else {
        SqliteThrottle::open(&cli.database)
            .await
            .with_context(|| format!("opening throttle database {:?}", cli.database))?
    };
    let network = ReqwestNetwork::with_config(config.network_config())?;

    let pipeline = Pipeline::new(config, Arc::new(network), Arc::new(throttle.clone()));
    let report = pipeline.run(&lines).await;
    throttle.close().await;

    let (hosts_path, proxies_path) = write_outputs(&cli.output, &report)?;
    info!(
        hosts = report.hosts.len(),
        path = ?hosts_path,
        "saved validated hosts"
    );
    info!(
        proxies = report.proxies.len(),
        path = ?proxies_path,
        "saved proxies"
    );

    let stats = &report.stats;
    println!(
        "Candidates: {} lines, {} valid, {} unique, {} skipped",
        stats.total_lines, stats.valid_lines, stats.unique_candidates, stats.skipped_by_throttle
    );
    println!(
        "Hosts: {} live of {} probed",
        stats.live_hosts, stats.probed
    );
    println!(
        "Proxies: {} harvested, {} unique, {} duplicates, {} evicted",
        stats.raw_proxies, stats.unique_proxies, stats.duplicate_proxies, stats.evicted_proxies
    );

    Ok(())
}
