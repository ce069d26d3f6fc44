//! Process-wide tracing subscriber

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber; `RUST_LOG` takes precedence over `level`
pub fn init_logging(level: &str) {
    let default = format!("{level},sub_harvest={level},sqlx=warn,reqwest=warn,hyper=warn");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second call (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init();
}
