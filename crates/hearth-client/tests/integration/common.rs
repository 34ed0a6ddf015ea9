use std::time::Duration;

use hearth_client::transport::ReqwestTransport;
use hearth_core::fetcher::{FetcherConfig, ResilientFetcher};

/// No pacing, two quick retries.
pub fn fast_config() -> FetcherConfig {
    FetcherConfig::default()
        .with_rate_limit(Duration::ZERO, Duration::ZERO)
        .with_retries(2, Duration::from_millis(10))
        .with_user_agent("hearth-test/1.0")
}

pub fn direct_fetcher() -> ResilientFetcher<ReqwestTransport> {
    let transport = ReqwestTransport::with_timeout(Duration::from_secs(5))
        .expect("Failed to build transport");
    ResilientFetcher::new(transport, fast_config())
}
