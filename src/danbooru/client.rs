use std::time::Duration;

use reqwest::Client;
use tracing::info;

use crate::danbooru::config::Http;

/// Builds the HTTP client shared by the resolver, fetcher and downloader.
///
/// Every request carries the configured user agent. The timeout bounds each
/// read, not the whole transfer.
pub fn build_client(config: &Http) -> reqwest::Result<Client> {
    let client = Client::builder()
        .user_agent(&config.user_agent)
        .read_timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(Duration::from_secs(90))
        .gzip(true)
        .tcp_nodelay(true)
        .build()?;

    info!(
        "Initialized HTTP client: {}s read timeout, {} max idle per host",
        config.timeout_secs, config.pool_max_idle_per_host
    );
    Ok(client)
}

/// Exponential backoff used between retry attempts, capped at one minute.
pub fn calculate_backoff(attempt: usize, base_delay_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as u32;
    let max_delay = 60_000;

    let delay = (1u64 << exponent).saturating_mul(base_delay_ms);
    Duration::from_millis(delay.min(max_delay))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(calculate_backoff(1, 100), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, 100), Duration::from_millis(200));
        assert_eq!(calculate_backoff(4, 100), Duration::from_millis(800));
        assert_eq!(calculate_backoff(30, 1000), Duration::from_secs(60));
    }

    #[test]
    fn test_client_builds_from_defaults() {
        assert!(build_client(&Http::default()).is_ok());
    }
}
