//! Health check for the endpoints of a [`ProxyPool`].

use std::time::Duration;

use hearth_core::proxy_pool::{ProxyEndpoint, ProxyPool};
use serde::Serialize;
use tokio::task::JoinSet;

use crate::transport::{build_client, send};

#[derive(Debug, Clone)]
pub struct ProxyCheckConfig {
    /// URL every endpoint must fetch with a 200.
    pub test_url: String,
    pub timeout: Duration,
    /// Tries per endpoint before it is given up on.
    pub attempts: u32,
}

impl Default for ProxyCheckConfig {
    fn default() -> Self {
        Self {
            test_url: "https://httpbin.org/ip".to_string(),
            timeout: Duration::from_secs(10),
            attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyCheckSummary {
    pub checked: usize,
    pub working: usize,
}

/// Probe every endpoint concurrently and record the result in the pool.
///
/// Each failed try counts as one failure, so an endpoint that never answers
/// is marked failed `attempts` times. The first 200 marks it working.
pub async fn check_proxies(pool: &ProxyPool, config: &ProxyCheckConfig) -> ProxyCheckSummary {
    let endpoints = pool.endpoints();
    let mut tasks = JoinSet::new();

    for endpoint in endpoints.iter().cloned() {
        let pool = pool.clone();
        let config = config.clone();
        tasks.spawn(async move { check_endpoint(&pool, &endpoint, &config).await });
    }

    let mut summary = ProxyCheckSummary {
        checked: endpoints.len(),
        working: 0,
    };
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(true) => summary.working += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Proxy check task panicked"),
        }
    }

    tracing::info!(
        checked = summary.checked,
        working = summary.working,
        "Proxy check complete"
    );
    summary
}

async fn check_endpoint(
    pool: &ProxyPool,
    endpoint: &ProxyEndpoint,
    config: &ProxyCheckConfig,
) -> bool {
    let client = match build_client(Some(&endpoint.address), config.timeout) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(proxy = %endpoint.address, error = %e, "Unusable proxy address");
            for _ in 0..config.attempts.max(1) {
                pool.mark_failed(endpoint.id);
            }
            return false;
        }
    };

    for attempt in 1..=config.attempts.max(1) {
        match send(&client, &config.test_url, &[], config.timeout.as_secs()).await {
            Ok(response) if response.status == 200 => {
                pool.mark_working(endpoint.id);
                tracing::debug!(proxy = %endpoint.address, attempt, "Proxy is working");
                return true;
            }
            Ok(response) => {
                tracing::debug!(proxy = %endpoint.address, attempt, status = response.status, "Proxy check failed");
            }
            Err(e) => {
                tracing::debug!(proxy = %endpoint.address, attempt, error = %e, "Proxy check failed");
            }
        }
        pool.mark_failed(endpoint.id);
    }
    false
}

#[cfg(test)]
mod tests {
    use hearth_core::proxy_pool::ProxyProtocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// HTTP proxy that answers every request with 200.
    async fn healthy_proxy() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0_u8; 2048];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                });
            }
        });
        addr.to_string()
    }

    fn dead_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn config() -> ProxyCheckConfig {
        ProxyCheckConfig {
            test_url: "http://check.example.com/ip".to_string(),
            timeout: Duration::from_secs(2),
            attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_check_marks_dead_and_live_endpoints() {
        let pool = ProxyPool::default();
        pool.add(&healthy_proxy().await, ProxyProtocol::Http).unwrap();
        pool.add(&dead_address(), ProxyProtocol::Http).unwrap();

        let summary = check_proxies(&pool, &config()).await;

        assert_eq!(
            summary,
            ProxyCheckSummary {
                checked: 2,
                working: 1
            }
        );
        assert_eq!(pool.working_count(), 1);

        let endpoints = pool.endpoints();
        assert!(endpoints[0].is_working);
        assert_eq!(endpoints[0].consecutive_failures, 0);
        assert!(!endpoints[1].is_working);
        assert_eq!(endpoints[1].consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_check_then_prune_leaves_live_endpoints() {
        let pool = ProxyPool::default();
        pool.add(&dead_address(), ProxyProtocol::Http).unwrap();
        pool.add(&healthy_proxy().await, ProxyProtocol::Http).unwrap();

        check_proxies(&pool, &config()).await;
        assert_eq!(pool.remove_failed(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_pool_checks_nothing() {
        let summary = check_proxies(&ProxyPool::default(), &config()).await;
        assert_eq!(summary, ProxyCheckSummary::default());
    }
}
