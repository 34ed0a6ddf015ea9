//! reqwest-backed [`HttpTransport`]s: direct, through one proxy (e.g. Tor's
//! SOCKS port), or through a health-tracked [`ProxyPool`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hearth_core::error::AppError;
use hearth_core::proxy_pool::{ProxyEndpoint, ProxyPool};
use hearth_core::traits::{HttpTransport, TransportResponse};
use reqwest::{Client, Proxy};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client, optionally routed through `proxy_url`
/// (`http://`, `https://`, `socks5://` or `socks5h://`).
pub fn build_client(proxy_url: Option<&str>, timeout: Duration) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(30));

    builder = match proxy_url {
        Some(proxy_url) => {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| AppError::InvalidProxy(format!("{proxy_url}: {e}")))?;
            builder.proxy(proxy)
        }
        // Direct means direct: ignore HTTP_PROXY and friends.
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| AppError::HttpError(e.to_string()))
}

/// One GET with the given headers. Any status is a successful exchange.
pub async fn send(
    client: &Client,
    url: &str,
    headers: &[(&'static str, String)],
    timeout_secs: u64,
) -> Result<TransportResponse, AppError> {
    let mut request = client.get(url);
    for (name, value) in headers {
        request = request.header(*name, value.as_str());
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify(e, timeout_secs))?;
    let status = response.status().as_u16();

    let body = response.text().await.map_err(|e| {
        if e.is_timeout() {
            AppError::Timeout(timeout_secs)
        } else {
            AppError::NetworkError(format!("Failed to read response body: {e}"))
        }
    })?;

    Ok(TransportResponse { status, body })
}

fn classify(e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_builder() {
        AppError::HttpError(e.to_string())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::NetworkError(e.to_string())
    }
}

/// Plain reqwest transport.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(None, timeout)?,
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Route every request through one proxy.
    pub fn via_proxy(proxy_url: &str, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(Some(proxy_url), timeout)?,
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Route through Tor's SOCKS port. Host names are resolved by Tor.
    pub fn via_tor(host: &str, socks_port: u16, timeout: Duration) -> Result<Self, AppError> {
        Self::via_proxy(&format!("socks5h://{host}:{socks_port}"), timeout)
    }
}

impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<TransportResponse, AppError> {
        send(&self.client, url, headers, self.timeout_secs).await
    }
}

/// How [`PooledTransport`] picks an endpoint per request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    RoundRobin,
    Random,
}

/// Sends each request through an endpoint of a [`ProxyPool`] and feeds the
/// outcome back into the pool's health tracking.
#[derive(Clone)]
pub struct PooledTransport {
    pool: ProxyPool,
    selection: Selection,
    timeout: Duration,
    clients: Arc<Mutex<HashMap<u64, Client>>>,
}

impl PooledTransport {
    pub fn new(pool: ProxyPool, timeout: Duration) -> Self {
        Self {
            pool,
            selection: Selection::default(),
            timeout,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    /// Reuse one client per endpoint so connections stay pooled.
    fn client_for(&self, endpoint: &ProxyEndpoint) -> Result<Client, AppError> {
        let mut clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = clients.get(&endpoint.id) {
            return Ok(client.clone());
        }
        let client = build_client(Some(&endpoint.address), self.timeout)?;
        clients.insert(endpoint.id, client.clone());
        Ok(client)
    }
}

impl HttpTransport for PooledTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<TransportResponse, AppError> {
        let endpoint = match self.selection {
            Selection::RoundRobin => self.pool.next()?,
            Selection::Random => self.pool.random()?,
        };

        let client = match self.client_for(&endpoint) {
            Ok(client) => client,
            Err(e) => {
                self.pool.mark_failed(endpoint.id);
                return Err(e);
            }
        };

        match send(&client, url, headers, self.timeout.as_secs()).await {
            // The proxy itself refused us; another endpoint may not.
            Ok(response) if response.status == 407 => {
                self.pool.mark_failed(endpoint.id);
                Err(AppError::NetworkError(format!(
                    "proxy {} requires authentication (407)",
                    endpoint.address
                )))
            }
            Ok(response) => {
                self.pool.mark_working(endpoint.id);
                Ok(response)
            }
            Err(e) => {
                tracing::debug!(proxy = %endpoint.address, error = %e, "Proxy request failed");
                self.pool.mark_failed(endpoint.id);
                Err(e)
            }
        }
    }
}

/// Either transport behind one type, so sources can be built uniformly.
#[derive(Clone)]
pub enum AnyTransport {
    Direct(ReqwestTransport),
    Pooled(PooledTransport),
}

impl HttpTransport for AnyTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<TransportResponse, AppError> {
        match self {
            AnyTransport::Direct(t) => t.get(url, headers).await,
            AnyTransport::Pooled(t) => t.get(url, headers).await,
        }
    }
}
