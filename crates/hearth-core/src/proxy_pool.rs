//! Pool of egress endpoints with health tracking.
//!
//! Endpoints are owned by the pool; callers receive [`ProxyEndpoint`]
//! snapshots and report back through [`ProxyPool::mark_failed`] and
//! [`ProxyPool::mark_working`] by id.
//!
//! ```text
//! working --[max_failures consecutive mark_failed]--> dead --[mark_working]--> working
//!                                                       |
//!                                                       +--[remove_failed]--> dropped
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Wire protocol spoken to an egress endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyProtocol {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(ProxyProtocol::Http),
            "https" => Ok(ProxyProtocol::Https),
            "socks5" | "socks5h" => Ok(ProxyProtocol::Socks5),
            other => Err(AppError::InvalidProxy(format!(
                "unsupported protocol '{other}'"
            ))),
        }
    }
}

/// Snapshot of one egress path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyEndpoint {
    /// Pool-assigned handle, stable for the endpoint's lifetime.
    pub id: u64,
    /// Full proxy URL, e.g. `socks5://127.0.0.1:9050`.
    pub address: String,
    pub protocol: ProxyProtocol,
    pub is_working: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive failures after which an endpoint is taken out of rotation.
    pub max_failures: u32,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self { max_failures: 3 }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    endpoints: Vec<ProxyEndpoint>,
    /// Index of the endpoint handed out last by `next`.
    cursor: Option<usize>,
    next_id: u64,
}

impl PoolInner {
    fn get_mut(&mut self, id: u64) -> Option<&mut ProxyEndpoint> {
        self.endpoints.iter_mut().find(|e| e.id == id)
    }
}

/// Thread-safe endpoint pool. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    config: ProxyPoolConfig,
    inner: Arc<RwLock<PoolInner>>,
}

impl ProxyPool {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(PoolInner::default())),
        }
    }

    /// Acquires the read lock, recovering from poison if necessary.
    fn read(&self) -> RwLockReadGuard<'_, PoolInner> {
        self.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool lock");
            poisoned.into_inner()
        })
    }

    /// Acquires the write lock, recovering from poison if necessary.
    fn write(&self) -> RwLockWriteGuard<'_, PoolInner> {
        self.inner.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy pool lock");
            poisoned.into_inner()
        })
    }

    /// Add an endpoint. `address` may omit the scheme, in which case
    /// `protocol` supplies it; an explicit scheme decides the protocol.
    ///
    /// Malformed addresses are rejected without touching the pool.
    pub fn add(&self, address: &str, protocol: ProxyProtocol) -> Result<u64, AppError> {
        let (address, protocol) = normalize_address(address, protocol)?;

        let mut inner = self.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.endpoints.push(ProxyEndpoint {
            id,
            address,
            protocol,
            is_working: true,
            consecutive_failures: 0,
            last_checked: None,
            last_used: None,
        });
        Ok(id)
    }

    /// Add every non-blank, non-comment line. Returns how many were added;
    /// malformed lines are logged and skipped.
    pub fn add_from_list(&self, list: &str, protocol: ProxyProtocol) -> usize {
        let mut added = 0;
        for line in list.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match self.add(line, protocol) {
                Ok(_) => added += 1,
                Err(e) => tracing::warn!(proxy = %line, error = %e, "Skipping proxy"),
            }
        }
        added
    }

    /// Next working endpoint after the cursor, scanning at most once around
    /// the pool.
    pub fn next(&self) -> Result<ProxyEndpoint, AppError> {
        let mut inner = self.write();
        let len = inner.endpoints.len();
        if len == 0 {
            return Err(AppError::NoProxies);
        }

        let start = inner.cursor.map_or(0, |c| (c + 1) % len);
        for offset in 0..len {
            let idx = (start + offset) % len;
            if inner.endpoints[idx].is_working {
                inner.cursor = Some(idx);
                let endpoint = &mut inner.endpoints[idx];
                endpoint.last_used = Some(Utc::now());
                return Ok(endpoint.clone());
            }
        }

        Err(AppError::NoWorkingProxies)
    }

    /// Uniformly random working endpoint.
    pub fn random(&self) -> Result<ProxyEndpoint, AppError> {
        let mut inner = self.write();
        if inner.endpoints.is_empty() {
            return Err(AppError::NoProxies);
        }

        let working: Vec<usize> = inner
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_working)
            .map(|(i, _)| i)
            .collect();

        let Some(&idx) = working.choose(&mut rand::rng()) else {
            return Err(AppError::NoWorkingProxies);
        };

        let endpoint = &mut inner.endpoints[idx];
        endpoint.last_used = Some(Utc::now());
        Ok(endpoint.clone())
    }

    /// Count a failure. Returns `false` when the id is unknown.
    pub fn mark_failed(&self, id: u64) -> bool {
        let max_failures = self.config.max_failures;
        let mut inner = self.write();
        let Some(endpoint) = inner.get_mut(id) else {
            return false;
        };

        endpoint.consecutive_failures += 1;
        endpoint.last_checked = Some(Utc::now());
        if endpoint.is_working && endpoint.consecutive_failures >= max_failures {
            endpoint.is_working = false;
            tracing::warn!(
                proxy = %endpoint.address,
                failures = endpoint.consecutive_failures,
                "Proxy disabled"
            );
        }
        true
    }

    /// Reset the failure count and return the endpoint to rotation.
    pub fn mark_working(&self, id: u64) -> bool {
        let mut inner = self.write();
        let Some(endpoint) = inner.get_mut(id) else {
            return false;
        };

        endpoint.consecutive_failures = 0;
        endpoint.is_working = true;
        endpoint.last_checked = Some(Utc::now());
        true
    }

    pub fn working_count(&self) -> usize {
        self.read().endpoints.iter().filter(|e| e.is_working).count()
    }

    pub fn len(&self) -> usize {
        self.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().endpoints.is_empty()
    }

    /// Drop every dead endpoint. Returns how many were removed.
    pub fn remove_failed(&self) -> usize {
        let mut inner = self.write();
        let before = inner.endpoints.len();
        inner.endpoints.retain(|e| e.is_working);
        let removed = before - inner.endpoints.len();
        // Indices shifted; restart the round-robin.
        if removed > 0 {
            inner.cursor = None;
        }
        removed
    }

    /// Consistent copy of every endpoint.
    pub fn endpoints(&self) -> Vec<ProxyEndpoint> {
        self.read().endpoints.clone()
    }
}

/// Prefix a bare `host:port` with the protocol scheme and check that the
/// result has a supported scheme and a host.
fn normalize_address(
    address: &str,
    protocol: ProxyProtocol,
) -> Result<(String, ProxyProtocol), AppError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidProxy("empty address".into()));
    }

    let full = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{trimmed}", protocol.as_str())
    };

    let parsed = url::Url::parse(&full)
        .map_err(|e| AppError::InvalidProxy(format!("{trimmed}: {e}")))?;
    let protocol = parsed.scheme().parse::<ProxyProtocol>()?;
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok((full, protocol)),
        _ => Err(AppError::InvalidProxy(format!("{trimmed}: missing host"))),
    }
}
