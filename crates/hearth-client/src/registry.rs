//! Builds concrete sources from a JSON definitions file.
//!
//! ```json
//! { "sources": [
//!     { "kind": "open_data", "name": "nyc_opendata", "url": "...", "country": "...", "city": "..." },
//!     { "kind": "listing_site", "name": "...", "base_url": "...", "search_path": "...", ... }
//! ] }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hearth_core::error::AppError;
use hearth_core::fetcher::{FetcherConfig, ResilientFetcher};
use hearth_core::proxy_pool::ProxyPool;
use hearth_core::source::Source;
use serde::{Deserialize, Serialize};

use crate::geocoding::{CachedGeocoder, HttpGeocoder};
use crate::sources::{ListingSiteConfig, ListingSiteSource, OpenDataConfig, OpenDataSource};
use crate::tor::{TorConfig, TorController};
use crate::transport::{AnyTransport, PooledTransport, ReqwestTransport, Selection};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    OpenData(OpenDataConfig),
    ListingSite(ListingSiteConfig),
}

impl SourceSpec {
    pub fn name(&self) -> &str {
        match self {
            SourceSpec::OpenData(c) => &c.name,
            SourceSpec::ListingSite(c) => &c.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    sources: Vec<SourceSpec>,
}

pub fn parse_sources(json: &str) -> Result<Vec<SourceSpec>, AppError> {
    let file: SourcesFile = serde_json::from_str(json)
        .map_err(|e| AppError::ConfigError(format!("invalid sources file: {e}")))?;
    Ok(file.sources)
}

pub fn load_sources(path: &Path) -> Result<Vec<SourceSpec>, AppError> {
    let json = std::fs::read_to_string(path)
        .map_err(|e| AppError::ConfigError(format!("cannot read {}: {e}", path.display())))?;
    parse_sources(&json)
}

/// Where a source's requests go out.
#[derive(Debug, Clone)]
pub enum Routing {
    Direct,
    /// Tor's SOCKS port, with circuit rotation through the control port.
    Tor {
        socks_host: String,
        socks_port: u16,
        control: TorConfig,
    },
    Proxies { pool: ProxyPool, selection: Selection },
}

/// The fetcher every built-in source uses.
pub type SourceFetcher = ResilientFetcher<AnyTransport, TorController>;

/// Hands each source its own fetcher, so pacing and rotation counters are
/// per source.
#[derive(Debug, Clone)]
pub struct FetcherFactory {
    routing: Routing,
    config: FetcherConfig,
    timeout: Duration,
}

impl FetcherFactory {
    pub fn new(routing: Routing, config: FetcherConfig, timeout: Duration) -> Self {
        Self {
            routing,
            config,
            timeout,
        }
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    pub fn build(&self) -> Result<SourceFetcher, AppError> {
        let (transport, circuit) = match &self.routing {
            Routing::Direct => (
                AnyTransport::Direct(ReqwestTransport::with_timeout(self.timeout)?),
                None,
            ),
            Routing::Tor {
                socks_host,
                socks_port,
                control,
            } => (
                AnyTransport::Direct(ReqwestTransport::via_tor(
                    socks_host,
                    *socks_port,
                    self.timeout,
                )?),
                Some(TorController::new(control.clone())),
            ),
            Routing::Proxies { pool, selection } => (
                AnyTransport::Pooled(
                    PooledTransport::new(pool.clone(), self.timeout).with_selection(*selection),
                ),
                None,
            ),
        };
        Ok(ResilientFetcher::from_parts(
            transport,
            circuit,
            self.config.clone(),
        ))
    }
}

/// Instantiate every spec. Source names must be unique since they key the
/// stored records.
pub fn build_sources(
    specs: &[SourceSpec],
    factory: &FetcherFactory,
    geocoder: Option<&CachedGeocoder<HttpGeocoder>>,
) -> Result<Vec<Arc<dyn Source>>, AppError> {
    let mut seen = HashSet::new();
    let mut sources: Vec<Arc<dyn Source>> = Vec::with_capacity(specs.len());

    for spec in specs {
        if !seen.insert(spec.name().to_string()) {
            return Err(AppError::ConfigError(format!(
                "duplicate source name: {}",
                spec.name()
            )));
        }

        let fetcher = factory.build()?;
        let source: Arc<dyn Source> = match spec {
            SourceSpec::OpenData(config) => {
                let source = OpenDataSource::new(config.clone(), fetcher);
                match geocoder {
                    Some(geocoder) => Arc::new(source.with_geocoder(geocoder.clone())),
                    None => Arc::new(source),
                }
            }
            SourceSpec::ListingSite(config) => {
                Arc::new(ListingSiteSource::new(config.clone(), fetcher)?)
            }
        };
        tracing::debug!(source = %spec.name(), "Source registered");
        sources.push(source);
    }

    Ok(sources)
}
