//! Address geocoding through Nominatim or OpenCage.
//!
//! Sources call a [`Geocoder`] only for records that arrive without
//! coordinates. Nominatim's usage policy allows one request per second, so
//! the HTTP geocoder paces itself; [`CachedGeocoder`] keeps repeated
//! addresses off the network entirely.

use std::sync::Arc;
use std::time::Duration;

use hearth_core::cache::TtlCache;
use hearth_core::error::AppError;
use hearth_core::traits::Geocoder;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

use crate::transport::{build_client, send};

pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
pub const OPENCAGE_URL: &str = "https://api.opencagedata.com";

const USER_AGENT: &str = "hearth/0.1 (real-estate aggregator)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    Nominatim,
    OpenCage { api_key: String },
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub provider: Provider,
    /// Overrides the provider's public endpoint.
    pub base_url: Option<String>,
    /// Minimum spacing between requests.
    pub min_interval: Duration,
    pub timeout: Duration,
}

impl GeocoderConfig {
    /// OpenCage when a key is given, Nominatim otherwise.
    pub fn from_api_key(api_key: Option<String>) -> Self {
        let provider = match api_key.filter(|k| !k.is_empty()) {
            Some(api_key) => Provider::OpenCage { api_key },
            None => Provider::Nominatim,
        };
        Self {
            provider,
            base_url: None,
            min_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }
}

#[derive(Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

#[derive(Deserialize)]
struct OpenCageResponse {
    results: Vec<OpenCageResult>,
}

#[derive(Deserialize)]
struct OpenCageResult {
    geometry: OpenCageGeometry,
}

#[derive(Deserialize)]
struct OpenCageGeometry {
    lat: f64,
    lng: f64,
}

#[derive(Clone)]
pub struct HttpGeocoder {
    client: Client,
    config: Arc<GeocoderConfig>,
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl HttpGeocoder {
    pub fn new(config: GeocoderConfig) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(None, config.timeout)?,
            config: Arc::new(config),
            last_request: Arc::new(Mutex::new(None)),
        })
    }

    fn request_url(&self, address: &str) -> Result<Url, AppError> {
        let (default_base, path) = match &self.config.provider {
            Provider::Nominatim => (NOMINATIM_URL, "/search"),
            Provider::OpenCage { .. } => (OPENCAGE_URL, "/geocode/v1/json"),
        };
        let base = self.config.base_url.as_deref().unwrap_or(default_base);
        let endpoint = format!("{}{path}", base.trim_end_matches('/'));

        let result = match &self.config.provider {
            Provider::Nominatim => Url::parse_with_params(
                &endpoint,
                &[("q", address), ("format", "json"), ("limit", "1")],
            ),
            Provider::OpenCage { api_key } => Url::parse_with_params(
                &endpoint,
                &[("q", address), ("key", api_key.as_str()), ("limit", "1")],
            ),
        };
        result.map_err(|e| AppError::ConfigError(format!("invalid geocoder URL: {e}")))
    }

    /// Wait out the remainder of `min_interval` since the previous request.
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.config.min_interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn parse(&self, address: &str, body: &str) -> Result<(f64, f64), AppError> {
        let not_found = || AppError::ParseError(format!("no geocoding result for {address:?}"));
        match self.config.provider {
            Provider::Nominatim => {
                let places: Vec<NominatimPlace> = serde_json::from_str(body)?;
                let place = places.into_iter().next().ok_or_else(not_found)?;
                let lat = place.lat.parse::<f64>();
                let lon = place.lon.parse::<f64>();
                match (lat, lon) {
                    (Ok(lat), Ok(lon)) => Ok((lat, lon)),
                    _ => Err(AppError::ParseError(format!(
                        "invalid coordinates {:?},{:?}",
                        place.lat, place.lon
                    ))),
                }
            }
            Provider::OpenCage { .. } => {
                let response: OpenCageResponse = serde_json::from_str(body)?;
                let result = response.results.into_iter().next().ok_or_else(not_found)?;
                Ok((result.geometry.lat, result.geometry.lng))
            }
        }
    }
}

impl Geocoder for HttpGeocoder {
    async fn geocode(&self, address: &str) -> Result<(f64, f64), AppError> {
        let url = self.request_url(address)?;
        self.pace().await;

        let response = send(
            &self.client,
            url.as_str(),
            &[("user-agent", USER_AGENT.to_string())],
            self.config.timeout.as_secs(),
        )
        .await?;
        if response.status != 200 {
            return Err(AppError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            });
        }

        let coords = self.parse(address, &response.body)?;
        tracing::debug!(address, lat = coords.0, lng = coords.1, "Geocoded address");
        Ok(coords)
    }
}

/// Geocoder for sources configured without one. Always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeocoder;

impl Geocoder for NoGeocoder {
    async fn geocode(&self, address: &str) -> Result<(f64, f64), AppError> {
        Err(AppError::ConfigError(format!(
            "no geocoder configured for {address:?}"
        )))
    }
}

/// Memoizes another geocoder's answers for the cache's TTL.
#[derive(Clone)]
pub struct CachedGeocoder<G> {
    inner: G,
    cache: TtlCache<String, (f64, f64)>,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(inner: G, ttl: Duration) -> Self {
        Self {
            inner,
            cache: TtlCache::new(ttl),
        }
    }
}

impl<G: Geocoder> Geocoder for CachedGeocoder<G> {
    async fn geocode(&self, address: &str) -> Result<(f64, f64), AppError> {
        let key = address.trim().to_lowercase();
        if let Some(coords) = self.cache.get(&key).await {
            return Ok(coords);
        }
        let coords = self.inner.geocode(address).await?;
        self.cache.set(key, coords).await;
        Ok(coords)
    }
}
