//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests. All mocks use
//! `Arc<Mutex<_>>` or atomics for interior mutability, allowing test
//! assertions on recorded calls.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{Property, PropertyFactors};
use crate::source::{ParseFailure, Source};
use crate::store::MemoryStore;
use crate::traits::{
    CircuitController, Enricher, Fetcher, HttpTransport, PropertyStore, TransportResponse,
};

/// Rebuild an error for mocks that hand out the same failure repeatedly.
pub fn clone_error(error: &AppError) -> AppError {
    match error {
        AppError::HttpStatus { status, url } => AppError::HttpStatus {
            status: *status,
            url: url.clone(),
        },
        AppError::HttpError(m) => AppError::HttpError(m.clone()),
        AppError::NetworkError(m) => AppError::NetworkError(m.clone()),
        AppError::Timeout(s) => AppError::Timeout(*s),
        AppError::RetriesExhausted { attempts, last } => AppError::RetriesExhausted {
            attempts: *attempts,
            last: Box::new(clone_error(last)),
        },
        AppError::Cancelled => AppError::Cancelled,
        AppError::Validation { field, message } => AppError::Validation {
            field: *field,
            message: *message,
        },
        AppError::InvalidProxy(m) => AppError::InvalidProxy(m.clone()),
        AppError::NoProxies => AppError::NoProxies,
        AppError::NoWorkingProxies => AppError::NoWorkingProxies,
        AppError::CircuitError(m) => AppError::CircuitError(m.clone()),
        AppError::ParseError(m) => AppError::ParseError(m.clone()),
        AppError::DatabaseError(m) => AppError::DatabaseError(m.clone()),
        AppError::ConfigError(m) => AppError::ConfigError(m.clone()),
        other => AppError::Generic(other.to_string()),
    }
}

/// A valid listing with coordinates, price and address.
pub fn sample_property(source: &str, external_id: &str) -> Property {
    let mut p = Property::new(source, external_id);
    p.url = format!("https://listings.example.com/{source}/{external_id}");
    p.country = "US".into();
    p.city = "New York".into();
    p.address = format!("{external_id} Broadway");
    p.latitude = 40.7128;
    p.longitude = -74.0060;
    p.property_type = "apartment".into();
    p.price = 450_000.0;
    p.currency = "USD".into();
    p.area = 72.5;
    p.rooms = 3;
    p
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// One request seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub at: Instant,
}

/// Transport that replays queued responses, then a fallback status.
#[derive(Clone)]
pub struct MockTransport {
    responses: Arc<Mutex<VecDeque<Result<TransportResponse, AppError>>>>,
    fallback_status: u16,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

fn response(status: u16) -> TransportResponse {
    TransportResponse {
        status,
        body: if status == 200 { "ok" } else { "error" }.to_string(),
    }
}

impl MockTransport {
    /// Every request answers `status`.
    pub fn always(status: u16) -> Self {
        Self::with_responses(Vec::new()).with_fallback(status)
    }

    /// Answer the given statuses in order, then 200.
    pub fn with_statuses(statuses: Vec<u16>) -> Self {
        Self::with_responses(statuses.into_iter().map(|s| Ok(response(s))).collect())
    }

    /// Answer the given results in order, then 200.
    pub fn with_responses(responses: Vec<Result<TransportResponse, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            fallback_status: 200,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_fallback(mut self, status: u16) -> Self {
        self.fallback_status = status;
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.requests().into_iter().map(|r| r.at).collect()
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|r| {
                r.headers
                    .into_iter()
                    .find(|(k, _)| *k == "user-agent")
                    .map(|(_, v)| v)
            })
            .collect()
    }
}

impl HttpTransport for MockTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> Result<TransportResponse, AppError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: url.to_string(),
            headers: headers.to_vec(),
            at: Instant::now(),
        });
        let next = self.responses.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(response(self.fallback_status)))
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Fetcher that serves bodies by URL substring.
///
/// Routes are matched in insertion order; unmatched URLs answer HTTP 404.
#[derive(Clone, Default)]
pub struct MockFetcher {
    routes: Arc<Mutex<Vec<(String, Result<String, u16>)>>>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url_contains: &str, body: impl Into<String>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((url_contains.to_string(), Ok(body.into())));
        self
    }

    pub fn fail(self, url_contains: &str, status: u16) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((url_contains.to_string(), Err(status)));
        self
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, cancel: &CancellationToken, url: &str) -> Result<String, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        self.fetched.lock().unwrap().push(url.to_string());

        let routes = self.routes.lock().unwrap();
        let outcome = routes
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or(Err(404));

        outcome.map_err(|status| AppError::HttpStatus {
            status,
            url: url.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockCircuit
// ---------------------------------------------------------------------------

/// Circuit controller counting rotation requests.
#[derive(Clone, Default)]
pub struct MockCircuit {
    rotations: Arc<AtomicUsize>,
    fail: bool,
    delay: Option<Duration>,
}

impl MockCircuit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every rotation is counted, then fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Each rotation takes `delay` to answer, like a slow control port.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn rotations(&self) -> usize {
        self.rotations.load(Ordering::SeqCst)
    }
}

impl CircuitController for MockCircuit {
    async fn rotate_circuit(&self) -> Result<(), AppError> {
        self.rotations.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            Err(AppError::CircuitError("control port unreachable".into()))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

/// Source returning fixed records or a fixed failure.
pub struct MockSource {
    name: String,
    records: Vec<Property>,
    error: Option<AppError>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn new(name: &str, records: Vec<Property>) -> Self {
        Self {
            name: name.to_string(),
            records,
            error: None,
            delay: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(name: &str, error: AppError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(name, Vec::new())
        }
    }

    /// Fails with `error` after gathering `records`.
    pub fn partial(name: &str, records: Vec<Property>, error: AppError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(name, records)
        }
    }

    /// Spend `delay` (cancellable) before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Source for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn parse(&self, cancel: &CancellationToken) -> Result<Vec<Property>, ParseFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(AppError::Cancelled.into()),
            }
        }

        match &self.error {
            Some(error) => Err(ParseFailure::new(self.records.clone(), clone_error(error))),
            None => Ok(self.records.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

/// [`MemoryStore`] that fails selected batch calls (0-based).
#[derive(Clone, Default)]
pub struct MockStore {
    inner: MemoryStore,
    failing_batches: Arc<HashSet<usize>>,
    batch_sizes: Arc<Mutex<Vec<usize>>>,
}

impl MockStore {
    pub fn failing_batches(indices: Vec<usize>) -> Self {
        Self {
            failing_batches: Arc::new(indices.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn stored(&self) -> &MemoryStore {
        &self.inner
    }
}

impl PropertyStore for MockStore {
    async fn upsert_batch(&self, batch: &[Property]) -> Result<Vec<Property>, AppError> {
        let index = {
            let mut sizes = self.batch_sizes.lock().unwrap();
            sizes.push(batch.len());
            sizes.len() - 1
        };
        if self.failing_batches.contains(&index) {
            return Err(AppError::DatabaseError("deadlock detected".into()));
        }
        self.inner.upsert_batch(batch).await
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Property>, AppError> {
        self.inner.find_by_id(id).await
    }
}

// ---------------------------------------------------------------------------
// MockEnricher
// ---------------------------------------------------------------------------

/// Enricher recording the property ids whose factors were saved.
#[derive(Clone, Default)]
pub struct MockEnricher {
    saved: Arc<Mutex<Vec<i64>>>,
    fail: bool,
}

impl MockEnricher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn saved_ids(&self) -> Vec<i64> {
        self.saved.lock().unwrap().clone()
    }
}

impl Enricher for MockEnricher {
    async fn compute_factors(&self, property: &Property) -> Result<PropertyFactors, AppError> {
        if self.fail {
            return Err(AppError::Generic("scoring backend unavailable".into()));
        }
        Ok(PropertyFactors {
            property_id: property.id.unwrap_or_default(),
            overall_score: 50.0,
            ..Default::default()
        })
    }

    async fn save_factors(&self, factors: &PropertyFactors) -> Result<(), AppError> {
        self.saved.lock().unwrap().push(factors.property_id);
        Ok(())
    }
}
