use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{Property, PropertyFactors};

/// Raw outcome of a single HTTP exchange, before any retry policy applies.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Sends one GET request. No retries, no pacing: that is the
/// [`Fetcher`]'s job.
pub trait HttpTransport: Send + Sync + Clone {
    fn get(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
    ) -> impl Future<Output = Result<TransportResponse, AppError>> + Send;
}

/// Fetches the body of a URL, observing `cancel` between attempts.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Requests a fresh egress identity (e.g. a new Tor circuit).
pub trait CircuitController: Send + Sync + Clone {
    fn rotate_circuit(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Placeholder controller for fetchers without anonymity routing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCircuit;

impl CircuitController for NoCircuit {
    async fn rotate_circuit(&self) -> Result<(), AppError> {
        Ok(())
    }
}

/// Persists canonical records keyed by `(source, external_id)`.
pub trait PropertyStore: Send + Sync + Clone + 'static {
    /// Insert-or-update a batch in one write.
    ///
    /// Existing rows keep their `id` and `created_at`; every other field is
    /// overwritten. Returns the stored records with identity filled in. An
    /// error means none of the batch was written.
    fn upsert_batch(
        &self,
        batch: &[Property],
    ) -> impl Future<Output = Result<Vec<Property>, AppError>> + Send;

    fn find_by_id(&self, id: i64)
    -> impl Future<Output = Result<Option<Property>, AppError>> + Send;
}

/// Persists computed location factors, one row per listing.
pub trait FactorStore: Send + Sync + Clone + 'static {
    /// Insert-or-replace the factors of `factors.property_id`.
    fn save_factors(
        &self,
        factors: &PropertyFactors,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn find_factors(
        &self,
        property_id: i64,
    ) -> impl Future<Output = Result<Option<PropertyFactors>, AppError>> + Send;
}

/// Computes and stores location factors for persisted listings.
pub trait Enricher: Send + Sync + Clone + 'static {
    fn compute_factors(
        &self,
        property: &Property,
    ) -> impl Future<Output = Result<PropertyFactors, AppError>> + Send;

    fn save_factors(
        &self,
        factors: &PropertyFactors,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// An Enricher that computes nothing, for runs where scoring is not wired up.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEnricher;

impl Enricher for NullEnricher {
    async fn compute_factors(&self, property: &Property) -> Result<PropertyFactors, AppError> {
        Ok(PropertyFactors {
            property_id: property.id.unwrap_or_default(),
            ..Default::default()
        })
    }

    async fn save_factors(&self, _factors: &PropertyFactors) -> Result<(), AppError> {
        Ok(())
    }
}

/// Resolves a free-text address to `(latitude, longitude)`.
pub trait Geocoder: Send + Sync + Clone {
    fn geocode(&self, address: &str) -> impl Future<Output = Result<(f64, f64), AppError>> + Send;
}

/// Converts an amount between ISO currency codes.
pub trait CurrencyConverter: Send + Sync {
    fn convert(&self, amount: f64, from: &str, to: &str) -> Result<f64, AppError>;
}
