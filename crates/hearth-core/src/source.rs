//! The contract every listing source implements.
//!
//! Sources are held as `Arc<dyn Source>` by the orchestrator, so the trait
//! goes through `async_trait` to stay object safe.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::Property;
use crate::validation::validate_property;

/// A failed parse pass, carrying whatever complete records were gathered
/// before the error.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ParseFailure {
    pub gathered: Vec<Property>,
    pub error: AppError,
}

impl ParseFailure {
    pub fn new(gathered: Vec<Property>, error: AppError) -> Self {
        Self { gathered, error }
    }

    pub fn is_cancellation(&self) -> bool {
        self.error.is_cancellation()
    }
}

impl From<AppError> for ParseFailure {
    fn from(error: AppError) -> Self {
        Self {
            gathered: Vec::new(),
            error,
        }
    }
}

/// One origin of listings.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable name, stored as `Property::source`.
    fn name(&self) -> &str;

    /// Harvest every listing the source currently offers.
    ///
    /// On cancellation returns the records gathered so far together with a
    /// cancellation error. Records missing a mandatory field are dropped,
    /// never emitted.
    async fn parse(&self, cancel: &CancellationToken) -> Result<Vec<Property>, ParseFailure>;
}

/// Keep only records that pass validation.
pub fn retain_valid(source: &str, records: Vec<Property>) -> Vec<Property> {
    let before = records.len();
    let valid: Vec<Property> = records
        .into_iter()
        .filter(|p| match validate_property(p) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(%source, external_id = %p.external_id, error = %e, "Dropping record");
                false
            }
        })
        .collect();
    let dropped = before - valid.len();
    if dropped > 0 {
        tracing::info!(%source, %dropped, "Dropped invalid records");
    }
    valid
}

/// Run `parse_one` for each sub-dimension (city, category, ...) in order.
///
/// A failing dimension is logged and skipped. Cancellation, either observed
/// before a dimension starts or reported by one, stops the sweep and returns
/// the records gathered so far.
pub async fn sweep_dimensions<D, F, Fut>(
    source: &str,
    cancel: &CancellationToken,
    dimensions: &[D],
    mut parse_one: F,
) -> Result<Vec<Property>, ParseFailure>
where
    D: Clone + Display,
    F: FnMut(D) -> Fut,
    Fut: Future<Output = Result<Vec<Property>, AppError>>,
{
    let mut gathered = Vec::new();

    for dimension in dimensions {
        if cancel.is_cancelled() {
            return Err(ParseFailure::new(gathered, AppError::Cancelled));
        }

        match parse_one(dimension.clone()).await {
            Ok(records) => {
                let records = retain_valid(source, records);
                tracing::info!(%source, %dimension, count = records.len(), "Parsed dimension");
                gathered.extend(records);
            }
            Err(e) if e.is_cancellation() => {
                return Err(ParseFailure::new(gathered, e));
            }
            Err(e) => {
                tracing::warn!(%source, %dimension, error = %e, "Dimension failed, skipping");
            }
        }
    }

    Ok(gathered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(id: &str, price: f64) -> Property {
        let mut p = Property::new("test", id);
        p.price = price;
        p.address = "1 Main St".into();
        p
    }

    #[tokio::test]
    async fn test_failed_dimension_does_not_abort_others() {
        let cancel = CancellationToken::new();
        let cities = ["berlin", "paris", "rome"];

        let records = sweep_dimensions("test", &cancel, &cities, |city| async move {
            if city == "paris" {
                Err(AppError::HttpStatus {
                    status: 404,
                    url: "http://example.com/paris".into(),
                })
            } else {
                Ok(vec![listing(city, 1000.0)])
            }
        })
        .await
        .unwrap();

        let ids: Vec<_> = records.iter().map(|p| p.external_id.as_str()).collect();
        assert_eq!(ids, ["berlin", "rome"]);
    }

    #[tokio::test]
    async fn test_invalid_records_are_dropped() {
        let cancel = CancellationToken::new();
        let records = sweep_dimensions("test", &cancel, &["x"], |_| async {
            Ok(vec![listing("ok", 1.0), listing("free", 0.0)])
        })
        .await
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "ok");
    }

    #[tokio::test]
    async fn test_cancellation_returns_gathered_records() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let failure = sweep_dimensions("test", &cancel, &["a", "b", "c"], |d| {
            if d == "a" {
                trigger.cancel();
            }
            async move { Ok(vec![listing(d, 10.0)]) }
        })
        .await
        .unwrap_err();

        assert!(failure.is_cancellation());
        assert_eq!(failure.gathered.len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_reported_by_dimension_stops_sweep() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let failure = sweep_dimensions("test", &cancel, &["a", "b"], |_| {
            calls += 1;
            async { Err(AppError::Cancelled) }
        })
        .await
        .unwrap_err();

        assert!(failure.is_cancellation());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_parse_failure_from_app_error() {
        let failure: ParseFailure = AppError::NoWorkingProxies.into();
        assert!(failure.gathered.is_empty());
        assert!(!failure.is_cancellation());
    }
}
