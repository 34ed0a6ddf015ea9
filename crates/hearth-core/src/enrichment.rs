//! Location scoring for saved listings.
//!
//! [`ScoringEnricher`] pairs a [`FactorScorer`] with a [`FactorStore`] so the
//! orchestrator can hand every saved listing to whatever scoring backend is
//! configured and persist the result next to the listing.

use std::future::Future;

use serde_json::json;

use crate::error::AppError;
use crate::models::{Property, PropertyFactors};
use crate::traits::{Enricher, FactorStore};

/// Produces location factors for one listing.
pub trait FactorScorer: Send + Sync + Clone + 'static {
    fn score(
        &self,
        property: &Property,
    ) -> impl Future<Output = Result<PropertyFactors, AppError>> + Send;
}

/// Weights of each component in the overall score. They sum to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactorWeights {
    pub crime: f64,
    pub transport: f64,
    pub education: f64,
    pub infrastructure: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            crime: 0.25,
            transport: 0.25,
            education: 0.20,
            infrastructure: 0.30,
        }
    }
}

impl FactorWeights {
    /// Weighted sum of the component scores, rounded to two decimals.
    pub fn overall(&self, factors: &PropertyFactors) -> f64 {
        let sum = factors.crime_score * self.crime
            + factors.transport_score * self.transport
            + factors.education_score * self.education
            + factors.infrastructure_score * self.infrastructure;
        (sum * 100.0).round() / 100.0
    }
}

/// Scores every listing with fixed per-component values.
///
/// Stands in for data-backed scoring: the values are what a listing gets
/// when no crime, transit, school or amenity data covers its location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineScorer {
    pub crime: f64,
    pub transport: f64,
    pub education: f64,
    pub infrastructure: f64,
    pub weights: FactorWeights,
}

impl Default for BaselineScorer {
    fn default() -> Self {
        Self {
            crime: 70.0,
            transport: 65.0,
            education: 60.0,
            infrastructure: 70.0,
            weights: FactorWeights::default(),
        }
    }
}

impl FactorScorer for BaselineScorer {
    async fn score(&self, property: &Property) -> Result<PropertyFactors, AppError> {
        let mut factors = PropertyFactors {
            property_id: property.id.unwrap_or_default(),
            crime_score: self.crime,
            transport_score: self.transport,
            education_score: self.education,
            infrastructure_score: self.infrastructure,
            overall_score: 0.0,
            details: json!({ "basis": "baseline" }),
        };
        factors.overall_score = self.weights.overall(&factors);
        Ok(factors)
    }
}

/// [`Enricher`] that scores with `Sc` and persists into `St`.
#[derive(Debug, Clone)]
pub struct ScoringEnricher<Sc, St> {
    scorer: Sc,
    store: St,
}

impl<Sc, St> ScoringEnricher<Sc, St>
where
    Sc: FactorScorer,
    St: FactorStore,
{
    pub fn new(scorer: Sc, store: St) -> Self {
        Self { scorer, store }
    }
}

impl<Sc, St> Enricher for ScoringEnricher<Sc, St>
where
    Sc: FactorScorer,
    St: FactorStore,
{
    async fn compute_factors(&self, property: &Property) -> Result<PropertyFactors, AppError> {
        let Some(property_id) = property.id else {
            return Err(AppError::Generic(format!(
                "listing {}/{} has no id yet",
                property.source, property.external_id
            )));
        };
        let mut factors = self.scorer.score(property).await?;
        factors.property_id = property_id;
        Ok(factors)
    }

    async fn save_factors(&self, factors: &PropertyFactors) -> Result<(), AppError> {
        self.store.save_factors(factors).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::orchestrator::Orchestrator;
    use crate::source::Source;
    use crate::store::MemoryStore;
    use crate::testutil::{MockSource, sample_property};

    #[test]
    fn test_overall_is_weighted_and_rounded() {
        let factors = PropertyFactors {
            crime_score: 70.0,
            transport_score: 65.0,
            education_score: 60.0,
            infrastructure_score: 70.0,
            ..Default::default()
        };
        assert_eq!(FactorWeights::default().overall(&factors), 66.75);

        let odd = PropertyFactors {
            crime_score: 33.333,
            ..Default::default()
        };
        assert_eq!(FactorWeights::default().overall(&odd), 8.33);
    }

    #[tokio::test]
    async fn test_unsaved_listing_is_rejected() {
        let enricher = ScoringEnricher::new(BaselineScorer::default(), MemoryStore::new());
        let err = enricher
            .compute_factors(&sample_property("s", "1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("s/1"));
    }

    #[tokio::test]
    async fn test_run_persists_factors_for_saved_listings() {
        let store = MemoryStore::new();
        let enricher = ScoringEnricher::new(BaselineScorer::default(), store.clone());
        let source = MockSource::new(
            "s",
            vec![sample_property("s", "1"), sample_property("s", "2")],
        );
        let orchestrator = Orchestrator::with_enricher(
            vec![Arc::new(source) as Arc<dyn Source>],
            store.clone(),
            enricher,
        );

        orchestrator
            .run_all(&CancellationToken::new())
            .await
            .unwrap();
        orchestrator.wait_enrichment().await;

        for listing in store.all() {
            let id = listing.id.unwrap();
            let factors = store.find_factors(id).await.unwrap().unwrap();
            assert_eq!(factors.property_id, id);
            assert_eq!(factors.overall_score, 66.75);
            assert_eq!(factors.details["basis"], "baseline");
        }
        assert_eq!(store.len(), 2);
    }
}
