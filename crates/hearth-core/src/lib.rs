pub mod cache;
pub mod enrichment;
pub mod error;
pub mod fetcher;
pub mod headers;
pub mod heatmap;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod proxy_pool;
pub mod source;
pub mod store;
pub mod traits;
pub mod validation;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use cache::{CacheStats, TtlCache};
pub use enrichment::{BaselineScorer, FactorScorer, FactorWeights, ScoringEnricher};
pub use error::AppError;
pub use fetcher::{FetcherConfig, ResilientFetcher, backoff_delay};
pub use heatmap::{HeatmapPoint, aggregate_heatmap};
pub use metrics::{MetricsRecorder, MetricsSnapshot, SourceStats};
pub use models::{Property, PropertyFactors, compute_hash, derive_external_id};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RunEvent, RunReport, RunReporter, SourceOutcome,
    TracingRunReporter,
};
pub use proxy_pool::{ProxyEndpoint, ProxyPool, ProxyPoolConfig, ProxyProtocol};
pub use source::{ParseFailure, Source};
pub use store::MemoryStore;
pub use traits::{
    CircuitController, CurrencyConverter, Enricher, FactorStore, Fetcher, Geocoder, HttpTransport,
    NoCircuit, NullEnricher, PropertyStore, TransportResponse,
};
pub use validation::{normalize_property, validate_property};
