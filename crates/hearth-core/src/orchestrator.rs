//! Runs every configured source, persists its listings in batches and
//! schedules enrichment of what was saved.
//!
//! Two modes share the same per-source pipeline:
//!
//! ```text
//! run_all             source 1 ──> source 2 ──> ... (in order)
//!
//! run_all_concurrent  jobs ──> [worker 1..N] ──> results ──> aggregate
//! ```
//!
//! A failing source never aborts its siblings. The run returns
//! [`AppError::SourcesFailed`] naming the sources that did not complete.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::AppError;
use crate::metrics::MetricsRecorder;
use crate::models::Property;
use crate::source::Source;
use crate::traits::{Enricher, NullEnricher, PropertyStore};
use crate::validation::{normalize_property, validate_property};

/// Events emitted during a run for monitoring/logging.
#[derive(Debug, Clone)]
pub enum RunEvent<'a> {
    RunStarted {
        run_id: Uuid,
        sources: usize,
        workers: usize,
    },
    SourceStarted {
        source: &'a str,
        worker: Option<usize>,
    },
    SourceCompleted {
        source: &'a str,
        parsed: u64,
        saved: u64,
        errors: u64,
        duration: Duration,
    },
    SourceFailed {
        source: &'a str,
        error: &'a str,
        cancelled: bool,
    },
    BatchFailed {
        source: &'a str,
        size: usize,
        error: &'a str,
    },
    EnrichmentFailed {
        property_id: i64,
        error: &'a str,
    },
    RunFinished {
        run_id: Uuid,
        failed: usize,
        total: usize,
        duration: Duration,
    },
}

/// Trait for receiving run events (decoupled logging).
pub trait RunReporter: Send + Sync {
    fn report(&self, event: RunEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRunReporter;

impl RunReporter for TracingRunReporter {
    fn report(&self, event: RunEvent<'_>) {
        match event {
            RunEvent::RunStarted {
                run_id,
                sources,
                workers,
            } => {
                tracing::info!(%run_id, %sources, %workers, "Run started");
            }
            RunEvent::SourceStarted { source, worker } => {
                tracing::info!(%source, ?worker, "Scraping source");
            }
            RunEvent::SourceCompleted {
                source,
                parsed,
                saved,
                errors,
                duration,
            } => {
                tracing::info!(
                    %source,
                    %parsed,
                    %saved,
                    %errors,
                    duration_ms = %duration.as_millis(),
                    "Source completed"
                );
            }
            RunEvent::SourceFailed {
                source,
                error,
                cancelled,
            } => {
                if cancelled {
                    tracing::warn!(%source, "Source cancelled");
                } else {
                    tracing::error!(%source, %error, "Source failed");
                }
            }
            RunEvent::BatchFailed {
                source,
                size,
                error,
            } => {
                tracing::error!(%source, %size, %error, "Batch upsert failed");
            }
            RunEvent::EnrichmentFailed { property_id, error } => {
                tracing::debug!(%property_id, %error, "Enrichment failed");
            }
            RunEvent::RunFinished {
                run_id,
                failed,
                total,
                duration,
            } => {
                tracing::info!(
                    %run_id,
                    %failed,
                    %total,
                    duration_ms = %duration.as_millis(),
                    "Run finished"
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Records per upsert call.
    pub batch_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { batch_size: 100 }
    }
}

impl OrchestratorConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Outcome of one source execution.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutcome {
    pub source: String,
    pub parsed: u64,
    pub saved: u64,
    pub errors: u64,
    pub duration: Duration,
    /// `None` when the source completed.
    pub error: Option<String>,
    pub cancelled: bool,
}

impl SourceOutcome {
    /// Outcome for a source that was never started because the run was
    /// cancelled first.
    fn skipped(source: &str) -> Self {
        Self {
            source: source.to_string(),
            parsed: 0,
            saved: 0,
            errors: 0,
            duration: Duration::ZERO,
            error: Some(AppError::Cancelled.to_string()),
            cancelled: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-source outcomes of a fully successful run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcomes: Vec<SourceOutcome>,
}

impl RunReport {
    pub fn total_saved(&self) -> u64 {
        self.outcomes.iter().map(|o| o.saved).sum()
    }

    pub fn total_errors(&self) -> u64 {
        self.outcomes.iter().map(|o| o.errors).sum()
    }
}

struct Shared<S, E> {
    store: S,
    enricher: E,
    metrics: MetricsRecorder,
    config: OrchestratorConfig,
    reporter: Arc<dyn RunReporter>,
    enrichment: TaskTracker,
}

/// Drives sources into the store.
pub struct Orchestrator<S, E = NullEnricher>
where
    S: PropertyStore,
    E: Enricher,
{
    sources: Vec<Arc<dyn Source>>,
    shared: Arc<Shared<S, E>>,
}

impl<S: PropertyStore> Orchestrator<S, NullEnricher> {
    pub fn new(sources: Vec<Arc<dyn Source>>, store: S) -> Self {
        Orchestrator::with_enricher(sources, store, NullEnricher)
    }
}

impl<S, E> Orchestrator<S, E>
where
    S: PropertyStore,
    E: Enricher,
{
    pub fn with_enricher(sources: Vec<Arc<dyn Source>>, store: S, enricher: E) -> Self {
        Self {
            sources,
            shared: Arc::new(Shared {
                store,
                enricher,
                metrics: MetricsRecorder::new(),
                config: OrchestratorConfig::default(),
                reporter: Arc::new(TracingRunReporter),
                enrichment: TaskTracker::new(),
            }),
        }
    }

    /// Rebuild shared state with one piece replaced.
    fn map_shared(self, f: impl FnOnce(&mut Shared<S, E>)) -> Self {
        let shared = match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => {
                f(&mut shared);
                shared
            }
            Err(arc) => {
                let mut shared = Shared {
                    store: arc.store.clone(),
                    enricher: arc.enricher.clone(),
                    metrics: arc.metrics.clone(),
                    config: arc.config.clone(),
                    reporter: Arc::clone(&arc.reporter),
                    enrichment: arc.enrichment.clone(),
                };
                f(&mut shared);
                shared
            }
        };
        Self {
            sources: self.sources,
            shared: Arc::new(shared),
        }
    }

    pub fn with_config(self, config: OrchestratorConfig) -> Self {
        self.map_shared(|s| s.config = config)
    }

    /// Record into an existing recorder, e.g. one shared across scheduled runs.
    pub fn with_metrics(self, metrics: MetricsRecorder) -> Self {
        self.map_shared(|s| s.metrics = metrics)
    }

    pub fn with_reporter(self, reporter: Arc<dyn RunReporter>) -> Self {
        self.map_shared(|s| s.reporter = reporter)
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.shared.metrics
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    /// Run sources one after another.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Result<RunReport, AppError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        self.shared.reporter.report(RunEvent::RunStarted {
            run_id,
            sources: self.sources.len(),
            workers: 1,
        });

        let mut outcomes = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let outcome = if cancel.is_cancelled() {
                SourceOutcome::skipped(source.name())
            } else {
                run_source(&self.shared, source.as_ref(), cancel, None).await
            };
            outcomes.push(outcome);
        }

        self.finish(run_id, started, outcomes)
    }

    /// Run sources on a fixed pool of `workers` tasks fed by a job queue.
    pub async fn run_all_concurrent(
        &self,
        cancel: &CancellationToken,
        workers: usize,
    ) -> Result<RunReport, AppError> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let workers = workers.max(1);
        let capacity = self.sources.len().max(1);

        self.shared.reporter.report(RunEvent::RunStarted {
            run_id,
            sources: self.sources.len(),
            workers,
        });

        let (job_tx, job_rx) = mpsc::channel::<(usize, Arc<dyn Source>)>(capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, SourceOutcome)>(capacity);

        let mut pool = JoinSet::new();
        for worker_id in 1..=workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();

            pool.spawn(async move {
                loop {
                    let job = job_rx.lock().await.recv().await;
                    let Some((index, source)) = job else {
                        break;
                    };

                    let outcome = if cancel.is_cancelled() {
                        SourceOutcome::skipped(source.name())
                    } else {
                        run_source(&shared, source.as_ref(), &cancel, Some(worker_id)).await
                    };

                    if result_tx.send((index, outcome)).await.is_err() {
                        break;
                    }
                }
                tracing::debug!(%worker_id, "Worker drained");
            });
        }
        drop(result_tx);

        for (index, source) in self.sources.iter().enumerate() {
            if job_tx.send((index, Arc::clone(source))).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut indexed = Vec::with_capacity(self.sources.len());
        while let Some(result) = result_rx.recv().await {
            indexed.push(result);
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        // Any source whose worker died without reporting counts as failed.
        let mut slots: Vec<Option<SourceOutcome>> = vec![None; self.sources.len()];
        for (index, outcome) in indexed {
            slots[index] = Some(outcome);
        }
        let outcomes = slots
            .into_iter()
            .zip(&self.sources)
            .map(|(slot, source)| {
                slot.unwrap_or_else(|| SourceOutcome {
                    error: Some("worker terminated before reporting".to_string()),
                    cancelled: false,
                    ..SourceOutcome::skipped(source.name())
                })
            })
            .collect();

        self.finish(run_id, started, outcomes)
    }

    /// Wait for every enrichment task scheduled so far.
    pub async fn wait_enrichment(&self) {
        let tracker = &self.shared.enrichment;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }

    fn finish(
        &self,
        run_id: Uuid,
        started: Instant,
        outcomes: Vec<SourceOutcome>,
    ) -> Result<RunReport, AppError> {
        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.source.clone())
            .collect();
        let total = outcomes.len();

        self.shared.reporter.report(RunEvent::RunFinished {
            run_id,
            failed: failed.len(),
            total,
            duration: started.elapsed(),
        });

        if failed.is_empty() {
            Ok(RunReport { run_id, outcomes })
        } else {
            Err(AppError::SourcesFailed { failed, total })
        }
    }
}

/// Parse, validate, persist and schedule enrichment for one source.
///
/// Metrics are recorded whatever the outcome. Records gathered by a source
/// that then failed are not persisted.
async fn run_source<S, E>(
    shared: &Shared<S, E>,
    source: &dyn Source,
    cancel: &CancellationToken,
    worker: Option<usize>,
) -> SourceOutcome
where
    S: PropertyStore,
    E: Enricher,
{
    let name = source.name().to_string();
    let started = Instant::now();
    shared.reporter.report(RunEvent::SourceStarted {
        source: &name,
        worker,
    });

    let records = match source.parse(cancel).await {
        Ok(records) => records,
        Err(failure) => {
            let duration = started.elapsed();
            shared.metrics.record_run(&name, 0, 0, 1, duration);

            let error = format!("failed to parse {name}: {}", failure.error);
            let cancelled = failure.is_cancellation();
            shared.reporter.report(RunEvent::SourceFailed {
                source: &name,
                error: &error,
                cancelled,
            });
            return SourceOutcome {
                source: name,
                parsed: 0,
                saved: 0,
                errors: 1,
                duration,
                error: Some(error),
                cancelled,
            };
        }
    };

    let parsed = records.len() as u64;
    let (valid, invalid) = prepare(&name, records);
    let (saved, batch_errors) = persist(shared, &name, valid).await;
    let saved_count = saved.len() as u64;
    let errors = invalid + batch_errors;

    schedule_enrichment(shared, saved);

    let duration = started.elapsed();
    shared
        .metrics
        .record_run(&name, parsed, saved_count, errors, duration);
    shared.reporter.report(RunEvent::SourceCompleted {
        source: &name,
        parsed,
        saved: saved_count,
        errors,
        duration,
    });

    SourceOutcome {
        source: name,
        parsed,
        saved: saved_count,
        errors,
        duration,
        error: None,
        cancelled: false,
    }
}

/// Normalize records, split off those that fail validation and collapse
/// repeated natural keys.
///
/// When a source yields the same `(source, external_id)` more than once the
/// last occurrence wins, at the position of that last occurrence.
fn prepare(source: &str, records: Vec<Property>) -> (Vec<Property>, u64) {
    let mut invalid = 0;
    let valid: Vec<Property> = records
        .into_iter()
        .filter_map(|mut p| {
            if p.source.is_empty() {
                p.source = source.to_string();
            }
            normalize_property(&mut p);
            match validate_property(&p) {
                Ok(()) => Some(p),
                Err(e) => {
                    tracing::debug!(%source, external_id = %p.external_id, error = %e, "Invalid record");
                    invalid += 1;
                    None
                }
            }
        })
        .collect();

    let total = valid.len();
    let mut seen = HashSet::with_capacity(total);
    let mut unique: Vec<Property> = valid
        .into_iter()
        .rev()
        .filter(|p| seen.insert((p.source.clone(), p.external_id.clone())))
        .collect();
    unique.reverse();

    if unique.len() < total {
        tracing::debug!(%source, duplicates = total - unique.len(), "Collapsed repeated listings");
    }
    (unique, invalid)
}

/// Upsert in fixed-size batches. A failed batch counts all its records as
/// errors and does not stop later batches.
async fn persist<S, E>(
    shared: &Shared<S, E>,
    source: &str,
    records: Vec<Property>,
) -> (Vec<Property>, u64)
where
    S: PropertyStore,
    E: Enricher,
{
    let mut saved = Vec::with_capacity(records.len());
    let mut errors = 0;

    for batch in records.chunks(shared.config.batch_size.max(1)) {
        match shared.store.upsert_batch(batch).await {
            Ok(stored) => saved.extend(stored),
            Err(e) => {
                let error = e.to_string();
                shared.reporter.report(RunEvent::BatchFailed {
                    source,
                    size: batch.len(),
                    error: &error,
                });
                errors += batch.len() as u64;
            }
        }
    }

    (saved, errors)
}

fn schedule_enrichment<S, E>(shared: &Shared<S, E>, saved: Vec<Property>)
where
    S: PropertyStore,
    E: Enricher,
{
    if saved.is_empty() {
        return;
    }

    let enricher = shared.enricher.clone();
    let reporter = Arc::clone(&shared.reporter);
    shared.enrichment.spawn(async move {
        for property in saved {
            let Some(property_id) = property.id else {
                continue;
            };
            let result = match enricher.compute_factors(&property).await {
                Ok(factors) => enricher.save_factors(&factors).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let error = e.to_string();
                reporter.report(RunEvent::EnrichmentFailed {
                    property_id,
                    error: &error,
                });
            }
        }
    });
}
