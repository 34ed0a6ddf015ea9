//! Resilient fetch policy: pacing, identity rotation and retry with
//! exponential backoff.
//!
//! [`ResilientFetcher`] wraps any [`HttpTransport`] and turns single HTTP
//! exchanges into a polite, persistent fetch:
//!
//! 1. every call after the first waits a randomized delay in
//!    `[rate_limit_delay, rate_limit_delay + rate_limit_jitter]`;
//! 2. when a [`CircuitController`] is attached, the egress identity is
//!    rotated each time the request counter reaches a positive multiple of
//!    `rotate_every`;
//! 3. HTTP 429, 5xx and network failures are retried after
//!    `2^attempt * retry_delay`, every other status fails immediately.
//!
//! Pacing state belongs to one fetcher instance (and its clones), so each
//! source gets its own rate limit.
//!
//! ```text
//! fetch ──> pace ──> [rotate?] ──> attempt 0 ──503──> sleep 1x ──> attempt 1 ──503──> rotate, sleep 2x ──> ...
//!                                      │
//!                                      └──200──> body
//! ```

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::headers::browser_headers;
use crate::traits::{CircuitController, Fetcher, HttpTransport, NoCircuit};

/// Tunables for [`ResilientFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Minimum pause before every request but the first.
    pub rate_limit_delay: Duration,

    /// Upper bound of the uniform random extra pause added to
    /// `rate_limit_delay`.
    pub rate_limit_jitter: Duration,

    /// Retries after the first attempt; a call makes at most
    /// `max_retries + 1` attempts.
    pub max_retries: u32,

    /// Base of the exponential backoff.
    pub retry_delay: Duration,

    /// Rotate identity every this many requests. `0` disables periodic
    /// rotation.
    pub rotate_every: u64,

    /// Fixed user agent. `None` rotates through a browser table per attempt.
    pub user_agent: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            rate_limit_delay: Duration::from_secs(2),
            rate_limit_jitter: Duration::from_secs(2),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            rotate_every: 10,
            user_agent: None,
        }
    }
}

impl FetcherConfig {
    pub fn with_rate_limit(mut self, delay: Duration, jitter: Duration) -> Self {
        self.rate_limit_delay = delay;
        self.rate_limit_jitter = jitter;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_rotate_every(mut self, requests: u64) -> Self {
        self.rotate_every = requests;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Draw one pacing delay from `[delay, delay + jitter]`.
    fn pacing_delay(&self) -> Duration {
        if self.rate_limit_jitter.is_zero() {
            return self.rate_limit_delay;
        }
        let jitter_ms = self.rate_limit_jitter.as_millis() as u64;
        let extra = rand::rng().random_range(0..=jitter_ms);
        self.rate_limit_delay + Duration::from_millis(extra)
    }
}

/// Backoff before the retry that follows `attempt` (0-based):
/// `2^attempt * base`.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[derive(Debug, Default)]
struct Pacing {
    request_count: u64,
}

/// Fetch policy over an [`HttpTransport`], optionally rotating identity
/// through a [`CircuitController`].
///
/// Clones share pacing state and the request counter. Build a new instance
/// per source to rate-limit sources independently.
#[derive(Clone)]
pub struct ResilientFetcher<T, C = NoCircuit> {
    transport: T,
    circuit: Option<C>,
    config: FetcherConfig,
    pacing: Arc<Mutex<Pacing>>,
}

impl<T: HttpTransport> ResilientFetcher<T, NoCircuit> {
    /// Fetcher without anonymity routing.
    pub fn new(transport: T, config: FetcherConfig) -> Self {
        Self {
            transport,
            circuit: None,
            config,
            pacing: Arc::new(Mutex::new(Pacing::default())),
        }
    }
}

impl<T: HttpTransport, C: CircuitController> ResilientFetcher<T, C> {
    /// Attach a circuit controller, enabling identity rotation.
    pub fn with_circuit<C2: CircuitController>(self, circuit: C2) -> ResilientFetcher<T, C2> {
        ResilientFetcher {
            transport: self.transport,
            circuit: Some(circuit),
            config: self.config,
            pacing: self.pacing,
        }
    }

    /// Build from parts, rotating identity only when `circuit` is given.
    pub fn from_parts(transport: T, circuit: Option<C>, config: FetcherConfig) -> Self {
        Self {
            transport,
            circuit,
            config,
            pacing: Arc::new(Mutex::new(Pacing::default())),
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }

    /// Number of top-level `fetch` calls that got past pacing.
    pub async fn request_count(&self) -> u64 {
        self.pacing.lock().await.request_count
    }

    /// Rate-limit, rotate if due, then count the request.
    ///
    /// The lock is held across the sleep so concurrent callers of the same
    /// instance are spaced at least `rate_limit_delay` apart.
    async fn pace(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let mut pacing = self.pacing.lock().await;
        let count = pacing.request_count;

        if count > 0 {
            let delay = self.config.pacing_delay();
            tracing::debug!(delay_ms = %delay.as_millis(), "Rate limiting request");
            sleep_or_cancel(delay, cancel).await?;
        }

        if count > 0 && self.config.rotate_every > 0 && count % self.config.rotate_every == 0 {
            self.rotate_identity("periodic", cancel).await?;
        }

        pacing.request_count += 1;
        Ok(())
    }

    /// Ask the circuit for a new identity. Only cancellation is an error; a
    /// failed rotation keeps the current circuit.
    async fn rotate_identity(
        &self,
        reason: &'static str,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let Some(circuit) = &self.circuit else {
            return Ok(());
        };
        tracing::info!(%reason, "Rotating egress identity");
        let result = tokio::select! {
            result = circuit.rotate_circuit() => result,
            () = cancel.cancelled() => return Err(AppError::Cancelled),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "Identity rotation failed, continuing on current circuit");
        }
        Ok(())
    }

    async fn attempt(&self, url: &str) -> Result<String, AppError> {
        let headers = browser_headers(self.config.user_agent.as_deref());
        let response = self.transport.get(url, &headers).await?;
        if response.status == 200 {
            Ok(response.body)
        } else {
            Err(AppError::HttpStatus {
                status: response.status,
                url: url.to_string(),
            })
        }
    }
}

impl<T: HttpTransport, C: CircuitController> Fetcher for ResilientFetcher<T, C> {
    async fn fetch(&self, cancel: &CancellationToken, url: &str) -> Result<String, AppError> {
        self.pace(cancel).await?;

        let max_retries = self.config.max_retries;
        let mut last_error = None;

        for attempt in 0..=max_retries {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let outcome = tokio::select! {
                result = self.attempt(url) => result,
                () = cancel.cancelled() => return Err(AppError::Cancelled),
            };

            let error = match outcome {
                Ok(body) => return Ok(body),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt < max_retries {
                let delay = backoff_delay(attempt, self.config.retry_delay);
                tracing::warn!(
                    %url,
                    attempt = attempt + 1,
                    error = %error,
                    delay_ms = %delay.as_millis(),
                    "Fetch attempt failed, retrying"
                );
                if attempt > 0 {
                    self.rotate_identity("retry", cancel).await?;
                }
                sleep_or_cancel(delay, cancel).await?;
            }
            last_error = Some(error);
        }

        Err(AppError::RetriesExhausted {
            attempts: max_retries + 1,
            last: Box::new(
                last_error.unwrap_or_else(|| AppError::Generic("no attempt made".into())),
            ),
        })
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(AppError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::testutil::{MockCircuit, MockTransport};

    fn quick_config() -> FetcherConfig {
        FetcherConfig::default()
            .with_rate_limit(Duration::from_secs(1), Duration::ZERO)
            .with_retries(2, Duration::from_secs(1))
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(0, base), Duration::from_millis(500));
        assert_eq!(backoff_delay(1, base), Duration::from_millis(1000));
        assert_eq!(backoff_delay(2, base), Duration::from_millis(2000));
        for attempt in 0..8 {
            assert_eq!(
                backoff_delay(attempt + 1, base),
                backoff_delay(attempt, base) * 2
            );
        }
    }

    #[test]
    fn pacing_delay_is_bounded() {
        let config = FetcherConfig::default()
            .with_rate_limit(Duration::from_secs(2), Duration::from_secs(2));
        for _ in 0..200 {
            let d = config.pacing_delay();
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_secs(4));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_503_exhausts_after_max_retries_plus_one() {
        let transport = MockTransport::always(503);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());

        let start = Instant::now();
        let err = fetcher
            .fetch(&CancellationToken::new(), "http://example.com/listings")
            .await
            .unwrap_err();

        assert_eq!(transport.call_count(), 3);
        match err {
            AppError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, AppError::HttpStatus { status: 503, .. }));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        // 1s after attempt 0, 2s after attempt 1, no sleep after the last.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_status_is_not_retried() {
        let transport = MockTransport::always(404);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());

        let err = fetcher
            .fetch(&CancellationToken::new(), "http://example.com/missing")
            .await
            .unwrap_err();

        assert_eq!(transport.call_count(), 1);
        assert!(matches!(err, AppError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_then_ok_succeeds() {
        let transport = MockTransport::with_statuses(vec![429, 200]);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());

        let body = fetcher
            .fetch(&CancellationToken::new(), "http://example.com")
            .await
            .unwrap();

        assert_eq!(body, "ok");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_are_retried() {
        let transport = MockTransport::with_responses(vec![
            Err(AppError::NetworkError("connection reset".into())),
            Err(AppError::Timeout(30)),
        ]);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());

        let body = fetcher
            .fetch(&CancellationToken::new(), "http://example.com")
            .await
            .unwrap();
        assert_eq!(body, "ok");
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_calls_are_spaced_by_rate_limit() {
        let transport = MockTransport::always(200);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());
        let cancel = CancellationToken::new();

        for _ in 0..4 {
            fetcher.fetch(&cancel, "http://example.com").await.unwrap();
        }

        let times = transport.call_times();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_the_rate_limit() {
        let transport = MockTransport::always(200);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for i in 0..5 {
            let fetcher = fetcher.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                fetcher
                    .fetch(&cancel, &format!("http://example.com/{i}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut times = transport.call_times();
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
        assert_eq!(fetcher.request_count().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_happens_on_every_tenth_request_only() {
        let transport = MockTransport::always(200);
        let circuit = MockCircuit::new();
        let fetcher =
            ResilientFetcher::new(transport, quick_config()).with_circuit(circuit.clone());
        let cancel = CancellationToken::new();

        for _ in 0..10 {
            fetcher.fetch(&cancel, "http://example.com").await.unwrap();
        }
        assert_eq!(circuit.rotations(), 0, "first ten requests must not rotate");

        fetcher.fetch(&cancel, "http://example.com").await.unwrap();
        assert_eq!(circuit.rotations(), 1);

        for _ in 0..10 {
            fetcher.fetch(&cancel, "http://example.com").await.unwrap();
        }
        assert_eq!(circuit.rotations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_the_first_rotate_identity() {
        let transport = MockTransport::always(502);
        let circuit = MockCircuit::new();
        let config = quick_config().with_retries(3, Duration::from_millis(100));
        let fetcher = ResilientFetcher::new(transport.clone(), config).with_circuit(circuit.clone());

        let _ = fetcher
            .fetch(&CancellationToken::new(), "http://example.com")
            .await;

        assert_eq!(transport.call_count(), 4);
        // Before attempts 2 and 3; the first retry keeps the circuit.
        assert_eq!(circuit.rotations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rotation_is_not_fatal() {
        let transport = MockTransport::always(200);
        let circuit = MockCircuit::failing();
        let config = quick_config().with_rotate_every(2);
        let fetcher = ResilientFetcher::new(transport, config).with_circuit(circuit.clone());
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            fetcher.fetch(&cancel, "http://example.com").await.unwrap();
        }
        assert_eq!(circuit.rotations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_slow_rotation() {
        let transport = MockTransport::always(200);
        let circuit = MockCircuit::new().with_delay(Duration::from_secs(60));
        let config = quick_config().with_rotate_every(1);
        let fetcher = ResilientFetcher::new(transport.clone(), config).with_circuit(circuit.clone());
        let cancel = CancellationToken::new();

        fetcher.fetch(&cancel, "http://example.com").await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = fetcher
            .fetch(&cancel, "http://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert_eq!(circuit.rotations(), 1);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_aborts_without_more_attempts() {
        let transport = MockTransport::always(503);
        let config = quick_config().with_retries(5, Duration::from_secs(60));
        let fetcher = ResilientFetcher::new(transport.clone(), config);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = fetcher
            .fetch(&cancel, "http://example.com")
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Cancelled));
        assert_eq!(transport.call_count(), 1);
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_token_skips_the_request() {
        let transport = MockTransport::always(200);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher.fetch(&cancel, "http://example.com").await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_counter_increments_once_per_call_not_per_retry() {
        let transport = MockTransport::with_statuses(vec![500, 500, 200]);
        let fetcher = ResilientFetcher::new(transport.clone(), quick_config());

        fetcher
            .fetch(&CancellationToken::new(), "http://example.com")
            .await
            .unwrap();

        assert_eq!(transport.call_count(), 3);
        assert_eq!(fetcher.request_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_user_agent_is_sent_on_every_attempt() {
        let transport = MockTransport::with_statuses(vec![503, 200]);
        let config = quick_config().with_user_agent("hearth-test/1.0");
        let fetcher = ResilientFetcher::new(transport.clone(), config);

        fetcher
            .fetch(&CancellationToken::new(), "http://example.com")
            .await
            .unwrap();

        for ua in transport.user_agents() {
            assert_eq!(ua, "hearth-test/1.0");
        }
    }
}
