//! Network resilience: retry with backoff, circuit breaking, and the
//! offline cache path
//!
//! Every segment fetch goes through `fetch_with_resilience`. The breaker is
//! consulted before any I/O, the retry policy wraps the transport call, and
//! outcomes feed back into the breaker. One manager (and so one breaker and
//! one failure history) exists per origin.

use crate::config::{CircuitBreakerConfig, ResilienceConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::types::ConnectionQuality;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// A segment fetch request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentRequest {
    pub url: Url,
    /// Inclusive byte range, when the level uses ranged segments
    pub byte_range: Option<(u64, u64)>,
}

impl SegmentRequest {
    pub fn new(url: Url) -> Self {
        Self { url, byte_range: None }
    }

    pub fn with_range(url: Url, start: u64, end: u64) -> Self {
        Self { url, byte_range: Some((start, end)) }
    }

    fn cache_key(&self) -> String {
        match self.byte_range {
            Some((start, end)) => format!("{}#{}-{}", self.url, start, end),
            None => self.url.to_string(),
        }
    }
}

/// Transport seam so the resilience layer is testable without sockets
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &SegmentRequest, timeout: Duration) -> Result<Bytes>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &SegmentRequest, timeout: Duration) -> Result<Bytes> {
        let mut builder = self.client.get(request.url.clone()).timeout(timeout);
        if let Some((start, end)) = request.byte_range {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={start}-{end}"));
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        Ok(bytes)
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before the retry following `attempt` (0-based).
    ///
    /// The exponential delay is capped at `max_delay` first, then jitter
    /// shaves off up to `jitter_factor` of it, so the result always sits in
    /// `[capped * (1 - jitter_factor), capped]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential =
            self.config.initial_delay.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        let capped = exponential.min(self.config.max_delay.as_secs_f64());
        let jitter = capped * self.config.jitter_factor * rand::random::<f64>();
        Duration::from_secs_f64((capped - jitter).max(0.0))
    }

    /// Run `op` until it succeeds, the error is non-transient, or attempts
    /// are exhausted. The last error is rethrown.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err);
                    }
                    debug!(attempt, error = %err, "Transient fetch failure");
                    last_error = Some(err);
                    if attempt < self.config.max_attempts {
                        tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("retry loop without attempts".into())))
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Failure-isolation state machine.
///
/// The open → half-open transition happens lazily inside `is_open`; there is
/// no background timer.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
        }
    }

    /// True while requests must fail fast. Transitions open → half-open once
    /// the reset timeout has elapsed since the last failure.
    pub fn is_open(&mut self, now: Instant) -> bool {
        if self.state != CircuitState::Open {
            return false;
        }
        let cooled_down = self
            .last_failure_at
            .is_none_or(|t| now.duration_since(t) >= self.config.reset_timeout);
        if cooled_down {
            debug!("Circuit breaker entering half-open");
            self.state = CircuitState::HalfOpen;
            self.consecutive_successes = 0;
            return false;
        }
        true
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == CircuitState::HalfOpen {
            self.consecutive_successes += 1;
            if self.consecutive_successes >= self.config.success_threshold {
                debug!("Circuit breaker closed");
                self.state = CircuitState::Closed;
                self.consecutive_successes = 0;
            }
        }
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_successes = 0;
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                warn!("Circuit breaker re-opened from half-open");
                self.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = self.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {
                self.consecutive_failures += 1;
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// In-memory segment cache backing the offline path, with byte-budget
/// eviction (oldest entry first)
#[derive(Debug)]
pub struct SegmentCache {
    entries: HashMap<String, Bytes>,
    order: VecDeque<String>,
    used: usize,
    budget: usize,
}

impl SegmentCache {
    pub fn new(budget: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            used: 0,
            budget,
        }
    }

    pub fn get(&self, request: &SegmentRequest) -> Option<Bytes> {
        self.entries.get(&request.cache_key()).cloned()
    }

    pub fn insert(&mut self, request: &SegmentRequest, data: Bytes) {
        if data.len() > self.budget {
            return;
        }
        let key = request.cache_key();
        if let Some(old) = self.entries.remove(&key) {
            self.used -= old.len();
            self.order.retain(|k| k != &key);
        }
        while self.used + data.len() > self.budget {
            let Some(oldest) = self.order.pop_front() else { break };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.used -= evicted.len();
            }
        }
        self.used += data.len();
        self.entries.insert(key.clone(), data);
        self.order.push_back(key);
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-origin resilience wrapper around the transport
pub struct NetworkResilienceManager {
    retry: RetryPolicy,
    breaker: Mutex<CircuitBreaker>,
    cache: Mutex<SegmentCache>,
    offline: AtomicBool,
    transport: Arc<dyn Transport>,
}

impl NetworkResilienceManager {
    pub fn new(config: ResilienceConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            retry: RetryPolicy::new(config.retry),
            breaker: Mutex::new(CircuitBreaker::new(config.circuit_breaker)),
            cache: Mutex::new(SegmentCache::new(config.cache_budget_bytes)),
            offline: AtomicBool::new(false),
            transport,
        }
    }

    /// Report connectivity as known-offline or back online
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    pub async fn breaker_state(&self) -> CircuitState {
        self.breaker.lock().await.state()
    }

    /// Serve a request from the cache without touching the network
    pub async fn cached(&self, request: &SegmentRequest) -> Option<Bytes> {
        self.cache.lock().await.get(request)
    }

    /// The cache holds at least one segment (degraded playback is viable)
    pub async fn has_cached_segments(&self) -> bool {
        !self.cache.lock().await.is_empty()
    }

    /// Fetch a segment with circuit breaking, the offline/cache path, the
    /// retry policy, and an adaptive timeout chosen from connection quality.
    pub async fn fetch_with_resilience(
        &self,
        request: &SegmentRequest,
        quality: ConnectionQuality,
    ) -> Result<Bytes> {
        if self.breaker.lock().await.is_open(Instant::now()) {
            return Err(Error::CircuitOpen);
        }

        if self.is_offline() {
            if let Some(bytes) = self.cache.lock().await.get(request) {
                debug!(url = %request.url, "Serving segment from cache while offline");
                return Ok(bytes);
            }
            return Err(Error::Network { status: 0, transient: true });
        }

        let timeout = quality.request_timeout();
        let transport = Arc::clone(&self.transport);
        let result = self
            .retry
            .execute(|_attempt| {
                let transport = Arc::clone(&transport);
                let request = request.clone();
                async move { transport.fetch(&request, timeout).await }
            })
            .await;

        match result {
            Ok(bytes) => {
                self.breaker.lock().await.record_success();
                self.cache.lock().await.insert(request, bytes.clone());
                Ok(bytes)
            }
            Err(err) => {
                self.breaker.lock().await.record_failure(Instant::now());
                Err(err)
            }
        }
    }
}
