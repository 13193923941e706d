//! Stream session - the per-session decision loop
//!
//! Coordinates:
//! - Endpoint selection and failover
//! - Quality level selection per decision cycle
//! - Resilient segment fetching with estimator feedback
//! - Buffer health evaluation and remediation on every tick
//! - Last-resort recovery and teardown

use crate::{
    abr::{AbrContext, AbrDecisionEngine, SwitchReason},
    bandwidth::BandwidthEstimator,
    buffer::{BufferInfo, BufferMonitor, PreloadMode, RemediationAction, StallDetector, StallEvent},
    config::EngineConfig,
    endpoint::{EndpointCandidate, EndpointProber, EndpointSelector, HttpProber},
    error::{Error, Result},
    events::{EngineEvent, TelemetryRecord, TelemetrySink},
    fallback::{FallbackContext, FallbackOrchestrator, RecoveryAction},
    resilience::{HttpTransport, NetworkResilienceManager, SegmentRequest, Transport},
    types::{ConnectionQuality, DeviceConstraints, QualityLevel, QualityMetrics, SessionId, TimeRange},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A single playback session's decision engine
pub struct StreamSession {
    /// Unique session ID
    id: SessionId,
    /// Session configuration
    config: EngineConfig,
    /// Rolling throughput estimate
    estimator: Arc<RwLock<BandwidthEstimator>>,
    /// Quality level selector
    abr: Arc<RwLock<AbrDecisionEngine>>,
    /// Buffer health and remediation
    monitor: Arc<RwLock<BufferMonitor>>,
    /// Stall transition tracking
    stalls: Arc<RwLock<StallDetector>>,
    /// Origin scoring and failover
    endpoints: Arc<RwLock<EndpointSelector>>,
    /// Last-resort recovery chain
    fallback: Arc<RwLock<FallbackOrchestrator>>,
    /// One resilience manager (breaker, cache) per origin
    resilience: Arc<RwLock<HashMap<String, Arc<NetworkResilienceManager>>>>,
    /// Shared transport behind every manager
    transport: Arc<dyn Transport>,
    /// Outbound event channel
    telemetry: TelemetrySink,
    /// Teardown signal observed by the tick loop and in-flight fetches
    cancel: CancellationToken,
    /// Playback state fed by the player layer
    position: Arc<RwLock<f64>>,
    paused: Arc<RwLock<bool>>,
    ranges: Arc<RwLock<Vec<TimeRange>>>,
    duration: Arc<RwLock<Option<f64>>>,
    device: Arc<RwLock<Option<DeviceConstraints>>>,
    /// Session counters
    metrics: Arc<RwLock<QualityMetrics>>,
    /// Degraded cache-only playback (recovery outcome)
    cache_only: AtomicBool,
}

impl StreamSession {
    /// Create a session with the default HTTP transport and prober
    pub fn new(
        config: EngineConfig,
        levels: Vec<QualityLevel>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TelemetryRecord>)> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        let prober: Arc<dyn EndpointProber> =
            Arc::new(HttpProber::new(config.endpoints.probe_sample_bytes)?);
        Self::with_parts(config, levels, transport, prober)
    }

    /// Create a session with explicit transport and prober implementations
    pub fn with_parts(
        config: EngineConfig,
        levels: Vec<QualityLevel>,
        transport: Arc<dyn Transport>,
        prober: Arc<dyn EndpointProber>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TelemetryRecord>)> {
        config.validate()?;

        let id = SessionId::new();
        let (telemetry, rx) = TelemetrySink::new(id);

        let session = Self {
            id,
            estimator: Arc::new(RwLock::new(BandwidthEstimator::new(
                config.default_bandwidth_bps,
            ))),
            abr: Arc::new(RwLock::new(AbrDecisionEngine::new(
                config.abr.clone(),
                levels,
            ))),
            monitor: Arc::new(RwLock::new(BufferMonitor::new(config.buffer.clone()))),
            stalls: Arc::new(RwLock::new(StallDetector::new())),
            endpoints: Arc::new(RwLock::new(EndpointSelector::new(
                config.endpoints.clone(),
                prober,
            ))),
            fallback: Arc::new(RwLock::new(FallbackOrchestrator::new())),
            resilience: Arc::new(RwLock::new(HashMap::new())),
            transport,
            telemetry,
            cancel: CancellationToken::new(),
            position: Arc::new(RwLock::new(0.0)),
            paused: Arc::new(RwLock::new(false)),
            ranges: Arc::new(RwLock::new(Vec::new())),
            duration: Arc::new(RwLock::new(None)),
            device: Arc::new(RwLock::new(None)),
            metrics: Arc::new(RwLock::new(QualityMetrics::default())),
            cache_only: AtomicBool::new(false),
            config,
        };

        info!(session_id = %id, "Stream session created");
        Ok((Arc::new(session), rx))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn current_level(&self) -> usize {
        self.abr.read().await.current_level()
    }

    pub async fn bandwidth_estimate(&self) -> u64 {
        self.estimator.read().await.estimate()
    }

    pub async fn buffer_target(&self) -> f64 {
        self.monitor.read().await.buffer_target()
    }

    /// Current preloading intensity (turns aggressive under critical buffer)
    pub async fn preload_mode(&self) -> PreloadMode {
        self.monitor.read().await.preload_mode()
    }

    pub async fn metrics(&self) -> QualityMetrics {
        self.metrics.read().await.clone()
    }

    // === Player-layer inputs ===

    /// Feed the current playhead and pause state
    pub async fn update_playback(&self, position: f64, paused: bool) {
        *self.position.write().await = position;
        *self.paused.write().await = paused;
    }

    /// Replace the downloaded-range view of the media timeline
    pub async fn update_ranges(&self, ranges: Vec<TimeRange>) {
        *self.ranges.write().await = ranges;
    }

    /// Replace the quality ladder wholesale (manifest change)
    pub async fn update_levels(&self, levels: Vec<QualityLevel>) {
        self.abr.write().await.set_levels(levels);
    }

    pub async fn set_duration(&self, duration: Option<f64>) {
        *self.duration.write().await = duration;
    }

    pub async fn set_device_constraints(&self, device: Option<DeviceConstraints>) {
        *self.device.write().await = device;
    }

    /// Report connectivity as known-offline or back online
    pub async fn set_offline(&self, offline: bool) {
        for manager in self.resilience.read().await.values() {
            manager.set_offline(offline);
        }
    }

    /// Playback resumed after recovery: close the active fallback pass
    pub async fn report_recovered(&self) {
        self.fallback.write().await.mark_recovered();
    }

    // === Decision loop ===

    /// One decision cycle: buffer snapshot, stall detection, remediation,
    /// and quality selection. Driven at `tick_interval` by `run`.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub async fn tick(&self) {
        if self.cancel.is_cancelled() {
            return;
        }

        let position = *self.position.read().await;
        let paused = *self.paused.read().await;
        let ranges = self.ranges.read().await.clone();
        let duration = *self.duration.read().await;

        let info = self
            .monitor
            .read()
            .await
            .compute_buffer_info(position, &ranges, duration);
        self.telemetry.emit(EngineEvent::BufferMetrics {
            length: info.length,
            health: info.health,
            holes: info.holes.len(),
            percentage: info.percentage_of_duration,
        });

        self.detect_stall(position, paused).await;
        self.remediate(&info, position).await;
        self.select_quality(&info).await;

        let estimate = self.estimator.read().await.estimate();
        let bitrate = self.abr.read().await.current_bitrate();
        let mut metrics = self.metrics.write().await;
        metrics.buffer_level = info.length;
        metrics.average_throughput = estimate;
        metrics.current_bitrate = bitrate;
    }

    async fn detect_stall(&self, position: f64, paused: bool) {
        let event = self
            .stalls
            .write()
            .await
            .update(position, paused, Instant::now());
        match event {
            Some(StallEvent::Started { position }) => {
                warn!(position, "Playback stall detected");
                self.metrics.write().await.stall_count += 1;
                self.telemetry.emit(EngineEvent::StallStarted { position });
            }
            Some(StallEvent::Resolved { duration_ms }) => {
                self.metrics.write().await.stall_duration += duration_ms as f64 / 1000.0;
                self.telemetry.emit(EngineEvent::StallResolved { duration_ms });
            }
            None => {}
        }
    }

    async fn remediate(&self, info: &BufferInfo, position: f64) {
        let action = self.monitor.write().await.plan_remediation(info, position);
        match action {
            Some(RemediationAction::ForceLowestQuality { pause }) => {
                self.telemetry.emit(EngineEvent::RequestLowestQuality);
                if pause {
                    self.telemetry.emit(EngineEvent::PauseRequested);
                }
            }
            Some(RemediationAction::RaiseBufferTarget { seconds })
            | Some(RemediationAction::LowerBufferTarget { seconds }) => {
                self.telemetry
                    .emit(EngineEvent::AdjustBufferTarget { seconds });
            }
            Some(RemediationAction::SeekToContiguous { position }) => {
                self.telemetry.emit(EngineEvent::SeekRequested { position });
            }
            None => {}
        }
    }

    async fn select_quality(&self, info: &BufferInfo) {
        let ctx = AbrContext {
            bandwidth_estimate: self.estimator.read().await.estimate(),
            buffer_level: info.length,
            device: *self.device.read().await,
        };
        let mut abr = self.abr.write().await;
        let from = abr.current_level();
        let decision = abr.select_level(&ctx, Instant::now());
        drop(abr);

        if decision.changed {
            self.metrics.write().await.quality_switches += 1;
            self.telemetry.emit(EngineEvent::QualityChanged {
                from,
                to: decision.index,
                reason: decision.reason,
            });
        }
    }

    /// Spawn the 1 Hz decision loop. The task exits when the session is
    /// shut down.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(session.config.tick_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => session.tick().await,
                }
            }
            debug!(session_id = %session.id, "Decision loop stopped");
        })
    }

    // === Fetch path ===

    /// Fetch a segment through the selected origin with full resilience.
    /// Feeds the measured throughput back into the estimator.
    pub async fn fetch_segment(&self, path: &str) -> Result<Bytes> {
        self.fetch(path, None).await
    }

    /// Ranged variant for levels that use byte-range segments
    pub async fn fetch_segment_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes> {
        self.fetch(path, Some((start, end))).await
    }

    #[instrument(skip(self), fields(session_id = %self.id))]
    async fn fetch(&self, path: &str, range: Option<(u64, u64)>) -> Result<Bytes> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let endpoint = self.current_endpoint().await?;
        match self.fetch_from(&endpoint, path, range).await {
            Ok(bytes) => {
                self.note_success().await;
                Ok(bytes)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(err) if !err.is_transient() && !matches!(err, Error::CircuitOpen) => Err(err),
            Err(err) => self.fail_over(endpoint, path, range, err).await,
        }
    }

    /// Local endpoint failover, then the recovery chain
    async fn fail_over(
        &self,
        failed: EndpointCandidate,
        path: &str,
        range: Option<(u64, u64)>,
        err: Error,
    ) -> Result<Bytes> {
        warn!(endpoint = %failed.id, error = %err, "Segment fetch failed, trying failover");
        self.telemetry
            .emit(EngineEvent::EndpointFailed { id: failed.id.clone() });

        let next = self.endpoints.write().await.handle_failure(&failed.id).await;
        match next {
            Ok((candidate, score)) => {
                self.telemetry.emit(EngineEvent::EndpointSelected {
                    id: candidate.id.clone(),
                    score,
                });
                match self.fetch_from(&candidate, path, range).await {
                    Ok(bytes) => {
                        self.note_success().await;
                        Ok(bytes)
                    }
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(retry_err) => self.recover_and_fail(retry_err).await,
                }
            }
            Err(_) => self.recover_and_fail(Error::NoEndpointAvailable).await,
        }
    }

    async fn current_endpoint(&self) -> Result<EndpointCandidate> {
        if let Some(current) = self.endpoints.read().await.current() {
            return Ok(current.clone());
        }
        let (candidate, score) = self.endpoints.write().await.select_optimal_endpoint().await?;
        self.telemetry.emit(EngineEvent::EndpointSelected {
            id: candidate.id.clone(),
            score,
        });
        Ok(candidate)
    }

    async fn fetch_from(
        &self,
        endpoint: &EndpointCandidate,
        path: &str,
        range: Option<(u64, u64)>,
    ) -> Result<Bytes> {
        let url = endpoint
            .base_url
            .join(path)
            .map_err(|e| Error::Internal(format!("invalid segment path {path:?}: {e}")))?;
        let request = match range {
            Some((start, end)) => SegmentRequest::with_range(url, start, end),
            None => SegmentRequest::new(url),
        };
        let manager = self.manager_for(&endpoint.id).await;

        if self.cache_only.load(Ordering::Acquire) {
            if let Some(bytes) = manager.cached(&request).await {
                return Ok(bytes);
            }
        }

        let quality = ConnectionQuality::from_bandwidth(self.estimator.read().await.estimate());
        let started = Instant::now();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            outcome = manager.fetch_with_resilience(&request, quality) => outcome,
        };

        let bytes = result?;
        let elapsed = started.elapsed();
        // A cancelled session must not write to engine state
        if !self.cancel.is_cancelled() {
            self.estimator
                .write()
                .await
                .add_sample(bytes.len() as u64, elapsed);
        }
        debug!(
            url = %request.url,
            bytes = bytes.len(),
            duration_ms = elapsed.as_millis(),
            "Segment fetched"
        );
        Ok(bytes)
    }

    async fn manager_for(&self, endpoint_id: &str) -> Arc<NetworkResilienceManager> {
        let mut managers = self.resilience.write().await;
        Arc::clone(managers.entry(endpoint_id.to_string()).or_insert_with(|| {
            Arc::new(NetworkResilienceManager::new(
                self.config.resilience.clone(),
                Arc::clone(&self.transport),
            ))
        }))
    }

    async fn note_success(&self) {
        let mut fallback = self.fallback.write().await;
        if fallback.pass_active() {
            fallback.mark_recovered();
        }
    }

    // === Recovery ===

    async fn recover_and_fail(&self, err: Error) -> Result<Bytes> {
        let ctx = self.fallback_context().await;
        let outcome = self.fallback.write().await.recover(&err, &ctx);
        match outcome {
            Ok(action) => {
                self.apply_recovery(action).await;
                Err(err)
            }
            Err(fatal) => {
                self.telemetry.emit(EngineEvent::FatalError {
                    code: fatal.error_code().to_string(),
                    message: fatal.to_string(),
                });
                Err(fatal)
            }
        }
    }

    async fn fallback_context(&self) -> FallbackContext {
        let (current_level, level_count) = {
            let abr = self.abr.read().await;
            (abr.current_level(), abr.levels().len())
        };
        let alternate_origins = {
            let endpoints = self.endpoints.read().await;
            let current_id = endpoints.current().map(|c| c.id.clone());
            endpoints
                .candidates()
                .iter()
                .filter(|c| c.healthy && Some(&c.id) != current_id.as_ref())
                .count()
        };
        let mut cache_ready = false;
        for manager in self.resilience.read().await.values() {
            if manager.has_cached_segments().await {
                cache_ready = true;
                break;
            }
        }
        FallbackContext {
            current_level,
            level_count,
            cache_ready,
            alternate_origins,
        }
    }

    async fn apply_recovery(&self, action: RecoveryAction) {
        match action {
            RecoveryAction::SwitchLevel(level) => {
                let forced = self.abr.write().await.force_level(level, Instant::now());
                if let Some((from, to)) = forced {
                    self.metrics.write().await.quality_switches += 1;
                    self.telemetry.emit(EngineEvent::QualityChanged {
                        from,
                        to,
                        reason: SwitchReason::Manual,
                    });
                }
            }
            RecoveryAction::SwitchProtocol => {
                self.telemetry.emit(EngineEvent::ProtocolSwitchRequested);
            }
            RecoveryAction::SwitchOrigin => {
                let current_id = self.endpoints.read().await.current().map(|c| c.id.clone());
                if let Some(id) = current_id {
                    self.telemetry.emit(EngineEvent::EndpointFailed { id: id.clone() });
                    if let Ok((candidate, score)) =
                        self.endpoints.write().await.handle_failure(&id).await
                    {
                        self.telemetry.emit(EngineEvent::EndpointSelected {
                            id: candidate.id,
                            score,
                        });
                    }
                }
            }
            RecoveryAction::ServeFromCache => {
                self.cache_only.store(true, Ordering::Release);
                self.telemetry.emit(EngineEvent::DegradedModeEntered);
            }
            RecoveryAction::MinimalStream => {
                let forced = self.abr.write().await.force_level(0, Instant::now());
                if let Some((from, to)) = forced {
                    self.telemetry.emit(EngineEvent::QualityChanged {
                        from,
                        to,
                        reason: SwitchReason::Manual,
                    });
                }
                self.telemetry.emit(EngineEvent::AdjustBufferTarget {
                    seconds: self.config.buffer.min_buffer_length,
                });
            }
        }
    }

    // === Teardown ===

    /// Cancel the decision loop and all in-flight fetches. Completion
    /// handlers observe the token and become no-ops; no state is written
    /// after this returns.
    pub fn shutdown(&self) {
        info!(session_id = %self.id, "Session shutting down");
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
