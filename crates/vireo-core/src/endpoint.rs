//! Delivery endpoint selection and failover
//!
//! Candidates are probed concurrently (latency, throughput, availability),
//! scored together with edge distance and delivery cost, and the best one
//! wins. Scores live only for the selection cycle; the `healthy` flag is the
//! only state that survives it.

use crate::config::{EndpointConfig, ScoreWeights};
use crate::error::{Error, Result};
use crate::types::GeoPoint;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// A content-delivery origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointCandidate {
    pub id: String,
    pub base_url: Url,
    /// Edge location for distance scoring
    pub edge: GeoPoint,
    /// Delivery cost in currency units per GB
    pub cost_per_gb: f64,
    pub healthy: bool,
}

/// Raw probe measurements for one candidate
#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub latency_ms: f64,
    pub throughput_mbps: f64,
    pub available: bool,
}

/// Probe seam so selection is testable without sockets
#[async_trait]
pub trait EndpointProber: Send + Sync {
    async fn probe(&self, candidate: &EndpointCandidate) -> Result<ProbeResult>;
}

/// reqwest-backed prober: a timed HEAD for latency/availability and a timed
/// ranged fetch for throughput
pub struct HttpProber {
    client: reqwest::Client,
    sample_bytes: u64,
}

impl HttpProber {
    pub fn new(sample_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build probe client: {e}")))?;
        Ok(Self { client, sample_bytes })
    }
}

#[async_trait]
impl EndpointProber for HttpProber {
    async fn probe(&self, candidate: &EndpointCandidate) -> Result<ProbeResult> {
        let head_start = Instant::now();
        let head = self
            .client
            .head(candidate.base_url.clone())
            .send()
            .await
            .map_err(|e| Error::ProbeFailed(format!("{}: {e}", candidate.id)))?;
        let latency_ms = head_start.elapsed().as_secs_f64() * 1000.0;
        let available = head.status().is_success();

        let range_end = self.sample_bytes.saturating_sub(1);
        let fetch_start = Instant::now();
        let sample = self
            .client
            .get(candidate.base_url.clone())
            .header(reqwest::header::RANGE, format!("bytes=0-{range_end}"))
            .send()
            .await
            .map_err(|e| Error::ProbeFailed(format!("{}: {e}", candidate.id)))?
            .bytes()
            .await
            .map_err(|e| Error::ProbeFailed(format!("{}: {e}", candidate.id)))?;
        let elapsed = fetch_start.elapsed().as_secs_f64().max(1e-3);
        let throughput_mbps = sample.len() as f64 * 8.0 / elapsed / 1_000_000.0;

        Ok(ProbeResult {
            latency_ms,
            throughput_mbps,
            available,
        })
    }
}

/// Great-circle distance in kilometers
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Weighted score for one candidate. Each metric is normalized into [0, 1]
/// before weighting; a missing probe zeroes the probed components.
fn score_candidate(
    weights: &ScoreWeights,
    probe: Option<&ProbeResult>,
    distance_km: f64,
    cost_per_gb: f64,
) -> f64 {
    let latency_score = probe.map_or(0.0, |p| 1.0 / (1.0 + p.latency_ms / 100.0));
    let throughput_score = probe.map_or(0.0, |p| (p.throughput_mbps / 100.0).min(1.0));
    let availability_score = probe.map_or(0.0, |p| if p.available { 1.0 } else { 0.0 });
    let distance_score = 1.0 / (1.0 + distance_km / 1000.0);
    let cost_score = 1.0 / (1.0 + cost_per_gb.max(0.0));

    weights.latency * latency_score
        + weights.throughput * throughput_score
        + weights.availability * availability_score
        + weights.distance * distance_score
        + weights.cost * cost_score
}

/// Scores origins and picks the best healthy one
pub struct EndpointSelector {
    config: EndpointConfig,
    candidates: Vec<EndpointCandidate>,
    prober: Arc<dyn EndpointProber>,
    current: Option<String>,
}

impl EndpointSelector {
    pub fn new(config: EndpointConfig, prober: Arc<dyn EndpointProber>) -> Self {
        let mut candidates = vec![config.primary.clone()];
        candidates.extend(config.fallbacks.iter().cloned());
        Self {
            config,
            candidates,
            prober,
            current: None,
        }
    }

    pub fn candidates(&self) -> &[EndpointCandidate] {
        &self.candidates
    }

    pub fn current(&self) -> Option<&EndpointCandidate> {
        let id = self.current.as_deref()?;
        self.candidates.iter().find(|c| c.id == id)
    }

    fn healthy_count(&self) -> usize {
        self.candidates.iter().filter(|c| c.healthy).count()
    }

    /// Probe and score every healthy candidate, pick the best.
    ///
    /// All probes run concurrently under one overall deadline; if the
    /// deadline fires, selection falls back to the current (or first
    /// healthy) candidate rather than blocking the decision loop.
    pub async fn select_optimal_endpoint(&mut self) -> Result<(EndpointCandidate, f64)> {
        let healthy: Vec<EndpointCandidate> = self
            .candidates
            .iter()
            .filter(|c| c.healthy)
            .cloned()
            .collect();
        if healthy.is_empty() {
            return Err(Error::NoEndpointAvailable);
        }

        let probes = healthy.iter().map(|candidate| {
            let prober = Arc::clone(&self.prober);
            let candidate = candidate.clone();
            async move {
                let result = prober.probe(&candidate).await;
                (candidate, result)
            }
        });

        let probed = match tokio::time::timeout(self.config.probe_timeout, join_all(probes)).await {
            Ok(results) => results,
            Err(_) => {
                warn!("Endpoint probe round timed out, keeping current origin");
                let fallback = self
                    .current()
                    .cloned()
                    .or_else(|| healthy.first().cloned())
                    .ok_or(Error::NoEndpointAvailable)?;
                return Ok((fallback, 0.0));
            }
        };

        let mut best: Option<(EndpointCandidate, f64)> = None;
        for (candidate, result) in probed {
            let probe = match &result {
                Ok(p) => Some(p),
                Err(err) => {
                    debug!(endpoint = %candidate.id, error = %err, "Probe failed");
                    None
                }
            };
            let distance_km = self
                .config
                .client_position
                .map(|pos| haversine_km(pos, candidate.edge))
                .unwrap_or(0.0);
            let score = score_candidate(
                &self.config.weights,
                probe,
                distance_km,
                candidate.cost_per_gb,
            );
            debug!(endpoint = %candidate.id, score, distance_km, "Endpoint scored");
            if best.as_ref().is_none_or(|(_, s)| score > *s) {
                best = Some((candidate, score));
            }
        }

        let (chosen, score) = best.ok_or(Error::NoEndpointAvailable)?;
        info!(endpoint = %chosen.id, score, "Endpoint selected");
        self.current = Some(chosen.id.clone());
        Ok((chosen, score))
    }

    /// Mark an origin unhealthy and pick the best of the rest
    pub async fn handle_failure(&mut self, failed_id: &str) -> Result<(EndpointCandidate, f64)> {
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.id == failed_id) {
            candidate.healthy = false;
            warn!(endpoint = %failed_id, "Endpoint marked unhealthy");
        }
        if self.current.as_deref() == Some(failed_id) {
            self.current = None;
        }
        if self.healthy_count() == 0 {
            return Err(Error::NoEndpointAvailable);
        }
        self.select_optimal_endpoint().await
    }

    /// Readmit an origin after external recovery (e.g. health-check success)
    pub fn mark_healthy(&mut self, id: &str) {
        if let Some(candidate) = self.candidates.iter_mut().find(|c| c.id == id) {
            candidate.healthy = true;
        }
    }
}
