//! Uniform per-container usage snapshots from the metrics backend.
//!
//! The metrics-server adapter issues one raw request per namespace per sweep
//! and serves every container snapshot of that sweep from the cached result,
//! so repeated calls within a sweep reuse one backend read. Backend failures
//! are surfaced as `Unavailable` (never as zero usage) and the warning log is
//! rate-limited under a decaying window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kube::Client;
use parking_lot::Mutex;
use serde::Deserialize;

use crate::quantity::{parse_cpu, parse_memory};
use crate::types::UsageSample;

/// Error type for usage snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Metrics backend unavailable or not installed")]
    Unavailable,

    #[error("Metrics API request failed: {0}")]
    Api(String),
}

/// Source of per-container usage samples.
#[async_trait]
pub trait UsageProvider: Send + Sync {
    /// Invalidate per-sweep coalescing state. The scheduler calls this once
    /// at the top of every sweep.
    fn begin_sweep(&self);

    /// Current usage of one container. `Ok(None)` means the backend answered
    /// but has no data for this container; callers must not treat that as
    /// zero usage.
    async fn snapshot(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<Option<UsageSample>, ProviderError>;
}

// ============================================================================
// metrics-server adapter
// ============================================================================

type NamespaceUsage = HashMap<(String, String), UsageSample>;

/// Adapter over the Kubernetes metrics-server API.
pub struct MetricsServerProvider {
    client: Client,
    /// Per-namespace results for the current sweep
    cache: DashMap<String, Result<NamespaceUsage, ()>>,
    warn_limiter: WarnLimiter,
}

impl MetricsServerProvider {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: DashMap::new(),
            warn_limiter: WarnLimiter::new(Duration::from_secs(300)),
        }
    }

    async fn fetch_namespace(&self, namespace: &str) -> Result<NamespaceUsage, ProviderError> {
        let path = format!("/apis/metrics.k8s.io/v1beta1/namespaces/{namespace}/pods");

        let request = http::Request::builder()
            .method("GET")
            .uri(&path)
            .body(Vec::new())
            .map_err(|e| ProviderError::Api(format!("Failed to build request: {e}")))?;

        let response = self
            .client
            .request::<PodMetricsList>(request)
            .await
            .map_err(|e| {
                if e.to_string().contains("404") || e.to_string().contains("not found") {
                    ProviderError::Unavailable
                } else {
                    ProviderError::Api(format!("Metrics API error: {e}"))
                }
            })?;

        let mut usage = NamespaceUsage::new();
        for pm in response.items {
            let timestamp = pm
                .timestamp
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now());
            for cm in pm.containers {
                usage.insert(
                    (pm.metadata.name.clone(), cm.name),
                    UsageSample {
                        timestamp,
                        cpu_millicores: parse_cpu(&cm.usage.cpu).unwrap_or(0),
                        memory_bytes: parse_memory(&cm.usage.memory).unwrap_or(0),
                    },
                );
            }
        }
        Ok(usage)
    }
}

#[async_trait]
impl UsageProvider for MetricsServerProvider {
    fn begin_sweep(&self) {
        self.cache.clear();
    }

    async fn snapshot(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<Option<UsageSample>, ProviderError> {
        if let Some(cached) = self.cache.get(namespace) {
            return match cached.value() {
                Ok(usage) => Ok(usage.get(&(pod.to_string(), container.to_string())).copied()),
                Err(()) => Err(ProviderError::Unavailable),
            };
        }

        match self.fetch_namespace(namespace).await {
            Ok(usage) => {
                let sample = usage.get(&(pod.to_string(), container.to_string())).copied();
                self.cache.insert(namespace.to_string(), Ok(usage));
                Ok(sample)
            }
            Err(e) => {
                self.warn_limiter
                    .warn(|suppressed| {
                        log::warn!(
                            "usage snapshot failed for namespace {namespace}: {e} \
                             ({suppressed} similar warnings suppressed)"
                        );
                    });
                // Remember the failure so the rest of the sweep does not
                // hammer a backend that is already down.
                self.cache.insert(namespace.to_string(), Err(()));
                Err(e)
            }
        }
    }
}

// ============================================================================
// Internal types for metrics API responses
// ============================================================================

#[derive(Debug, Deserialize)]
struct PodMetricsList {
    items: Vec<PodMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsItem {
    metadata: PodMetricsMetadata,
    timestamp: String,
    containers: Vec<ContainerMetricsItem>,
}

#[derive(Debug, Deserialize)]
struct PodMetricsMetadata {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ContainerMetricsItem {
    name: String,
    usage: RawUsage,
}

#[derive(Debug, Deserialize)]
struct RawUsage {
    cpu: String,
    memory: String,
}

// ============================================================================
// Warning rate limiter
// ============================================================================

/// Emits at most one warning per decaying window, counting what it swallowed.
struct WarnLimiter {
    window: Duration,
    state: Mutex<(Option<Instant>, u64)>,
}

impl WarnLimiter {
    fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new((None, 0)),
        }
    }

    fn warn(&self, emit: impl FnOnce(u64)) {
        let mut state = self.state.lock();
        let (last, suppressed) = &mut *state;
        let due = last.is_none_or(|t| t.elapsed() >= self.window);
        if due {
            let count = *suppressed;
            *last = Some(Instant::now());
            *suppressed = 0;
            drop(state);
            emit(count);
        } else {
            *suppressed += 1;
        }
    }
}

// ============================================================================
// In-memory provider for tests and offline runs
// ============================================================================

/// Simple in-memory usage provider.
#[derive(Default)]
pub struct InMemoryUsageProvider {
    samples: DashMap<(String, String, String), UsageSample>,
    /// When set, every snapshot fails as unavailable
    unavailable: std::sync::atomic::AtomicBool,
    /// Backend reads issued (cache misses), for coalescing assertions
    reads: std::sync::atomic::AtomicU64,
}

impl InMemoryUsageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sample(&self, namespace: &str, pod: &str, container: &str, sample: UsageSample) {
        self.samples.insert(
            (namespace.to_string(), pod.to_string(), container.to_string()),
            sample,
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageProvider for InMemoryUsageProvider {
    fn begin_sweep(&self) {}

    async fn snapshot(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<Option<UsageSample>, ProviderError> {
        self.reads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ProviderError::Unavailable);
        }
        Ok(self
            .samples
            .get(&(namespace.to_string(), pod.to_string(), container.to_string()))
            .map(|s| *s.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_limiter_suppresses_within_window() {
        let limiter = WarnLimiter::new(Duration::from_secs(60));
        let mut emitted = Vec::new();
        for _ in 0..5 {
            limiter.warn(|suppressed| emitted.push(suppressed));
        }
        // Only the first warning fires inside the window
        assert_eq!(emitted, vec![0]);
    }

    #[test]
    fn test_warn_limiter_reports_suppressed_count() {
        let limiter = WarnLimiter::new(Duration::ZERO);
        let mut emitted = Vec::new();
        limiter.warn(|s| emitted.push(s));
        limiter.warn(|s| emitted.push(s));
        // Zero-width window: every warning fires, nothing suppressed
        assert_eq!(emitted, vec![0, 0]);
    }

    #[tokio::test]
    async fn test_in_memory_provider_round_trip() {
        let provider = InMemoryUsageProvider::new();
        let sample = UsageSample {
            timestamp: Utc::now(),
            cpu_millicores: 150,
            memory_bytes: 256 * 1024 * 1024,
        };
        provider.set_sample("prod", "web-0", "app", sample);

        let got = provider.snapshot("prod", "web-0", "app").await.unwrap();
        assert_eq!(got, Some(sample));

        let missing = provider.snapshot("prod", "web-0", "sidecar").await.unwrap();
        assert!(missing.is_none());

        provider.set_unavailable(true);
        assert!(provider.snapshot("prod", "web-0", "app").await.is_err());
    }

    #[test]
    fn test_metrics_response_parsing() {
        let body = r#"{
            "items": [{
                "metadata": {"name": "web-0", "namespace": "prod"},
                "timestamp": "2026-08-01T10:00:00Z",
                "containers": [
                    {"name": "app", "usage": {"cpu": "150m", "memory": "268435456"}},
                    {"name": "sidecar", "usage": {"cpu": "250000000n", "memory": "64Mi"}}
                ]
            }]
        }"#;
        let parsed: PodMetricsList = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.items.len(), 1);
        let item = &parsed.items[0];
        assert_eq!(item.containers[0].name, "app");
        assert_eq!(parse_cpu(&item.containers[1].usage.cpu), Some(250));
        assert_eq!(parse_memory(&item.containers[1].usage.memory), Some(64 * 1024 * 1024));
    }
}
