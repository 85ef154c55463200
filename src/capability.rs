//! Startup and periodic probing of orchestrator capabilities.
//!
//! Two flags gate the loop: whether the orchestrator supports in-place pod
//! resizing (without it the executor is disabled and the loop runs
//! observe-only), and whether a metrics backend is reachable (without it
//! adaptive sizing is suppressed). The flags live behind an atomic snapshot
//! so the scheduler and executor read them without locking.

use arc_swap::ArcSwap;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;

/// In-place pod resize went alpha in this minor version.
const MIN_RESIZE_MINOR: u32 = 27;

/// Probed orchestrator capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Orchestrator supports the in-place resize sub-operation
    pub in_place_resize: bool,
    /// A metrics backend answered the probe
    pub metrics_api: bool,
}

impl Capabilities {
    /// Conservative default before the first probe completes.
    pub fn unprobed() -> Self {
        Self {
            in_place_resize: false,
            metrics_api: false,
        }
    }
}

/// Holds the capability flags behind an atomic snapshot.
pub struct CapabilityDetector {
    flags: ArcSwap<Capabilities>,
}

impl Default for CapabilityDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityDetector {
    pub fn new() -> Self {
        Self {
            flags: ArcSwap::from_pointee(Capabilities::unprobed()),
        }
    }

    /// Lock-free read of the current flags.
    pub fn snapshot(&self) -> Capabilities {
        **self.flags.load()
    }

    /// Force the flags; used by tests and degraded-mode overrides.
    pub fn set(&self, capabilities: Capabilities) {
        self.flags.store(Arc::new(capabilities));
    }

    /// Probe the orchestrator once and swap the flags.
    pub async fn probe(&self, client: &Client) -> Result<Capabilities, crate::error::Error> {
        let version = client
            .apiserver_version()
            .await
            .map_err(|e| crate::error::Error::Capability(format!("apiserver version: {e}")))?;

        let in_place_resize = supports_in_place_resize(&version.major, &version.minor);
        let metrics_api = metrics_api_reachable(client).await;

        let capabilities = Capabilities {
            in_place_resize,
            metrics_api,
        };

        if !in_place_resize {
            log::warn!(
                "orchestrator v{}.{} does not support in-place resize; running observe-only",
                version.major,
                version.minor
            );
        }
        if !metrics_api {
            log::warn!("metrics API unreachable; adaptive sizing suppressed");
        }

        self.set(capabilities);
        Ok(capabilities)
    }

    /// Re-probe on a coarse schedule until shutdown flips.
    pub async fn run_refresh(
        self: Arc<Self>,
        client: Client,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick fires immediately; probe already ran
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe(&client).await {
                        log::warn!("capability re-probe failed: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// Version gate for the in-place resize sub-operation.
fn supports_in_place_resize(major: &str, minor: &str) -> bool {
    let major: u32 = match digits(major).parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    let minor: u32 = match digits(minor).parse() {
        Ok(v) => v,
        Err(_) => return false,
    };
    major > 1 || (major == 1 && minor >= MIN_RESIZE_MINOR)
}

/// GKE-style version strings carry suffixes ("27+"); keep the digits.
fn digits(s: &str) -> &str {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    &s[..end]
}

/// Raw probe of the metrics API group, the same way the usage adapter
/// queries it.
async fn metrics_api_reachable(client: &Client) -> bool {
    let request = http::Request::builder()
        .method("GET")
        .uri("/apis/metrics.k8s.io/v1beta1")
        .body(Vec::new());

    match request {
        Ok(req) => client.request::<serde_json::Value>(req).await.is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_gate() {
        assert!(supports_in_place_resize("1", "27"));
        assert!(supports_in_place_resize("1", "33"));
        assert!(supports_in_place_resize("1", "27+"));
        assert!(supports_in_place_resize("2", "0"));
        assert!(!supports_in_place_resize("1", "26"));
        assert!(!supports_in_place_resize("1", "garbage"));
    }

    #[test]
    fn test_snapshot_starts_unprobed() {
        let detector = CapabilityDetector::new();
        let caps = detector.snapshot();
        assert!(!caps.in_place_resize);
        assert!(!caps.metrics_api);
    }

    #[test]
    fn test_set_swaps_atomically() {
        let detector = CapabilityDetector::new();
        detector.set(Capabilities {
            in_place_resize: true,
            metrics_api: true,
        });
        let caps = detector.snapshot();
        assert!(caps.in_place_resize && caps.metrics_api);
    }
}
