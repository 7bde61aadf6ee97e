//! Runtime counters and shutdown timing

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long in-flight requests get to finish after SIGTERM/SIGINT.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime metrics tracked while the service is running
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Number of requests currently being processed. Reported when the drain
    /// deadline expires with work still outstanding.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Count a new request and hold it in flight until the guard drops.
    pub fn begin_request(&self) -> InFlightGuard {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }

    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements `in_flight` on drop, including when a handler future is
/// cancelled mid-request.
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_tracks_in_flight() {
        let metrics = ServiceMetrics::new();
        let first = metrics.begin_request();
        let second = metrics.begin_request();
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 2);

        drop(first);
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 1);
        drop(second);
        assert_eq!(metrics.in_flight.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn clones_share_counters() {
        let metrics = ServiceMetrics::new();
        let clone = metrics.clone();
        clone.record_error();
        assert_eq!(metrics.errors_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drain_timeout_is_five_seconds() {
        assert_eq!(DRAIN_TIMEOUT, Duration::from_secs(5));
    }
}
