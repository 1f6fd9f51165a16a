//! Per-client call metrics
//!
//! Logical calls that reach the transport stage count towards
//! total/successful/failed. Response times are tracked per physical attempt.
//! Breaker rejections are counted separately and never as requests.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

/// Point-in-time copy of a client's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Physical transport attempts, retries included
    pub total_attempts: u64,
    pub total_retries: u64,
    /// Calls that had to wait for a rate-limit token
    pub rate_limit_wait_count: u64,
    pub rate_limit_wait_time: Duration,
    /// Calls rejected by an open circuit breaker
    pub circuit_breaker_open_count: u64,
    pub min_response_time: Option<Duration>,
    pub max_response_time: Option<Duration>,
    pub avg_response_time: Option<Duration>,
}

impl ClientMetrics {
    /// Fraction of logical calls that succeeded, `1.0` before any call
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    metrics: ClientMetrics,
    timed_attempts: u64,
    total_response_time: Duration,
}

/// Thread-safe metrics accumulator
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<Counters>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one physical attempt that produced a response or a transport error
    pub fn record_attempt(&self, elapsed: Duration) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.timed_attempts += 1;
        inner.total_response_time += elapsed;

        let metrics = &mut inner.metrics;
        metrics.total_attempts += 1;
        metrics.min_response_time = Some(metrics.min_response_time.map_or(elapsed, |min| min.min(elapsed)));
        metrics.max_response_time = Some(metrics.max_response_time.map_or(elapsed, |max| max.max(elapsed)));
        metrics.avg_response_time = Some(
            inner.total_response_time / u32::try_from(inner.timed_attempts).unwrap_or(u32::MAX),
        );
    }

    /// Record the terminal outcome of a logical call
    pub fn record_outcome(&self, success: bool, retries: u32) {
        let mut inner = self.inner.lock();
        let metrics = &mut inner.metrics;
        metrics.total_requests += 1;
        metrics.total_retries += u64::from(retries);
        if success {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
        }
    }

    pub fn record_rate_limit_wait(&self, waited: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.rate_limit_wait_count += 1;
        inner.metrics.rate_limit_wait_time += waited;
    }

    pub fn record_circuit_rejection(&self) {
        self.inner.lock().metrics.circuit_breaker_open_count += 1;
    }

    pub fn snapshot(&self) -> ClientMetrics {
        self.inner.lock().metrics.clone()
    }

    pub fn reset(&self) {
        *self.inner.lock() = Counters::default();
    }
}
