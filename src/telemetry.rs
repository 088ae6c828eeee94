//! Request correlation and in-process counters.
//!
//! Every dispatched tool call gets a short correlation id that prefixes its
//! log lines. Counters are plain atomics; they are reported in server
//! instructions and the HTTP health probe, and never exported.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Generate a short correlation ID (8 characters) for compact logging.
pub fn generate_short_correlation_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Correlation information carried through one tool call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique identifier for this request.
    pub correlation_id: String,
    /// When the request was received.
    pub start_time: Instant,
    /// Operation being dispatched.
    pub operation: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_correlation_id(generate_short_correlation_id())
    }

    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            start_time: Instant::now(),
            operation: None,
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Create a log prefix for consistent logging format.
    pub fn log_prefix(&self) -> String {
        match &self.operation {
            Some(op) => format!("[{}] [{}]", self.correlation_id, op),
            None => format!("[{}]", self.correlation_id),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Server metrics collection.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Tool calls dispatched.
    pub requests_total: AtomicU64,

    /// Tool calls answered with an error envelope.
    pub requests_failed: AtomicU64,

    /// Queries sent to the remote server.
    pub queries_total: AtomicU64,

    pub queries_failed: AtomicU64,

    /// Total query execution time in milliseconds.
    pub query_time_ms_total: AtomicU64,

    pub connects_total: AtomicU64,

    pub connect_failures: AtomicU64,

    /// Sessions dropped because of a transport failure.
    pub sessions_lost: AtomicU64,

    /// Language model round trips.
    pub generations_total: AtomicU64,

    pub generations_failed: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a query execution.
    pub fn record_query(&self, success: bool, duration: Duration) {
        self.queries_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.query_time_ms_total
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_connect(&self, success: bool) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.connect_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_session_lost(&self) {
        self.sessions_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation(&self, success: bool) {
        self.generations_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.generations_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            queries_total: self.queries_total.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            query_time_ms_total: self.query_time_ms_total.load(Ordering::Relaxed),
            connects_total: self.connects_total.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            sessions_lost: self.sessions_lost.load(Ordering::Relaxed),
            generations_total: self.generations_total.load(Ordering::Relaxed),
            generations_failed: self.generations_failed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub queries_total: u64,
    pub queries_failed: u64,
    pub query_time_ms_total: u64,
    pub connects_total: u64,
    pub connect_failures: u64,
    pub sessions_lost: u64,
    pub generations_total: u64,
    pub generations_failed: u64,
}

impl MetricsSnapshot {
    /// Calculate average query time in milliseconds.
    pub fn avg_query_time_ms(&self) -> f64 {
        if self.queries_total == 0 {
            return 0.0;
        }
        self.query_time_ms_total as f64 / self.queries_total as f64
    }

    /// Calculate query success rate as a percentage.
    pub fn query_success_rate(&self) -> f64 {
        if self.queries_total == 0 {
            return 100.0;
        }
        let ok = self.queries_total - self.queries_failed;
        (ok as f64 / self.queries_total as f64) * 100.0
    }
}

/// Shared metrics type for thread-safe access.
pub type SharedMetrics = Arc<ServerMetrics>;

/// Create a new shared metrics collector.
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(ServerMetrics::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_recording() {
        let metrics = ServerMetrics::new();

        metrics.record_query(true, Duration::from_millis(100));
        metrics.record_query(true, Duration::from_millis(200));
        metrics.record_query(false, Duration::from_millis(50));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queries_total, 3);
        assert_eq!(snapshot.queries_failed, 1);
        assert_eq!(snapshot.query_time_ms_total, 350);
        assert!((snapshot.avg_query_time_ms() - 350.0 / 3.0).abs() < 0.01);
        assert!((snapshot.query_success_rate() - 200.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn test_session_counters() {
        let metrics = ServerMetrics::new();
        metrics.record_connect(true);
        metrics.record_connect(false);
        metrics.record_session_lost();
        metrics.record_request(false);
        metrics.record_generation(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connects_total, 2);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(snapshot.sessions_lost, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.generations_total, 1);
        assert_eq!(snapshot.generations_failed, 0);
    }

    #[test]
    fn test_empty_metrics_rates() {
        let snapshot = ServerMetrics::new().snapshot();
        assert_eq!(snapshot.query_success_rate(), 100.0);
        assert_eq!(snapshot.avg_query_time_ms(), 0.0);
    }

    #[test]
    fn test_short_correlation_id() {
        let a = generate_short_correlation_id();
        let b = generate_short_correlation_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_context_log_prefix() {
        let ctx = RequestContext::with_correlation_id("abc12345").with_operation("execute-query");
        assert_eq!(ctx.log_prefix(), "[abc12345] [execute-query]");
        assert_eq!(RequestContext::with_correlation_id("abc12345").log_prefix(), "[abc12345]");
    }
}
