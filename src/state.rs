//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Allows multiple parts of the program to safely share ownership of data
//! - **Why needed**: Request handlers, WebSocket actors and session workers all run
//!   concurrently and need the same configuration, metrics and session registry
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time
//! - **parking_lot**: Its locks never poison, so no `.unwrap()` on every access
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration (new sessions pick up changes)
//! - **metrics**: HTTP request counters maintained by `MetricsMiddleware`
//! - **lifecycle**: the session registry, broadcast hub and upstream services

use crate::config::AppConfig;
use crate::session::{BroadcastHub, LifecycleController, PipelineServices, SessionRegistry};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics (updated by every HTTP request)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Session registry, broadcast groups and the services sessions call
    pub lifecycle: LifecycleController,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
///
/// ## Why these metrics matter:
/// - **request_count**: Total requests processed (for load monitoring)
/// - **error_count**: Total errors (for reliability monitoring)
/// - **active_sessions**: Presentation sessions currently attached to a socket
/// - **endpoint_metrics**: Per-endpoint statistics, keyed by normalized path
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: u32,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    /// Cumulative processing time in milliseconds
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the application state, wiring a fresh registry and broadcast hub to
    /// the given services.
    pub fn new(config: AppConfig, services: PipelineServices) -> Self {
        let lifecycle = LifecycleController::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(BroadcastHub::new()),
            services,
        );

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            lifecycle,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// The first time we see an endpoint, we create a new EndpointMetric with default values.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn increment_active_sessions(&self) {
        self.metrics.write().active_sessions += 1;
    }

    /// Decrement the active sessions counter, never going below zero.
    pub fn decrement_active_sessions(&self) {
        let mut metrics = self.metrics.write();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::mock::{ScriptedAnalyzer, ScriptedTranscriber};
    use crate::services::JsonRecordStore;
    use crate::session::PipelineStats;

    pub(crate) fn test_state() -> AppState {
        AppState::new(
            AppConfig::default(),
            PipelineServices {
                transcriber: Arc::new(ScriptedTranscriber::new()),
                analyzer: Arc::new(ScriptedAnalyzer::new()),
                store: Arc::new(JsonRecordStore::in_memory()),
                stats: Arc::new(PipelineStats::default()),
            },
        )
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_active_sessions_never_underflow() {
        let state = test_state();
        state.decrement_active_sessions();
        state.increment_active_sessions();
        state.decrement_active_sessions();
        state.decrement_active_sessions();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_update_config_validates() {
        let state = test_state();
        let mut bad = state.get_config();
        bad.evaluation.batch_threshold = 0;
        assert!(state.update_config(bad).is_err());

        let mut good = state.get_config();
        good.evaluation.batch_threshold = 3;
        assert!(state.update_config(good).is_ok());
        assert_eq!(state.get_config().evaluation.batch_threshold, 3);
    }
}
