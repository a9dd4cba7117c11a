//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, GEMINI_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_EVALUATION__BATCH_THRESHOLD, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::scoring::rubric::{default_rubric, RubricCategory};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, services, evaluation, ...)
/// keeps each concern small and lets the config crate map nested TOML tables
/// and environment variables onto them directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    pub evaluation: EvaluationConfig,
    pub performance: PerformanceConfig,
    pub storage: StorageConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream transcription and analysis services.
///
/// An empty API key (or empty transcription URL) means the service is not
/// configured; the pipeline then runs on its fallback values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Base URL of the Gemini REST API
    pub analysis_base_url: String,
    /// Multimodal model used for live and final analysis
    pub analysis_model: String,
    pub analysis_api_key: String,
    /// Base URL of an OpenAI-compatible transcription API
    pub transcription_base_url: String,
    pub transcription_model: String,
    pub transcription_api_key: String,
    /// Per-request timeout for both services
    pub request_timeout_secs: u64,
}

/// Live evaluation tuning.
///
/// ## Fields:
/// - `batch_threshold`: number of audio fragments per dispatched batch
/// - `live_score_max`: upper bound of live content/delivery/engagement scores
/// - `neutral_score`: value substituted for missing or malformed live scores
/// - `finalize_timeout_ms`: how long ending a session waits for in-flight analysis
/// - `rubric`: final scoring categories with their maxima and fallback values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub batch_threshold: usize,
    pub live_score_max: f64,
    pub neutral_score: f64,
    pub finalize_timeout_ms: u64,
    pub rubric: Vec<RubricCategory>,
}

impl EvaluationConfig {
    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Higher concurrent sessions: More presenters, but more upstream calls in flight
/// - Heartbeat values control how fast dead WebSocket connections are detected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Record store settings. With `persist = false` records live only in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub persist: bool,
    pub data_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 5001,
            },
            services: ServicesConfig {
                analysis_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                analysis_model: "gemini-1.5-pro".to_string(),
                analysis_api_key: String::new(),
                transcription_base_url: String::new(),
                transcription_model: "whisper-1".to_string(),
                transcription_api_key: String::new(),
                request_timeout_secs: 30,
            },
            evaluation: EvaluationConfig {
                batch_threshold: 10,        // ~2.5 seconds of browser audio chunks
                live_score_max: 10.0,
                neutral_score: 5.0,
                finalize_timeout_ms: 15_000,
                rubric: default_rubric(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 50,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            storage: StorageConfig {
                persist: false,
                data_dir: "data".to_string(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_EVALUATION__BATCH_THRESHOLD=20`: Bigger audio batches
    /// - `APP_STORAGE__PERSIST=true`: Mirror records to JSON files
    /// - `HOST`, `PORT`: Special cases for deployment platforms
    /// - `GEMINI_API_KEY`: Key for the analysis service
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY") {
            settings = settings.set_override("services.analysis_api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Batches contain at least one fragment
    /// - At least one session is allowed
    /// - Heartbeats fire at a non-zero interval, shorter than the client timeout
    /// - The rubric is non-empty and every fallback score fits under its maximum
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.evaluation.batch_threshold == 0 {
            return Err(anyhow::anyhow!("Batch threshold must be greater than 0"));
        }

        if self.evaluation.live_score_max <= 0.0 {
            return Err(anyhow::anyhow!("Live score maximum must be positive"));
        }

        if !(0.0..=self.evaluation.live_score_max).contains(&self.evaluation.neutral_score) {
            return Err(anyhow::anyhow!("Neutral score must lie within [0, live_score_max]"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.performance.client_timeout_secs,
                self.performance.heartbeat_interval_secs
            ));
        }

        if self.evaluation.rubric.is_empty() {
            return Err(anyhow::anyhow!("Rubric must contain at least one category"));
        }

        for category in &self.evaluation.rubric {
            if category.max_score < 0.0 {
                return Err(anyhow::anyhow!(
                    "Rubric category '{}' has a negative maximum",
                    category.name
                ));
            }
            if category.default_score < 0.0 || category.default_score > category.max_score {
                return Err(anyhow::anyhow!(
                    "Rubric category '{}' default score must lie within [0, {}]",
                    category.name,
                    category.max_score
                ));
            }
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON are touched, so
    /// `{"evaluation": {"batch_threshold": 20}}` changes just the threshold.
    /// Running sessions keep the settings they were created with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(evaluation) = partial_config.get("evaluation") {
            if let Some(threshold) = evaluation.get("batch_threshold").and_then(|v| v.as_u64()) {
                self.evaluation.batch_threshold = threshold as usize;
            }
            if let Some(max) = evaluation.get("live_score_max").and_then(|v| v.as_f64()) {
                self.evaluation.live_score_max = max;
            }
            if let Some(timeout) = evaluation.get("finalize_timeout_ms").and_then(|v| v.as_u64()) {
                self.evaluation.finalize_timeout_ms = timeout;
            }
            if let Some(rubric) = evaluation.get("rubric") {
                self.evaluation.rubric = serde_json::from_value(rubric.clone())?;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Whether the analysis service has credentials.
    pub fn analysis_configured(&self) -> bool {
        !self.services.analysis_api_key.trim().is_empty()
    }

    /// Whether a transcription endpoint is set.
    pub fn transcription_configured(&self) -> bool {
        !self.services.transcription_base_url.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.evaluation.batch_threshold, 10);
        assert_eq!(config.evaluation.rubric.len(), 7);
        assert!(config.validate().is_ok());
        assert!(!config.analysis_configured());
        assert!(!config.transcription_configured());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.evaluation.batch_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.evaluation.rubric[0].default_score = 1000.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.evaluation.rubric.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.client_timeout_secs = config.performance.heartbeat_interval_secs;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.heartbeat_interval_secs = 5;
        config.performance.client_timeout_secs = 10;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"evaluation": {"batch_threshold": 4, "finalize_timeout_ms": 500}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.evaluation.batch_threshold, 4);
        assert_eq!(config.evaluation.finalize_timeout(), Duration::from_millis(500));
        // Other fields should remain unchanged
        assert_eq!(config.server.port, 5001);
    }

    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
        assert!(config.update_from_json(r#"{"evaluation": {"batch_threshold": 0}}"#).is_err());
    }

    #[test]
    fn test_config_update_replaces_rubric() {
        let mut config = AppConfig::default();
        let json = r#"{"evaluation": {"rubric": [
            {"name": "Project Content", "max_score": 20.0, "default_score": 10.0}
        ]}}"#;
        config.update_from_json(json).unwrap();
        assert_eq!(config.evaluation.rubric.len(), 1);
        assert_eq!(config.evaluation.rubric[0].name, "Project Content");
    }
}
