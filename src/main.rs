//! # Presentation Evaluator - Main Application Entry Point
//!
//! Actix-web server that evaluates live student presentations. Clients stream audio
//! and slide images over a WebSocket; the server batches the audio, sends it through
//! transcription and multimodal analysis, pushes live scores and follow-up questions
//! back, and produces a rubric-scored final report when the presentation ends.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML file + environment variables)
//! - **error**: Pipeline error taxonomy and HTTP error responses
//! - **state**: Shared application state and request metrics
//! - **session**: The live evaluation pipeline (registry, batching, worker, lifecycle)
//! - **scoring**: Rubric and final report aggregation
//! - **services**: Transcription, analysis and record store adapters
//! - **websocket**: The per-connection presentation actor
//! - **health / handlers / middleware**: HTTP surface

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod scoring;
mod services;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use services::{GeminiAnalyzer, HttpTranscriber, JsonRecordStore, RecordStore};
use session::{PipelineServices, PipelineStats};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the upstream adapters and record store**
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals, finalizing
///    every live session before the server stops
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting presentation-evaluator v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let services = build_services(&config).await?;
    let app_state = AppState::new(config.clone(), services);
    let lifecycle = app_state.lifecycle.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/live-sessions", web::get().to(handlers::list_live_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/evaluations/{id}", web::get().to(handlers::get_evaluation)),
            )
            .route("/ws/presentation", web::get().to(websocket::presentation_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, finalizing live sessions...");
            // Stop accepting connections, then finish sessions while their
            // sockets can still receive `session_ended`.
            server_handle.pause().await;
            let finalized = lifecycle.shutdown().await;
            info!(finalized, "Live sessions finalized, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Build the transcription and analysis adapters and the record store.
///
/// Missing credentials are not fatal: the pipeline runs on neutral scores and
/// fallback reports until they are configured.
async fn build_services(config: &AppConfig) -> Result<PipelineServices> {
    let analyzer = GeminiAnalyzer::new(&config.services, config.evaluation.neutral_score)?;
    let transcriber = HttpTranscriber::new(&config.services)?;

    if !config.analysis_configured() {
        warn!("GEMINI_API_KEY not set, live analysis will use neutral scores");
    }
    if !config.transcription_configured() {
        warn!("No transcription endpoint configured, transcripts will contain markers only");
    }

    let store: Arc<dyn RecordStore> = if config.storage.persist {
        Arc::new(JsonRecordStore::open(&config.storage.data_dir).await?)
    } else {
        info!("Record persistence disabled, keeping records in memory");
        Arc::new(JsonRecordStore::in_memory())
    };

    Ok(PipelineServices {
        transcriber: Arc::new(transcriber),
        analyzer: Arc::new(analyzer),
        store,
        stats: Arc::new(PipelineStats::default()),
    })
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "presentation_evaluator=trace")
/// - If not set, defaults to "presentation_evaluator=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "presentation_evaluator=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown (SIGTERM and SIGINT).
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
