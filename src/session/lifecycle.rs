//! # Session Lifecycle Controller
//!
//! Drives a session from registration to its final report:
//!
//! 1. **start**: register, spawn the worker, join the broadcast group (`active`),
//!    create the session and evaluation records
//! 2. **ingest_audio / update_slide**: synchronous, never wait on upstream calls
//! 3. **end**: `ending`, wait for the worker to drain (bounded by the finalize
//!    timeout, aborting it on expiry), build and persist the final report,
//!    publish `session_ended`, `completed`, release the session
//!
//! A lost connection takes the same path as an explicit end. Ending twice is a no-op.
//! Server shutdown ends every remaining session the same way (`shutdown`).
//!
//! Persistence failures are logged and sent to the group as `error` events; they
//! never undo in-memory progress or stop finalization.

use super::broadcast::{BroadcastHub, EventSender, ServerEvent};
use super::registry::{AppendOutcome, LiveSession, SessionRegistry, SessionSettings};
use super::state::SessionState;
use super::worker::EvaluationWorker;
use super::PipelineServices;
use crate::config::AppConfig;
use crate::error::{EvalResult, EvaluationError};
use crate::scoring::{FinalReport, ScoreAggregator};
use crate::services::record_store::SessionRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Extra time shutdown allows for sessions finalized by another caller, on top of
/// their finalize timeout, to cover the final report calls.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Explicit,
    Disconnected,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Explicit => "explicit",
            EndReason::Disconnected => "disconnected",
        }
    }
}

#[derive(Clone)]
pub struct LifecycleController {
    registry: Arc<SessionRegistry>,
    hub: Arc<BroadcastHub>,
    services: PipelineServices,
}

impl LifecycleController {
    pub fn new(registry: Arc<SessionRegistry>, hub: Arc<BroadcastHub>, services: PipelineServices) -> Self {
        Self { registry, hub, services }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    /// Start a session for `connection_id` using the evaluation settings in `config`.
    pub async fn start(
        &self,
        connection_id: &str,
        presentation_id: &str,
        events: EventSender,
        config: &AppConfig,
    ) -> EvalResult<Arc<LiveSession>> {
        let (session, batches) = self.registry.create(
            connection_id,
            presentation_id,
            SessionSettings::from_config(config),
            config.performance.max_concurrent_sessions,
        )?;

        let worker = EvaluationWorker::new(Arc::clone(&session), self.services.clone(), Arc::clone(&self.hub));
        session.attach_worker(worker.spawn(batches));

        self.hub.join(session.group_id(), connection_id, events);
        session.transition(SessionState::Active)?;

        info!(
            session_id = %session.session_id,
            connection_id,
            presentation_id,
            "Session started"
        );

        let store = &self.services.store;
        let record = SessionRecord::new(&session.session_id, presentation_id);
        let persisted = async {
            store.create_session(record).await?;
            store.update_status(&session.session_id, SessionState::Active).await?;
            store.create_evaluation(&session.session_id, presentation_id).await
        }
        .await;
        if let Err(e) = persisted {
            self.persistence_failed(&session, &e);
        }

        Ok(session)
    }

    pub fn ingest_audio(&self, connection_id: &str, fragment: Vec<u8>) -> EvalResult<AppendOutcome> {
        let session = self
            .registry
            .get(connection_id)
            .ok_or_else(|| EvaluationError::SessionNotFound(connection_id.to_string()))?;
        session.append_audio(fragment)
    }

    pub fn update_slide(&self, connection_id: &str, image: String) -> EvalResult<()> {
        let session = self
            .registry
            .get(connection_id)
            .ok_or_else(|| EvaluationError::SessionNotFound(connection_id.to_string()))?;
        session.set_slide(image);
        Ok(())
    }

    /// End the session on `connection_id` and return its final report.
    ///
    /// Returns `Ok(None)` when another caller is already finalizing the session.
    pub async fn end(&self, connection_id: &str, reason: EndReason) -> EvalResult<Option<FinalReport>> {
        let session = self
            .registry
            .get(connection_id)
            .ok_or_else(|| EvaluationError::SessionNotFound(connection_id.to_string()))?;

        if !session.begin_ending()? {
            return Ok(None);
        }

        let session_id = session.session_id.clone();
        info!(session_id = %session_id, reason = reason.as_str(), "Session ending");

        if let Err(e) = self.services.store.update_status(&session_id, SessionState::Ending).await {
            self.persistence_failed(&session, &e);
        }

        self.settle_worker(&session).await;

        let aggregator = ScoreAggregator::new(
            Arc::clone(&self.services.analyzer),
            session.settings().rubric.clone(),
        );
        let report = aggregator.finalize(session.finalization_input()).await;

        session.transition(SessionState::Completed)?;
        self.persist_report(&session, &report).await;

        self.hub.publish(
            session.group_id(),
            ServerEvent::SessionEnded {
                session_id: session_id.clone(),
                report: Box::new(report.clone()),
            },
        );

        self.hub.remove_group(session.group_id());
        self.registry.remove(connection_id);
        self.services.stats.record_completed(report.aborted_cycles);

        info!(
            session_id = %session_id,
            total = report.total,
            aborted_cycles = report.aborted_cycles,
            "Session completed"
        );
        Ok(Some(report))
    }

    /// Finalize every live session. Runs at server shutdown while connections are
    /// still open, so each session reaches `completed` with its report stored.
    ///
    /// Sessions another caller is already finalizing are waited for, bounded by
    /// their finalize timeout plus a grace period. Returns how many sessions this
    /// call finalized itself.
    pub async fn shutdown(&self) -> usize {
        let connections = self.registry.connection_ids();
        if connections.is_empty() {
            return 0;
        }

        let wait = connections
            .iter()
            .filter_map(|c| self.registry.get(c))
            .map(|s| s.settings().finalize_timeout)
            .max()
            .unwrap_or_default()
            + SHUTDOWN_GRACE;

        info!(sessions = connections.len(), "Finalizing live sessions before shutdown");

        let ends = connections.iter().map(|c| self.end(c, EndReason::Disconnected));
        let finalized = futures_util::future::join_all(ends)
            .await
            .into_iter()
            .filter(|result| matches!(result, Ok(Some(_))))
            .count();

        let deadline = tokio::time::Instant::now() + wait;
        while !self.registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !self.registry.is_empty() {
            warn!(remaining = self.registry.len(), "Sessions still finalizing at shutdown");
        }

        finalized
    }

    /// Wait for the worker to drain its queue, aborting it when the session's
    /// finalize timeout expires.
    async fn settle_worker(&self, session: &LiveSession) {
        let Some(mut handle) = session.take_worker() else {
            return;
        };

        let timeout = session.settings().finalize_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %session.session_id, error = %e, "Evaluation worker terminated abnormally");
                session.record_aborted();
            }
            Err(_) => {
                handle.abort();
                let aborted = session.record_aborted();
                warn!(
                    session_id = %session.session_id,
                    timeout_ms = timeout.as_millis() as u64,
                    aborted,
                    "Evaluation worker timed out, finalizing with partial data"
                );
            }
        }
    }

    async fn persist_report(&self, session: &LiveSession, report: &FinalReport) {
        let store = &self.services.store;
        let session_id = session.session_id.as_str();
        let persisted = async {
            store.update_analysis(session_id, &report.live).await?;
            store.complete_evaluation(session_id, report).await?;
            store.update_status(session_id, SessionState::Completed).await
        }
        .await;

        if let Err(e) = persisted {
            self.persistence_failed(session, &e);
        }
    }

    fn persistence_failed(&self, session: &LiveSession, err: &EvaluationError) {
        self.services.stats.record_persistence_failure();
        warn!(session_id = %session.session_id, error = %err, "Record store update failed");
        self.hub.publish(session.group_id(), ServerEvent::from_error(err));
    }
}
