//! # Session Registry
//!
//! Process-wide map from connection id to the live session started on that
//! connection. The registry is the only owner of `LiveSession` values; workers and
//! the lifecycle controller hold `Arc`s and touch session data through the
//! synchronized accessors below.
//!
//! ## Locking:
//! Each session has one `parking_lot::Mutex` around all of its mutable state. No
//! accessor holds it across an `.await`, which keeps the receive path from ever
//! waiting on an upstream call.

use super::aggregator::{AudioAggregator, AudioBatch};
use super::state::SessionState;
use crate::config::AppConfig;
use crate::error::{EvalResult, EvaluationError};
use crate::scoring::rubric::RubricCategory;
use crate::scoring::{FinalizationInput, LiveScoreSample};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Evaluation settings captured when a session is created. Later config updates
/// do not reach running sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub batch_threshold: usize,
    pub live_score_max: f64,
    pub finalize_timeout: Duration,
    pub rubric: Vec<RubricCategory>,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_threshold: config.evaluation.batch_threshold,
            live_score_max: config.evaluation.live_score_max,
            finalize_timeout: config.evaluation.finalize_timeout(),
            rubric: config.evaluation.rubric.clone(),
        }
    }
}

/// Result of buffering one audio fragment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendOutcome {
    Buffered { buffered: usize },
    Dispatched { sequence: u64 },
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    audio: AudioAggregator,
    batch_tx: Option<UnboundedSender<AudioBatch>>,
    transcript: String,
    current_slide: Option<String>,
    samples: Vec<LiveScoreSample>,
    questions: Vec<String>,
    batches_settled: u64,
    aborted_cycles: u32,
    discarded_fragments: usize,
}

/// One presentation being evaluated.
#[derive(Debug)]
pub struct LiveSession {
    pub session_id: String,
    pub connection_id: String,
    pub presentation_id: String,
    pub created_at: DateTime<Utc>,
    settings: SessionSettings,
    inner: Mutex<SessionInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Read-only view of a session for the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub presentation_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub fragments_received: u64,
    pub buffered_fragments: usize,
    pub batches_dispatched: u64,
    pub batches_settled: u64,
    pub live_samples: usize,
    pub questions: usize,
    pub transcript_chars: usize,
    pub has_slide: bool,
}

impl LiveSession {
    /// Build a session and the receiving end of its work queue.
    pub fn new(
        connection_id: &str,
        presentation_id: &str,
        settings: SessionSettings,
    ) -> (Self, UnboundedReceiver<AudioBatch>) {
        let (batch_tx, batch_rx) = unbounded_channel();
        let session = Self {
            session_id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            presentation_id: presentation_id.to_string(),
            created_at: Utc::now(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                audio: AudioAggregator::new(settings.batch_threshold),
                batch_tx: Some(batch_tx),
                transcript: String::new(),
                current_slide: None,
                samples: Vec::new(),
                questions: Vec::new(),
                batches_settled: 0,
                aborted_cycles: 0,
                discarded_fragments: 0,
            }),
            settings,
            worker: Mutex::new(None),
        };
        (session, batch_rx)
    }

    /// Broadcast group of this session.
    pub fn group_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn transition(&self, next: SessionState) -> EvalResult<bool> {
        self.inner.lock().state.advance(next)
    }

    /// Buffer one fragment, detaching and queueing a batch when the threshold is hit.
    ///
    /// Push, detach and enqueue happen under the session lock, so concurrent
    /// appends can never split or duplicate a batch.
    pub fn append_audio(&self, fragment: Vec<u8>) -> EvalResult<AppendOutcome> {
        let mut inner = self.inner.lock();
        if !inner.state.accepts_audio() {
            return Err(EvaluationError::NotAcceptingAudio(self.session_id.clone()));
        }

        match inner.audio.push(fragment) {
            None => Ok(AppendOutcome::Buffered {
                buffered: inner.audio.buffered(),
            }),
            Some(batch) => {
                let sequence = batch.sequence;
                let sent = inner.batch_tx.as_ref().map(|tx| tx.send(batch).is_ok()).unwrap_or(false);
                if !sent {
                    warn!(session_id = %self.session_id, sequence, "Work queue closed, batch dropped");
                }
                Ok(AppendOutcome::Dispatched { sequence })
            }
        }
    }

    /// Enter `Ending`: stop accepting audio, discard the partial buffer and close
    /// the work queue so the worker exits once queued batches are done.
    ///
    /// Returns false if the session was already ending or completed.
    pub fn begin_ending(&self) -> EvalResult<bool> {
        let mut inner = self.inner.lock();
        if !inner.state.advance(SessionState::Ending)? {
            return Ok(false);
        }
        inner.discarded_fragments = inner.audio.discard();
        inner.batch_tx = None;
        Ok(true)
    }

    pub fn attach_worker(&self, handle: JoinHandle<()>) {
        *self.worker.lock() = Some(handle);
    }

    pub fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker.lock().take()
    }

    pub fn set_slide(&self, image: String) {
        self.inner.lock().current_slide = Some(image);
    }

    pub fn current_slide(&self) -> Option<String> {
        self.inner.lock().current_slide.clone()
    }

    pub fn append_transcript(&self, text: &str) {
        let mut inner = self.inner.lock();
        inner.transcript.push_str(text);
        inner.transcript.push(' ');
    }

    pub fn transcript(&self) -> String {
        self.inner.lock().transcript.trim_end().to_string()
    }

    pub fn record_sample(&self, sample: LiveScoreSample) {
        let mut inner = self.inner.lock();
        if let Some(question) = &sample.question {
            inner.questions.push(question.clone());
        }
        inner.samples.push(sample);
    }

    pub fn samples(&self) -> Vec<LiveScoreSample> {
        self.inner.lock().samples.clone()
    }

    /// Called by the worker after each batch, successful or not.
    pub fn mark_settled(&self) {
        self.inner.lock().batches_settled += 1;
    }

    /// Count every dispatched batch that never settled as an aborted cycle.
    pub fn record_aborted(&self) -> u32 {
        let mut inner = self.inner.lock();
        let pending = inner.audio.batches_dispatched().saturating_sub(inner.batches_settled);
        inner.aborted_cycles = u32::try_from(pending).unwrap_or(u32::MAX);
        inner.aborted_cycles
    }

    pub fn finalization_input(&self) -> FinalizationInput {
        let inner = self.inner.lock();
        FinalizationInput {
            session_id: self.session_id.clone(),
            presentation_id: self.presentation_id.clone(),
            transcript: inner.transcript.trim_end().to_string(),
            samples: inner.samples.clone(),
            questions: inner.questions.clone(),
            aborted_cycles: inner.aborted_cycles,
            discarded_fragments: inner.discarded_fragments,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        SessionSnapshot {
            session_id: self.session_id.clone(),
            presentation_id: self.presentation_id.clone(),
            state: inner.state,
            created_at: self.created_at,
            fragments_received: inner.audio.fragments_received(),
            buffered_fragments: inner.audio.buffered(),
            batches_dispatched: inner.audio.batches_dispatched(),
            batches_settled: inner.batches_settled,
            live_samples: inner.samples.len(),
            questions: inner.questions.len(),
            transcript_chars: inner.transcript.trim_end().len(),
            has_slide: inner.current_slide.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_sessions: usize,
    pub by_state: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<LiveSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session for a connection.
    ///
    /// Fails with `DuplicateSession` if the connection already has one and with
    /// `CapacityExceeded` when `capacity` sessions are live.
    pub fn create(
        &self,
        connection_id: &str,
        presentation_id: &str,
        settings: SessionSettings,
        capacity: usize,
    ) -> EvalResult<(Arc<LiveSession>, UnboundedReceiver<AudioBatch>)> {
        let mut sessions = self.sessions.write();

        if sessions.contains_key(connection_id) {
            return Err(EvaluationError::DuplicateSession(connection_id.to_string()));
        }
        if sessions.len() >= capacity {
            return Err(EvaluationError::CapacityExceeded(capacity));
        }

        let (session, batch_rx) = LiveSession::new(connection_id, presentation_id, settings);
        let session = Arc::new(session);
        sessions.insert(connection_id.to_string(), Arc::clone(&session));
        Ok((session, batch_rx))
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<LiveSession>> {
        self.sessions.read().get(connection_id).cloned()
    }

    pub fn get_by_session_id(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        self.sessions
            .read()
            .values()
            .find(|s| s.session_id == session_id)
            .cloned()
    }

    /// Drop the registry's reference. Broadcast membership is released by the
    /// lifecycle controller alongside this call.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<LiveSession>> {
        self.sessions.write().remove(connection_id)
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self.sessions.read().values().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read();
        let mut by_state = BTreeMap::new();
        for session in sessions.values() {
            *by_state.entry(session.state().as_str().to_string()).or_insert(0) += 1;
        }
        RegistrySummary {
            total_sessions: sessions.len(),
            by_state,
        }
    }
}
