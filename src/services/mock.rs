//! Scripted service doubles for pipeline tests.

use super::record_store::{EvaluationRecord, RecordStore, SessionRecord, TranscriptEntry};
use super::{Analyzer, LiveAnalysis, QualitativeReport, RubricAssessment, Transcriber};
use crate::error::{EvalResult, EvaluationError};
use crate::scoring::rubric::RubricCategory;
use crate::scoring::{FinalReport, LiveSummary};
use crate::session::SessionState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Echoes the audio bytes back as text, so a transcript shows exactly which
/// fragments reached the worker.
#[derive(Default)]
pub struct ScriptedTranscriber {
    calls: AtomicUsize,
    fail_on: HashSet<usize>,
    silent_on: HashSet<usize>,
}

impl ScriptedTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th call (0-based).
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on.insert(n);
        self
    }

    /// Return blank text for the `n`th call, as for silence or noise.
    pub fn silent_on(mut self, n: usize) -> Self {
        self.silent_on.insert(n);
        self
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> EvalResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&call) {
            return Err(EvaluationError::TransientUpstreamFailure(format!("scripted failure {}", call)));
        }
        if self.silent_on.contains(&call) {
            return Ok("  ".to_string());
        }
        Ok(String::from_utf8_lossy(audio).into_owned())
    }

    fn is_configured(&self) -> bool {
        true
    }
}

pub struct ScriptedAnalyzer {
    calls: AtomicUsize,
    fail_chunk_on: HashSet<usize>,
    chunk_delay: Duration,
    question: Option<String>,
    rubric_scores: HashMap<String, f64>,
    fail_final: bool,
    fragments: Mutex<Vec<String>>,
}

impl Default for ScriptedAnalyzer {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_chunk_on: HashSet::new(),
            chunk_delay: Duration::ZERO,
            question: None,
            rubric_scores: HashMap::new(),
            fail_final: false,
            fragments: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th live analysis call (0-based).
    pub fn failing_chunk_on(mut self, n: usize) -> Self {
        self.fail_chunk_on.insert(n);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_question(mut self, question: &str) -> Self {
        self.question = Some(question.to_string());
        self
    }

    pub fn with_rubric_scores(mut self, scores: HashMap<String, f64>) -> Self {
        self.rubric_scores = scores;
        self
    }

    /// Fail both end-of-session calls.
    pub fn failing_final(mut self) -> Self {
        self.fail_final = true;
        self
    }

    /// Fragments seen by `analyze_chunk`, in call order.
    pub fn fragments(&self) -> Vec<String> {
        self.fragments.lock().clone()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze_chunk(&self, fragment: &str, _slide: Option<&str>) -> EvalResult<LiveAnalysis> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.chunk_delay.is_zero() {
            tokio::time::sleep(self.chunk_delay).await;
        }
        self.fragments.lock().push(fragment.to_string());

        if self.fail_chunk_on.contains(&call) {
            return Err(EvaluationError::MalformedUpstreamResponse(format!("scripted failure {}", call)));
        }

        Ok(LiveAnalysis {
            content_score: 7.0,
            delivery_score: 6.0,
            engagement_score: 8.0,
            question: self.question.clone(),
        })
    }

    async fn analyze_full(&self, _transcript: &str) -> EvalResult<QualitativeReport> {
        if self.fail_final {
            return Err(EvaluationError::TransientUpstreamFailure("scripted".to_string()));
        }
        Ok(QualitativeReport::fallback())
    }

    async fn score_rubric(
        &self,
        _transcript: &str,
        _questions: &[String],
        _rubric: &[RubricCategory],
    ) -> EvalResult<RubricAssessment> {
        if self.fail_final {
            return Err(EvaluationError::TransientUpstreamFailure("scripted".to_string()));
        }
        Ok(RubricAssessment {
            scores: self.rubric_scores.clone(),
            feedback: Default::default(),
        })
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// Every write fails as if the disk were gone; reads find nothing.
#[derive(Default)]
pub struct FailingStore {
    writes: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempted_writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn fail(&self) -> EvalResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(EvaluationError::PersistenceFailure("disk unavailable".to_string()))
    }
}

#[async_trait]
impl RecordStore for FailingStore {
    async fn create_session(&self, _record: SessionRecord) -> EvalResult<()> {
        self.fail()
    }

    async fn update_status(&self, _session_id: &str, _status: SessionState) -> EvalResult<()> {
        self.fail()
    }

    async fn update_analysis(&self, _session_id: &str, _summary: &LiveSummary) -> EvalResult<()> {
        self.fail()
    }

    async fn create_evaluation(&self, _session_id: &str, _presentation_id: &str) -> EvalResult<()> {
        self.fail()
    }

    async fn append_transcript_entry(&self, _session_id: &str, _entry: TranscriptEntry) -> EvalResult<()> {
        self.fail()
    }

    async fn complete_evaluation(&self, _session_id: &str, _report: &FinalReport) -> EvalResult<()> {
        self.fail()
    }

    async fn get_session(&self, _session_id: &str) -> EvalResult<Option<SessionRecord>> {
        Ok(None)
    }

    async fn get_evaluation(&self, _session_id: &str) -> EvalResult<Option<EvaluationRecord>> {
        Ok(None)
    }
}
