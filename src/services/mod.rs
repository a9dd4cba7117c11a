//! # External Services
//!
//! Contracts for the collaborators the live pipeline talks to, plus the adapters
//! wired in by `main`.
//!
//! ## Key Components:
//! - **Transcriber**: audio bytes → text (`transcription.rs`, OpenAI-compatible HTTP API)
//! - **Analyzer**: transcript fragments and slides → live scores, questions, final report
//!   and rubric scores (`gemini.rs`)
//! - **RecordStore**: create/read/update of session and evaluation records
//!   (`record_store.rs`)
//!
//! ## Why traits:
//! The pipeline only sees `Arc<dyn Transcriber>` etc., so tests swap in scripted
//! doubles and deployments can swap providers without touching session code.

pub mod gemini;
pub mod record_store;
pub mod transcription;

#[cfg(test)]
pub mod mock;

use crate::error::EvalResult;
use crate::scoring::rubric::RubricCategory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub use gemini::GeminiAnalyzer;
pub use record_store::{JsonRecordStore, RecordStore};
pub use transcription::HttpTranscriber;

/// Text returned by a transcriber for empty or garbled audio.
pub const UNRECOGNIZED_AUDIO: &str = "unrecognized";

/// Speech-to-text contract.
///
/// Recognition failures are `TransientUpstreamFailure`; audio that contains no
/// recognizable speech returns [`UNRECOGNIZED_AUDIO`] instead of failing.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> EvalResult<String>;

    /// Whether the transcriber has an endpoint to call
    fn is_configured(&self) -> bool;
}

/// Partial scores for one transcript fragment.
///
/// All scores are always present: missing or malformed upstream fields are
/// replaced with the neutral score before this value is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveAnalysis {
    pub content_score: f64,
    pub delivery_score: f64,
    pub engagement_score: f64,
    pub question: Option<String>,
}

impl LiveAnalysis {
    pub fn neutral(score: f64) -> Self {
        Self {
            content_score: score,
            delivery_score: score,
            engagement_score: score,
            question: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strength {
    pub metric: String,
    pub observation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub metric: String,
    pub recommendation: String,
}

/// Qualitative end-of-session feedback: exactly three of each list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitativeReport {
    pub strengths: Vec<Strength>,
    pub improvements: Vec<Improvement>,
}

impl QualitativeReport {
    pub const ITEMS: usize = 3;

    /// Fixed report used whenever the full-transcript analysis fails.
    pub fn fallback() -> Self {
        let strength = |metric: &str, observation: &str| Strength {
            metric: metric.to_string(),
            observation: observation.to_string(),
        };
        let improvement = |metric: &str, recommendation: &str| Improvement {
            metric: metric.to_string(),
            recommendation: recommendation.to_string(),
        };

        Self {
            strengths: vec![
                strength("content", "Clear structure"),
                strength("delivery", "Good pacing"),
                strength("engagement", "Maintained interest"),
            ],
            improvements: vec![
                improvement("content", "Add more examples"),
                improvement("delivery", "Vary vocal tone"),
                improvement("engagement", "Use more visuals"),
            ],
        }
    }

    pub fn is_complete(&self) -> bool {
        self.strengths.len() == Self::ITEMS && self.improvements.len() == Self::ITEMS
    }
}

/// Raw rubric scoring result, before clamping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RubricAssessment {
    pub scores: HashMap<String, f64>,
    pub feedback: BTreeMap<String, String>,
}

/// Multimodal analysis contract.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Score one transcript fragment, optionally with the current slide visual.
    /// A missing or malformed reply yields neutral scores rather than an error.
    async fn analyze_chunk(&self, fragment: &str, slide: Option<&str>) -> EvalResult<LiveAnalysis>;

    /// Strengths and improvements for the whole transcript.
    async fn analyze_full(&self, transcript: &str) -> EvalResult<QualitativeReport>;

    /// Per-category rubric scores for the whole session.
    async fn score_rubric(
        &self,
        transcript: &str,
        questions: &[String],
        rubric: &[RubricCategory],
    ) -> EvalResult<RubricAssessment>;

    fn is_configured(&self) -> bool;
}
