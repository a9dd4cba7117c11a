//! # Score Aggregation
//!
//! Builds the final report of a session from its transcript, the live score samples
//! recorded while it ran, and two upstream calls: the qualitative full-transcript
//! analysis and rubric scoring.
//!
//! ## Guarantees:
//! - Every rubric category is present and clamped to `[0, max_score]`
//! - `total` is exactly the sum of the category scores
//! - Upstream failures never prevent a report: the qualitative part falls back to a
//!   fixed report and rubric scores fall back to the rubric's defaults

use super::rubric::{clamp_scores, default_scores, CategoryScore, RubricCategory};
use crate::services::{Analyzer, Improvement, QualitativeReport, Strength};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Feedback key carrying the failure message when rubric scoring falls back.
pub const RUBRIC_ERROR_KEY: &str = "error";

/// Live scores produced by one analyzed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveScoreSample {
    pub sequence: u64,
    pub content: f64,
    pub delivery: f64,
    pub engagement: f64,
    pub question: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Averages over a session's live score samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveSummary {
    pub samples: usize,
    pub avg_content: f64,
    pub avg_delivery: f64,
    pub avg_engagement: f64,
}

impl LiveSummary {
    pub fn from_samples(samples: &[LiveScoreSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let n = samples.len() as f64;
        let avg = |f: fn(&LiveScoreSample) -> f64| samples.iter().map(f).sum::<f64>() / n;

        Self {
            samples: samples.len(),
            avg_content: avg(|s| s.content),
            avg_delivery: avg(|s| s.delivery),
            avg_engagement: avg(|s| s.engagement),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub session_id: String,
    pub presentation_id: String,
    pub scores: Vec<CategoryScore>,
    pub total: f64,
    pub max_total: f64,
    pub strengths: Vec<Strength>,
    pub improvements: Vec<Improvement>,
    pub feedback: BTreeMap<String, String>,
    pub live: LiveSummary,
    pub questions: Vec<String>,
    /// Worker cycles cut short by the finalization timeout
    pub aborted_cycles: u32,
    /// Buffered fragments that never reached a batch
    pub discarded_fragments: usize,
    pub completed_at: DateTime<Utc>,
}

/// Snapshot of a session taken once its worker has settled.
#[derive(Debug, Clone, Default)]
pub struct FinalizationInput {
    pub session_id: String,
    pub presentation_id: String,
    pub transcript: String,
    pub samples: Vec<LiveScoreSample>,
    pub questions: Vec<String>,
    pub aborted_cycles: u32,
    pub discarded_fragments: usize,
}

pub struct ScoreAggregator {
    analyzer: Arc<dyn Analyzer>,
    rubric: Vec<RubricCategory>,
}

impl ScoreAggregator {
    pub fn new(analyzer: Arc<dyn Analyzer>, rubric: Vec<RubricCategory>) -> Self {
        Self { analyzer, rubric }
    }

    /// Produce the final report. Never fails.
    pub async fn finalize(&self, input: FinalizationInput) -> FinalReport {
        let (qualitative, assessment) = tokio::join!(
            self.analyzer.analyze_full(&input.transcript),
            self.analyzer.score_rubric(&input.transcript, &input.questions, &self.rubric),
        );

        let qualitative = qualitative.unwrap_or_else(|e| {
            warn!(session_id = %input.session_id, error = %e, "Full transcript analysis failed, using default report");
            QualitativeReport::fallback()
        });

        let mut feedback = BTreeMap::new();
        let scores = match assessment {
            Ok(assessment) => {
                let scores = clamp_scores(&self.rubric, &assessment.scores);
                feedback.extend(
                    assessment
                        .feedback
                        .into_iter()
                        .filter(|(name, _)| self.rubric.iter().any(|c| &c.name == name)),
                );
                scores
            }
            Err(e) => {
                warn!(session_id = %input.session_id, error = %e, "Rubric scoring failed, using default scores");
                feedback.insert(RUBRIC_ERROR_KEY.to_string(), format!("Rubric scoring failed: {}", e));
                default_scores(&self.rubric)
            }
        };

        let total = scores.iter().map(|s| s.score).sum();
        let max_total = self.rubric.iter().map(|c| c.max_score).sum();

        info!(
            session_id = %input.session_id,
            total,
            samples = input.samples.len(),
            aborted_cycles = input.aborted_cycles,
            "Final report built"
        );

        FinalReport {
            session_id: input.session_id,
            presentation_id: input.presentation_id,
            scores,
            total,
            max_total,
            strengths: qualitative.strengths,
            improvements: qualitative.improvements,
            feedback,
            live: LiveSummary::from_samples(&input.samples),
            questions: input.questions,
            aborted_cycles: input.aborted_cycles,
            discarded_fragments: input.discarded_fragments,
            completed_at: Utc::now(),
        }
    }
}
