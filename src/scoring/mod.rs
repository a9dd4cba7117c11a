//! # Scoring
//!
//! Everything that turns a session's raw signals into numbers:
//!
//! - **rubric.rs**: rubric categories, clamping, conservative defaults
//! - **aggregator.rs**: live score samples and the end-of-session `FinalReport`

pub mod aggregator;
pub mod rubric;

pub use aggregator::{FinalReport, FinalizationInput, LiveScoreSample, LiveSummary, ScoreAggregator};
