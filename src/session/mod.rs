//! # Live Evaluation Pipeline
//!
//! Per-connection presentation sessions and everything that moves their audio
//! through transcription and analysis.
//!
//! ## Key Components:
//! - **state.rs**: lifecycle states and forward-only transitions
//! - **aggregator.rs**: fragment buffering and batch detachment
//! - **registry.rs**: the session map and per-session synchronized accessors
//! - **broadcast.rs**: broadcast groups and the server event vocabulary
//! - **worker.rs**: the per-session task that drains the work queue
//! - **lifecycle.rs**: start / ingest / end, including bounded finalization
//!
//! ## Flow:
//! ```text
//! audio frame -> registry lookup -> aggregator (threshold) -> work queue
//!     -> worker: transcribe -> analyze -> publish to group
//! end / disconnect -> ending -> drain (bounded) -> final report -> completed
//! ```

pub mod aggregator;
pub mod broadcast;
pub mod lifecycle;
pub mod registry;
pub mod state;
pub mod worker;

pub use broadcast::{BroadcastHub, EventSender, ServerEvent};
pub use lifecycle::{EndReason, LifecycleController};
pub use registry::{AppendOutcome, SessionRegistry};
pub use state::SessionState;

use crate::services::{Analyzer, RecordStore, Transcriber};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the pipeline, exposed by the metrics endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    batches_processed: AtomicU64,
    upstream_failures: AtomicU64,
    persistence_failures: AtomicU64,
    sessions_completed: AtomicU64,
    aborted_cycles: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatsSnapshot {
    pub batches_processed: u64,
    pub upstream_failures: u64,
    pub persistence_failures: u64,
    pub sessions_completed: u64,
    pub aborted_cycles: u64,
}

impl PipelineStats {
    pub fn record_batch(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, aborted_cycles: u32) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
        self.aborted_cycles.fetch_add(u64::from(aborted_cycles), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            aborted_cycles: self.aborted_cycles.load(Ordering::Relaxed),
        }
    }
}

/// The external collaborators every session shares.
#[derive(Clone)]
pub struct PipelineServices {
    pub transcriber: Arc<dyn Transcriber>,
    pub analyzer: Arc<dyn Analyzer>,
    pub store: Arc<dyn RecordStore>,
    pub stats: Arc<PipelineStats>,
}
