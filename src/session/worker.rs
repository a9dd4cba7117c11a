//! # Evaluation Worker
//!
//! One task per session drains the session's work queue. Because a single task owns
//! the receiver, batches are processed strictly in detach order and at most one
//! transcription/analysis cycle is in flight per session, while the WebSocket actor
//! keeps accepting audio.
//!
//! ## Per batch:
//! 1. Transcribe; failures and empty results become the `unrecognized` marker
//! 2. Append to the transcript, publish `transcript_update`
//! 3. Analyze with the current slide
//! 4. On success record a sample and publish `live_score_update`, then `ai_question`
//! 5. On failure publish `error` and record nothing
//! 6. Persist the transcript entry

use super::aggregator::AudioBatch;
use super::broadcast::{BroadcastHub, ServerEvent};
use super::registry::LiveSession;
use super::PipelineServices;
use crate::scoring::LiveScoreSample;
use crate::services::record_store::TranscriptEntry;
use crate::services::UNRECOGNIZED_AUDIO;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct EvaluationWorker {
    session: Arc<LiveSession>,
    services: PipelineServices,
    hub: Arc<BroadcastHub>,
}

impl EvaluationWorker {
    pub fn new(session: Arc<LiveSession>, services: PipelineServices, hub: Arc<BroadcastHub>) -> Self {
        Self { session, services, hub }
    }

    /// Run the worker on its own task until the session's queue is closed and drained.
    pub fn spawn(self, batches: UnboundedReceiver<AudioBatch>) -> JoinHandle<()> {
        tokio::spawn(self.run(batches))
    }

    async fn run(self, mut batches: UnboundedReceiver<AudioBatch>) {
        debug!(session_id = %self.session.session_id, "Evaluation worker started");
        while let Some(batch) = batches.recv().await {
            self.process(batch).await;
        }
        debug!(session_id = %self.session.session_id, "Evaluation worker drained");
    }

    pub async fn process(&self, batch: AudioBatch) {
        let session_id = self.session.session_id.as_str();
        let group = self.session.group_id();
        let sequence = batch.sequence;
        debug!(session_id, sequence, fragments = batch.fragments.len(), "Processing batch");

        let text = match self.services.transcriber.transcribe(&batch.bytes()).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => UNRECOGNIZED_AUDIO.to_string(),
            Err(e) => {
                self.services.stats.record_upstream_failure();
                warn!(session_id, sequence, error = %e, "Transcription failed, continuing with marker");
                UNRECOGNIZED_AUDIO.to_string()
            }
        };

        self.session.append_transcript(&text);
        let entry = TranscriptEntry {
            sequence,
            text: text.clone(),
            timestamp: Utc::now(),
        };
        self.hub.publish(group, ServerEvent::TranscriptUpdate {
            text: text.clone(),
            sequence,
        });

        let slide = self.session.current_slide();
        match self.services.analyzer.analyze_chunk(&text, slide.as_deref()).await {
            Ok(analysis) => {
                let max = self.session.settings().live_score_max;
                let clamp = |score: f64| if score.is_finite() { score.clamp(0.0, max) } else { 0.0 };

                let sample = LiveScoreSample {
                    sequence,
                    content: clamp(analysis.content_score),
                    delivery: clamp(analysis.delivery_score),
                    engagement: clamp(analysis.engagement_score),
                    question: analysis.question,
                    timestamp: Utc::now(),
                };

                self.hub.publish(group, ServerEvent::LiveScoreUpdate {
                    content: sample.content,
                    delivery: sample.delivery,
                    engagement: sample.engagement,
                    sequence,
                });
                if let Some(question) = &sample.question {
                    self.hub.publish(group, ServerEvent::AiQuestion {
                        question: question.clone(),
                        timestamp: batch.dispatched_at,
                    });
                }

                info!(session_id, sequence, content = sample.content, "Live scores published");
                self.session.record_sample(sample);
            }
            Err(e) => {
                self.services.stats.record_upstream_failure();
                if e.is_recoverable() {
                    warn!(session_id, sequence, error = %e, "Live analysis failed");
                } else {
                    error!(session_id, sequence, error = %e, "Live analysis failed");
                }
                self.hub.publish(group, ServerEvent::from_error(&e));
            }
        }

        // Persisted last, so a slow store never delays this batch's live events.
        if let Err(e) = self.services.store.append_transcript_entry(session_id, entry).await {
            self.services.stats.record_persistence_failure();
            warn!(session_id, sequence, error = %e, "Failed to persist transcript entry");
            self.hub.publish(group, ServerEvent::from_error(&e));
        }

        self.session.mark_settled();
        self.services.stats.record_batch();
    }
}
