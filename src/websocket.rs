//! # Presentation WebSocket Handler
//!
//! Clients connect to `/ws/presentation`. Each connection is one actor and can run
//! one presentation session at a time.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: server sends `connection_ack` with the connection id
//! 2. **Start**: `{"type": "start_presentation", "presentation_id": "..."}` → `session_started`
//! 3. **Audio**: `{"type": "audio_chunk", "audio": "<base64 or data URL>"}` or a binary
//!    frame → `audio_ack`; every `batch_threshold` fragments the server emits
//!    `transcript_update`, `live_score_update` and possibly `ai_question`
//! 4. **Slides**: `{"type": "slide_image", "image": "<data URL>"}` → `slide_ack`
//! 5. **End**: `{"type": "end_presentation"}` → `session_ended` with the final report
//!
//! Closing the socket without ending finalizes the session the same way.
//!
//! ## Event delivery:
//! Every outgoing message, whether produced here or by the session's worker, goes
//! through one unbounded channel that the actor drains as a stream. That keeps a
//! single ordered path to the socket.

use crate::error::{EvalResult, EvaluationError};
use crate::session::{AppendOutcome, EndReason, EventSender, LifecycleController, ServerEvent};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::Engine;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Slides arrive as data URLs, well above the default 64 KiB frame limit.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Messages sent from presentation clients to the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartPresentation { presentation_id: String },
    AudioChunk { audio: String },
    SlideImage { image: String },
    EndPresentation,
}

/// Decode a base64 audio fragment, accepting an optional `data:...;base64,` prefix.
pub fn decode_audio(payload: &str) -> EvalResult<Vec<u8>> {
    let data = match payload.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| EvaluationError::InvalidAudio("data URL has no payload".to_string()))?,
        None => payload,
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| EvaluationError::InvalidAudio(e.to_string()))?;

    if bytes.is_empty() {
        return Err(EvaluationError::InvalidAudio("empty audio fragment".to_string()));
    }
    Ok(bytes)
}

/// WebSocket actor for one presentation client.
pub struct PresentationSocket {
    connection_id: String,
    app_state: web::Data<AppState>,
    lifecycle: LifecycleController,
    events: EventSender,
    pending_events: Option<UnboundedReceiver<ServerEvent>>,
    session_id: Option<String>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
}

impl PresentationSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let (events, pending_events) = unbounded_channel();
        let performance = app_state.get_config().performance;

        Self {
            connection_id: Uuid::new_v4().to_string(),
            lifecycle: app_state.lifecycle.clone(),
            app_state,
            events,
            pending_events: Some(pending_events),
            session_id: None,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_secs(performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(performance.client_timeout_secs),
        }
    }

    fn send(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!(connection_id = %self.connection_id, "Event channel closed");
        }
    }

    fn send_error(&self, err: &EvaluationError) {
        warn!(connection_id = %self.connection_id, error = %err, "Presentation error");
        self.send(ServerEvent::from_error(err));
    }

    fn handle_client_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg {
            ClientMessage::StartPresentation { presentation_id } => self.handle_start(presentation_id, ctx),
            ClientMessage::AudioChunk { audio } => match decode_audio(&audio) {
                Ok(bytes) => self.handle_audio(bytes),
                Err(err) => self.send_error(&err),
            },
            ClientMessage::SlideImage { image } => {
                match self.lifecycle.update_slide(&self.connection_id, image) {
                    Ok(()) => self.send(ServerEvent::SlideAck),
                    Err(err) => self.send_error(&err),
                }
            }
            ClientMessage::EndPresentation => self.handle_end(),
        }
    }

    /// Start runs inside `ctx.wait`, so frames that arrive meanwhile (typically the
    /// first audio chunks) are only handled once the session exists.
    fn handle_start(&mut self, presentation_id: String, ctx: &mut ws::WebsocketContext<Self>) {
        let lifecycle = self.lifecycle.clone();
        let connection_id = self.connection_id.clone();
        let events = self.events.clone();
        let config = self.app_state.get_config();
        let requested = presentation_id.clone();

        let start = async move { lifecycle.start(&connection_id, &requested, events, &config).await };

        ctx.wait(start.into_actor(self).map(move |result, act, _ctx| match result {
            Ok(session) => {
                act.session_id = Some(session.session_id.clone());
                act.app_state.increment_active_sessions();
                act.send(ServerEvent::SessionStarted {
                    session_id: session.session_id.clone(),
                    presentation_id,
                });
            }
            Err(err) => act.send_error(&err),
        }));
    }

    fn handle_audio(&mut self, bytes: Vec<u8>) {
        match self.lifecycle.ingest_audio(&self.connection_id, bytes) {
            Ok(AppendOutcome::Buffered { buffered }) => self.send(ServerEvent::AudioAck {
                buffered,
                dispatched: None,
            }),
            Ok(AppendOutcome::Dispatched { sequence }) => self.send(ServerEvent::AudioAck {
                buffered: 0,
                dispatched: Some(sequence),
            }),
            Err(err) => self.send_error(&err),
        }
    }

    /// Finalization runs detached from the actor so it survives the client closing
    /// the socket right after `end_presentation`.
    fn handle_end(&mut self) {
        let Some(session_id) = self.session_id.take() else {
            self.send_error(&EvaluationError::SessionNotFound(self.connection_id.clone()));
            return;
        };

        self.app_state.decrement_active_sessions();
        spawn_end(
            self.lifecycle.clone(),
            self.connection_id.clone(),
            session_id,
            EndReason::Explicit,
            Some(self.events.clone()),
        );
    }
}

fn spawn_end(
    lifecycle: LifecycleController,
    connection_id: String,
    session_id: String,
    reason: EndReason,
    events: Option<EventSender>,
) {
    tokio::spawn(end_session(lifecycle, connection_id, session_id, reason, events));
}

/// End a session and report a failure to the client when it can still be reached.
/// Returns whether a final report was produced by this call.
async fn end_session(
    lifecycle: LifecycleController,
    connection_id: String,
    session_id: String,
    reason: EndReason,
    events: Option<EventSender>,
) -> bool {
    match lifecycle.end(&connection_id, reason).await {
        Ok(Some(report)) => {
            info!(session_id = %session_id, reason = reason.as_str(), total = report.total, "Presentation finalized");
            true
        }
        Ok(None) => {
            debug!(session_id = %session_id, "Session already finalizing");
            false
        }
        Err(EvaluationError::SessionNotFound(_)) if reason == EndReason::Disconnected => {
            debug!(session_id = %session_id, "Session already finalized");
            false
        }
        Err(err) => {
            error!(session_id = %session_id, error = %err, "Failed to end session");
            if let Some(events) = events {
                if events.send(ServerEvent::from_error(&err)).is_err() {
                    debug!(connection_id = %connection_id, "Event channel closed before end error was delivered");
                }
            }
            false
        }
    }
}

impl Actor for PresentationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection started");

        if let Some(pending) = self.pending_events.take() {
            ctx.add_stream(UnboundedReceiverStream::new(pending));
        }
        self.send(ServerEvent::ConnectionAck {
            connection_id: self.connection_id.clone(),
        });

        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(connection_id = %act.connection_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "WebSocket connection stopped");

        if let Some(session_id) = self.session_id.take() {
            self.app_state.decrement_active_sessions();
            spawn_end(
                self.lifecycle.clone(),
                self.connection_id.clone(),
                session_id,
                EndReason::Disconnected,
                None,
            );
        } else if let Some(session) = self.lifecycle.registry().get(&self.connection_id) {
            // start was interrupted after registration
            if session.state().accepts_audio() {
                spawn_end(
                    self.lifecycle.clone(),
                    self.connection_id.clone(),
                    session.session_id.clone(),
                    EndReason::Disconnected,
                    None,
                );
            }
        }
    }
}

/// Outgoing events, drained from the connection's channel.
impl StreamHandler<ServerEvent> for PresentationSocket {
    fn handle(&mut self, event: ServerEvent, ctx: &mut Self::Context) {
        match serde_json::to_string(&event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(event = event.name(), error = %err, "Failed to serialize event"),
        }
    }

    /// The channel only closes when the actor itself is going away.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PresentationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.send(ServerEvent::error(format!("Invalid message: {}", err))),
            },
            Ok(ws::Message::Binary(data)) => {
                if data.is_empty() {
                    self.send_error(&EvaluationError::InvalidAudio("empty audio fragment".to_string()));
                } else {
                    self.handle_audio(data.to_vec());
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, ?reason, "WebSocket closed");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a new `PresentationSocket` actor.
pub async fn presentation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    ws::WsResponseBuilder::new(PresentationSocket::new(app_state), &req, stream)
        .frame_size(MAX_FRAME_SIZE)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use serde_json::json;

    #[test]
    fn test_client_message_parsing() {
        let start: ClientMessage =
            serde_json::from_value(json!({"type": "start_presentation", "presentation_id": "p-1"})).unwrap();
        assert_eq!(
            start,
            ClientMessage::StartPresentation {
                presentation_id: "p-1".to_string()
            }
        );

        let end: ClientMessage = serde_json::from_value(json!({"type": "end_presentation"})).unwrap();
        assert_eq!(end, ClientMessage::EndPresentation);

        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "audio_chunk"})).is_err());
        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "dance"})).is_err());
    }

    #[test]
    fn test_decode_audio_accepts_plain_and_data_urls() {
        assert_eq!(decode_audio("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_audio("data:audio/webm;codecs=opus;base64,aGVsbG8=").unwrap(), b"hello");
    }

    #[test]
    fn test_decode_audio_rejects_garbage() {
        assert_eq!(decode_audio("!!!").unwrap_err().kind(), "invalid_audio");
        assert_eq!(decode_audio("").unwrap_err().kind(), "invalid_audio");
        assert_eq!(decode_audio("data:audio/webm;base64").unwrap_err().kind(), "invalid_audio");
    }

    #[actix_web::test]
    async fn test_end_failure_reaches_client_or_is_dropped_quietly() {
        let state = test_state();
        let (tx, mut rx) = unbounded_channel();
        let ended = end_session(
            state.lifecycle.clone(),
            "conn-missing".to_string(),
            "session-missing".to_string(),
            EndReason::Explicit,
            Some(tx),
        )
        .await;
        assert!(!ended);
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::Error { kind: Some(ref kind), .. }) if kind == "session_not_found"
        ));

        let (tx, rx) = unbounded_channel();
        drop(rx);
        let ended = end_session(
            state.lifecycle.clone(),
            "conn-missing".to_string(),
            "session-missing".to_string(),
            EndReason::Explicit,
            Some(tx),
        )
        .await;
        assert!(!ended);
    }

    #[actix_web::test]
    async fn test_end_session_finalizes_live_session() {
        let state = test_state();
        let (tx, _events) = unbounded_channel();
        state
            .lifecycle
            .start("conn-1", "pres-1", tx, &state.get_config())
            .await
            .unwrap();

        let ended = end_session(
            state.lifecycle.clone(),
            "conn-1".to_string(),
            "session-1".to_string(),
            EndReason::Disconnected,
            None,
        )
        .await;
        assert!(ended);

        // a late disconnect for the same connection is not an error
        assert!(
            !end_session(
                state.lifecycle.clone(),
                "conn-1".to_string(),
                "session-1".to_string(),
                EndReason::Disconnected,
                None,
            )
            .await
        );
    }
}
