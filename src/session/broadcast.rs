//! # Broadcast Groups
//!
//! Each session publishes its events to a group named after its session id. Members
//! are WebSocket connections, represented by the sending half of an unbounded
//! channel that the connection's actor drains.
//!
//! ## Concurrency:
//! Joins, leaves and publishes may come from any task. The group map sits behind a
//! `parking_lot::RwLock`; publishing only takes the read lock, and members whose
//! receiver is gone are pruned afterwards under the write lock.

use crate::scoring::FinalReport;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Messages sent from the server to presentation clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConnectionAck {
        connection_id: String,
    },
    SessionStarted {
        session_id: String,
        presentation_id: String,
    },
    AudioAck {
        buffered: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        dispatched: Option<u64>,
    },
    TranscriptUpdate {
        text: String,
        sequence: u64,
    },
    LiveScoreUpdate {
        content: f64,
        delivery: f64,
        engagement: f64,
        sequence: u64,
    },
    AiQuestion {
        question: String,
        timestamp: DateTime<Utc>,
    },
    SlideAck,
    SessionEnded {
        session_id: String,
        report: Box<FinalReport>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
            kind: None,
        }
    }

    pub fn from_error(err: &crate::error::EvaluationError) -> Self {
        ServerEvent::Error {
            message: err.to_string(),
            kind: Some(err.kind().to_string()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionAck { .. } => "connection_ack",
            ServerEvent::SessionStarted { .. } => "session_started",
            ServerEvent::AudioAck { .. } => "audio_ack",
            ServerEvent::TranscriptUpdate { .. } => "transcript_update",
            ServerEvent::LiveScoreUpdate { .. } => "live_score_update",
            ServerEvent::AiQuestion { .. } => "ai_question",
            ServerEvent::SlideAck => "slide_ack",
            ServerEvent::SessionEnded { .. } => "session_ended",
            ServerEvent::Error { .. } => "error",
        }
    }
}

pub type EventSender = UnboundedSender<ServerEvent>;

#[derive(Debug, Default)]
pub struct BroadcastHub {
    groups: RwLock<HashMap<String, HashMap<String, EventSender>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a group. Returns false if it was already a member,
    /// in which case its sender is replaced.
    pub fn join(&self, group: &str, connection_id: &str, sender: EventSender) -> bool {
        let mut groups = self.groups.write();
        groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.to_string(), sender)
            .is_none()
    }

    pub fn leave(&self, group: &str, connection_id: &str) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(group) {
            members.remove(connection_id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Send an event to every member of a group. Returns how many members
    /// received it.
    pub fn publish(&self, group: &str, event: ServerEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let groups = self.groups.read();
            let Some(members) = groups.get(group) else {
                return 0;
            };
            for (connection_id, sender) in members {
                if sender.send(event.clone()).is_ok() {
                    delivered += 1;
                } else {
                    closed.push(connection_id.clone());
                }
            }
        }

        for connection_id in closed {
            debug!(group, connection_id = %connection_id, "Pruning closed broadcast member");
            self.leave(group, &connection_id);
        }

        delivered
    }

    pub fn remove_group(&self, group: &str) {
        self.groups.write().remove(group);
    }

    #[cfg(test)]
    pub fn member_count(&self, group: &str) -> usize {
        self.groups.read().get(group).map(|m| m.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_publish_reaches_only_group_members() {
        let hub = BroadcastHub::new();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        assert!(hub.join("session-a", "conn-a", tx_a));
        assert!(hub.join("session-b", "conn-b", tx_b));

        assert_eq!(hub.publish("session-a", ServerEvent::SlideAck), 1);

        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::SlideAck);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_closed_members_are_pruned() {
        let hub = BroadcastHub::new();
        let (tx, rx) = unbounded_channel();
        hub.join("session-a", "conn-a", tx);
        drop(rx);

        assert_eq!(hub.publish("session-a", ServerEvent::SlideAck), 0);
        assert_eq!(hub.member_count("session-a"), 0);
        assert_eq!(hub.group_count(), 0);
    }

    #[test]
    fn test_leave_and_remove_group() {
        let hub = BroadcastHub::new();
        let (tx1, _rx1) = unbounded_channel();
        let (tx2, _rx2) = unbounded_channel();
        hub.join("g", "c1", tx1);
        hub.join("g", "c2", tx2);
        hub.leave("g", "c1");
        assert_eq!(hub.member_count("g"), 1);
        hub.remove_group("g");
        assert_eq!(hub.publish("g", ServerEvent::SlideAck), 0);
    }

    #[test]
    fn test_event_wire_format() {
        let event = ServerEvent::LiveScoreUpdate {
            content: 7.0,
            delivery: 6.0,
            engagement: 8.0,
            sequence: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "live_score_update");
        assert_eq!(json["content"], 7.0);

        let ack = serde_json::to_value(ServerEvent::AudioAck { buffered: 3, dispatched: None }).unwrap();
        assert_eq!(ack, serde_json::json!({"type": "audio_ack", "buffered": 3}));

        let slide = serde_json::to_value(ServerEvent::SlideAck).unwrap();
        assert_eq!(slide, serde_json::json!({"type": "slide_ack"}));
    }
}
