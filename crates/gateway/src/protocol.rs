//! WebSocket protocol message types.
//!
//! Server → client frames are [`realtime::BroadcastEvent`]s. The canvas
//! channel only understands the plain-text `ping`; the duel channel accepts
//! the JSON messages below.

use realtime::{BroadcastEvent, UserId};
use serde::Deserialize;

/// Plain-text keepalive on the canvas channel.
pub const CANVAS_PING: &str = "ping";
pub const CANVAS_PONG: &str = "pong";

/// Message sent from a duel participant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DuelClientMessage {
    Ping,
    SequenceReady,
    AnswerSubmitted {
        #[serde(default)]
        level: Option<u32>,
    },
    LevelComplete {
        #[serde(default)]
        level: Option<u32>,
    },
    GameOver {
        #[serde(default)]
        level_reached: Option<u32>,
    },
}

impl DuelClientMessage {
    /// `None` for malformed JSON or an unknown `type`; callers ignore those.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Event re-broadcast to the other participant, stamped with the sender.
    /// `ping` is answered locally and never relayed.
    pub fn into_relay_event(self, user_id: UserId) -> Option<BroadcastEvent> {
        match self {
            DuelClientMessage::Ping => None,
            DuelClientMessage::SequenceReady => Some(BroadcastEvent::SequenceReady { user_id }),
            DuelClientMessage::AnswerSubmitted { level } => {
                Some(BroadcastEvent::AnswerSubmitted { user_id, level })
            }
            DuelClientMessage::LevelComplete { level } => {
                Some(BroadcastEvent::LevelComplete { user_id, level })
            }
            DuelClientMessage::GameOver { level_reached } => {
                Some(BroadcastEvent::GameOver {
                    user_id,
                    level_reached,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_messages() {
        assert_eq!(
            DuelClientMessage::parse(r#"{"type":"ping"}"#),
            Some(DuelClientMessage::Ping)
        );
        assert_eq!(
            DuelClientMessage::parse(r#"{"type":"answer_submitted","level":4}"#),
            Some(DuelClientMessage::AnswerSubmitted { level: Some(4) })
        );
        assert_eq!(
            DuelClientMessage::parse(r#"{"type":"level_complete"}"#),
            Some(DuelClientMessage::LevelComplete { level: None })
        );
    }

    #[test]
    fn test_malformed_or_unknown_ignored() {
        assert_eq!(DuelClientMessage::parse("not json"), None);
        assert_eq!(DuelClientMessage::parse(r#"{"type":"teleport"}"#), None);
        assert_eq!(DuelClientMessage::parse(r#"{"level":1}"#), None);
    }

    #[test]
    fn test_relay_event_carries_sender() {
        let event = DuelClientMessage::GameOver {
            level_reached: Some(7),
        }
        .into_relay_event(42)
        .unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "game_over");
        assert_eq!(json["user_id"], 42);
        assert_eq!(json["level_reached"], 7);

        assert!(DuelClientMessage::Ping.into_relay_event(42).is_none());
    }
}
