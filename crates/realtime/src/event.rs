//! Events fanned out to WebSocket connections.
//!
//! Every event is a JSON object with a `type` discriminator, e.g.
//! `{"type":"pixel_updated","x":1,"y":2,...}`.

use crate::registry::ConnectionId;
use crate::{SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Server → Client Events
// ============================================================================

/// Event delivered to every connection of a scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    /// A canvas cell was committed.
    PixelUpdated {
        x: u32,
        y: u32,
        color: String,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    /// A participant opened its duel channel.
    PlayerConnected { user_id: UserId, game_id: SessionId },
    /// A participant's duel channel closed.
    PlayerDisconnected { user_id: UserId, game_id: SessionId },
    /// Relayed from a participant: ready to watch the sequence.
    SequenceReady { user_id: UserId },
    /// Relayed from a participant: answer sent for a level.
    AnswerSubmitted {
        user_id: UserId,
        level: Option<u32>,
    },
    /// Relayed from a participant: level cleared.
    LevelComplete {
        user_id: UserId,
        level: Option<u32>,
    },
    /// Relayed from a participant: the participant lost.
    GameOver {
        user_id: UserId,
        level_reached: Option<u32>,
    },
    /// Second player joined a waiting session by code.
    PlayerJoined { user_id: UserId, game_id: SessionId },
    /// A PvP pixel was accepted.
    PixelPlaced {
        game_id: SessionId,
        user_id: UserId,
        x: u32,
        y: u32,
        color: String,
        pixels_placed: u32,
        pixels_remaining: u32,
    },
    /// Both PvP quotas are complete. `winner_id` is absent on a draw.
    GameFinished {
        game_id: SessionId,
        winner_id: Option<UserId>,
    },
    /// The creator cancelled a waiting session.
    GameCancelled { game_id: SessionId },
    /// Reply to a duel client's `ping`, sent only to that socket.
    Pong,
}

impl BroadcastEvent {
    /// Wire name of the event (the `type` field).
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastEvent::PixelUpdated { .. } => "pixel_updated",
            BroadcastEvent::PlayerConnected { .. } => "player_connected",
            BroadcastEvent::PlayerDisconnected { .. } => "player_disconnected",
            BroadcastEvent::SequenceReady { .. } => "sequence_ready",
            BroadcastEvent::AnswerSubmitted { .. } => "answer_submitted",
            BroadcastEvent::LevelComplete { .. } => "level_complete",
            BroadcastEvent::GameOver { .. } => "game_over",
            BroadcastEvent::PlayerJoined { .. } => "player_joined",
            BroadcastEvent::PixelPlaced { .. } => "pixel_placed",
            BroadcastEvent::GameFinished { .. } => "game_finished",
            BroadcastEvent::GameCancelled { .. } => "game_cancelled",
            BroadcastEvent::Pong => "pong",
        }
    }
}

// ============================================================================
// Broker Envelope
// ============================================================================

/// What actually travels over a broker topic.
///
/// `exclude` names the sending connection so relays on every process can
/// skip it; connection ids are UUIDs and therefore unique across processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<ConnectionId>,
    pub event: BroadcastEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pixel_updated_wire_format() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = BroadcastEvent::PixelUpdated {
            x: 3,
            y: 4,
            color: "#FF0000".to_string(),
            user_id: 7,
            timestamp: ts,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "pixel_updated");
        assert_eq!(value["x"], 3);
        assert_eq!(value["user_id"], 7);
        assert_eq!(value["color"], "#FF0000");
        assert_eq!(event.kind(), "pixel_updated");
    }

    #[test]
    fn test_relayed_duel_message_carries_user() {
        let event = BroadcastEvent::AnswerSubmitted {
            user_id: 5,
            level: Some(3),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "answer_submitted", "user_id": 5, "level": 3})
        );
    }

    #[test]
    fn test_envelope_without_exclude_omits_field() {
        let envelope = Envelope {
            exclude: None,
            event: BroadcastEvent::GameCancelled { game_id: 9 },
        };
        let text = serde_json::to_string(&envelope).unwrap();
        assert!(!text.contains("exclude"));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
    }
}
