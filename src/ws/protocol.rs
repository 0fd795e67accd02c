//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::game::PlayerState;

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Client-declared absolute position, validated against the movement bound
    Position { position: f64 },

    /// Declared facing, `true` is forward; the server integrates the step
    Direction { direction: bool },

    /// Any other `type`, ignored
    #[serde(other)]
    Unknown,
}

/// Decoding failure; always fatal to the session
#[derive(Debug, thiserror::Error)]
#[error("malformed client message: {0}")]
pub struct ProtocolError(#[from] serde_json::Error);

impl ClientMsg {
    /// Decode one frame. Frames without a `type` decode to `Unknown`; frames
    /// that are not JSON objects, or known types with bad fields, are errors.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let object: Map<String, Value> = serde_json::from_slice(frame)?;
        match object.get("type") {
            None | Some(Value::Null) => Ok(Self::Unknown),
            Some(Value::String(_)) => Ok(serde_json::from_value(Value::Object(object))?),
            Some(_) => Err(ProtocolError(serde_json::Error::custom(
                "message type must be a string",
            ))),
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        player_id: String,
        server_time: u64,
        screen_width: f64,
        allowed_delta: f64,
        broadcast_interval_ms: u64,
    },

    /// Periodic state push
    Direction { direction: bool, position: f64 },
}

impl ServerMsg {
    pub fn state(player: &PlayerState) -> Self {
        Self::Direction {
            direction: player.direction.is_forward(),
            position: player.position,
        }
    }
}

/// Player state as exposed over HTTP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerView {
    pub player_id: String,
    pub position: f64,
    pub direction: bool,
    pub speed: f64,
}

impl From<&PlayerState> for PlayerView {
    fn from(state: &PlayerState) -> Self {
        Self {
            player_id: state.id.to_string(),
            position: state.position,
            direction: state.direction.is_forward(),
            speed: state.speed,
        }
    }
}
