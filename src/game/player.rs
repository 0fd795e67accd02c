//! Authoritative per-player state

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use super::movement::{Direction, MoveRejection, MovementPolicy};

/// Longest accepted player identifier, in bytes
pub const MAX_PLAYER_ID_LEN: usize = 128;

/// Identifier a client connects with, unique among live sessions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Validate a raw identifier taken from the upgrade request
    pub fn parse(raw: Option<&str>) -> Result<Self, PlayerIdError> {
        let raw = raw.ok_or(PlayerIdError::Missing)?;

        if raw.trim().is_empty() {
            return Err(PlayerIdError::Empty);
        }
        if raw.len() > MAX_PLAYER_ID_LEN {
            return Err(PlayerIdError::TooLong {
                max: MAX_PLAYER_ID_LEN,
            });
        }
        if raw.chars().any(char::is_control) {
            return Err(PlayerIdError::ControlCharacter);
        }

        Ok(Self(raw.to_string()))
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlayerIdError {
    #[error("missing playerID query parameter")]
    Missing,

    #[error("playerID must not be empty")]
    Empty,

    #[error("playerID longer than {max} bytes")]
    TooLong { max: usize },

    #[error("playerID contains control characters")]
    ControlCharacter,
}

/// Player state (authoritative, owned by its session task)
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub id: PlayerId,
    pub position: f64,
    pub direction: Direction,
    pub speed: f64,
}

impl PlayerState {
    /// State of a freshly admitted player
    pub fn new(id: PlayerId, speed: f64) -> Self {
        Self {
            id,
            position: 0.0,
            direction: Direction::Forward,
            speed,
        }
    }

    /// Apply a client-declared absolute position. Rejections leave the
    /// state untouched.
    pub fn apply_position(
        &mut self,
        proposed: f64,
        policy: &MovementPolicy,
    ) -> Result<(), MoveRejection> {
        match policy.check_position(self.position, proposed) {
            Ok(position) => {
                self.position = position;
                Ok(())
            }
            Err(rejection) => {
                warn!(player_id = %self.id, %rejection, "Rejected position update");
                Err(rejection)
            }
        }
    }

    /// Apply a declared facing and advance one server-computed step
    pub fn apply_direction(&mut self, direction: Direction, policy: &MovementPolicy) {
        self.direction = direction;
        self.position = policy.integrate_direction(self.position, direction, self.speed);
        debug!(
            player_id = %self.id,
            forward = direction.is_forward(),
            position = self.position,
            "Direction step applied"
        );
    }
}
