//! Movement bounds and direction integration

use crate::config::SyncConfig;
use crate::util::time::millis_f64;

/// Facing of a player. Presentational, but it also picks the sign of
/// direction-driven movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Backward => -1.0,
        }
    }

    pub fn is_forward(self) -> bool {
        self == Self::Forward
    }
}

impl From<bool> for Direction {
    fn from(forward: bool) -> Self {
        if forward {
            Self::Forward
        } else {
            Self::Backward
        }
    }
}

/// Why a declared position was refused
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum MoveRejection {
    #[error("position {proposed} outside [0, {screen_width})")]
    OutOfBounds { proposed: f64, screen_width: f64 },

    #[error("position jump of {delta} exceeds allowed {allowed}")]
    ExcessiveDelta { delta: f64, allowed: f64 },
}

/// Movement policy applied to every session
#[derive(Debug, Clone, Copy)]
pub struct MovementPolicy {
    screen_width: f64,
    allowed_delta: f64,
    step_millis: f64,
}

impl MovementPolicy {
    pub fn new(screen_width: f64, allowed_delta: f64, step_millis: f64) -> Self {
        Self {
            screen_width,
            allowed_delta,
            step_millis,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.screen_width,
            config.allowed_delta,
            millis_f64(config.broadcast_interval),
        )
    }

    pub fn screen_width(&self) -> f64 {
        self.screen_width
    }

    pub fn allowed_delta(&self) -> f64 {
        self.allowed_delta
    }

    /// Check a client-declared absolute position against the last known one.
    /// Returns the position to store.
    pub fn check_position(&self, current: f64, proposed: f64) -> Result<f64, MoveRejection> {
        if !(0.0..self.screen_width).contains(&proposed) {
            return Err(MoveRejection::OutOfBounds {
                proposed,
                screen_width: self.screen_width,
            });
        }

        let delta = (proposed - current).abs();
        if delta > self.allowed_delta {
            return Err(MoveRejection::ExcessiveDelta {
                delta,
                allowed: self.allowed_delta,
            });
        }

        Ok(proposed)
    }

    /// Integrate one direction-driven step. Server computed, so no delta
    /// check, only clamping into the playfield.
    pub fn integrate_direction(&self, current: f64, direction: Direction, speed: f64) -> f64 {
        self.clamp(current + self.step_millis * direction.sign() * speed)
    }

    /// Clamp into `[0, screen_width)`
    pub fn clamp(&self, position: f64) -> f64 {
        if position.is_nan() || position < 0.0 {
            0.0
        } else if position >= self.screen_width {
            self.max_position()
        } else {
            position
        }
    }

    /// Largest representable position strictly below the screen width
    fn max_position(&self) -> f64 {
        // screen_width is positive and finite, so its predecessor is one ulp down
        f64::from_bits(self.screen_width.to_bits() - 1)
    }
}
