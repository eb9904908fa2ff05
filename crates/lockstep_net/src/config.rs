//! Session configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

/// Smallest command delay at which no peer can have simulated a command's
/// target turn before the command reaches it.
pub const MIN_COMMAND_DELAY_TURNS: u64 = 2;

/// Tunables for a [`LockstepSession`](crate::session::LockstepSession).
///
/// Every peer in a game must use the same `turn_speed_ms`, `player_count`
/// and `command_delay_turns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Duration of one turn in milliseconds.
    pub turn_speed_ms: u32,
    /// Number of players in the game.
    pub player_count: u32,
    /// How many turns ahead local commands are scheduled.
    pub command_delay_turns: u64,
    /// Remote commands scheduled further than this past the current turn
    /// are dropped.
    pub max_command_lead_turns: u64,
    /// Silence after which a peer blocking the turn gate is evicted.
    pub peer_timeout_ms: u64,
    /// Re-derive every turn locally and fail on mismatch.
    pub check_determinism_each_turn: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            turn_speed_ms: lockstep_core::simulation::DEFAULT_TURN_SPEED_MS,
            player_count: 2,
            command_delay_turns: 2,
            max_command_lead_turns: 600,
            peer_timeout_ms: 5_000,
            check_determinism_each_turn: true,
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a RON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_ron_str(&contents)
    }

    /// Parse and validate a configuration from a RON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid configuration.
    pub fn from_ron_str(ron: &str) -> Result<Self> {
        let config: Self = ron::from_str(ron)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values can drive a session.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.turn_speed_ms == 0 {
            return Err(NetError::InvalidConfig("turn_speed_ms must be positive".into()));
        }
        if self.player_count == 0 {
            return Err(NetError::InvalidConfig("player_count must be positive".into()));
        }
        // A peer that already signaled turn N may still issue commands while
        // a faster peer simulates N + 1.
        if self.command_delay_turns < MIN_COMMAND_DELAY_TURNS {
            return Err(NetError::InvalidConfig(format!(
                "command_delay_turns must be at least {MIN_COMMAND_DELAY_TURNS}"
            )));
        }
        if self.max_command_lead_turns < self.command_delay_turns {
            return Err(NetError::InvalidConfig(
                "max_command_lead_turns must cover command_delay_turns".into(),
            ));
        }
        Ok(())
    }
}
