//! Messages exchanged between peers.

use lockstep_core::command::Command;
use lockstep_core::entity::PlayerId;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PeerMessage {
    /// Announces a peer.
    Hello {
        /// The sender's player ID.
        player_id: PlayerId,
    },
    /// A command issued by the sender.
    Command {
        /// The command, already scheduled for its target turn.
        command: Command,
    },
    /// The sender finished `turn` and is ready for the next one.
    EndOfTurn {
        /// The sender's player ID.
        player_id: PlayerId,
        /// The finished turn.
        turn: u64,
        /// Hash of the sender's state at the end of `turn`.
        state_hash: u64,
    },
}

impl PeerMessage {
    /// Player the message claims to come from.
    #[must_use]
    pub const fn claimed_player(&self) -> PlayerId {
        match self {
            Self::Hello { player_id } | Self::EndOfTurn { player_id, .. } => *player_id,
            Self::Command { command } => command.player_id,
        }
    }

    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Raw bytes received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Transport-level sender identity.
    pub from: PlayerId,
    /// Encoded [`PeerMessage`].
    pub payload: Vec<u8>,
}
