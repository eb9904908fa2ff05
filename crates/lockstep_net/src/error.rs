//! Error types for peer networking.

use lockstep_core::entity::PlayerId;
use lockstep_core::error::SimError;
use thiserror::Error;

/// Result type alias using [`NetError`].
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors raised while running a lockstep session.
#[derive(Debug, Error)]
pub enum NetError {
    /// The local simulation failed.
    #[error("Simulation error: {0}")]
    Sim(#[from] SimError),

    /// A message could not be encoded or decoded.
    #[error("Message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Two peers computed different states for the same turn.
    #[error("Desync at turn {turn}: local hash {local:#018x}, peer {peer_id} reported {remote:#018x}")]
    Desync {
        /// Turn whose end states differ.
        turn: u64,
        /// Peer that reported the other hash.
        peer_id: PlayerId,
        /// Local state hash.
        local: u64,
        /// Remote state hash.
        remote: u64,
    },

    /// IO failure (config files, runtime setup).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse RON configuration.
    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] ron::error::SpannedError),

    /// Configuration values are unusable.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
}
