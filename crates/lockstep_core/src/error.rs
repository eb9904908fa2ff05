//! Error types for the lockstep simulation.

use thiserror::Error;

use crate::entity::{Entity, EntityId, PlayerId};
use crate::math::Vec2Fixed;

/// Result type alias using [`SimError`].
pub type Result<T> = std::result::Result<T, SimError>;

/// Top-level error type for all simulation errors.
#[derive(Debug, Error)]
pub enum SimError {
    /// Command issued by a player outside `[1, player_count]`.
    #[error("Invalid player ID {player_id} (player count is {player_count})")]
    InvalidPlayer {
        /// Offending player ID.
        player_id: PlayerId,
        /// Number of players in the session.
        player_count: u32,
    },

    /// Command targets a turn that has already been simulated.
    #[error("Command for turn {target_turn} arrived at turn {current_turn}")]
    StaleCommand {
        /// Turn the command was scheduled for.
        target_turn: u64,
        /// Turn the simulation had already reached.
        current_turn: u64,
    },

    /// Invalid entity reference.
    #[error("Entity not found: {0}")]
    EntityNotFound(EntityId),

    /// Player tried to act on an entity it does not own.
    #[error("Player {player_id} does not own entity {entity_id}")]
    NotOwner {
        /// Acting player.
        player_id: PlayerId,
        /// Entity that belongs to somebody else.
        entity_id: EntityId,
    },

    /// A player's entity ID range is used up.
    #[error("Player {player_id} exhausted its {capacity} entity IDs")]
    EntityIdsExhausted {
        /// Player whose range is exhausted.
        player_id: PlayerId,
        /// Per-player capacity.
        capacity: u32,
    },

    /// A position lies outside the playable world.
    #[error("Position {0} is outside the world")]
    OutOfWorld(Vec2Fixed),

    /// Two simulations that should be identical diverged.
    #[error("Simulation is not deterministic: {0}")]
    NotDeterministic(#[from] DeterminismError),

    /// Replay payload could not be parsed or is inconsistent.
    #[error("Malformed replay: {0}")]
    MalformedReplay(String),

    /// Replay byte stream could not be read or written.
    #[error("Replay IO failed: {0}")]
    ReplayIo(#[from] std::io::Error),

    /// Invalid simulation state or configuration.
    #[error("Invalid simulation state: {0}")]
    InvalidState(String),
}

/// First point of divergence between a live simulation and its re-derivation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeterminismError {
    /// The two simulations are not on the same turn.
    #[error("turn number differs: live sim {live} | check sim {check}")]
    TurnMismatch {
        /// Live simulation turn.
        live: u64,
        /// Re-derived simulation turn.
        check: u64,
    },

    /// The entity ID sets differ.
    #[error("entity IDs differ at turn {turn}: only live {only_live:?} | only check {only_check:?}")]
    EntitySetMismatch {
        /// Turn of the comparison.
        turn: u64,
        /// IDs present only in the live simulation.
        only_live: Vec<EntityId>,
        /// IDs present only in the re-derived simulation.
        only_check: Vec<EntityId>,
    },

    /// An entity differs field-wise.
    #[error("entity {entity_id} differs in {field} at turn {turn}: live sim {live} | check sim {check}")]
    EntityMismatch {
        /// Turn of the comparison.
        turn: u64,
        /// Diverged entity.
        entity_id: EntityId,
        /// First differing field.
        field: &'static str,
        /// Live entity.
        live: Box<Entity>,
        /// Re-derived entity.
        check: Box<Entity>,
    },

    /// A player's selection differs.
    #[error("selection of player {player_id} differs at turn {turn}: live sim {live:?} | check sim {check:?}")]
    SelectionMismatch {
        /// Turn of the comparison.
        turn: u64,
        /// Player whose selection diverged.
        player_id: PlayerId,
        /// Live selection.
        live: Vec<EntityId>,
        /// Re-derived selection.
        check: Vec<EntityId>,
    },
}
