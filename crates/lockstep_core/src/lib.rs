//! # Lockstep Core
//!
//! Deterministic simulation core for a lockstep RTS.
//!
//! This crate contains **only** deterministic logic:
//! - No rendering
//! - No networking
//! - No system randomness
//! - No floating-point math in the authoritative state (uses fixed-point)
//!
//! Peers that run the same commands through it end every turn with
//! bit-identical state, which is what makes lockstep multiplayer, replays and
//! the built-in determinism checks possible.
//!
//! ## Crate Structure
//!
//! - [`math`] - Fixed-point scalar, vectors and integer square root
//! - [`entity`] - Entities and their per-turn movement rule
//! - [`state`] - Per-turn snapshots with player-partitioned entity IDs
//! - [`command`] - Commands and the canonical command queue
//! - [`handler`] - The state transition for each command
//! - [`presentation`] - Observer and view projection hooks
//! - [`simulation`] - Turn engine, interpolation and determinism checks
//! - [`replay`] - Recording and playback

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod command;
pub mod entity;
pub mod error;
pub mod handler;
pub mod math;
pub mod presentation;
pub mod replay;
pub mod simulation;
pub mod state;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::{Command, CommandKind, CommandQueue};
    pub use crate::entity::{Entity, EntityId, PlayerId};
    pub use crate::error::{DeterminismError, Result, SimError};
    pub use crate::handler::CommandHandler;
    pub use crate::math::{Fixed, Vec2Fixed};
    pub use crate::presentation::{IdentityProjection, SimulationObserver, ViewProjection};
    pub use crate::replay::{Replay, ReplayPlayer};
    pub use crate::simulation::{Simulation, TurnEvents};
    pub use crate::state::SimulationState;
}
