//! Hooks into the presentation layer.
//!
//! The simulation never renders anything itself. It reports spawns and
//! despawns to a [`SimulationObserver`] and asks a [`ViewProjection`] where an
//! entity appears on screen when resolving box selections.

use std::fmt;

use crate::entity::Entity;
use crate::math::Vec2Fixed;

/// Maps world positions into the view space used by box selection.
///
/// Implementations must be deterministic: every peer projects the same
/// position to the same point, or box selections diverge.
pub trait ViewProjection: fmt::Debug + Send + Sync {
    /// Project a world position into view space.
    fn project(&self, world: Vec2Fixed) -> Vec2Fixed;
}

/// View space equals world space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityProjection;

impl ViewProjection for IdentityProjection {
    fn project(&self, world: Vec2Fixed) -> Vec2Fixed {
        world
    }
}

/// Receives entity lifecycle notifications while commands are applied.
pub trait SimulationObserver {
    /// A new entity exists in the current turn.
    fn on_entity_spawned(&mut self, _entity: &Entity) {}

    /// An entity was removed in the current turn.
    fn on_entity_despawned(&mut self, _entity: &Entity) {}
}

/// Lifecycle change produced by applying a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityEvent {
    /// Entity spawned.
    Spawned(Entity),
    /// Entity despawned.
    Despawned(Entity),
}

impl EntityEvent {
    /// Forward the event to an observer.
    pub fn notify(&self, observer: &mut dyn SimulationObserver) {
        match self {
            Self::Spawned(entity) => observer.on_entity_spawned(entity),
            Self::Despawned(entity) => observer.on_entity_despawned(entity),
        }
    }
}
