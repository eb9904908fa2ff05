//! The state transition function for commands.
//!
//! [`CommandHandler::apply`] mutates the fresh per-turn copy of the state, so
//! at the turn level it behaves like a pure function of
//! `(previous state, commands)`.

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::command::{Command, CommandKind};
use crate::entity::{Entity, EntityId, PlayerId};
use crate::error::{Result, SimError};
use crate::math::{Fixed, Vec2Fixed};
use crate::presentation::{EntityEvent, IdentityProjection, ViewProjection};
use crate::state::SimulationState;

/// Seed of the generator used by [`CommandKind::MassSpawn`].
pub const MASS_SPAWN_SEED: u64 = 123;

/// Entities created by one [`CommandKind::MassSpawn`].
pub const MASS_SPAWN_COUNT: usize = 100;

/// Radius of the [`CommandKind::MassSpawn`] scatter.
pub const MASS_SPAWN_RADIUS: Fixed = Fixed::from_int(10);

/// Applies commands to a simulation state.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    projection: Arc<dyn ViewProjection>,
}

impl Default for CommandHandler {
    fn default() -> Self {
        Self::new(Arc::new(IdentityProjection))
    }
}

impl CommandHandler {
    /// Create a handler that resolves box selections through `projection`.
    #[must_use]
    pub fn new(projection: Arc<dyn ViewProjection>) -> Self {
        Self { projection }
    }

    /// The projection used for box selection.
    #[must_use]
    pub fn projection(&self) -> &Arc<dyn ViewProjection> {
        &self.projection
    }

    /// Apply `command` to `state`, appending lifecycle changes to `events`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command references an unknown entity, an
    /// entity the issuer does not own, a position outside the world, or the
    /// issuer's ID range is exhausted. Rejected selection changes and moves
    /// leave the state untouched.
    pub fn apply(
        &self,
        state: &mut SimulationState,
        command: &Command,
        events: &mut Vec<EntityEvent>,
    ) -> Result<()> {
        let player = command.player_id;
        match command.kind {
            CommandKind::Select { entity_id } => select(state, player, entity_id),
            CommandKind::Deselect => {
                state.selection_mut(player).clear();
                Ok(())
            }
            CommandKind::BoxSelect { min, max } => {
                self.box_select(state, player, min, max);
                Ok(())
            }
            CommandKind::Move { target } => move_selection(state, player, target),
            CommandKind::Spawn { position } => spawn(state, player, position, events),
            CommandKind::MassSpawn { position } => mass_spawn(state, player, position, events),
            CommandKind::Despawn { entity_id } => {
                let entity = owned_entity(state, player, entity_id)?;
                state.despawn_entity(entity.entity_id)?;
                events.push(EntityEvent::Despawned(entity));
                Ok(())
            }
        }
    }

    fn box_select(
        &self,
        state: &mut SimulationState,
        player: PlayerId,
        a: Vec2Fixed,
        b: Vec2Fixed,
    ) {
        let (lo, hi) = (a.min(b), a.max(b));
        let inside: Vec<EntityId> = state
            .entities_owned_by(player)
            .filter(|entity| {
                let p = self.projection.project(entity.position);
                lo.x <= p.x && p.x <= hi.x && lo.y <= p.y && p.y <= hi.y
            })
            .map(|entity| entity.entity_id)
            .collect();

        let selection = state.selection_mut(player);
        selection.clear();
        selection.extend(inside);
    }
}

fn owned_entity(state: &SimulationState, player: PlayerId, entity_id: EntityId) -> Result<Entity> {
    let entity = state
        .entity(entity_id)
        .copied()
        .ok_or(SimError::EntityNotFound(entity_id))?;
    if entity.owning_player != player {
        return Err(SimError::NotOwner {
            player_id: player,
            entity_id,
        });
    }
    Ok(entity)
}

/// Replace the issuer's selection with `entity_id`.
///
/// Unlike a plain clear-then-add, the entity must exist and belong to the
/// issuer; otherwise the command is rejected and the previous selection is
/// kept.
fn select(state: &mut SimulationState, player: PlayerId, entity_id: EntityId) -> Result<()> {
    owned_entity(state, player, entity_id)?;
    let selection = state.selection_mut(player);
    selection.clear();
    selection.insert(entity_id);
    Ok(())
}

fn move_selection(state: &mut SimulationState, player: PlayerId, target: Vec2Fixed) -> Result<()> {
    let selected: Vec<Entity> = state
        .selection(player)
        .into_iter()
        .filter_map(|id| state.entity(id).copied())
        .collect();

    let orders: Vec<(EntityId, Vec2Fixed)> = match selected.len() {
        0 => Vec::new(),
        1 => vec![(selected[0].entity_id, target)],
        n => {
            // Keep each unit's offset from the group centre.
            let count = n as i128;
            let sum_x: i128 = selected.iter().map(|e| i128::from(e.position.x.raw())).sum();
            let sum_y: i128 = selected.iter().map(|e| i128::from(e.position.y.raw())).sum();
            let center = Vec2Fixed::from_raw((sum_x / count) as i64, (sum_y / count) as i64);

            selected
                .iter()
                .map(|entity| {
                    let destination = center
                        .checked_sub(entity.position)
                        .and_then(|offset| target.checked_sub(offset))
                        .ok_or(SimError::OutOfWorld(target))?;
                    Ok((entity.entity_id, destination))
                })
                .collect::<Result<_>>()?
        }
    };

    // All or nothing: a group is never split by an unreachable destination.
    if let Some((_, outside)) = orders.iter().find(|(_, destination)| !destination.in_world()) {
        return Err(SimError::OutOfWorld(*outside));
    }
    for (id, destination) in orders {
        if let Some(entity) = state.entity_mut(id) {
            entity.move_towards(destination);
        }
    }
    Ok(())
}

fn spawn(
    state: &mut SimulationState,
    player: PlayerId,
    position: Vec2Fixed,
    events: &mut Vec<EntityEvent>,
) -> Result<()> {
    let entity = state.spawn_entity(Entity::at(position), player)?;
    events.push(EntityEvent::Spawned(entity));
    Ok(())
}

fn mass_spawn(
    state: &mut SimulationState,
    player: PlayerId,
    center: Vec2Fixed,
    events: &mut Vec<EntityEvent>,
) -> Result<()> {
    // Either the whole scatter fits in the player's ID range or nothing spawns.
    let remaining = state.remaining_entity_ids(player).ok_or(SimError::InvalidPlayer {
        player_id: player,
        player_count: state.player_count(),
    })?;
    if (remaining as usize) < MASS_SPAWN_COUNT {
        return Err(SimError::EntityIdsExhausted {
            player_id: player,
            capacity: state.max_entities_per_player(),
        });
    }

    // A fresh generator per command: same seed, same scatter on every peer.
    let mut rng = ChaCha8Rng::seed_from_u64(MASS_SPAWN_SEED);
    let positions = (0..MASS_SPAWN_COUNT)
        .map(|_| {
            center
                .checked_add(point_in_disc(&mut rng, MASS_SPAWN_RADIUS))
                .filter(|position| position.in_world())
                .ok_or(SimError::OutOfWorld(center))
        })
        .collect::<Result<Vec<_>>>()?;

    for position in positions {
        spawn(state, player, position, events)?;
    }
    Ok(())
}

fn point_in_disc(rng: &mut ChaCha8Rng, radius: Fixed) -> Vec2Fixed {
    let r = radius.raw();
    let r_sq = i128::from(r) * i128::from(r);
    loop {
        let x = rng.gen_range(-r..=r);
        let y = rng.gen_range(-r..=r);
        if i128::from(x) * i128::from(x) + i128::from(y) * i128::from(y) <= r_sq {
            return Vec2Fixed::from_raw(x, y);
        }
    }
}
