//! Per-turn simulation snapshots.
//!
//! A [`SimulationState`] holds everything that exists in one turn. The engine
//! never mutates a snapshot once it has been shifted into the history; each
//! turn starts from a deep copy (`Clone`) of the previous one.
//!
//! # Entity ID partitioning
//!
//! Every player owns a disjoint, contiguous range of entity IDs:
//! player `p` allocates from `[(p - 1) * K, p * K)` where
//! `K = floor(2^31 / player_count)`. Peers can therefore spawn entities
//! without coordinating IDs.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::Hasher;

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId, PlayerId};
use crate::error::{Result, SimError};

/// Size of the entity ID space shared by all players.
pub const ENTITY_ID_SPACE: u64 = 1 << 31;

/// Entity table, selections and ID allocators for one turn.
///
/// Ordered maps give every peer the same iteration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationState {
    entities: BTreeMap<EntityId, Entity>,
    selected_entities: BTreeMap<PlayerId, BTreeSet<EntityId>>,
    entity_id_counters: BTreeMap<PlayerId, EntityId>,
    player_count: u32,
    max_entities_per_player: u32,
}

impl SimulationState {
    /// Create an empty state for `player_count` players.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidState`] if `player_count` is zero.
    pub fn new(player_count: u32) -> Result<Self> {
        if player_count == 0 {
            return Err(SimError::InvalidState(
                "player count must be at least 1".to_string(),
            ));
        }

        let max_entities_per_player = (ENTITY_ID_SPACE / u64::from(player_count)) as u32;
        let entity_id_counters = (1..=player_count)
            .map(|player| (player, (player - 1) * max_entities_per_player))
            .collect();
        let selected_entities = (1..=player_count)
            .map(|player| (player, BTreeSet::new()))
            .collect();

        Ok(Self {
            entities: BTreeMap::new(),
            selected_entities,
            entity_id_counters,
            player_count,
            max_entities_per_player,
        })
    }

    /// Number of players this state was created for.
    #[must_use]
    pub const fn player_count(&self) -> u32 {
        self.player_count
    }

    /// Per-player entity ID capacity `K`.
    #[must_use]
    pub const fn max_entities_per_player(&self) -> u32 {
        self.max_entities_per_player
    }

    /// The half-open ID range owned by `player_id`.
    #[must_use]
    pub fn id_range(&self, player_id: PlayerId) -> Option<std::ops::Range<EntityId>> {
        if player_id == 0 || player_id > self.player_count {
            return None;
        }
        let start = (player_id - 1).checked_mul(self.max_entities_per_player)?;
        Some(start..start.checked_add(self.max_entities_per_player)?)
    }

    /// Check the internal invariants of a snapshot that came from outside,
    /// such as a replay file.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidState`] naming the first broken invariant.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> { Err(SimError::InvalidState(reason)) };

        if self.player_count == 0 {
            return invalid("player count must be at least 1".to_string());
        }
        let expected = ENTITY_ID_SPACE / u64::from(self.player_count);
        if u64::from(self.max_entities_per_player) != expected {
            return invalid(format!(
                "{} IDs per player, expected {expected} for {} players",
                self.max_entities_per_player, self.player_count
            ));
        }

        if !self.entity_id_counters.keys().copied().eq(1..=self.player_count) {
            return invalid("ID counters do not cover exactly the players".to_string());
        }
        for (&player, &counter) in &self.entity_id_counters {
            let Some(range) = self.id_range(player) else {
                return invalid(format!("player {player} has no ID range"));
            };
            if counter < range.start || counter > range.end {
                return invalid(format!(
                    "ID counter {counter} of player {player} is outside {range:?}"
                ));
            }
        }

        for (&id, entity) in &self.entities {
            if entity.entity_id != id {
                return invalid(format!("entity stored under {id} claims ID {}", entity.entity_id));
            }
            let allocated = self
                .id_range(entity.owning_player)
                .zip(self.entity_id_counters.get(&entity.owning_player))
                .is_some_and(|(range, &next)| range.start <= id && id < next);
            if !allocated {
                return invalid(format!(
                    "entity {id} was never allocated to player {}",
                    entity.owning_player
                ));
            }
            if ![entity.position, entity.target, entity.velocity]
                .iter()
                .all(|v| v.in_world())
            {
                return invalid(format!("entity {id} lies outside the world"));
            }
        }

        for (&player, selection) in &self.selected_entities {
            if player == 0 || player > self.player_count {
                return invalid(format!("selection of unknown player {player}"));
            }
            if let Some(id) = selection.iter().find(|id| {
                self.entities
                    .get(*id)
                    .map_or(true, |entity| entity.owning_player != player)
            }) {
                return invalid(format!("player {player} selects entity {id} it does not own"));
            }
        }
        Ok(())
    }

    /// Allocate the next ID for `player_id`, stamp and insert the entity.
    ///
    /// IDs are never reused.
    ///
    /// # Errors
    ///
    /// [`SimError::InvalidPlayer`] for an unknown player and
    /// [`SimError::EntityIdsExhausted`] once the player's range is used up.
    pub fn spawn_entity(&mut self, mut entity: Entity, player_id: PlayerId) -> Result<Entity> {
        let range = self.id_range(player_id).ok_or(SimError::InvalidPlayer {
            player_id,
            player_count: self.player_count,
        })?;
        let counter = self
            .entity_id_counters
            .get_mut(&player_id)
            .ok_or(SimError::InvalidPlayer {
                player_id,
                player_count: self.player_count,
            })?;

        if !entity.position.in_world() {
            return Err(SimError::OutOfWorld(entity.position));
        }
        if *counter >= range.end {
            return Err(SimError::EntityIdsExhausted {
                player_id,
                capacity: self.max_entities_per_player,
            });
        }

        let id = *counter;
        *counter += 1;

        entity.entity_id = id;
        entity.owning_player = player_id;
        self.entities.insert(id, entity);
        tracing::trace!(entity_id = id, player_id, "Spawned entity");
        Ok(entity)
    }

    /// Remove an entity and drop it from every selection.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::EntityNotFound`] if the ID is unknown.
    pub fn despawn_entity(&mut self, id: EntityId) -> Result<Entity> {
        let entity = self
            .entities
            .remove(&id)
            .ok_or(SimError::EntityNotFound(id))?;
        for selection in self.selected_entities.values_mut() {
            selection.remove(&id);
        }
        Ok(entity)
    }

    /// Get an entity by ID.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Get a mutable reference to an entity by ID.
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    /// The entity table, ordered by ID.
    #[must_use]
    pub const fn entities(&self) -> &BTreeMap<EntityId, Entity> {
        &self.entities
    }

    /// Mutable iteration in ID order.
    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    /// Entities owned by `player_id`, in ID order.
    pub fn entities_owned_by(&self, player_id: PlayerId) -> impl Iterator<Item = &Entity> {
        self.entities
            .values()
            .filter(move |entity| entity.owning_player == player_id)
    }

    /// Number of entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether there are no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// The current selection of `player_id` (empty for unknown players).
    #[must_use]
    pub fn selection(&self, player_id: PlayerId) -> Vec<EntityId> {
        self.selected_entities
            .get(&player_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All selections keyed by player.
    #[must_use]
    pub const fn selections(&self) -> &BTreeMap<PlayerId, BTreeSet<EntityId>> {
        &self.selected_entities
    }

    pub(crate) fn selection_mut(&mut self, player_id: PlayerId) -> &mut BTreeSet<EntityId> {
        self.selected_entities.entry(player_id).or_default()
    }

    /// Next ID `player_id` would receive.
    #[must_use]
    pub fn next_entity_id(&self, player_id: PlayerId) -> Option<EntityId> {
        self.entity_id_counters.get(&player_id).copied()
    }

    /// How many more IDs `player_id` can allocate.
    #[must_use]
    pub fn remaining_entity_ids(&self, player_id: PlayerId) -> Option<u32> {
        let range = self.id_range(player_id)?;
        let next = self.next_entity_id(player_id)?;
        Some(range.end.saturating_sub(next))
    }

    #[cfg(test)]
    pub(crate) fn set_next_entity_id(&mut self, player_id: PlayerId, id: EntityId) {
        self.entity_id_counters.insert(player_id, id);
    }

    /// Hash of the full snapshot, stable across platforms for a given build.
    ///
    /// Peers exchange it to detect divergence without shipping state.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();

        hasher.write(&self.player_count.to_le_bytes());
        for (id, entity) in &self.entities {
            hasher.write(&id.to_le_bytes());
            for value in [
                entity.position.x,
                entity.position.y,
                entity.target.x,
                entity.target.y,
                entity.velocity.x,
                entity.velocity.y,
            ] {
                hasher.write(&value.raw().to_le_bytes());
            }
            hasher.write_u8(u8::from(entity.moving));
            hasher.write(&entity.owning_player.to_le_bytes());
        }
        for (player, selection) in &self.selected_entities {
            hasher.write(&player.to_le_bytes());
            hasher.write(&(selection.len() as u64).to_le_bytes());
            for id in selection {
                hasher.write(&id.to_le_bytes());
            }
        }
        for (player, counter) in &self.entity_id_counters {
            hasher.write(&player.to_le_bytes());
            hasher.write(&counter.to_le_bytes());
        }

        hasher.finish()
    }

    /// Serialize the snapshot to a compact binary form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| SimError::InvalidState(format!("Failed to serialize state: {e}")))
    }

    /// Deserialize a snapshot produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid snapshot.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let state: Self = bincode::deserialize(data)
            .map_err(|e| SimError::InvalidState(format!("Failed to deserialize state: {e}")))?;
        state.validate()?;
        Ok(state)
    }
}
