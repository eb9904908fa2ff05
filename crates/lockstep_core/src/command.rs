//! Player commands and the turn-ordered command queue.
//!
//! Commands are the only way simulation state changes. Each one is scheduled
//! for a target turn and drained exactly when the simulation reaches it.
//!
//! # Ordering
//!
//! Commands due on the same turn are applied in a canonical order,
//! `(target_turn, player_id, sequence)`, so peers that received the same
//! commands in different network orders still apply them identically. The
//! issuing peer stamps `sequence`; local arrival order only breaks ties
//! between commands that carry identical keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, PlayerId};
use crate::math::Vec2Fixed;

/// A command issued by a player for a specific turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// Issuing player.
    pub player_id: PlayerId,
    /// Turn on which the command takes effect.
    pub target_turn: u64,
    /// Per-player sequence number stamped by the issuing peer.
    #[serde(default)]
    pub sequence: u64,
    /// What the command does.
    pub kind: CommandKind,
}

/// The command taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Replace the selection with a single entity. Rejected, leaving the
    /// selection unchanged, if the entity is missing or not the issuer's.
    Select {
        /// Entity to select.
        entity_id: EntityId,
    },
    /// Clear the selection.
    Deselect,
    /// Select every own entity whose view-space position lies in the box.
    BoxSelect {
        /// One corner of the box in view space.
        min: Vec2Fixed,
        /// The opposite corner.
        max: Vec2Fixed,
    },
    /// Move the selection towards a world position.
    Move {
        /// Destination (group centre for multi-selections).
        target: Vec2Fixed,
    },
    /// Spawn one entity.
    Spawn {
        /// Spawn position.
        position: Vec2Fixed,
    },
    /// Spawn a seeded scatter of entities around a point.
    MassSpawn {
        /// Centre of the scatter.
        position: Vec2Fixed,
    },
    /// Remove an own entity.
    Despawn {
        /// Entity to remove.
        entity_id: EntityId,
    },
}

impl CommandKind {
    /// Short name of the command kind.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Select { .. } => "Select",
            Self::Deselect => "Deselect",
            Self::BoxSelect { .. } => "BoxSelect",
            Self::Move { .. } => "Move",
            Self::Spawn { .. } => "Spawn",
            Self::MassSpawn { .. } => "MassSpawn",
            Self::Despawn { .. } => "Despawn",
        }
    }

    /// World position the command carries. Box corners are view-space
    /// bounds and are not included.
    #[must_use]
    pub const fn world_position(&self) -> Option<Vec2Fixed> {
        match self {
            Self::Move { target } => Some(*target),
            Self::Spawn { position } | Self::MassSpawn { position } => Some(*position),
            Self::Select { .. }
            | Self::Deselect
            | Self::BoxSelect { .. }
            | Self::Despawn { .. } => None,
        }
    }
}

impl Command {
    /// Create a command with sequence number zero.
    #[must_use]
    pub const fn new(player_id: PlayerId, target_turn: u64, kind: CommandKind) -> Self {
        Self {
            player_id,
            target_turn,
            sequence: 0,
            kind,
        }
    }

    /// Set the issuer's sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by player {} for turn {} (seq {})",
            self.kind.name(),
            self.player_id,
            self.target_turn,
            self.sequence
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    target_turn: u64,
    player_id: PlayerId,
    sequence: u64,
    arrival: u64,
}

/// Pending commands in canonical application order.
#[derive(Debug, Clone, Default)]
pub struct CommandQueue {
    pending: BTreeMap<QueueKey, Command>,
    arrivals: u64,
}

impl CommandQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a command.
    pub fn push(&mut self, command: Command) {
        let key = QueueKey {
            target_turn: command.target_turn,
            player_id: command.player_id,
            sequence: command.sequence,
            arrival: self.arrivals,
        };
        self.arrivals += 1;
        self.pending.insert(key, command);
    }

    /// Target turn of the next command, if any.
    #[must_use]
    pub fn next_turn(&self) -> Option<u64> {
        self.pending.keys().next().map(|key| key.target_turn)
    }

    /// Pop the next command if it is due on `turn`.
    pub fn pop_due(&mut self, turn: u64) -> Option<Command> {
        if self.next_turn()? != turn {
            return None;
        }
        self.pending.pop_first().map(|(_, command)| command)
    }

    /// Remove every command scheduled before `turn`.
    pub fn drain_before(&mut self, turn: u64) -> Vec<Command> {
        let mut stale = Vec::new();
        while self.next_turn().is_some_and(|next| next < turn) {
            if let Some((_, command)) = self.pending.pop_first() {
                stale.push(command);
            }
        }
        stale
    }

    /// Number of pending commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending commands in application order.
    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.pending.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(player: PlayerId, turn: u64, seq: u64) -> Command {
        Command::new(player, turn, CommandKind::Deselect).with_sequence(seq)
    }

    #[test]
    fn test_orders_by_turn_player_sequence() {
        let mut queue = CommandQueue::new();
        queue.push(cmd(2, 5, 0));
        queue.push(cmd(1, 5, 1));
        queue.push(cmd(1, 3, 9));
        queue.push(cmd(1, 5, 0));

        let order: Vec<_> = queue
            .iter()
            .map(|c| (c.target_turn, c.player_id, c.sequence))
            .collect();
        assert_eq!(order, vec![(3, 1, 9), (5, 1, 0), (5, 1, 1), (5, 2, 0)]);
    }

    #[test]
    fn test_arrival_order_is_irrelevant_for_distinct_keys() {
        let commands = [cmd(2, 4, 0), cmd(1, 4, 0), cmd(1, 4, 1)];

        let mut forward = CommandQueue::new();
        commands.iter().for_each(|c| forward.push(*c));
        let mut backward = CommandQueue::new();
        commands.iter().rev().for_each(|c| backward.push(*c));

        let a: Vec<_> = forward.iter().copied().collect();
        let b: Vec<_> = backward.iter().copied().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_identical_keys_keep_arrival_order() {
        let mut queue = CommandQueue::new();
        let first = Command::new(1, 2, CommandKind::Select { entity_id: 1 });
        let second = Command::new(1, 2, CommandKind::Select { entity_id: 2 });
        queue.push(first);
        queue.push(second);

        assert_eq!(queue.pop_due(2), Some(first));
        assert_eq!(queue.pop_due(2), Some(second));
        assert_eq!(queue.pop_due(2), None);
    }

    #[test]
    fn test_pop_due_only_on_exact_turn() {
        let mut queue = CommandQueue::new();
        queue.push(cmd(1, 3, 0));

        assert_eq!(queue.pop_due(2), None);
        assert_eq!(queue.len(), 1);
        assert!(queue.pop_due(3).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_before() {
        let mut queue = CommandQueue::new();
        queue.push(cmd(1, 1, 0));
        queue.push(cmd(2, 2, 0));
        queue.push(cmd(1, 3, 0));

        let stale = queue.drain_before(3);
        assert_eq!(stale.len(), 2);
        assert_eq!(queue.next_turn(), Some(3));
    }

    #[test]
    fn test_json_is_tagged_by_kind() {
        let command = Command::new(
            1,
            20,
            CommandKind::Move {
                target: Vec2Fixed::from_raw(125_423_056, 130_503_525),
            },
        );
        let json = serde_json::to_string(&command).unwrap();
        assert_eq!(
            json,
            r#"{"player_id":1,"target_turn":20,"sequence":0,"kind":{"Move":{"target":{"x":125423056,"y":130503525}}}}"#
        );
        let parsed: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, command);
    }
}
