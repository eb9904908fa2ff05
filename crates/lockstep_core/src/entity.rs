//! Simulated entities and their per-turn movement rule.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::math::{Blend, Fixed, Vec2Fixed};

/// Unique identifier for entities. Partitioned by player, see
/// [`SimulationState`](crate::state::SimulationState).
pub type EntityId = u32;

/// Player identifier, `1..=player_count`.
pub type PlayerId = u32;

/// Distance travelled per turn by a moving entity.
pub const SPEED_PER_TURN: Fixed = Fixed::ONE;

/// Entities closer than this to their target snap onto it.
pub const ARRIVAL_RADIUS: Fixed = Fixed::from_int(2);

/// A single simulated object.
///
/// Equality is exact, field by field. The determinism checks rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Entity {
    /// World position.
    pub position: Vec2Fixed,
    /// Where the entity is heading. Only meaningful while `moving`.
    pub target: Vec2Fixed,
    /// Per-turn displacement. Never read while not `moving`.
    pub velocity: Vec2Fixed,
    /// Whether the entity is travelling towards `target`.
    pub moving: bool,
    /// Owner, stamped on spawn.
    pub owning_player: PlayerId,
    /// ID, stamped on spawn.
    pub entity_id: EntityId,
}

impl Entity {
    /// An idle, unowned entity at `position`, ready to be spawned.
    #[must_use]
    pub fn at(position: Vec2Fixed) -> Self {
        Self {
            position,
            target: position,
            ..Self::default()
        }
    }

    /// Advance the entity by one turn.
    #[must_use]
    pub fn update(mut self) -> Self {
        if !self.moving {
            return self;
        }

        // The second condition catches a target that rounding made us pass.
        let remaining = self.target - self.position;
        if self.position.distance(self.target) < ARRIVAL_RADIUS
            || remaining.dot_wide(self.velocity) <= 0
        {
            self.position = self.target;
            self.moving = false;
            return self;
        }

        self.position = self.position + self.velocity;
        self
    }

    /// Start moving towards `target` at [`SPEED_PER_TURN`].
    pub fn move_towards(&mut self, target: Vec2Fixed) {
        self.target = target;
        self.velocity = velocity_towards(self.position, target);
        self.moving = true;
    }

    /// Presentation blend between two snapshots of the same entity.
    ///
    /// `t = 1` yields `newer`, `t = 0` yields `older`'s position and target.
    #[must_use]
    pub fn interpolate(newer: &Self, older: &Self, t: Blend) -> Self {
        Self {
            position: Vec2Fixed::blend(newer.position, older.position, t),
            target: Vec2Fixed::blend(newer.target, older.target, t),
            ..*newer
        }
    }

    /// Name of the first field that differs from `other`, if any.
    #[must_use]
    pub fn first_difference(&self, other: &Self) -> Option<&'static str> {
        if self.position != other.position {
            Some("position")
        } else if self.target != other.target {
            Some("target")
        } else if self.velocity != other.velocity {
            Some("velocity")
        } else if self.moving != other.moving {
            Some("moving")
        } else if self.owning_player != other.owning_player {
            Some("owning_player")
        } else if self.entity_id != other.entity_id {
            Some("entity_id")
        } else {
            None
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Entity {} (player {}): P = {}/{}, V = {}/{}, M = {}, T = {}/{}",
            self.entity_id,
            self.owning_player,
            self.position.x,
            self.position.y,
            self.velocity.x,
            self.velocity.y,
            self.moving,
            self.target.x,
            self.target.y,
        )
    }
}

/// Velocity of length [`SPEED_PER_TURN`] from `from` towards `to`.
///
/// Zero when the points coincide.
#[must_use]
pub fn velocity_towards(from: Vec2Fixed, to: Vec2Fixed) -> Vec2Fixed {
    let dist = i128::from(from.distance(to).raw());
    if dist == 0 {
        return Vec2Fixed::ZERO;
    }

    let delta = to - from;
    let speed = i128::from(SPEED_PER_TURN.raw());
    let scale = |component: Fixed| {
        Fixed::from_raw((i128::from(component.raw()) * speed / dist) as i64)
    };
    Vec2Fixed::new(scale(delta.x), scale(delta.y))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: i64, y: i64) -> Vec2Fixed {
        Vec2Fixed::new(Fixed::from_int(x), Fixed::from_int(y))
    }

    #[test]
    fn test_idle_entity_is_unchanged() {
        let entity = Entity {
            velocity: v(5, 5),
            ..Entity::at(v(1, 1))
        };
        assert_eq!(entity.update(), entity);
    }

    #[test]
    fn test_velocity_has_unit_speed() {
        let vel = velocity_towards(v(0, 0), v(30, 40));
        assert_eq!(vel, Vec2Fixed::from_raw(6_000, 8_000));
    }

    #[test]
    fn test_velocity_zero_distance() {
        assert_eq!(velocity_towards(v(3, 3), v(3, 3)), Vec2Fixed::ZERO);
    }

    #[test]
    fn test_moves_then_snaps() {
        let mut entity = Entity::at(v(0, 0));
        entity.move_towards(v(5, 0));

        entity = entity.update();
        assert_eq!(entity.position, v(1, 0));
        entity = entity.update();
        entity = entity.update();
        assert_eq!(entity.position, v(3, 0));
        assert!(entity.moving);

        // 2.0 away is not yet inside the arrival radius
        entity = entity.update();
        assert_eq!(entity.position, v(4, 0));
        entity = entity.update();
        assert_eq!(entity.position, v(5, 0));
        assert!(!entity.moving);
    }

    #[test]
    fn test_passed_target_snaps_instead_of_overshooting() {
        let entity = Entity {
            position: v(10, 0),
            target: v(0, 0),
            velocity: v(1, 0),
            moving: true,
            ..Entity::default()
        };
        let updated = entity.update();
        assert_eq!(updated.position, v(0, 0));
        assert!(!updated.moving);
    }

    #[test]
    fn test_interpolate_keeps_identity_of_newer() {
        let older = Entity {
            entity_id: 7,
            owning_player: 1,
            ..Entity::at(v(0, 0))
        };
        let mut newer = older;
        newer.move_towards(v(10, 0));
        newer = newer.update();

        let half = Entity::interpolate(&newer, &older, Blend::from_num(0.5));
        assert_eq!(half.position, Vec2Fixed::from_raw(5_000, 0));
        assert_eq!(half.entity_id, 7);
        assert_eq!(half.velocity, newer.velocity);
        assert!(half.moving);
    }

    #[test]
    fn test_first_difference() {
        let a = Entity::at(v(1, 2));
        let mut b = a;
        assert_eq!(a.first_difference(&b), None);
        b.velocity = v(0, 1);
        assert_eq!(a.first_difference(&b), Some("velocity"));
        b.position = v(9, 9);
        assert_eq!(a.first_difference(&b), Some("position"));
    }
}
