//! Test fixtures and helpers.
//!
//! Pre-built simulations and RON scenarios for consistent testing.

use std::path::Path;

use lockstep_core::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Create a fixed-point number from whole units.
#[must_use]
pub const fn fixed(n: i64) -> Fixed {
    Fixed::from_int(n)
}

/// Create a vector from whole units.
#[must_use]
pub const fn vec2(x: i64, y: i64) -> Vec2Fixed {
    Vec2Fixed::new(Fixed::from_int(x), Fixed::from_int(y))
}

/// Turn duration used by fixtures.
pub const TEST_TURN_SPEED_MS: u32 = 100;

/// An empty two-player simulation.
///
/// # Panics
///
/// Never; the parameters are valid.
#[must_use]
pub fn two_player_simulation() -> Simulation {
    Simulation::new(TEST_TURN_SPEED_MS, 2).expect("two players is a valid setup")
}

/// A simulation where every player starts with a row of `per_player` idle
/// units, player `p` on row `y = 10 * p`.
///
/// # Panics
///
/// Panics if `player_count` is zero.
#[must_use]
pub fn lined_up_simulation(player_count: u32, per_player: u32) -> Simulation {
    let mut sim = Simulation::new(TEST_TURN_SPEED_MS, player_count).expect("valid player count");
    for player in 1..=player_count {
        for i in 0..per_player {
            let position = vec2(i64::from(i) * 3, i64::from(player) * 10);
            sim.seed_entity(Entity::at(position), player)
                .expect("fixture fits in the ID range");
        }
    }
    sim
}

/// The command log of the reference replay: player 1 selects entity 5 on
/// turn 2 and orders it to (12542.3056, 13050.3525) on turn 20.
#[must_use]
pub fn reference_replay_commands() -> Vec<Command> {
    vec![
        Command::new(1, 2, CommandKind::Select { entity_id: 5 }),
        Command::new(
            1,
            20,
            CommandKind::Move {
                target: Vec2Fixed::from_raw(125_423_056, 130_503_525),
            },
        ),
    ]
}

/// Error type for scenario operations.
#[derive(Error, Debug)]
pub enum ScenarioError {
    /// Failed to read file.
    #[error("Failed to read scenario file: {0}")]
    ReadError(#[from] std::io::Error),
    /// Failed to parse RON.
    #[error("Failed to parse scenario: {0}")]
    ParseError(#[from] ron::error::SpannedError),
    /// The scenario does not describe a valid game.
    #[error("Invalid scenario: {0}")]
    Invalid(#[from] SimError),
}

/// Result type for scenario operations.
pub type ScenarioResult<T> = std::result::Result<T, ScenarioError>;

/// A unit placed before the first turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitPlacement {
    /// Owner.
    pub player: PlayerId,
    /// Position in whole units.
    pub x: i64,
    /// Position in whole units.
    pub y: i64,
}

/// A starting position plus a scripted command log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Number of players.
    pub player_count: u32,
    /// Turn duration.
    #[serde(default = "default_turn_speed")]
    pub turn_speed_ms: u32,
    /// Units placed before the first turn.
    #[serde(default)]
    pub units: Vec<UnitPlacement>,
    /// Scripted commands.
    #[serde(default)]
    pub commands: Vec<Command>,
    /// How many turns the scenario runs for.
    pub turns: u64,
}

const fn default_turn_speed() -> u32 {
    TEST_TURN_SPEED_MS
}

impl Scenario {
    /// Load a scenario from a RON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> ScenarioResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_ron_str(&contents)
    }

    /// Load from a RON string (useful for embedded scenarios).
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid scenario.
    pub fn from_ron_str(ron: &str) -> ScenarioResult<Self> {
        let scenario: Self = ron::from_str(ron)?;
        Ok(scenario)
    }

    /// Build the simulation at turn 0 with units placed and commands queued.
    ///
    /// # Errors
    ///
    /// Returns an error if a unit or command is invalid for the scenario.
    pub fn build(&self) -> ScenarioResult<Simulation> {
        let mut sim = Simulation::new(self.turn_speed_ms, self.player_count)?;
        for unit in &self.units {
            sim.seed_entity(Entity::at(vec2(unit.x, unit.y)), unit.player)?;
        }
        for command in &self.commands {
            sim.add_command(*command)?;
        }
        tracing::debug!(
            scenario = %self.name,
            units = self.units.len(),
            commands = self.commands.len(),
            "Scenario built"
        );
        Ok(sim)
    }

    /// Build the simulation and run it for [`turns`](Self::turns) turns.
    ///
    /// # Errors
    ///
    /// Returns an error if the scenario cannot be built.
    pub fn run(&self) -> ScenarioResult<Simulation> {
        let mut sim = self.build()?;
        for _ in 0..self.turns {
            sim.step();
        }
        Ok(sim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SKIRMISH: &str = r#"
        (
            name: "skirmish",
            player_count: 2,
            units: [
                (player: 1, x: 0, y: 0),
                (player: 1, x: 4, y: 0),
                (player: 2, x: 50, y: 50),
            ],
            commands: [
                (player_id: 1, target_turn: 1, kind: BoxSelect(min: (x: -10000, y: -10000), max: (x: 100000, y: 10000))),
                (player_id: 1, target_turn: 2, kind: Move(target: (x: 200000, y: 0))),
                (player_id: 2, target_turn: 3, sequence: 4, kind: MassSpawn(position: (x: 500000, y: 500000))),
            ],
            turns: 40,
        )
    "#;

    #[test]
    fn test_scenario_from_ron() {
        let scenario = Scenario::from_ron_str(SKIRMISH).unwrap();
        assert_eq!(scenario.turn_speed_ms, TEST_TURN_SPEED_MS);
        assert_eq!(scenario.units.len(), 3);
        assert_eq!(scenario.commands[2].sequence, 4);

        let sim = scenario.run().unwrap();
        assert_eq!(sim.current_turn(), 40);
        assert_eq!(sim.current_state().len(), 103);

        // Both units arrive two units either side of the target.
        assert_eq!(sim.current_state().entity(0).unwrap().position, vec2(18, 0));
        assert_eq!(sim.current_state().entity(1).unwrap().position, vec2(22, 0));
    }

    #[test]
    fn test_invalid_scenarios() {
        assert!(matches!(
            Scenario::from_ron_str("(name: \"broken\""),
            Err(ScenarioError::ParseError(_))
        ));

        let foreign_unit = Scenario {
            name: "foreign".to_string(),
            player_count: 1,
            turn_speed_ms: TEST_TURN_SPEED_MS,
            units: vec![UnitPlacement { player: 2, x: 0, y: 0 }],
            commands: Vec::new(),
            turns: 1,
        };
        assert!(matches!(
            foreign_unit.build(),
            Err(ScenarioError::Invalid(SimError::InvalidPlayer { .. }))
        ));
    }

    #[test]
    fn test_lined_up_simulation() {
        let sim = lined_up_simulation(3, 4);
        assert_eq!(sim.current_state().len(), 12);
        assert_eq!(sim.current_state().entities_owned_by(2).count(), 4);
        assert_eq!(sim.initial_state(), sim.current_state());
    }
}
