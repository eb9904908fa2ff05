//! Replay system for recording and playing back games.
//!
//! A replay stores the initial state and every accepted command. Feeding
//! both into a fresh [`Simulation`] recreates the game exactly.
//!
//! The text form is JSON:
//!
//! ```json
//! { "version": 1, "player_count": 2, "turn_speed_ms": 100,
//!   "initial_state": { ... },
//!   "commands": [ { "player_id": 1, "target_turn": 20, "sequence": 0,
//!                   "kind": { "Move": { "target": { "x": 125423056, "y": 130503525 } } } } ] }
//! ```
//!
//! [`Replay::encode`] produces a compact bincode form of the same data.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::{Result, SimError};
use crate::simulation::{Simulation, DEFAULT_TURN_SPEED_MS};
use crate::state::SimulationState;

/// Replay file format version for compatibility.
pub const REPLAY_VERSION: u32 = 1;

const fn default_turn_speed_ms() -> u32 {
    DEFAULT_TURN_SPEED_MS
}

/// Complete replay data structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    /// Replay format version.
    pub version: u32,
    /// Number of players.
    pub player_count: u32,
    /// Turn duration the game was played at.
    #[serde(default = "default_turn_speed_ms")]
    pub turn_speed_ms: u32,
    /// State before the first turn.
    pub initial_state: SimulationState,
    /// Every accepted command, in acceptance order.
    pub commands: Vec<Command>,
}

impl Replay {
    /// Capture a simulation's initial state and command log.
    #[must_use]
    pub fn from_simulation(sim: &Simulation) -> Self {
        Self {
            version: REPLAY_VERSION,
            player_count: sim.player_count(),
            turn_speed_ms: sim.turn_speed_ms(),
            initial_state: sim.initial_state().clone(),
            commands: sim.all_commands().to_vec(),
        }
    }

    /// Check the replay is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::MalformedReplay`] on a version mismatch, a player
    /// count that disagrees with the embedded state, an initial state whose
    /// ID allocators, selections or positions are inconsistent, or a command
    /// that could never be applied.
    pub fn validate(&self) -> Result<()> {
        if self.version != REPLAY_VERSION {
            return Err(SimError::MalformedReplay(format!(
                "Replay version mismatch: expected {}, got {}",
                REPLAY_VERSION, self.version
            )));
        }
        if self.player_count == 0 || self.player_count != self.initial_state.player_count() {
            return Err(SimError::MalformedReplay(format!(
                "Player count {} does not match initial state ({})",
                self.player_count,
                self.initial_state.player_count()
            )));
        }
        self.initial_state
            .validate()
            .map_err(|e| SimError::MalformedReplay(format!("Invalid initial state: {e}")))?;
        if let Some(bad) = self.commands.iter().find(|c| {
            c.target_turn == 0
                || c.player_id == 0
                || c.player_id > self.player_count
                || c.kind.world_position().is_some_and(|p| !p.in_world())
        }) {
            return Err(SimError::MalformedReplay(format!("Invalid command: {bad}")));
        }
        Ok(())
    }

    /// Write the JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self).map_err(|e| SimError::ReplayIo(e.into()))
    }

    /// Read and validate the JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::MalformedReplay`] for unparsable or inconsistent
    /// data and [`SimError::ReplayIo`] if reading fails.
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        let replay: Self = serde_json::from_reader(reader).map_err(|e| {
            if e.is_io() {
                SimError::ReplayIo(e.into())
            } else {
                SimError::MalformedReplay(e.to_string())
            }
        })?;
        replay.validate()?;
        Ok(replay)
    }

    /// Encode to the compact binary form.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| SimError::InvalidState(format!("Failed to serialize replay: {e}")))
    }

    /// Decode and validate the binary form.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::MalformedReplay`] if the bytes are not a valid replay.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let replay: Self = bincode::deserialize(bytes)
            .map_err(|e| SimError::MalformedReplay(format!("Failed to deserialize replay: {e}")))?;
        replay.validate()?;
        Ok(replay)
    }

    /// Save the JSON form to a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Load the JSON form from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::read_from(BufReader::new(File::open(path.as_ref())?))
    }

    /// Commands scheduled for `turn`.
    #[must_use]
    pub fn commands_at_turn(&self, turn: u64) -> Vec<&Command> {
        self.commands
            .iter()
            .filter(|cmd| cmd.target_turn == turn)
            .collect()
    }

    /// Last turn any command is scheduled for.
    #[must_use]
    pub fn final_turn(&self) -> u64 {
        self.commands
            .iter()
            .map(|cmd| cmd.target_turn)
            .max()
            .unwrap_or(0)
    }

    /// Get the total number of commands in the replay.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }
}

impl Simulation {
    /// Write this game as a JSON replay.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn save_replay<W: Write>(&self, writer: W) -> Result<()> {
        let replay = Replay::from_simulation(self);
        replay.write_to(writer)?;
        tracing::info!(
            turn = self.current_turn(),
            commands = replay.command_count(),
            "Replay saved"
        );
        Ok(())
    }

    /// Read a JSON replay and schedule its commands in this simulation.
    ///
    /// Existing entities and commands are kept. Commands for turns this
    /// simulation already passed are discarded. Returns the number of
    /// commands scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay is unreadable or malformed; nothing is
    /// scheduled in that case.
    pub fn load_replay<R: Read>(&mut self, reader: R) -> Result<usize> {
        let replay = Replay::read_from(reader)?;
        let total = replay.command_count();
        let accepted = self.add_commands(replay.commands);
        tracing::info!(accepted, total, "Replay loaded");
        Ok(accepted)
    }

    /// A fresh simulation at turn 0 with the replay's initial state and
    /// commands.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay is inconsistent.
    pub fn from_replay(replay: &Replay) -> Result<Self> {
        replay.validate()?;
        let mut sim = Self::with_initial_state(replay.turn_speed_ms, replay.initial_state.clone())?;
        sim.add_commands(replay.commands.iter().copied());
        Ok(sim)
    }
}

/// Replay playback controller.
#[derive(Debug)]
pub struct ReplayPlayer {
    replay: Replay,
    simulation: Simulation,
    /// Whether playback is paused.
    pub paused: bool,
}

impl ReplayPlayer {
    /// Create a new replay player from a replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay is inconsistent.
    pub fn new(replay: Replay) -> Result<Self> {
        let simulation = Simulation::from_replay(&replay)?;
        Ok(Self {
            replay,
            simulation,
            paused: false,
        })
    }

    /// Advance playback by one turn.
    ///
    /// Returns true if there are more commands to play.
    pub fn advance(&mut self) -> bool {
        if !self.paused && !self.is_finished() {
            self.simulation.step();
        }
        !self.is_finished()
    }

    /// Seek to a specific turn, rewinding if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the replay cannot be restarted.
    pub fn seek(&mut self, target_turn: u64) -> Result<()> {
        if target_turn < self.simulation.current_turn() {
            self.simulation = Simulation::from_replay(&self.replay)?;
        }
        while self.simulation.current_turn() < target_turn {
            self.simulation.step();
        }
        Ok(())
    }

    /// Whether every recorded command has been applied.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.simulation.current_turn() >= self.replay.final_turn()
    }

    /// Get the current turn.
    #[must_use]
    pub const fn current_turn(&self) -> u64 {
        self.simulation.current_turn()
    }

    /// Get the simulation being played back.
    #[must_use]
    pub const fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// Get the replay being played.
    #[must_use]
    pub const fn replay(&self) -> &Replay {
        &self.replay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::entity::Entity;
    use crate::math::{Fixed, Vec2Fixed};

    fn v(x: i64, y: i64) -> Vec2Fixed {
        Vec2Fixed::new(Fixed::from_int(x), Fixed::from_int(y))
    }

    fn recorded_game() -> Simulation {
        let mut sim = Simulation::new(100, 2).unwrap();
        let id = sim.seed_entity(Entity::at(v(0, 0)), 1).unwrap().entity_id;
        sim.add_commands([
            Command::new(1, 2, CommandKind::Select { entity_id: id }),
            Command::new(1, 3, CommandKind::Move { target: v(20, 5) }),
            Command::new(2, 5, CommandKind::Spawn { position: v(-3, 3) }),
        ]);
        for _ in 0..30 {
            sim.step();
        }
        sim
    }

    #[test]
    fn test_json_replay_recreates_game() {
        let sim = recorded_game();
        let mut bytes = Vec::new();
        sim.save_replay(&mut bytes).unwrap();

        let replay = Replay::read_from(bytes.as_slice()).unwrap();
        assert_eq!(replay.command_count(), 3);
        assert_eq!(replay.final_turn(), 5);
        assert_eq!(replay.commands_at_turn(3).len(), 1);

        let mut replayed = Simulation::from_replay(&replay).unwrap();
        while replayed.current_turn() < sim.current_turn() {
            replayed.step();
        }
        assert!(sim.compare(&replayed).is_ok());
        assert_eq!(sim.state_hash(), replayed.state_hash());
    }

    #[test]
    fn test_binary_form_matches_json_form() {
        let replay = Replay::from_simulation(&recorded_game());
        let decoded = Replay::decode(&replay.encode().unwrap()).unwrap();
        assert_eq!(decoded, replay);
    }

    #[test]
    fn test_load_replay_appends_to_running_simulation() {
        let mut source = Simulation::new(100, 2).unwrap();
        source.add_commands([
            Command::new(1, 1, CommandKind::Spawn { position: v(1, 1) }),
            Command::new(1, 4, CommandKind::Spawn { position: v(2, 2) }),
        ]);
        let mut bytes = Vec::new();
        source.save_replay(&mut bytes).unwrap();

        let mut target = Simulation::new(100, 2).unwrap();
        target.seed_entity(Entity::at(v(9, 9)), 2).unwrap();
        target.step();
        target.step();

        // The turn-1 spawn is already in the past for `target`.
        assert_eq!(target.load_replay(bytes.as_slice()).unwrap(), 1);
        target.step();
        target.step();
        assert_eq!(target.current_state().len(), 2);
    }

    #[test]
    fn test_malformed_replays_are_rejected() {
        assert!(matches!(
            Replay::read_from(&b"{ not json"[..]),
            Err(SimError::MalformedReplay(_))
        ));
        assert!(matches!(
            Replay::decode(&[1, 2, 3]),
            Err(SimError::MalformedReplay(_))
        ));

        let mut replay = Replay::from_simulation(&recorded_game());
        replay.version = 99;
        assert!(matches!(replay.validate(), Err(SimError::MalformedReplay(_))));

        let mut replay = Replay::from_simulation(&recorded_game());
        replay.commands.push(Command::new(1, 0, CommandKind::Deselect));
        assert!(replay.validate().is_err());

        let mut replay = Replay::from_simulation(&recorded_game());
        replay.player_count = 3;
        assert!(replay.validate().is_err());
    }

    #[test]
    fn test_tampered_initial_state_is_malformed() {
        let replay = Replay::from_simulation(&recorded_game());
        let mut json = serde_json::to_value(&replay).unwrap();
        json["initial_state"]["max_entities_per_player"] = 4_000_000_000u32.into();
        json["commands"] = serde_json::json!([
            { "player_id": 2, "target_turn": 1, "kind": { "Spawn": { "position": { "x": 0, "y": 0 } } } }
        ]);
        let bytes = serde_json::to_vec(&json).unwrap();
        assert!(matches!(
            Replay::read_from(bytes.as_slice()),
            Err(SimError::MalformedReplay(_))
        ));

        let mut far_command = replay;
        far_command.commands.push(Command::new(
            1,
            40,
            CommandKind::Move { target: Vec2Fixed::from_raw(i64::MIN, 0) },
        ));
        assert!(matches!(far_command.validate(), Err(SimError::MalformedReplay(_))));
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let json = r#"{"version":1,"player_count":2,"commands":[]}"#;
        assert!(matches!(
            Replay::read_from(json.as_bytes()),
            Err(SimError::MalformedReplay(_))
        ));
    }

    #[test]
    fn test_player_seek_and_advance() {
        let sim = recorded_game();
        let mut player = ReplayPlayer::new(Replay::from_simulation(&sim)).unwrap();

        while player.advance() {}
        assert_eq!(player.current_turn(), 5);
        assert!(player.is_finished());

        player.seek(30).unwrap();
        assert!(sim.compare(player.simulation()).is_ok());

        player.seek(2).unwrap();
        assert_eq!(player.current_turn(), 2);
        assert_eq!(player.simulation().current_state().selection(1), vec![0]);
    }
}
