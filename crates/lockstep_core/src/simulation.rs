//! The lockstep simulation engine.
//!
//! The engine advances in discrete turns. Each turn it copies the current
//! snapshot, applies every command scheduled for the new turn and moves every
//! entity. Peers that feed it the same commands end every turn with identical
//! state.
//!
//! # Determinism
//!
//! - No floating-point math in the authoritative state (see [`Fixed`](crate::math::Fixed))
//! - Commands applied in one canonical order (see [`CommandQueue`])
//! - Entities updated in ascending ID order
//! - Randomness only from per-command seeded generators
//!
//! # Example
//!
//! ```
//! use lockstep_core::prelude::*;
//!
//! let mut sim = Simulation::new(100, 2).unwrap();
//! let unit = sim
//!     .seed_entity(Entity::at(Vec2Fixed::ZERO), 1)
//!     .unwrap();
//!
//! sim.add_command(Command::new(1, 1, CommandKind::Select { entity_id: unit.entity_id }))
//!     .unwrap();
//! sim.add_command(Command::new(
//!     1,
//!     2,
//!     CommandKind::Move { target: Vec2Fixed::new(Fixed::from_int(10), Fixed::ZERO) },
//! ))
//! .unwrap();
//!
//! for _ in 0..20 {
//!     sim.step();
//! }
//! assert!(sim.check_determinism().is_ok());
//! ```

use std::fmt;
use std::sync::Arc;

use crate::command::{Command, CommandQueue};
use crate::entity::{Entity, EntityId};
use crate::error::{DeterminismError, Result, SimError};
use crate::handler::CommandHandler;
use crate::math::blend_factor;
use crate::presentation::{EntityEvent, SimulationObserver, ViewProjection};
use crate::state::SimulationState;

/// Default turn duration in milliseconds.
pub const DEFAULT_TURN_SPEED_MS: u32 = 100;

/// Observer hooks as stored by the engine.
pub type BoxedObserver = Box<dyn SimulationObserver + Send>;

/// Events generated during a single turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnEvents {
    /// The turn that was simulated.
    pub turn: u64,
    /// Commands applied this turn, in application order.
    pub applied: Vec<Command>,
    /// Commands drained this turn that the handler rejected.
    pub rejected: Vec<Command>,
    /// Entities spawned this turn.
    pub spawned: Vec<EntityId>,
    /// Entities despawned this turn.
    pub despawned: Vec<EntityId>,
    /// Hash of the state at the end of the turn.
    pub state_hash: u64,
}

/// The lockstep simulation.
///
/// Keeps three snapshots: the state being produced this turn, the state of
/// the previous turn and the one before it. The latter two feed
/// [`interpolate`](Self::interpolate) and are never mutated once shifted.
pub struct Simulation {
    turn_speed_ms: u32,
    current_turn: u64,
    current_state: SimulationState,
    last_state: SimulationState,
    two_steps_ago_state: SimulationState,
    initial_state: SimulationState,
    queue: CommandQueue,
    all_commands: Vec<Command>,
    last_frame_actions: Vec<Command>,
    handler: CommandHandler,
    observer: Option<BoxedObserver>,
    paused: bool,
    accumulated_ms: u64,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("turn_speed_ms", &self.turn_speed_ms)
            .field("current_turn", &self.current_turn)
            .field("entities", &self.current_state.len())
            .field("pending_commands", &self.queue.len())
            .field("paused", &self.paused)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    /// Create an empty simulation for `player_count` players.
    ///
    /// # Errors
    ///
    /// Returns an error if `player_count` or `turn_speed_ms` is zero.
    pub fn new(turn_speed_ms: u32, player_count: u32) -> Result<Self> {
        Self::with_initial_state(turn_speed_ms, SimulationState::new(player_count)?)
    }

    /// Create a simulation at turn 0 from a prepared snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if `turn_speed_ms` is zero or the snapshot is
    /// inconsistent.
    pub fn with_initial_state(turn_speed_ms: u32, state: SimulationState) -> Result<Self> {
        check_turn_speed(turn_speed_ms)?;
        state.validate()?;
        Ok(Self {
            turn_speed_ms,
            current_turn: 0,
            current_state: state.clone(),
            last_state: state.clone(),
            two_steps_ago_state: state.clone(),
            initial_state: state,
            queue: CommandQueue::new(),
            all_commands: Vec::new(),
            last_frame_actions: Vec::new(),
            handler: CommandHandler::default(),
            observer: None,
            paused: false,
            accumulated_ms: 0,
        })
    }

    /// Resolve box selections through `projection` instead of world space.
    #[must_use]
    pub fn with_projection(mut self, projection: Arc<dyn ViewProjection>) -> Self {
        self.handler = CommandHandler::new(projection);
        self
    }

    /// Install the presentation observer.
    pub fn set_observer(&mut self, observer: BoxedObserver) {
        self.observer = Some(observer);
    }

    /// Remove and return the presentation observer.
    pub fn take_observer(&mut self) -> Option<BoxedObserver> {
        self.observer.take()
    }

    /// Place an entity into the starting scenario.
    ///
    /// Only valid before the first step; the entity becomes part of every
    /// history snapshot and of the initial state used by replays.
    ///
    /// # Errors
    ///
    /// Returns an error after turn 0, for unknown players, or when the
    /// player's ID range is exhausted.
    pub fn seed_entity(&mut self, entity: Entity, player_id: u32) -> Result<Entity> {
        if self.current_turn != 0 {
            return Err(SimError::InvalidState(format!(
                "Cannot seed entities at turn {}",
                self.current_turn
            )));
        }
        let spawned = self.current_state.spawn_entity(entity, player_id)?;
        self.last_state = self.current_state.clone();
        self.two_steps_ago_state = self.current_state.clone();
        self.initial_state = self.current_state.clone();
        Ok(spawned)
    }

    /// Schedule a command.
    ///
    /// # Errors
    ///
    /// Rejects commands from players outside `[1, player_count]`, commands
    /// for turns that were already simulated and commands whose position lies
    /// outside [`WORLD_LIMIT`](crate::math::WORLD_LIMIT). Rejected commands
    /// are dropped.
    pub fn add_command(&mut self, command: Command) -> Result<()> {
        let player_count = self.current_state.player_count();
        if command.player_id == 0 || command.player_id > player_count {
            tracing::warn!(%command, player_count, "Discarding command from invalid player");
            return Err(SimError::InvalidPlayer {
                player_id: command.player_id,
                player_count,
            });
        }
        if command.target_turn <= self.current_turn {
            tracing::warn!(%command, current_turn = self.current_turn, "Discarding stale command");
            return Err(SimError::StaleCommand {
                target_turn: command.target_turn,
                current_turn: self.current_turn,
            });
        }

        if let Some(position) = command.kind.world_position().filter(|p| !p.in_world()) {
            tracing::warn!(%command, "Discarding command outside the world");
            return Err(SimError::OutOfWorld(position));
        }

        self.queue.push(command);
        self.all_commands.push(command);
        Ok(())
    }

    /// Schedule several commands, returning how many were accepted.
    pub fn add_commands(&mut self, commands: impl IntoIterator<Item = Command>) -> usize {
        commands
            .into_iter()
            .filter(|command| self.add_command(*command).is_ok())
            .count()
    }

    /// Advance the simulation by one turn.
    pub fn step(&mut self) -> TurnEvents {
        self.current_turn += 1;
        let turn = self.current_turn;

        let next_state = self.current_state.clone();
        self.two_steps_ago_state = std::mem::replace(&mut self.last_state, next_state);
        std::mem::swap(&mut self.last_state, &mut self.current_state);

        for stale in self.queue.drain_before(turn) {
            tracing::warn!(command = %stale, turn, "Discarding command for a past turn");
        }

        let mut events = TurnEvents {
            turn,
            ..TurnEvents::default()
        };
        self.last_frame_actions.clear();
        let mut lifecycle = Vec::new();
        while let Some(command) = self.queue.pop_due(turn) {
            self.last_frame_actions.push(command);
            match self
                .handler
                .apply(&mut self.current_state, &command, &mut lifecycle)
            {
                Ok(()) => events.applied.push(command),
                Err(e) => {
                    tracing::warn!(%command, error = %e, "Command rejected");
                    events.rejected.push(command);
                }
            }
            for event in lifecycle.drain(..) {
                if let Some(observer) = self.observer.as_deref_mut() {
                    event.notify(observer);
                }
                match event {
                    EntityEvent::Spawned(entity) => events.spawned.push(entity.entity_id),
                    EntityEvent::Despawned(entity) => events.despawned.push(entity.entity_id),
                }
            }
        }

        for entity in self.current_state.entities_mut() {
            *entity = entity.update();
        }

        events.state_hash = self.current_state.state_hash();
        tracing::debug!(
            turn,
            state_hash = events.state_hash,
            commands = self.last_frame_actions.len(),
            "Turn simulated"
        );
        events
    }

    /// Fixed-timestep driver: accumulate `elapsed_ms` and step as many
    /// whole turns as fit. Does nothing while paused.
    pub fn run(&mut self, elapsed_ms: u64) -> Vec<TurnEvents> {
        if self.paused {
            return Vec::new();
        }
        self.accumulated_ms += elapsed_ms;
        let turn_ms = u64::from(self.turn_speed_ms);
        let mut turns = Vec::new();
        while self.accumulated_ms >= turn_ms {
            self.accumulated_ms -= turn_ms;
            turns.push(self.step());
        }
        turns
    }

    /// Pause or resume [`run`](Self::run). Returns the new paused flag.
    pub fn toggle_pause(&mut self) -> bool {
        self.paused = !self.paused;
        self.paused
    }

    /// Whether [`run`](Self::run) is paused.
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Change the turn duration.
    ///
    /// # Errors
    ///
    /// Returns an error if `turn_speed_ms` is zero.
    pub fn set_turn_speed_ms(&mut self, turn_speed_ms: u32) -> Result<()> {
        check_turn_speed(turn_speed_ms)?;
        self.turn_speed_ms = turn_speed_ms;
        Ok(())
    }

    /// Turn duration in milliseconds.
    #[must_use]
    pub const fn turn_speed_ms(&self) -> u32 {
        self.turn_speed_ms
    }

    /// Milliseconds [`run`](Self::run) has accumulated towards the next turn.
    #[must_use]
    pub const fn ms_since_turn_start(&self) -> u64 {
        self.accumulated_ms
    }

    /// The last simulated turn.
    #[must_use]
    pub const fn current_turn(&self) -> u64 {
        self.current_turn
    }

    /// Number of players.
    #[must_use]
    pub const fn player_count(&self) -> u32 {
        self.current_state.player_count()
    }

    /// State at the end of the current turn.
    #[must_use]
    pub const fn current_state(&self) -> &SimulationState {
        &self.current_state
    }

    /// State at the end of the previous turn.
    #[must_use]
    pub const fn last_state(&self) -> &SimulationState {
        &self.last_state
    }

    /// State at the end of the turn before the previous one.
    #[must_use]
    pub const fn two_steps_ago_state(&self) -> &SimulationState {
        &self.two_steps_ago_state
    }

    /// The state the simulation started from.
    #[must_use]
    pub const fn initial_state(&self) -> &SimulationState {
        &self.initial_state
    }

    /// Every accepted command, in acceptance order.
    #[must_use]
    pub fn all_commands(&self) -> &[Command] {
        &self.all_commands
    }

    /// Commands drained on the last turn, in application order.
    #[must_use]
    pub fn last_frame_actions(&self) -> &[Command] {
        &self.last_frame_actions
    }

    /// Commands waiting for their turn.
    #[must_use]
    pub const fn pending_commands(&self) -> &CommandQueue {
        &self.queue
    }

    /// Hash of the current state.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        self.current_state.state_hash()
    }

    /// Presentation snapshot `ms_since_start_of_turn` into the current turn.
    ///
    /// Blends the previous turn's state with the one before it. Entities that
    /// did not exist two turns ago are taken as-is.
    #[must_use]
    pub fn interpolate(&self, ms_since_start_of_turn: u64) -> SimulationState {
        let t = blend_factor(ms_since_start_of_turn, self.turn_speed_ms);
        let mut state = self.last_state.clone();
        for entity in state.entities_mut() {
            if let Some(older) = self.two_steps_ago_state.entity(entity.entity_id) {
                *entity = Entity::interpolate(entity, older, t);
            }
        }
        state
    }

    /// Presentation position of a single entity, `None` if it is gone.
    #[must_use]
    pub fn interpolate_entity(&self, id: EntityId, ms_since_start_of_turn: u64) -> Option<Entity> {
        let newer = self.last_state.entity(id)?;
        Some(match self.two_steps_ago_state.entity(id) {
            Some(older) => Entity::interpolate(
                newer,
                older,
                blend_factor(ms_since_start_of_turn, self.turn_speed_ms),
            ),
            None => *newer,
        })
    }

    /// Re-derive the current turn from the previous snapshot and the last
    /// turn's commands and compare the outcome. Always passes at turn 0.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NotDeterministic`] describing the first mismatch.
    pub fn check_determinism(&self) -> Result<()> {
        // Nothing has been simulated yet.
        if self.current_turn == 0 {
            return Ok(());
        }
        let mut check = self.fresh(self.last_state.clone());
        check.current_turn = self.current_turn - 1;
        for command in &self.last_frame_actions {
            check.queue.push(*command);
        }
        check.step();
        Ok(self.compare(&check)?)
    }

    /// Re-run the whole game from the initial state and compare the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NotDeterministic`] describing the first mismatch.
    pub fn check_full_determinism(&self) -> Result<()> {
        let mut check = self.fresh(self.initial_state.clone());
        for command in &self.all_commands {
            check.queue.push(*command);
        }
        while check.current_turn < self.current_turn {
            check.step();
        }
        Ok(self.compare(&check)?)
    }

    /// Compare the current state with another simulation's.
    ///
    /// # Errors
    ///
    /// Returns the first difference: turn, entity set, entity fields, then
    /// selections.
    pub fn compare(&self, check: &Self) -> std::result::Result<(), DeterminismError> {
        if self.current_turn != check.current_turn {
            return Err(DeterminismError::TurnMismatch {
                live: self.current_turn,
                check: check.current_turn,
            });
        }
        let turn = self.current_turn;
        let live = &self.current_state;
        let other = &check.current_state;

        let only_live: Vec<EntityId> = live
            .entities()
            .keys()
            .filter(|id| other.entity(**id).is_none())
            .copied()
            .collect();
        let only_check: Vec<EntityId> = other
            .entities()
            .keys()
            .filter(|id| live.entity(**id).is_none())
            .copied()
            .collect();
        if !only_live.is_empty() || !only_check.is_empty() {
            return Err(DeterminismError::EntitySetMismatch {
                turn,
                only_live,
                only_check,
            });
        }

        for (id, a) in live.entities() {
            let Some(b) = other.entity(*id) else { continue };
            if let Some(field) = a.first_difference(b) {
                return Err(DeterminismError::EntityMismatch {
                    turn,
                    entity_id: *id,
                    field,
                    live: Box::new(*a),
                    check: Box::new(*b),
                });
            }
        }

        for player_id in 1..=live.player_count().max(other.player_count()) {
            let (a, b) = (live.selection(player_id), other.selection(player_id));
            if a != b {
                return Err(DeterminismError::SelectionMismatch {
                    turn,
                    player_id,
                    live: a,
                    check: b,
                });
            }
        }
        Ok(())
    }

    /// A simulation sharing this one's configuration, without an observer.
    fn fresh(&self, state: SimulationState) -> Self {
        Self {
            turn_speed_ms: self.turn_speed_ms,
            current_turn: 0,
            current_state: state.clone(),
            last_state: state.clone(),
            two_steps_ago_state: state.clone(),
            initial_state: state,
            queue: CommandQueue::new(),
            all_commands: Vec::new(),
            last_frame_actions: Vec::new(),
            handler: self.handler.clone(),
            observer: None,
            paused: false,
            accumulated_ms: 0,
        }
    }
}

fn check_turn_speed(turn_speed_ms: u32) -> Result<()> {
    if turn_speed_ms == 0 {
        return Err(SimError::InvalidState(
            "Turn speed must be at least 1 ms".to_string(),
        ));
    }
    Ok(())
}
