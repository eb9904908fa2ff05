//! Determinism testing utilities.
//!
//! Provides a harness for verifying that the simulation
//! produces identical results given identical inputs.
//!
//! # Testing Strategy
//!
//! Lockstep peers only exchange commands, so every peer must compute
//! bit-identical state from them. Sources of non-determinism include:
//!
//! - **Floating-point math**: Different CPUs can produce different results.
//!   We use fixed-point arithmetic via [`lockstep_core::math::Fixed`] throughout.
//!
//! - **Iteration order**: Hash maps iterate in a randomized order.
//!   Entities and selections live in ordered maps.
//!
//! - **Command order**: Network arrival order differs between peers.
//!   The command queue applies a canonical order.
//!
//! - **System randomness**: No generator without an explicit seed.
//!
//! # Test Levels
//!
//! 1. **Unit tests**: Entity movement and command semantics
//! 2. **Property tests**: Random command streams must replay identically
//! 3. **Integration tests**: Scenarios and replays are reproducible
//! 4. **Parallel tests**: Running N simulations on threads all match

use std::thread;

use lockstep_core::prelude::*;

/// Per-turn state hashes of several runs of the same game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// For each run, the hash after every simulated turn (index 0 is turn 1).
    pub runs: Vec<Vec<u64>>,
}

impl DeterminismResult {
    /// Hash at the end of the game for each run.
    #[must_use]
    pub fn final_hashes(&self) -> Vec<u64> {
        self.runs
            .iter()
            .map(|run| run.last().copied().unwrap_or_default())
            .collect()
    }

    /// First turn on which some run disagrees with the first one.
    #[must_use]
    pub fn first_divergence(&self) -> Option<u64> {
        let (reference, others) = self.runs.split_first()?;
        let index = reference
            .iter()
            .enumerate()
            .find(|(i, hash)| others.iter().any(|run| run.get(*i) != Some(*hash)))
            .map(|(i, _)| i)?;
        Some(index as u64 + 1)
    }

    /// Whether every run produced the same hash on every turn.
    #[must_use]
    pub fn is_deterministic(&self) -> bool {
        self.first_divergence().is_none()
    }

    /// Assert that every run agreed, naming the first diverging turn.
    ///
    /// # Panics
    ///
    /// Panics if the runs disagree.
    pub fn assert_deterministic(&self) {
        if let Some(turn) = self.first_divergence() {
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 First diverging turn: {turn}\n\
                 Final hashes: {:?}",
                self.runs.len(),
                self.final_hashes()
            );
        }
    }
}

fn hash_trace(mut sim: Simulation, commands: &[Command], turns: u64) -> Vec<u64> {
    sim.add_commands(commands.iter().copied());
    (0..turns).map(|_| sim.step().state_hash).collect()
}

/// Play `commands` on `runs` fresh simulations for `turns` turns and record
/// the hash of every turn.
pub fn verify_determinism<F>(
    runs: usize,
    turns: u64,
    setup: F,
    commands: &[Command],
) -> DeterminismResult
where
    F: Fn() -> Simulation,
{
    DeterminismResult {
        runs: (0..runs).map(|_| hash_trace(setup(), commands, turns)).collect(),
    }
}

/// Runs a [`Simulation`] twice with identical setup and compares every turn.
pub fn verify_simulation_determinism<F>(setup_fn: F, num_turns: u64) -> bool
where
    F: Fn() -> Simulation,
{
    verify_determinism(2, num_turns, setup_fn, &[]).is_deterministic()
}

/// Run N simulations on scoped threads and collect final hashes.
///
/// Catches non-determinism that only shows up under thread scheduling or
/// memory layout differences.
///
/// # Panics
///
/// Panics if a simulation thread panics.
pub fn run_parallel_simulations<F>(
    setup_fn: F,
    num_sims: usize,
    num_turns: u64,
) -> DeterminismResult
where
    F: Fn() -> Simulation + Sync,
{
    let runs = thread::scope(|s| {
        let handles: Vec<_> = (0..num_sims)
            .map(|_| s.spawn(|| hash_trace(setup_fn(), &[], num_turns)))
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    DeterminismResult { runs }
}

/// Compare two simulation runs turn by turn, finding the first divergence.
///
/// # Returns
///
/// `None` if simulations are deterministic, `Some(turn)` if they diverge
/// at that turn.
pub fn find_first_divergence<F>(setup_fn: F, num_turns: u64) -> Option<u64>
where
    F: Fn() -> Simulation,
{
    let mut sim1 = setup_fn();
    let mut sim2 = setup_fn();

    if sim1.state_hash() != sim2.state_hash() {
        return Some(0);
    }

    for turn in 1..=num_turns {
        sim1.step();
        sim2.step();

        if sim1.compare(&sim2).is_err() {
            return Some(turn);
        }
    }

    None
}

/// Run a game, save it as a JSON replay, replay it from scratch and compare.
///
/// # Errors
///
/// Returns the first mismatch, or an error if the replay cannot be written
/// or read back.
pub fn verify_replay_determinism<F>(setup_fn: F, num_turns: u64) -> Result<()>
where
    F: Fn() -> Simulation,
{
    let mut live = setup_fn();
    for _ in 0..num_turns {
        live.step();
    }

    let mut bytes = Vec::new();
    live.save_replay(&mut bytes)?;
    let replay = Replay::read_from(bytes.as_slice())?;

    let mut replayed = Simulation::from_replay(&replay)?;
    while replayed.current_turn() < live.current_turn() {
        replayed.step();
    }
    Ok(live.compare(&replayed)?)
}

/// Step a game while running the per-turn and full determinism checks.
///
/// # Errors
///
/// Returns the first failing check.
pub fn step_checked(sim: &mut Simulation, num_turns: u64) -> Result<()> {
    for _ in 0..num_turns {
        sim.step();
        sim.check_determinism()?;
    }
    sim.check_full_determinism()
}

/// Proptest strategies for determinism testing.
///
/// These strategies generate random but reproducible inputs for
/// property-based testing of simulation determinism.
pub mod strategies {
    use lockstep_core::prelude::*;
    use proptest::prelude::*;

    /// Generate a fixed-point number in a reasonable range for positions.
    ///
    /// Range: -1000 to 1000 units, at full resolution
    pub fn arb_fixed_position() -> impl Strategy<Value = Fixed> {
        (-10_000_000i64..10_000_000i64).prop_map(Fixed::from_raw)
    }

    /// Generate a fixed-point 2D vector for positions.
    pub fn arb_vec2_position() -> impl Strategy<Value = Vec2Fixed> {
        (arb_fixed_position(), arb_fixed_position()).prop_map(|(x, y)| Vec2Fixed::new(x, y))
    }

    /// Generate a command kind. Entity references pick from `entity_ids`.
    pub fn arb_command_kind(entity_ids: Vec<EntityId>) -> impl Strategy<Value = CommandKind> {
        let ids = if entity_ids.is_empty() { vec![0] } else { entity_ids };
        let select_ids = ids.clone();
        prop_oneof![
            3 => proptest::sample::select(select_ids)
                .prop_map(|entity_id| CommandKind::Select { entity_id }),
            1 => Just(CommandKind::Deselect),
            2 => (arb_vec2_position(), arb_vec2_position())
                .prop_map(|(min, max)| CommandKind::BoxSelect { min, max }),
            4 => arb_vec2_position().prop_map(|target| CommandKind::Move { target }),
            2 => arb_vec2_position().prop_map(|position| CommandKind::Spawn { position }),
            1 => proptest::sample::select(ids)
                .prop_map(|entity_id| CommandKind::Despawn { entity_id }),
        ]
    }

    /// Generate a command for one of `player_count` players on turns
    /// `1..=max_turn`.
    pub fn arb_command(
        player_count: u32,
        max_turn: u64,
        entity_ids: Vec<EntityId>,
    ) -> impl Strategy<Value = Command> {
        (
            1..=player_count,
            1..=max_turn,
            0u64..4,
            arb_command_kind(entity_ids),
        )
            .prop_map(|(player, turn, sequence, kind)| {
                Command::new(player, turn, kind).with_sequence(sequence)
            })
    }

    /// Generate a sequence of commands.
    pub fn arb_command_sequence(
        player_count: u32,
        max_turn: u64,
        entity_ids: Vec<EntityId>,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<Command>> {
        proptest::collection::vec(arb_command(player_count, max_turn, entity_ids), 0..max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::strategies::*;
    use super::*;
    use crate::fixtures::{lined_up_simulation, reference_replay_commands, vec2};
    use proptest::prelude::*;

    // =========================================================================
    // Basic determinism tests
    // =========================================================================

    #[test]
    fn test_result_reports_first_divergence() {
        let agreeing = DeterminismResult {
            runs: vec![vec![1, 2, 3], vec![1, 2, 3]],
        };
        assert!(agreeing.is_deterministic());
        assert_eq!(agreeing.final_hashes(), vec![3, 3]);

        let split = DeterminismResult {
            runs: vec![vec![1, 2, 3], vec![1, 2, 3], vec![1, 5, 3]],
        };
        assert_eq!(split.first_divergence(), Some(2));
    }

    #[test]
    #[should_panic(expected = "First diverging turn: 1")]
    fn test_assert_deterministic_reports_divergence() {
        DeterminismResult {
            runs: vec![vec![1], vec![2]],
        }
        .assert_deterministic();
    }

    #[test]
    fn test_empty_simulation_determinism() {
        assert!(verify_simulation_determinism(
            crate::fixtures::two_player_simulation,
            100
        ));
    }

    fn busy_setup() -> Simulation {
        let mut sim = lined_up_simulation(2, 5);
        sim.add_commands([
            Command::new(1, 1, CommandKind::BoxSelect { min: vec2(-1, 0), max: vec2(100, 15) }),
            Command::new(1, 2, CommandKind::Move { target: vec2(40, -25) }),
            Command::new(2, 2, CommandKind::MassSpawn { position: vec2(-60, 60) }),
            Command::new(2, 3, CommandKind::BoxSelect { min: vec2(-100, 0), max: vec2(0, 100) }),
            Command::new(2, 4, CommandKind::Move { target: vec2(0, 0) }),
        ]);
        sim
    }

    #[test]
    fn test_busy_simulation_determinism() {
        let result = verify_determinism(4, 120, busy_setup, &[]);
        assert_eq!(result.runs.len(), 4);
        assert!(result.runs.iter().all(|run| run.len() == 120));
        result.assert_deterministic();
    }

    #[test]
    fn test_command_log_on_lined_up_game() {
        let commands = [
            Command::new(1, 3, CommandKind::Select { entity_id: 2 }),
            Command::new(1, 4, CommandKind::Move { target: vec2(-30, 8) }),
            Command::new(2, 4, CommandKind::Despawn { entity_id: 1 }),
        ];
        let result = verify_determinism(3, 40, || lined_up_simulation(2, 3), &commands);
        result.assert_deterministic();
        // Player 2 cannot despawn player 1's unit, but the move changes the state.
        assert_ne!(result.runs[0][1], result.runs[0][39]);
    }

    #[test]
    fn test_parallel_simulations_match() {
        let result = run_parallel_simulations(busy_setup, 4, 80);
        assert_eq!(result.final_hashes().len(), 4);
        result.assert_deterministic();
    }

    #[test]
    fn test_find_divergence_on_deterministic_sim() {
        assert_eq!(find_first_divergence(busy_setup, 100), None);
    }

    #[test]
    fn test_find_divergence_on_diverging_setup() {
        use std::sync::atomic::{AtomicI64, Ordering};

        let calls = AtomicI64::new(0);
        let divergence = find_first_divergence(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let mut sim = lined_up_simulation(1, 1);
                sim.add_commands([
                    Command::new(1, 1, CommandKind::Select { entity_id: 0 }),
                    Command::new(1, 5, CommandKind::Move { target: vec2(10 + n, 0) }),
                ]);
                sim
            },
            20,
        );
        assert_eq!(divergence, Some(5));
    }

    #[test]
    fn test_replay_determinism() {
        verify_replay_determinism(busy_setup, 150).unwrap();
    }

    #[test]
    fn test_step_checked() {
        let mut sim = busy_setup();
        step_checked(&mut sim, 60).unwrap();
        assert_eq!(sim.current_turn(), 60);
    }

    #[test]
    fn test_reference_commands_replay() {
        let setup = || {
            let mut sim = lined_up_simulation(1, 6);
            sim.add_commands(reference_replay_commands());
            sim
        };
        verify_replay_determinism(setup, 30).unwrap();
    }

    // =========================================================================
    // Property-based tests
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_random_commands_replay_identically(
            commands in arb_command_sequence(2, 30, vec![0, 1, 2, 1 << 30, (1 << 30) + 1], 40)
        ) {
            let setup = || {
                let mut sim = lined_up_simulation(2, 3);
                sim.add_commands(commands.iter().copied());
                sim
            };
            prop_assert!(verify_replay_determinism(setup, 40).is_ok());

            let mut sim = setup();
            prop_assert!(step_checked(&mut sim, 40).is_ok());
        }

        #[test]
        fn prop_arrival_order_does_not_matter(
            commands in arb_command_sequence(2, 10, vec![0, 1, 2, 1 << 30], 20)
        ) {
            let mut forward = lined_up_simulation(2, 3);
            forward.add_commands(commands.iter().copied());
            let mut backward = lined_up_simulation(2, 3);
            backward.add_commands(commands.iter().rev().copied());

            for _ in 0..15 {
                forward.step();
                backward.step();
            }
            // Commands with identical keys keep arrival order, so compare
            // only when keys are unique.
            let mut keys: Vec<_> = commands
                .iter()
                .map(|c| (c.target_turn, c.player_id, c.sequence))
                .collect();
            keys.sort_unstable();
            keys.dedup();
            if keys.len() == commands.len() {
                prop_assert!(forward.compare(&backward).is_ok());
            }
        }
    }
}
