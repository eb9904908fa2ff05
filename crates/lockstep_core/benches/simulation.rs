//! Simulation benchmarks for lockstep_core.
//!
//! Run with: `cargo bench -p lockstep_core`

// Benchmark binaries don't need docs on macro-generated functions
#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lockstep_core::prelude::*;

fn v(x: i64, y: i64) -> Vec2Fixed {
    Vec2Fixed::new(Fixed::from_int(x), Fixed::from_int(y))
}

/// A simulation with `scatters` mass spawns per player, every unit moving.
fn busy_simulation(scatters: u64) -> Simulation {
    let mut sim = Simulation::new(100, 2).expect("valid simulation");
    for player in 1..=2 {
        for i in 0..scatters {
            let offset = i64::from(player) * 100 + i as i64 * 25;
            sim.add_command(
                Command::new(player, 1, CommandKind::MassSpawn { position: v(offset, offset) })
                    .with_sequence(i),
            )
            .expect("command accepted");
        }
        sim.add_command(Command::new(
            player,
            2,
            CommandKind::BoxSelect { min: v(-10_000, -10_000), max: v(10_000, 10_000) },
        ))
        .expect("command accepted");
        sim.add_command(
            Command::new(player, 2, CommandKind::Move { target: v(-500, 500) }).with_sequence(1),
        )
        .expect("command accepted");
    }
    sim.step();
    sim.step();
    sim
}

/// Runs simulation benchmarks for the lockstep_core crate.
pub fn simulation_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("step");
    for scatters in [1_u64, 10] {
        let entities = scatters * 200;
        group.bench_with_input(BenchmarkId::from_parameter(entities), &scatters, |b, &n| {
            let mut sim = busy_simulation(n);
            b.iter(|| black_box(sim.step()));
        });
    }
    group.finish();

    let sim = busy_simulation(10);
    c.bench_function("check_determinism_2000", |b| {
        b.iter(|| black_box(sim.check_determinism()));
    });
    c.bench_function("state_hash_2000", |b| {
        b.iter(|| black_box(sim.state_hash()));
    });
}

criterion_group!(benches, simulation_benchmark);
criterion_main!(benches);
