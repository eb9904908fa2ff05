//! Lockstep demo: every player runs as its own task over a loopback network.
//!
//! Usage: `lockstep_net [config.ron]`

use lockstep_core::command::CommandKind;
use lockstep_core::entity::PlayerId;
use lockstep_core::math::{Fixed, Vec2Fixed};
use lockstep_net::{LockstepSession, LoopbackNetwork, LoopbackTransport, NetError, SessionConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Turns every peer simulates before the hashes are compared.
const DEMO_TURNS: u64 = 40;

/// Simulated milliseconds per session tick.
const TICK_MS: u64 = 10;

fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "Lockstep demo failed");
        std::process::exit(1);
    }
}

fn run() -> Result<(), NetError> {
    let config = match std::env::args().nth(1) {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    config.validate()?;
    tracing::info!(?config, turns = DEMO_TURNS, "Starting lockstep demo");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let results = runtime.block_on(async {
        let mut tasks = Vec::new();
        for transport in LoopbackNetwork::connect(config.player_count) {
            let session = LockstepSession::new(config.clone(), transport, 0)?;
            tasks.push(tokio::spawn(run_peer(session)));
        }

        let mut results = Vec::new();
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result?),
                Err(e) => tracing::error!(error = %e, "Peer task panicked"),
            }
        }
        Ok::<_, NetError>(results)
    })?;

    let Some(&(_, reference)) = results.first() else {
        return Err(NetError::InvalidConfig("No peer finished".into()));
    };
    for &(player, hash) in &results {
        if hash != reference {
            return Err(NetError::Desync {
                turn: DEMO_TURNS,
                peer_id: player,
                local: reference,
                remote: hash,
            });
        }
    }
    tracing::info!(
        peers = results.len(),
        state_hash = reference,
        "All peers agree"
    );
    Ok(())
}

/// Commands a player issues once its simulation reaches the given turn.
fn script(player: PlayerId) -> Vec<(u64, CommandKind)> {
    let centre = Vec2Fixed::new(Fixed::from_int(i64::from(player) * 40), Fixed::ZERO);
    let reach = Vec2Fixed::new(Fixed::from_int(15), Fixed::from_int(15));
    vec![
        (0, CommandKind::MassSpawn { position: centre }),
        (
            5,
            CommandKind::BoxSelect {
                min: centre - reach,
                max: centre + reach,
            },
        ),
        (
            8,
            CommandKind::Move {
                target: Vec2Fixed::ZERO,
            },
        ),
    ]
}

async fn run_peer(
    mut session: LockstepSession<LoopbackTransport>,
) -> Result<(PlayerId, u64), NetError> {
    let player = session.local_player();
    let mut pending = script(player).into_iter().peekable();
    let mut now_ms = 0;

    while session.simulation().current_turn() < DEMO_TURNS {
        let current_turn = session.simulation().current_turn();
        while let Some((turn, kind)) = pending.next_if(|(turn, _)| *turn <= current_turn) {
            let command = session.issue(kind)?;
            tracing::info!(player, turn, %command, "Issued scripted command");
        }

        now_ms += TICK_MS;
        if let Some(events) = session.tick(now_ms)? {
            if !events.spawned.is_empty() || !events.applied.is_empty() {
                tracing::info!(
                    player,
                    turn = events.turn,
                    applied = events.applied.len(),
                    spawned = events.spawned.len(),
                    "Turn applied commands"
                );
            }
        }
        if let Some(stall) = session.stall(now_ms) {
            tracing::trace!(player, ?stall, "Waiting on peers");
        }
        tokio::task::yield_now().await;
    }

    let hash = session.simulation().state_hash();
    tracing::info!(player, turn = DEMO_TURNS, state_hash = hash, "Peer finished");
    Ok((player, hash))
}
