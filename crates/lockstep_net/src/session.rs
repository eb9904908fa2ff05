//! One peer's lockstep driver.
//!
//! A [`LockstepSession`] glues a [`Simulation`], a [`TurnSync`] gate and a
//! [`Transport`] together. Local commands are scheduled a few turns ahead and
//! broadcast; remote commands are fed into the same queue. The simulation
//! only steps once every peer finished the previous turn, and the state
//! hashes peers attach to their end-of-turn signals are compared to catch
//! desyncs.

use std::collections::BTreeMap;

use lockstep_core::command::{Command, CommandKind};
use lockstep_core::entity::PlayerId;
use lockstep_core::simulation::{Simulation, TurnEvents};

use crate::config::SessionConfig;
use crate::error::{NetError, Result};
use crate::message::{Envelope, PeerMessage};
use crate::stats::SessionStats;
use crate::sync::{Stall, TurnSync};
use crate::transport::Transport;

/// Local hashes kept for comparison with late peer reports.
const HASH_HISTORY_TURNS: u64 = 64;

/// Drives one peer of a lockstep game.
#[derive(Debug)]
pub struct LockstepSession<T: Transport> {
    config: SessionConfig,
    simulation: Simulation,
    sync: TurnSync,
    transport: T,
    next_sequence: u64,
    turn_started_ms: u64,
    local_hashes: BTreeMap<u64, u64>,
    remote_hashes: BTreeMap<u64, BTreeMap<PlayerId, u64>>,
    stats: SessionStats,
}

impl<T: Transport> LockstepSession<T> {
    /// Start a session with an empty simulation.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the greeting
    /// cannot be sent.
    pub fn new(config: SessionConfig, transport: T, now_ms: u64) -> Result<Self> {
        config.validate()?;
        let simulation = Simulation::new(config.turn_speed_ms, config.player_count)?;
        Self::with_simulation(config, simulation, transport, now_ms)
    }

    /// Start a session from a prepared simulation at turn 0.
    ///
    /// Every peer must start from the same initial state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the simulation
    /// already advanced, or the greeting cannot be sent.
    pub fn with_simulation(
        config: SessionConfig,
        mut simulation: Simulation,
        mut transport: T,
        now_ms: u64,
    ) -> Result<Self> {
        config.validate()?;
        if simulation.current_turn() != 0 {
            return Err(NetError::InvalidConfig(format!(
                "Session must start at turn 0, simulation is at turn {}",
                simulation.current_turn()
            )));
        }
        if simulation.player_count() != config.player_count {
            return Err(NetError::InvalidConfig(format!(
                "Simulation has {} players, config expects {}",
                simulation.player_count(),
                config.player_count
            )));
        }
        simulation.set_turn_speed_ms(config.turn_speed_ms)?;

        let local_id = transport.local_peer_id();
        let mut sync = TurnSync::new(local_id, config.peer_timeout_ms, now_ms);
        for peer in transport.peers() {
            sync.add_peer(peer, now_ms);
        }
        transport.broadcast(&PeerMessage::Hello {
            player_id: local_id,
        })?;

        let mut local_hashes = BTreeMap::new();
        local_hashes.insert(0, simulation.state_hash());
        tracing::info!(
            player = local_id,
            peers = sync.peers().len(),
            turn_speed_ms = config.turn_speed_ms,
            "Lockstep session started"
        );

        Ok(Self {
            config,
            simulation,
            sync,
            transport,
            next_sequence: 0,
            turn_started_ms: now_ms,
            local_hashes,
            remote_hashes: BTreeMap::new(),
            stats: SessionStats {
                messages_sent: 1,
                ..SessionStats::default()
            },
        })
    }

    /// The local player's ID.
    #[must_use]
    pub fn local_player(&self) -> PlayerId {
        self.transport.local_peer_id()
    }

    /// The local simulation.
    #[must_use]
    pub const fn simulation(&self) -> &Simulation {
        &self.simulation
    }

    /// The turn gate.
    #[must_use]
    pub const fn sync(&self) -> &TurnSync {
        &self.sync
    }

    /// The transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Message and turn counters.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The session configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Issue a local command, scheduled `command_delay_turns` ahead, and
    /// send it to every peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the simulation rejects the command or the
    /// broadcast fails.
    pub fn issue(&mut self, kind: CommandKind) -> Result<Command> {
        let command = Command::new(
            self.local_player(),
            self.simulation.current_turn() + self.config.command_delay_turns,
            kind,
        )
        .with_sequence(self.next_sequence);
        self.next_sequence += 1;

        self.simulation.add_command(command)?;
        self.transport.broadcast(&PeerMessage::Command { command })?;
        self.stats.messages_sent += 1;
        tracing::debug!(%command, "Command issued");
        Ok(command)
    }

    /// Process incoming messages and advance at most one turn.
    ///
    /// Returns the events of the simulated turn, if the gate opened.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Desync`] when a peer reports a different state
    /// hash, [`NetError::Sim`] when the per-turn determinism check fails, and
    /// transport errors.
    pub fn tick(&mut self, now_ms: u64) -> Result<Option<TurnEvents>> {
        for envelope in self.transport.poll_incoming() {
            self.handle(envelope, now_ms);
        }
        self.compare_hashes()?;

        let turn = self.simulation.current_turn();
        let elapsed = now_ms.saturating_sub(self.turn_started_ms);
        if elapsed >= u64::from(self.config.turn_speed_ms) {
            let signaled = self.sync.signal_next_turn(
                turn,
                self.simulation.state_hash(),
                now_ms,
                &mut self.transport,
            )?;
            if signaled {
                self.stats.messages_sent += 1;
            }
        }

        let evicted = self.sync.evict_unresponsive(now_ms);
        if !evicted.is_empty() {
            self.stats.peers_evicted += evicted.len() as u64;
            tracing::warn!(?evicted, turn, "Continuing without evicted peers");
        }

        if !self.sync.can_advance_turn() {
            return Ok(None);
        }

        let events = self.simulation.step();
        self.stats.turns_advanced += 1;
        self.turn_started_ms = now_ms;
        if self.config.check_determinism_each_turn {
            self.simulation.check_determinism()?;
        }
        self.local_hashes.insert(events.turn, events.state_hash);
        self.local_hashes
            .retain(|t, _| t + HASH_HISTORY_TURNS > events.turn);
        self.compare_hashes()?;
        Ok(Some(events))
    }

    /// The gate is blocked on silent peers.
    #[must_use]
    pub fn stall(&self, now_ms: u64) -> Option<Stall> {
        self.sync.stall(now_ms)
    }

    fn handle(&mut self, envelope: Envelope, now_ms: u64) {
        let from = envelope.from;
        self.stats.messages_received += 1;
        let message = match PeerMessage::decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.dropped_undecodable += 1;
                tracing::warn!(from, error = %e, "Dropping undecodable message");
                return;
            }
        };
        if !self.sync.is_known(from) {
            self.stats.dropped_unknown_sender += 1;
            tracing::debug!(from, ?message, "Dropping message from unknown peer");
            return;
        }
        if message.claimed_player() != from {
            self.stats.dropped_spoofed += 1;
            tracing::warn!(from, ?message, "Dropping message claiming another player");
            return;
        }
        self.sync.heard_from(from, now_ms);

        match message {
            PeerMessage::Hello { .. } => {
                if self.stats.greeted_by.insert(from) {
                    tracing::debug!(from, "Peer said hello");
                }
            }
            PeerMessage::Command { command } => {
                self.stats.commands_received += 1;
                let horizon = self
                    .simulation
                    .current_turn()
                    .saturating_add(self.config.max_command_lead_turns);
                if command.target_turn > horizon {
                    self.stats.commands_rejected += 1;
                    tracing::warn!(
                        from,
                        %command,
                        horizon,
                        "Dropping command scheduled too far ahead"
                    );
                    return;
                }
                // Rejections are logged by the simulation.
                if self.simulation.add_command(command).is_err() {
                    self.stats.commands_rejected += 1;
                }
            }
            PeerMessage::EndOfTurn {
                turn, state_hash, ..
            } => {
                self.sync.on_end_of_turn(from, turn, now_ms);
                self.remote_hashes
                    .entry(turn)
                    .or_default()
                    .insert(from, state_hash);
            }
        }
    }

    fn compare_hashes(&mut self) -> Result<()> {
        let current = self.simulation.current_turn();
        let comparable: Vec<u64> = self
            .remote_hashes
            .range(..=current)
            .map(|(turn, _)| *turn)
            .collect();

        for turn in comparable {
            let Some(reports) = self.remote_hashes.remove(&turn) else {
                continue;
            };
            let Some(&local) = self.local_hashes.get(&turn) else {
                tracing::debug!(turn, "No local hash left to compare against");
                continue;
            };
            if let Some((&peer_id, &remote)) = reports.iter().find(|(_, hash)| **hash != local) {
                tracing::error!(turn, peer_id, local, remote, "Desync detected");
                return Err(NetError::Desync {
                    turn,
                    peer_id,
                    local,
                    remote,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lockstep_core::entity::Entity;
    use lockstep_core::math::{Fixed, Vec2Fixed};

    use super::*;
    use crate::transport::{LoopbackNetwork, LoopbackTransport};

    fn v(x: i64, y: i64) -> Vec2Fixed {
        Vec2Fixed::new(Fixed::from_int(x), Fixed::from_int(y))
    }

    fn sessions(player_count: u32) -> Vec<LockstepSession<LoopbackTransport>> {
        let config = SessionConfig {
            player_count,
            ..SessionConfig::default()
        };
        LoopbackNetwork::connect(player_count)
            .into_iter()
            .map(|transport| LockstepSession::new(config.clone(), transport, 0).unwrap())
            .collect()
    }

    /// Tick every session with a shared clock until all reach `turn`.
    fn run_until(peers: &mut [LockstepSession<LoopbackTransport>], turn: u64, clock: &mut u64) {
        while peers.iter().any(|p| p.simulation().current_turn() < turn) {
            *clock += 10;
            for peer in peers.iter_mut().filter(|p| p.simulation().current_turn() < turn) {
                peer.tick(*clock).unwrap();
            }
            assert!(*clock < 1_000_000, "peers stopped advancing");
        }
    }

    #[test]
    fn test_peers_apply_commands_on_the_same_turn() {
        let mut peers = sessions(2);
        let mut clock = 0;

        let spawn = peers[0].issue(CommandKind::Spawn { position: v(3, 3) }).unwrap();
        assert_eq!(spawn.target_turn, 2);
        let mass = peers[1].issue(CommandKind::MassSpawn { position: v(-20, 0) }).unwrap();
        assert_eq!(mass.sequence, 0);

        run_until(&mut peers, 10, &mut clock);
        for peer in &peers {
            assert_eq!(peer.simulation().current_state().len(), 101);
        }
        assert_eq!(
            peers[0].simulation().state_hash(),
            peers[1].simulation().state_hash()
        );
    }

    #[test]
    fn test_no_peer_runs_ahead_of_the_gate() {
        let mut peers = sessions(2);
        for now in (10..=2_000).step_by(10) {
            peers[0].tick(now).unwrap();
        }
        // Peer 2 never ticked, so nobody finished turn 0 on its side.
        assert_eq!(peers[0].simulation().current_turn(), 0);
        let stall = peers[0].stall(2_000).unwrap();
        assert_eq!(stall.waiting_on, vec![2]);
    }

    #[test]
    fn test_silent_peer_is_evicted() {
        let mut peers = sessions(2);
        let mut advanced = 0;
        for now in (10..=6_000).step_by(10) {
            if peers[0].tick(now).unwrap().is_some() {
                advanced += 1;
            }
        }
        assert!(!peers[0].sync().is_known(2));
        assert!(advanced > 0);
    }

    #[test]
    fn test_garbage_and_spoofed_messages_are_dropped() {
        let mut peers = sessions(2);
        peers[1].transport_mut().broadcast_raw(b"not json");
        let spoofed = PeerMessage::Command {
            command: Command::new(1, 5, CommandKind::Spawn { position: v(0, 0) }),
        };
        peers[1].transport_mut().broadcast(&spoofed).unwrap();

        let mut clock = 0;
        run_until(&mut peers, 8, &mut clock);
        assert!(peers[0].simulation().current_state().is_empty());
        assert!(peers[1].simulation().current_state().is_empty());

        let stats = peers[0].stats();
        assert_eq!(stats.dropped_undecodable, 1);
        assert_eq!(stats.dropped_spoofed, 1);
        assert_eq!(stats.commands_received, 0);
        assert_eq!(stats.turns_advanced, 8);
        assert!(stats.greeted_by.contains(&2));
        // Hello plus one end-of-turn per simulated turn; raw sends bypass the session.
        assert_eq!(peers[1].stats().messages_sent, 1 + 8);
    }

    #[test]
    fn test_late_remote_command_is_discarded() {
        let mut peers = sessions(2);
        let mut clock = 0;
        run_until(&mut peers, 4, &mut clock);

        // A command for a turn both peers already simulated.
        let late = PeerMessage::Command {
            command: Command::new(2, 2, CommandKind::Spawn { position: v(0, 0) }),
        };
        peers[1].transport_mut().broadcast(&late).unwrap();
        run_until(&mut peers, 8, &mut clock);
        assert!(peers[0].simulation().current_state().is_empty());
        assert_eq!(peers[0].stats().commands_received, 1);
        assert_eq!(peers[0].stats().commands_rejected, 1);
    }

    #[test]
    fn test_far_future_remote_command_is_dropped() {
        let mut peers = sessions(2);
        let lead = peers[0].config().max_command_lead_turns;
        let far = PeerMessage::Command {
            command: Command::new(2, u64::MAX, CommandKind::Spawn { position: v(0, 0) }),
        };
        let edge = PeerMessage::Command {
            command: Command::new(2, lead, CommandKind::Deselect),
        };
        peers[1].transport_mut().broadcast(&far).unwrap();
        peers[1].transport_mut().broadcast(&edge).unwrap();

        let mut clock = 0;
        run_until(&mut peers, 2, &mut clock);
        let stats = peers[0].stats();
        assert_eq!(stats.commands_received, 2);
        assert_eq!(stats.commands_rejected, 1);
        assert_eq!(peers[0].simulation().pending_commands().len(), 1);
        assert!(peers[0]
            .simulation()
            .all_commands()
            .iter()
            .all(|c| c.target_turn <= lead));
    }

    #[test]
    fn test_diverging_initial_state_is_a_desync() {
        let config = SessionConfig::default();
        let mut transports = LoopbackNetwork::connect(2).into_iter();

        let mut a_sim = Simulation::new(config.turn_speed_ms, 2).unwrap();
        a_sim.seed_entity(Entity::at(v(0, 0)), 1).unwrap();
        let mut b_sim = Simulation::new(config.turn_speed_ms, 2).unwrap();
        b_sim.seed_entity(Entity::at(v(0, 1)), 1).unwrap();

        let mut a =
            LockstepSession::with_simulation(config.clone(), a_sim, transports.next().unwrap(), 0)
                .unwrap();
        let mut b =
            LockstepSession::with_simulation(config, b_sim, transports.next().unwrap(), 0).unwrap();

        let mut desync = None;
        for now in (10..=1_000).step_by(10) {
            if let Err(e) = a.tick(now) {
                desync = Some(e);
                break;
            }
            if let Err(e) = b.tick(now) {
                desync = Some(e);
                break;
            }
        }
        assert!(matches!(desync, Some(NetError::Desync { turn: 0, .. })));
    }

    #[test]
    fn test_one_turn_delay_is_rejected() {
        let transport = LoopbackNetwork::connect(2).pop().unwrap();
        let config = SessionConfig {
            command_delay_turns: 1,
            ..SessionConfig::default()
        };
        assert!(matches!(
            LockstepSession::new(config, transport, 0),
            Err(NetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_command_from_lagging_peer_reaches_faster_peer_in_time() {
        let mut peers = sessions(2);
        // Peer 1 signals turn 0, then peer 2 sees it and steps to turn 1.
        assert!(peers[0].tick(100).unwrap().is_none());
        assert!(peers[1].tick(100).unwrap().is_some());
        assert_eq!(peers[1].simulation().current_turn(), 1);
        assert_eq!(peers[0].simulation().current_turn(), 0);

        // Peer 1 is still on turn 0 and issues a command.
        let spawn = peers[0].issue(CommandKind::Spawn { position: v(1, 1) }).unwrap();
        assert!(spawn.target_turn > peers[1].simulation().current_turn());

        let mut clock = 100;
        run_until(&mut peers, 4, &mut clock);
        for peer in &peers {
            assert_eq!(peer.simulation().current_state().len(), 1);
        }
        assert_eq!(
            peers[0].simulation().state_hash(),
            peers[1].simulation().state_hash()
        );
    }

    #[test]
    fn test_rejects_mismatched_simulation() {
        let transport = LoopbackNetwork::connect(1).pop().unwrap();
        let sim = Simulation::new(100, 3).unwrap();
        assert!(matches!(
            LockstepSession::with_simulation(SessionConfig::default(), sim, transport, 0),
            Err(NetError::InvalidConfig(_))
        ));
    }
}
