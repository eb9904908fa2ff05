//! The turn gate.
//!
//! No peer may simulate turn `N + 1` until every known peer has announced
//! that it finished turn `N`. [`TurnSync`] tracks those announcements.
//!
//! Announcements are stored as turn numbers rather than done flags, so an
//! end-of-turn for the next turn that arrives before the gate opens is kept.

use std::collections::BTreeMap;

use lockstep_core::entity::PlayerId;

use crate::error::Result;
use crate::message::PeerMessage;
use crate::transport::Transport;

/// What the gate knows about one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerStatus {
    /// Latest turn the peer announced as finished.
    pub signaled_turn: Option<u64>,
    /// Local time the peer was last heard from.
    pub last_heard_ms: u64,
}

/// The gate is blocked on peers that have not finished the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stall {
    /// Turn the gate is waiting on.
    pub turn: u64,
    /// Peers that have not announced it.
    pub waiting_on: Vec<PlayerId>,
    /// When the local peer finished the turn and started waiting.
    pub since_ms: u64,
}

/// Tracks end-of-turn announcements of every known peer.
#[derive(Debug, Clone)]
pub struct TurnSync {
    local_id: PlayerId,
    peers: BTreeMap<PlayerId, PeerStatus>,
    gate_turn: u64,
    last_turn_signaled: Option<u64>,
    waiting_since_ms: u64,
    peer_timeout_ms: u64,
}

impl TurnSync {
    /// A gate waiting on turn 0 that knows only the local peer.
    #[must_use]
    pub fn new(local_id: PlayerId, peer_timeout_ms: u64, now_ms: u64) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(
            local_id,
            PeerStatus {
                signaled_turn: None,
                last_heard_ms: now_ms,
            },
        );
        Self {
            local_id,
            peers,
            gate_turn: 0,
            last_turn_signaled: None,
            waiting_since_ms: now_ms,
            peer_timeout_ms,
        }
    }

    /// Start waiting on `peer` as well. No-op for known peers.
    pub fn add_peer(&mut self, peer: PlayerId, now_ms: u64) {
        self.peers.entry(peer).or_insert(PeerStatus {
            signaled_turn: None,
            last_heard_ms: now_ms,
        });
    }

    /// Stop waiting on `peer`. Returns whether it was known.
    pub fn remove_peer(&mut self, peer: PlayerId) -> bool {
        peer != self.local_id && self.peers.remove(&peer).is_some()
    }

    /// Whether `peer` takes part in the gate.
    #[must_use]
    pub fn is_known(&self, peer: PlayerId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Every known peer, local included.
    #[must_use]
    pub const fn peers(&self) -> &BTreeMap<PlayerId, PeerStatus> {
        &self.peers
    }

    /// Turn the gate is waiting on.
    #[must_use]
    pub const fn gate_turn(&self) -> u64 {
        self.gate_turn
    }

    /// Record that `peer` is alive.
    pub fn heard_from(&mut self, peer: PlayerId, now_ms: u64) {
        if let Some(status) = self.peers.get_mut(&peer) {
            status.last_heard_ms = status.last_heard_ms.max(now_ms);
        }
    }

    /// Announce locally and to all peers that `current_turn` is finished.
    ///
    /// Only the first call per turn has any effect. Returns whether a signal
    /// was sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the broadcast fails.
    pub fn signal_next_turn<T: Transport>(
        &mut self,
        current_turn: u64,
        state_hash: u64,
        now_ms: u64,
        transport: &mut T,
    ) -> Result<bool> {
        if self.last_turn_signaled.is_some_and(|turn| turn >= current_turn) {
            return Ok(false);
        }
        self.last_turn_signaled = Some(current_turn);
        self.waiting_since_ms = now_ms;
        self.mark_done(self.local_id, current_turn);
        transport.broadcast(&PeerMessage::EndOfTurn {
            player_id: self.local_id,
            turn: current_turn,
            state_hash,
        })?;
        Ok(true)
    }

    /// Handle a peer's end-of-turn announcement.
    ///
    /// Returns `false` and drops the announcement for unknown peers.
    pub fn on_end_of_turn(&mut self, peer: PlayerId, turn: u64, now_ms: u64) -> bool {
        if !self.is_known(peer) {
            tracing::debug!(peer, turn, "End of turn from unknown peer dropped");
            return false;
        }
        self.mark_done(peer, turn);
        self.heard_from(peer, now_ms);
        true
    }

    fn mark_done(&mut self, peer: PlayerId, turn: u64) {
        if let Some(status) = self.peers.get_mut(&peer) {
            status.signaled_turn = Some(status.signaled_turn.map_or(turn, |t| t.max(turn)));
        }
    }

    fn turn_done(&self, status: &PeerStatus) -> bool {
        status.signaled_turn.is_some_and(|turn| turn >= self.gate_turn)
    }

    /// Whether every known peer finished the gate turn.
    ///
    /// On `true` the gate moves on to the next turn, so every peer counts as
    /// not done again until it announces that one.
    pub fn can_advance_turn(&mut self) -> bool {
        if !self.peers.values().all(|status| self.turn_done(status)) {
            return false;
        }
        self.gate_turn += 1;
        true
    }

    /// Peers blocking the gate.
    #[must_use]
    pub fn waiting_on(&self) -> Vec<PlayerId> {
        self.peers
            .iter()
            .filter(|(_, status)| !self.turn_done(status))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove remote peers that block the gate and have been silent for
    /// longer than the timeout. Returns the evicted peers.
    pub fn evict_unresponsive(&mut self, now_ms: u64) -> Vec<PlayerId> {
        let timeout = self.peer_timeout_ms;
        let evicted: Vec<PlayerId> = self
            .peers
            .iter()
            .filter(|(id, status)| {
                **id != self.local_id
                    && !self.turn_done(status)
                    && now_ms.saturating_sub(status.last_heard_ms) > timeout
            })
            .map(|(id, _)| *id)
            .collect();

        for peer in &evicted {
            self.peers.remove(peer);
            tracing::warn!(
                peer,
                turn = self.gate_turn,
                timeout_ms = timeout,
                "Evicted unresponsive peer"
            );
        }
        evicted
    }

    /// Report a blocked gate once the local peer is done and still waiting.
    #[must_use]
    pub fn stall(&self, now_ms: u64) -> Option<Stall> {
        let local_done = self
            .peers
            .get(&self.local_id)
            .is_some_and(|status| self.turn_done(status));
        let waiting_on = self.waiting_on();
        if !local_done || waiting_on.is_empty() || now_ms < self.waiting_since_ms {
            return None;
        }
        Some(Stall {
            turn: self.gate_turn,
            waiting_on,
            since_ms: self.waiting_since_ms,
        })
    }
}
