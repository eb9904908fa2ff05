//! Per-session message counters.

use std::collections::BTreeSet;

use lockstep_core::entity::PlayerId;

/// What a [`LockstepSession`](crate::session::LockstepSession) sent, received
/// and dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages broadcast by the local peer.
    pub messages_sent: u64,
    /// Envelopes taken from the transport, including dropped ones.
    pub messages_received: u64,
    /// Payloads that were not a valid message.
    pub dropped_undecodable: u64,
    /// Messages from senders outside the turn gate.
    pub dropped_unknown_sender: u64,
    /// Messages claiming to come from another player than the sender.
    pub dropped_spoofed: u64,
    /// Remote commands handed to the simulation.
    pub commands_received: u64,
    /// Remote commands the simulation refused.
    pub commands_rejected: u64,
    /// Turns simulated.
    pub turns_advanced: u64,
    /// Peers removed for blocking the gate while silent.
    pub peers_evicted: u64,
    /// Peers that said hello.
    pub greeted_by: BTreeSet<PlayerId>,
}

impl SessionStats {
    /// Messages dropped for any reason.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped_undecodable + self.dropped_unknown_sender + self.dropped_spoofed
    }
}
