//! Peer transport abstraction and an in-process loopback network.

use std::collections::BTreeMap;

use lockstep_core::entity::PlayerId;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{Envelope, PeerMessage};

/// Reliable, per-peer ordered delivery of [`PeerMessage`]s.
///
/// The lockstep protocol relies on ordering: a peer's commands must arrive
/// before its end-of-turn signal for the turn that precedes them.
pub trait Transport {
    /// The local player's ID.
    fn local_peer_id(&self) -> PlayerId;

    /// Remote peers currently reachable.
    fn peers(&self) -> Vec<PlayerId>;

    /// Send a message to every remote peer.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded.
    fn broadcast(&mut self, message: &PeerMessage) -> Result<()>;

    /// Drain everything received since the last poll, in arrival order.
    fn poll_incoming(&mut self) -> Vec<Envelope>;
}

/// Builds fully connected in-process transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopbackNetwork;

impl LoopbackNetwork {
    /// One transport per player `1..=peer_count`, each connected to all others.
    #[must_use]
    pub fn connect(peer_count: u32) -> Vec<LoopbackTransport> {
        let (senders, receivers): (BTreeMap<_, _>, Vec<_>) = (1..=peer_count)
            .map(|id| {
                let (tx, rx) = mpsc::unbounded_channel();
                ((id, tx), (id, rx))
            })
            .unzip();

        receivers
            .into_iter()
            .map(|(local_id, incoming)| LoopbackTransport {
                local_id,
                outgoing: senders
                    .iter()
                    .filter(|(id, _)| **id != local_id)
                    .map(|(id, tx)| (*id, tx.clone()))
                    .collect(),
                incoming,
            })
            .collect()
    }
}

/// One peer's end of a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    local_id: PlayerId,
    outgoing: BTreeMap<PlayerId, mpsc::UnboundedSender<Envelope>>,
    incoming: mpsc::UnboundedReceiver<Envelope>,
}

impl LoopbackTransport {
    /// Broadcast raw bytes, bypassing the codec.
    pub fn broadcast_raw(&mut self, payload: &[u8]) {
        let local_id = self.local_id;
        self.outgoing.retain(|peer, tx| {
            let delivered = tx
                .send(Envelope {
                    from: local_id,
                    payload: payload.to_vec(),
                })
                .is_ok();
            if !delivered {
                tracing::debug!(peer, "Loopback peer hung up");
            }
            delivered
        });
    }

    /// Stop sending to `peer`, as if the link went down.
    pub fn disconnect(&mut self, peer: PlayerId) {
        self.outgoing.remove(&peer);
    }
}

impl Transport for LoopbackTransport {
    fn local_peer_id(&self) -> PlayerId {
        self.local_id
    }

    fn peers(&self) -> Vec<PlayerId> {
        self.outgoing.keys().copied().collect()
    }

    fn broadcast(&mut self, message: &PeerMessage) -> Result<()> {
        let payload = message.encode()?;
        self.broadcast_raw(&payload);
        Ok(())
    }

    fn poll_incoming(&mut self) -> Vec<Envelope> {
        let mut received = Vec::new();
        while let Ok(envelope) = self.incoming.try_recv() {
            received.push(envelope);
        }
        received
    }
}
