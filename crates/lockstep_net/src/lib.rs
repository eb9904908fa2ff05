//! # Lockstep Net
//!
//! Turn synchronization for peers running [`lockstep_core`] simulations.
//!
//! Every peer runs the full simulation. Peers only exchange commands and
//! end-of-turn signals; nobody simulates turn `N + 1` before every peer
//! finished turn `N`.
//!
//! ## Crate Structure
//!
//! - [`config`] - Session tunables loaded from RON
//! - [`message`] - JSON messages exchanged between peers
//! - [`transport`] - Transport trait and an in-process loopback network
//! - [`sync`] - The turn gate
//! - [`session`] - One peer's lockstep driver
//! - [`stats`] - Per-session message counters

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod config;
pub mod error;
pub mod message;
pub mod session;
pub mod stats;
pub mod sync;
pub mod transport;

pub use config::SessionConfig;
pub use error::{NetError, Result};
pub use message::{Envelope, PeerMessage};
pub use session::LockstepSession;
pub use stats::SessionStats;
pub use sync::{PeerStatus, Stall, TurnSync};
pub use transport::{LoopbackNetwork, LoopbackTransport, Transport};
