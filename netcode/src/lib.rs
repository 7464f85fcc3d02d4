//! # Lockstep-with-rollback netcode
//!
//! Keeps every peer's deterministic simulation in sync. Two copies of the
//! world are maintained at all times:
//! - **live**: the forward-most tentative state, advanced by a wall-clock
//!   tick loop and re-simulated whenever a command arrives late;
//! - **commit**: the authoritative past, advanced only once every player has
//!   declared (via a `CommitTick` ballot) that it will send no further
//!   commands for that tick.
//!
//! The [`rollback`] module owns the window of tentative ticks between the
//! two. The [`netcode`] module is the coordinator: one mutex over the whole
//! structure, per-peer send/receive loops, a tick clock and commit gating.
//! [`peer`] holds the async stream shells and the join handshake, [`render`]
//! the latch that hands the live state to the frame encoder.

pub mod error;
pub mod netcode;
pub mod peer;
pub mod render;
pub mod rollback;

pub use error::ProtocolError;
pub use netcode::{Netcode, Role};
pub use peer::{connect_to_server, serve_peer, ClockParams};
pub use render::{spawn_render_loop, FrameEncoder};
pub use rollback::{Rollback, TimedCommand};
