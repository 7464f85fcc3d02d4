//! Fixed-width command records exchanged between peers.
//!
//! Every record is `[u16 opcode][payload...]` in little endian, and the
//! payload width is determined solely by the opcode, so streams are
//! self-delimiting. Opcodes live in three disjoint ranges so each side of a
//! stream can reject records that are not meant for it:
//! - `0x0000..0x0800`: player commands (client → server, replayed everywhere)
//! - `0x0800..0x1000`: render-facing frames (server → UI, framed separately)
//! - `0x2000..`: session-local meta records

use crate::geometry::Rot16;

/// Largest wire size of any fixed-width record.
pub const MAX_COMMAND_SIZE: usize = 8;

/// Every opcode this protocol knows about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    /// Order a plane to turn to a heading.
    GivePlaneHeading = 0x0001,
    /// Put a plane on autopilot toward a runway.
    SendPlaneToRunway = 0x0002,
    /// One-shot session parameters for the UI (tick rate, map size, ...).
    GameInit = 0x0800,
    /// Per-frame plane positions for the UI.
    StateUpdate = 0x0801,
    /// Map dimensions changed (UI-facing).
    MapResize = 0x0802,
    /// A peer's assertion that it is done sending commands for a tick.
    CommitTick = 0x2000,
}

impl OpCode {
    pub fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            0x0001 => Some(OpCode::GivePlaneHeading),
            0x0002 => Some(OpCode::SendPlaneToRunway),
            0x0800 => Some(OpCode::GameInit),
            0x0801 => Some(OpCode::StateUpdate),
            0x0802 => Some(OpCode::MapResize),
            0x2000 => Some(OpCode::CommitTick),
            _ => None,
        }
    }

    /// Total record size on a peer stream, including the opcode itself.
    ///
    /// `None` for the render-facing opcodes: those never appear on peer
    /// streams and are framed by the UI layer instead.
    pub const fn wire_size(self) -> Option<usize> {
        match self {
            OpCode::GivePlaneHeading => Some(8),
            OpCode::SendPlaneToRunway => Some(8),
            OpCode::CommitTick => Some(2),
            OpCode::GameInit | OpCode::StateUpdate | OpCode::MapResize => None,
        }
    }

    /// True for commands a player may issue.
    pub const fn is_player_command(self) -> bool {
        (self as u16) < 0x0800
    }
}

/// A fixed-width command record.
///
/// Stored as a zero-padded `MAX_COMMAND_SIZE` buffer so commands can be
/// moved around without allocating. The derived ordering compares the full
/// padded buffer, which is exactly the deterministic sort key the rollback
/// window needs: every peer orders same-tick commands identically no matter
/// the arrival order.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Command([u8; MAX_COMMAND_SIZE]);

/// A decoded view of a [`Command`] payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandKind {
    GivePlaneHeading { plane_id: u32, heading: Rot16 },
    SendPlaneToRunway { plane_id: u32, runway_id: u16 },
    CommitTick,
}

impl Command {
    pub fn give_plane_heading(plane_id: u32, heading: Rot16) -> Command {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        buf[..2].copy_from_slice(&(OpCode::GivePlaneHeading as u16).to_le_bytes());
        buf[2..6].copy_from_slice(&plane_id.to_le_bytes());
        buf[6..8].copy_from_slice(&heading.raw().to_le_bytes());
        Command(buf)
    }

    pub fn send_plane_to_runway(plane_id: u32, runway_id: u16) -> Command {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        buf[..2].copy_from_slice(&(OpCode::SendPlaneToRunway as u16).to_le_bytes());
        buf[2..6].copy_from_slice(&plane_id.to_le_bytes());
        buf[6..8].copy_from_slice(&runway_id.to_le_bytes());
        Command(buf)
    }

    pub fn commit_tick() -> Command {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        buf[..2].copy_from_slice(&(OpCode::CommitTick as u16).to_le_bytes());
        Command(buf)
    }

    /// Wraps a buffer read off the wire. The caller must have zeroed the
    /// bytes past the record's wire size.
    pub fn from_raw(buf: [u8; MAX_COMMAND_SIZE]) -> Command {
        Command(buf)
    }

    pub fn opcode_raw(&self) -> u16 {
        u16::from_le_bytes([self.0[0], self.0[1]])
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u16(self.opcode_raw())
    }

    /// The record as it appears on the wire: the opcode-determined prefix of
    /// the padded buffer.
    ///
    /// Panics on an unknown opcode; commands are validated on ingress, so an
    /// unknown opcode here is a bug.
    pub fn wire_bytes(&self) -> &[u8] {
        let size = self
            .opcode()
            .and_then(OpCode::wire_size)
            .expect("command with no wire representation");
        &self.0[..size]
    }

    pub fn decode(&self) -> Option<CommandKind> {
        let op = self.opcode()?;
        let b = &self.0;
        match op {
            OpCode::GivePlaneHeading => Some(CommandKind::GivePlaneHeading {
                plane_id: u32::from_le_bytes([b[2], b[3], b[4], b[5]]),
                heading: Rot16::new(u16::from_le_bytes([b[6], b[7]])),
            }),
            OpCode::SendPlaneToRunway => Some(CommandKind::SendPlaneToRunway {
                plane_id: u32::from_le_bytes([b[2], b[3], b[4], b[5]]),
                runway_id: u16::from_le_bytes([b[6], b[7]]),
            }),
            OpCode::CommitTick => Some(CommandKind::CommitTick),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.decode() {
            Some(kind) => write!(f, "Command({:?})", kind),
            None => write!(f, "Command(op={:#06x})", self.opcode_raw()),
        }
    }
}
