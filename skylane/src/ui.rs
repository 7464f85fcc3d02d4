//! Framing for the UI child process on the two standard-stream pipes.
//!
//! Outbound frames carry a `u16` opcode header: one `GameInit` with the
//! session parameters, then a `StateUpdate` with materialized plane
//! positions every time the live state changes. Inbound, the UI writes full
//! command records exactly as they appear on the peer wire.

use std::io;
use std::sync::Arc;

use netcode::{FrameEncoder, Netcode};
use sim::{Command, OpCode, Rect, State, MAX_COMMAND_SIZE, SPEED, SUB_PIXEL, TICK_RATE};
use tokio::io::{AsyncRead, AsyncReadExt};

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_rect(out: &mut Vec<u8>, r: Rect) {
    put_u32(out, r.x as u32);
    put_u32(out, r.y as u32);
    put_u32(out, r.w as u32);
    put_u32(out, r.h as u32);
}

/// Encodes live states into UI frames.
#[derive(Default)]
pub struct UiEncoder {
    sent_init: bool,
}

impl FrameEncoder for UiEncoder {
    fn encode(&mut self, state: &State, out: &mut Vec<u8>) {
        if !self.sent_init {
            self.sent_init = true;
            put_u16(out, OpCode::GameInit as u16);
            put_u32(out, TICK_RATE);
            out.push(SUB_PIXEL);
            put_u32(out, SPEED as u32);
            put_rect(out, state.map_size);
            put_rect(out, state.camera_size);
        }

        put_u16(out, OpCode::StateUpdate as u16);
        put_u32(out, state.now);
        put_u32(out, state.planes.len() as u32);
        for p in &state.planes {
            put_u32(out, p.id);
            let (pos, heading) = p.position(state.now);
            put_u32(out, pos.x as u32);
            put_u32(out, pos.y as u32);
            put_u16(out, p.want_heading.raw());
            put_u16(out, heading.raw());
        }
    }
}

/// Reads command records from the UI pipe and feeds them to the netcode as
/// local player actions. Runs until the pipe breaks, which takes the
/// process with it.
pub async fn read_ui_commands(
    netcode: Arc<Netcode>,
    mut input: impl AsyncRead + Unpin,
) -> io::Result<()> {
    let mut buf = [0u8; MAX_COMMAND_SIZE];
    loop {
        input.read_exact(&mut buf[..2]).await?;
        let raw = u16::from_le_bytes([buf[0], buf[1]]);
        let op = OpCode::from_u16(raw).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown opcode from ui: {raw:#06x}"),
            )
        })?;
        if !op.is_player_command() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ui sent non-player opcode {raw:#06x}"),
            ));
        }
        let size = op.wire_size().expect("player commands have a wire size");
        if size > 2 {
            input.read_exact(&mut buf[2..size]).await?;
        }
        buf[size..].fill(0);
        netcode.act(Command::from_raw(buf));
    }
}
