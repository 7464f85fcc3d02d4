//! Stream-fatal protocol errors.

use sim::{StateDecodeError, Tick};

/// A framing or protocol violation on a peer stream.
///
/// All of these are fatal for the stream they occur on: the stream is torn
/// down and its bookkeeping rolled back. Whether they are fatal for the
/// process depends on the role (a client has only one stream to lose).
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0:#06x}")]
    UnknownOpcode(u16),
    #[error("opcode {0:#06x} is not valid on this stream")]
    UnexpectedOpcode(u16),
    #[error("commit tick for tick {got} does not match commit frontier {expected}")]
    CommitTickMismatch { expected: Tick, got: Tick },
    #[error("expected exactly one latency probe byte, got {len}")]
    BadProbe { len: usize },
    #[error("decoding state snapshot: {0}")]
    Snapshot(#[from] StateDecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
