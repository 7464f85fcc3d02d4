//! The render bridge: a one-producer latch that hands each new live state
//! to a frame encoder and ships the encoded bytes to the UI.

use std::sync::Arc;

use log::error;
use sim::State;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::netcode::Netcode;

/// Turns a live state into an outgoing frame.
///
/// `encode` runs while the netcode lock is held, which gives it a zero-copy
/// view of the authoritative live state. In exchange it must not block: no
/// I/O, no waiting. The render loop writes `out` to the sink after the lock
/// is released.
pub trait FrameEncoder: Send + 'static {
    fn encode(&mut self, state: &State, out: &mut Vec<u8>);
}

/// Spawns the render loop: wait until the live generation moves, encode
/// under the lock, write after release.
///
/// The encoder is never called concurrently. A write failure is fatal to
/// the process; losing the UI pipe is the intended way for the host to take
/// the whole game down.
pub fn spawn_render_loop<W>(netcode: &Arc<Netcode>, mut encoder: impl FrameEncoder, mut writer: W)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let n = Arc::clone(netcode);
    tokio::spawn(async move {
        let mut rendered_gen = 0u64;
        let mut buf = Vec::new();
        loop {
            let notified = n.state_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if n.encode_if_new(&mut rendered_gen, &mut encoder, &mut buf) {
                if let Err(e) = writer.write_all(&buf).await {
                    error!("writing frame to ui pipe: {}", e);
                    std::process::exit(1);
                }
                if let Err(e) = writer.flush().await {
                    error!("flushing ui pipe: {}", e);
                    std::process::exit(1);
                }
                continue;
            }
            notified.await;
        }
    });
}
