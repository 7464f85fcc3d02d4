//! Async shells around the coordinator: the join handshake and the per-peer
//! send/receive loops.
//!
//! Peer stream protocol, in order:
//! 1. server → client: the serialized commit state (length implicit in its
//!    field counts);
//! 2. client → server: one latency probe byte;
//! 3. server → client: `u32 remote_now`, the first tick the client may
//!    command;
//! 4. server → client: zero or more `{u32 when, record}` reliable catch-up
//!    entries, flowing straight into the steady-state framing;
//! 5. steady state: `{u32 when, record}` frames server → client, bare
//!    records client → server (the tick is implicit in the ordering).
//!
//! All framing is self-delimiting through the opcode size table, so neither
//! direction needs length prefixes.

use std::sync::Arc;
use std::time::Instant;

use log::{error, info};
use sim::{Command, OpCode, State, Tick, MAX_COMMAND_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::netcode::Netcode;

/// Parameters for the client's tick clock, measured during the handshake.
#[derive(Debug, Copy, Clone)]
pub struct ClockParams {
    /// Wall-clock anchor of the server's live timeline, shifted by half the
    /// measured round trip.
    pub origin: Instant,
    /// Do not ballot ticks before this one; the server already counts them.
    pub send_after: Tick,
}

/// Reads one fixed-width record off a stream into a zero-padded buffer.
///
/// Returns the opcode; rejects opcodes that are unknown or have no
/// stream representation.
async fn read_record<R>(r: &mut R, buf: &mut [u8; MAX_COMMAND_SIZE]) -> Result<OpCode, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    r.read_exact(&mut buf[..2]).await?;
    let raw = u16::from_le_bytes([buf[0], buf[1]]);
    let op = OpCode::from_u16(raw).ok_or(ProtocolError::UnknownOpcode(raw))?;
    let Some(size) = op.wire_size() else {
        return Err(ProtocolError::UnexpectedOpcode(raw));
    };
    if size > 2 {
        r.read_exact(&mut buf[2..size]).await?;
    }
    // The tail doubles as rollback sort key, so it must not carry garbage
    // from the previous record.
    buf[size..].fill(0);
    Ok(op)
}

// === Server side ===

/// Runs one accepted peer stream to completion.
///
/// On any stream or protocol error the peer is torn down and its
/// bookkeeping rolled back; the rest of the session keeps running.
pub async fn serve_peer<R, W>(netcode: Arc<Netcode>, mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let hs = netcode.register_peer();
    let player_id = hs.player_id;
    let remote_now = hs.remote_now;

    if let Err(e) = server_handshake(&hs, &mut reader, &mut writer).await {
        error!("player {} handshake failed: {}", player_id, e);
        netcode.peer_read_closed(remote_now);
        netcode.peer_write_closed(hs.last_sent_gen);
        return;
    }
    info!("player {} joined, commanding from tick {}", player_id, remote_now);

    // Receive loop in its own task; it owns the read edge of the
    // bookkeeping and rolls it back when the stream dies.
    let recv_netcode = Arc::clone(&netcode);
    tokio::spawn(async move {
        let mut remote_now = remote_now;
        if let Err(e) = server_recv_loop(&recv_netcode, &mut reader, player_id, &mut remote_now).await
        {
            error!("player {} receive loop: {}", player_id, e);
        }
        recv_netcode.peer_read_closed(remote_now);
    });

    // Send loop in this task, owning the write edge.
    let mut last_sent_gen = hs.last_sent_gen;
    if let Err(e) = server_send_loop(&netcode, &mut writer, player_id, &mut last_sent_gen).await {
        error!("player {} send loop: {}", player_id, e);
    }
    netcode.peer_write_closed(last_sent_gen);
}

async fn server_handshake<R, W>(
    hs: &crate::netcode::PeerHandshake,
    reader: &mut R,
    writer: &mut W,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_all(&hs.snapshot).await?;
    writer.flush().await?;

    // The client answers with exactly one byte once it has the snapshot;
    // over-reading catches peers that talk out of turn.
    let mut probe = [0u8; 2];
    let n = reader.read(&mut probe).await?;
    if n != 1 {
        return Err(ProtocolError::BadProbe { len: n });
    }

    writer.write_all(&hs.remote_now.to_le_bytes()).await?;
    if !hs.catchup.is_empty() {
        writer.write_all(&hs.catchup).await?;
    }
    writer.flush().await?;
    Ok(())
}

async fn server_recv_loop<R>(
    netcode: &Netcode,
    reader: &mut R,
    player_id: u32,
    remote_now: &mut Tick,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_COMMAND_SIZE];
    loop {
        let op = read_record(reader, &mut buf).await?;
        match op {
            OpCode::CommitTick => netcode.peer_ballot(remote_now),
            _ if op.is_player_command() => {
                netcode.peer_command(player_id, *remote_now, Command::from_raw(buf));
            }
            _ => return Err(ProtocolError::UnexpectedOpcode(op as u16)),
        }
    }
}

async fn server_send_loop<W>(
    netcode: &Netcode,
    writer: &mut W,
    player_id: u32,
    last_sent_gen: &mut u64,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::new();
    loop {
        // Register interest before checking the queue so a wakeup between
        // the check and the await is never lost.
        let notified = netcode.send_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if netcode.collect_peer_outgoing(last_sent_gen, player_id, &mut out) {
            if !out.is_empty() {
                writer.write_all(&out).await?;
                writer.flush().await?;
            }
            continue;
        }
        notified.await;
    }
}

// === Client side ===

/// Joins a server over an established stream: adopts its snapshot, measures
/// the one-way latency, fast-forwards live, and spawns the send and receive
/// loops.
///
/// Returns the parameters for the tick clock; the caller decides when to
/// start it (the binary starts it immediately).
///
/// Stream failure after this point is fatal to the process: a client
/// without its server has nothing left to simulate against.
pub async fn connect_to_server<R, W>(
    netcode: &Arc<Netcode>,
    mut reader: R,
    mut writer: W,
) -> Result<ClockParams, ProtocolError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    // Snapshot: header first, field counts give the body length.
    let mut header = [0u8; State::HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let n_planes = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let n_runways = u16::from_le_bytes([header[12], header[13]]) as usize;

    let mut snapshot = header.to_vec();
    let body = n_planes * State::PLANE_SIZE + n_runways * State::RUNWAY_SIZE;
    snapshot.resize(State::HEADER_SIZE + body, 0);
    reader.read_exact(&mut snapshot[State::HEADER_SIZE..]).await?;
    netcode.client_adopt(&snapshot)?;

    // Latency probe: the round trip from our byte to the server's tick
    // number, halved, shifts our clock onto the server's timeline.
    let probe_start = Instant::now();
    writer.write_all(&[0u8]).await?;
    writer.flush().await?;
    let mut live_buf = [0u8; 4];
    reader.read_exact(&mut live_buf).await?;
    let one_way = probe_start.elapsed() / 2;
    let remote_live = Tick::from_le_bytes(live_buf);

    netcode.finish_client_handshake(remote_live);
    info!(
        "joined server at tick {}, one-way latency {:?}",
        remote_live, one_way
    );

    let send_netcode = Arc::clone(netcode);
    tokio::spawn(async move {
        let mut last_sent_gen = 0u64;
        let mut send_time = remote_live;
        if let Err(e) =
            client_send_loop(&send_netcode, &mut writer, &mut last_sent_gen, &mut send_time).await
        {
            error!("server stream send loop: {}", e);
            std::process::exit(1);
        }
    });

    let recv_netcode = Arc::clone(netcode);
    tokio::spawn(async move {
        if let Err(e) = client_recv_loop(&recv_netcode, &mut reader).await {
            error!("server stream receive loop: {}", e);
            std::process::exit(1);
        }
    });

    Ok(ClockParams {
        origin: probe_start + one_way,
        send_after: remote_live,
    })
}

async fn client_recv_loop<R>(netcode: &Netcode, reader: &mut R) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_COMMAND_SIZE];
    loop {
        let mut when_buf = [0u8; 4];
        reader.read_exact(&mut when_buf).await?;
        let when = Tick::from_le_bytes(when_buf);

        let op = read_record(reader, &mut buf).await?;
        match op {
            OpCode::CommitTick => netcode.client_ingest(when, Command::commit_tick())?,
            _ if op.is_player_command() => {
                netcode.client_ingest(when, Command::from_raw(buf))?;
            }
            _ => return Err(ProtocolError::UnexpectedOpcode(op as u16)),
        }
    }
}

async fn client_send_loop<W>(
    netcode: &Netcode,
    writer: &mut W,
    last_sent_gen: &mut u64,
    send_time: &mut Tick,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::new();
    loop {
        let notified = netcode.send_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if netcode.collect_client_outgoing(last_sent_gen, send_time, &mut out) {
            if !out.is_empty() {
                writer.write_all(&out).await?;
                writer.flush().await?;
            }
            continue;
        }
        notified.await;
    }
}
