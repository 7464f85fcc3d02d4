//! End-to-end lockstep tests over in-memory duplex streams.
//!
//! These drive real handshakes and per-peer loops, but tick the clocks by
//! hand so the scenarios stay deterministic.

use std::sync::Arc;
use std::time::Duration;

use netcode::{connect_to_server, serve_peer, ClockParams, Netcode};
use sim::{Command, Rot16, State, Tick};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;

const TICK: Duration = Duration::from_millis(16);

fn heading_cmd(plane: u32, raw: u16) -> Command {
    Command::give_plane_heading(plane, Rot16::new(raw))
}

/// Polls `cond` for up to two seconds, letting the stream tasks pump.
async fn settle(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Wires a fresh client to the server over an in-memory stream. Tick clocks
/// are not started; tests advance them by hand.
async fn join(server: &Arc<Netcode>) -> (Arc<Netcode>, ClockParams) {
    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let (sr, sw) = split(server_side);
    tokio::spawn(serve_peer(Arc::clone(server), sr, sw));

    let client = Netcode::new_client(TICK);
    let (cr, cw) = split(client_side);
    let params = connect_to_server(&client, cr, cw)
        .await
        .expect("client handshake failed");
    (client, params)
}

#[tokio::test]
async fn new_peer_catches_up_through_reliable_history() {
    let server = Netcode::new_server(State::default(), TICK);
    server.advance_ticks(5, 0);

    // An idle early joiner: it never ballots, so the commit frontier
    // freezes just before its first commandable tick (7) and every later
    // command stays in the rollback window.
    let (_gate, _) = join(&server).await;

    for (tick, raw) in [(40, 1000u16), (60, 2000), (80, 3000)] {
        while server.live_now() < tick {
            server.advance_ticks(1, 0);
        }
        server.act(heading_cmd(0, raw));
    }
    while server.live_now() < 100 {
        server.advance_ticks(1, 0);
    }
    assert_eq!(server.commit_now(), 6);

    // The late joiner gets the old snapshot plus the reliable history and
    // must reconstruct the exact live state.
    let (late, params) = join(&server).await;
    assert_eq!(params.send_after, 101);
    assert_eq!(late.live_now(), 101);

    server.advance_ticks(1, 0); // meet the joiner at tick 101
    settle("late joiner to converge with the server", || {
        late.clone_live() == server.clone_live()
    })
    .await;

    let live = late.clone_live();
    assert_eq!(live.planes[0].want_heading, Rot16::new(3000));
}

#[tokio::test]
async fn commits_converge_across_peers() {
    let server = Netcode::new_server(State::default(), TICK);
    server.advance_ticks(1, 0);

    let (c1, p1) = join(&server).await;
    let (c2, p2) = join(&server).await;

    // Everyone ticks in rough lockstep while both players issue orders.
    for round in 0u32..30 {
        server.advance_ticks(1, 0);
        c1.advance_ticks(1, p1.send_after);
        c2.advance_ticks(1, p2.send_after);
        match round {
            5 => c1.act(heading_cmd(0, 111)),
            11 => c2.act(heading_cmd(0, 222)),
            17 => server.act(heading_cmd(0, 333)),
            _ => {}
        }
        // Let the stream tasks move ballots and commands around.
        sleep(Duration::from_millis(2)).await;
    }

    // Quiesce. The clients balloted ticks 3..=32 and the server's live
    // clock sits at 32, so every frontier must come to rest at exactly 31.
    settle("all commit frontiers to meet", || {
        server.commit_now() == 31 && c1.commit_now() == 31 && c2.commit_now() == 31
    })
    .await;

    let commit = server.clone_commit();
    assert_eq!(c1.clone_commit(), commit, "client 1 commit diverged");
    assert_eq!(c2.clone_commit(), commit, "client 2 commit diverged");
    // The last order is authoritative history by now.
    assert_eq!(commit.planes[0].want_heading, Rot16::new(333));
}

#[tokio::test]
async fn malformed_peer_is_torn_down_without_stalling_the_session() {
    let server = Netcode::new_server(State::default(), TICK);
    server.advance_ticks(3, 0);

    let (server_side, client_side) = tokio::io::duplex(64 * 1024);
    let (sr, sw) = split(server_side);
    tokio::spawn(serve_peer(Arc::clone(&server), sr, sw));

    // Speak the join handshake by hand.
    let (mut cr, mut cw) = split(client_side);
    let mut header = [0u8; State::HEADER_SIZE];
    cr.read_exact(&mut header).await.unwrap();
    let n_planes = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let n_runways = u16::from_le_bytes([header[12], header[13]]) as usize;
    let mut body = vec![0u8; n_planes * State::PLANE_SIZE + n_runways * State::RUNWAY_SIZE];
    cr.read_exact(&mut body).await.unwrap();

    cw.write_all(&[0u8]).await.unwrap();
    let mut remote_now = [0u8; 4];
    cr.read_exact(&mut remote_now).await.unwrap();
    let remote_now = Tick::from_le_bytes(remote_now);
    assert_eq!(remote_now, 5);

    // The peer now gates the frontier...
    server.advance_ticks(10, 0);
    assert_eq!(server.commit_now(), 4);

    // ...until it sends garbage and gets torn down.
    cw.write_all(&0xffffu16.to_le_bytes()).await.unwrap();
    settle("the malformed peer to be cleaned up", || {
        server.advance_ticks(0, 0);
        server.commit_now() > 4
    })
    .await;
    assert_eq!(server.commit_now(), server.live_now() - 1);
}
