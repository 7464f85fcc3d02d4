//! The netcode coordinator: one lock over the whole structure, per-peer
//! bookkeeping, commit gating and the tick clock.
//!
//! Locking rule: every operation that holds the [`Netcode`] mutex must be
//! block free. No I/O happens under the lock; the peer loops assemble their
//! output into local buffers while locked and write them after release.
//! Tasks are woken through two [`Notify`] handles: `state_notify` when the
//! live generation changes, `send_notify` when the send queue grows.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use sim::{Command, OpCode, State, Tick};
use tokio::sync::Notify;

use crate::error::ProtocolError;
use crate::render::FrameEncoder;
use crate::rollback::{Rollback, TimedCommand};

/// Which side of the session this instance runs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accepts peers, fans their commands out, and paces the commit
    /// frontier by broadcasting one `CommitTick` per committed tick.
    Server,
    /// Dials one server and ballots its own ticks back to it.
    Client,
}

/// A queued outgoing record, shared by every per-peer send loop.
#[derive(Debug)]
struct Sent {
    /// Player that originated the record; send loops skip their own
    /// player's records so commands never loop back.
    from_player: u32,
    /// Send loops still expected to consume this entry. The entry can be
    /// garbage collected from the queue head once this reaches zero.
    still_blocked_on_send: u32,
    when: Tick,
    cmd: Command,
}

/// Everything guarded by the one netcode lock.
struct Inner {
    rollback: Rollback,

    /// Per future tick, how many remote players have not yet balloted it.
    /// `ballots[0]` gates tick `commit.now + 1`.
    ballots: VecDeque<u32>,
    /// Connected remote players; newly grown ballot slots start at this.
    players_blocking_total: u32,

    send: VecDeque<Sent>,
    /// Generation of the entry just before `send[0]`; absolute generation of
    /// `send[i]` is `send_gen + i + 1`.
    send_gen: u64,
    players_waiting_on_send: u32,
    /// Monotonic player id allocator. Player 0 is always the local player.
    total_players: u32,
}

impl Inner {
    fn last_sent_gen(&self) -> u64 {
        self.send_gen + self.send.len() as u64
    }

    /// Queues a record for fan-out. Returns true when someone is listening
    /// and the caller must wake the send loops.
    fn push_sent(&mut self, from_player: u32, when: Tick, cmd: Command) -> bool {
        if self.players_waiting_on_send == 0 {
            return false;
        }
        self.send.push_back(Sent {
            from_player,
            still_blocked_on_send: self.players_waiting_on_send,
            when,
            cmd,
        });
        true
    }

    /// Drops fully consumed entries from the queue head.
    fn cleanup_sends(&mut self) {
        while let Some(s) = self.send.front() {
            if s.still_blocked_on_send != 0 {
                break;
            }
            self.send.pop_front();
            self.send_gen += 1;
        }
    }

    /// Ballot-window index for `tick`; only ticks after the commit frontier
    /// can be gated.
    fn ballot_idx(&self, tick: Tick) -> usize {
        (tick - self.rollback.commit.now - 1) as usize
    }

    /// Like [`ballot_idx`](Inner::ballot_idx), growing the window so the
    /// slot exists. New slots start at the current player count: every
    /// connected player implicitly blocks all future ticks.
    fn grab_ballot_idx(&mut self, tick: Tick) -> usize {
        let idx = self.ballot_idx(tick);
        while self.ballots.len() <= idx {
            self.ballots.push_back(self.players_blocking_total);
        }
        idx
    }

    /// Commits every tick that is no longer gated. Server only.
    ///
    /// A tick can be committed once no player blocks it and our own live
    /// clock has moved past it; other peers may be ahead of us, in which
    /// case commits wait for us. Returns true when the caller must wake the
    /// send loops (a `CommitTick` broadcast was queued).
    fn cleanup_commits(&mut self) -> bool {
        assert!(
            self.rollback.commit.now < self.rollback.live.now,
            "commit frontier caught up with live"
        );

        let mut wake_send = false;
        while let Some(&blocking) = self.ballots.front() {
            if blocking != 0 || self.rollback.commit.now + 1 >= self.rollback.live.now {
                break;
            }
            self.ballots.pop_front();
            wake_send |= self.tick_commit();
        }
        if self.players_blocking_total == 0 && self.ballots.is_empty() {
            // No remote player can gate anything: commit up to our live.
            while self.rollback.commit.now + 1 < self.rollback.live.now {
                wake_send |= self.tick_commit();
            }
        }
        wake_send
    }

    /// Commits one tick and broadcasts the `CommitTick` record for it.
    fn tick_commit(&mut self) -> bool {
        let committed = self.rollback.commit.now;
        self.rollback.tick_commit();
        self.push_sent(0, committed, Command::commit_tick())
    }
}

/// Handshake materials produced when a peer registers, to be written to its
/// stream outside the lock.
pub(crate) struct PeerHandshake {
    pub player_id: u32,
    /// First tick the peer is allowed to command; also its first ballot.
    pub remote_now: Tick,
    /// Send-queue generation this peer starts consuming from.
    pub last_sent_gen: u64,
    /// Serialized commit state.
    pub snapshot: Vec<u8>,
    /// Reliable `{u32 when, record}` entries still in the rollback window.
    pub catchup: Vec<u8>,
}

/// The netcode instance shared by every task of this process.
pub struct Netcode {
    inner: Mutex<Inner>,
    /// Signalled when `live_gen` changes.
    pub(crate) state_notify: Notify,
    /// Signalled when the send queue grows.
    pub(crate) send_notify: Notify,
    role: Role,
    tick_period: Duration,
}

impl Netcode {
    /// Creates a server instance. Live starts one tick ahead of commit so
    /// the commit frontier always trails the present.
    pub fn new_server(initial: State, tick_period: Duration) -> Arc<Netcode> {
        let mut rollback = Rollback::default();
        rollback.commit.copy_from(&initial);
        rollback.live.copy_from(&initial);
        rollback.live.tick();
        Arc::new(Netcode {
            inner: Mutex::new(Inner {
                rollback,
                ballots: VecDeque::new(),
                players_blocking_total: 0,
                send: VecDeque::new(),
                send_gen: 0,
                players_waiting_on_send: 0,
                total_players: 1, // player 0 is us
            }),
            state_notify: Notify::new(),
            send_notify: Notify::new(),
            role: Role::Server,
            tick_period,
        })
    }

    /// Creates a client instance. Its states stay empty until the join
    /// handshake adopts the server's snapshot.
    pub fn new_client(tick_period: Duration) -> Arc<Netcode> {
        Arc::new(Netcode {
            inner: Mutex::new(Inner {
                rollback: Rollback::default(),
                ballots: VecDeque::new(),
                players_blocking_total: 0,
                send: VecDeque::new(),
                send_gen: 0,
                players_waiting_on_send: 0,
                total_players: 1,
            }),
            state_notify: Notify::new(),
            send_notify: Notify::new(),
            role: Role::Client,
            tick_period,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("netcode lock poisoned")
    }

    // === Local input ===

    /// Ingests an action of the local player: applied to live at the current
    /// tick and queued for fan-out to every peer.
    pub fn act(&self, cmd: Command) {
        let mut inner = self.lock();
        let now = inner.rollback.live.now;
        if inner.rollback.submit(&[TimedCommand {
            cmd,
            reliable: true,
            when: now,
        }]) {
            self.state_notify.notify_waiters();
        }
        if inner.push_sent(0, now, cmd) {
            self.send_notify.notify_waiters();
        }
    }

    // === Tick clock ===

    /// Advances live by `todo` ticks: the body of the tick clock.
    ///
    /// The server opportunistically commits afterwards (it may itself have
    /// been the one blocking the frontier). The client, once its clock has
    /// passed `send_after`, ballots every tick it advances through.
    pub fn advance_ticks(&self, todo: u32, send_after: Tick) {
        let mut inner = self.lock();
        let mut wake_send = false;
        for _ in 0..todo {
            inner.rollback.tick_live();
            if self.role == Role::Client && inner.rollback.live.now >= send_after {
                let now = inner.rollback.live.now;
                wake_send |= inner.push_sent(0, now, Command::commit_tick());
            }
        }
        if self.role == Role::Server {
            wake_send |= inner.cleanup_commits();
        }
        drop(inner);
        if wake_send {
            self.send_notify.notify_waiters();
        }
        self.state_notify.notify_waiters();
    }

    /// Spawns the wall-clock tick loop. `start` anchors tick 0 of the run;
    /// if sleeps overshoot, the loop catches up by ticking multiple times,
    /// so the simulation never drifts from the wall clock.
    pub fn spawn_tick_clock(self: &Arc<Self>, mut start: Instant, send_after: Tick) {
        let n = Arc::clone(self);
        tokio::spawn(async move {
            let period = n.tick_period;
            loop {
                let dt = start.elapsed();
                let todo = (dt.as_nanos() / period.as_nanos()) as u32;
                if todo == 0 {
                    tokio::time::sleep(period.saturating_sub(dt)).await;
                    continue;
                }
                start += period * todo;
                n.advance_ticks(todo, send_after);
            }
        });
    }

    // === Server-side peer bookkeeping ===

    /// Registers a newly accepted peer and produces its handshake
    /// materials. The peer now gates every tick from `remote_now` on and is
    /// owed every send-queue entry from `last_sent_gen` on.
    pub(crate) fn register_peer(&self) -> PeerHandshake {
        let mut inner = self.lock();

        let mut snapshot = Vec::new();
        inner.rollback.commit.append_marshal(&mut snapshot);

        // Reliable commands still in flight between commit and live; the
        // peer replays these on top of the snapshot.
        let mut catchup = Vec::new();
        for tc in inner.rollback.joins() {
            if !tc.reliable {
                continue; // would masquerade as reliable on the other side
            }
            catchup.extend_from_slice(&tc.when.to_le_bytes());
            catchup.extend_from_slice(tc.cmd.wire_bytes());
        }

        inner.players_waiting_on_send += 1;
        let last_sent_gen = inner.last_sent_gen();
        let player_id = inner.total_players;
        inner.total_players += 1;

        // The peer may command the tick after our current live.
        let remote_now = inner.rollback.live.now + 1;
        let idx = inner.grab_ballot_idx(remote_now);
        inner.players_blocking_total += 1;
        for b in inner.ballots.iter_mut().skip(idx) {
            *b += 1;
        }

        PeerHandshake {
            player_id,
            remote_now,
            last_sent_gen,
            snapshot,
            catchup,
        }
    }

    /// Consumes one `CommitTick` ballot from a peer. `remote_now` is that
    /// peer's strictly ordered ballot counter.
    pub(crate) fn peer_ballot(&self, remote_now: &mut Tick) {
        let mut inner = self.lock();
        let committed = *remote_now;
        *remote_now += 1;

        let idx = inner.grab_ballot_idx(committed);
        let b = &mut inner.ballots[idx];
        assert!(*b > 0, "ballot counter underflow for tick {}", committed);
        *b -= 1;
        if inner.cleanup_commits() {
            self.send_notify.notify_waiters();
        }
    }

    /// Ingests a player command from a peer, stamped at that peer's current
    /// ballot tick, and queues it for fan-out to the other peers.
    pub(crate) fn peer_command(&self, player_id: u32, remote_now: Tick, cmd: Command) {
        let mut inner = self.lock();
        if inner.rollback.submit(&[TimedCommand {
            cmd,
            reliable: true,
            when: remote_now,
        }]) {
            self.state_notify.notify_waiters();
        }
        if inner.push_sent(player_id, remote_now, cmd) {
            self.send_notify.notify_waiters();
        }
    }

    /// Drains new send-queue entries for one peer's send loop.
    ///
    /// Encodes `{u32 when, record}` frames into `out`, skipping the peer's
    /// own records. Returns false when there is nothing new and the caller
    /// should wait on `send_notify`.
    pub(crate) fn collect_peer_outgoing(
        &self,
        last_sent_gen: &mut u64,
        player_id: u32,
        out: &mut Vec<u8>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.last_sent_gen() == *last_sent_gen {
            return false;
        }
        out.clear();
        let start = (*last_sent_gen - inner.send_gen) as usize;
        for i in start..inner.send.len() {
            let s = &mut inner.send[i];
            assert!(s.still_blocked_on_send > 0, "send entry consumed twice");
            s.still_blocked_on_send -= 1;
            if s.from_player == player_id {
                continue; // no loopback
            }
            out.extend_from_slice(&s.when.to_le_bytes());
            out.extend_from_slice(s.cmd.wire_bytes());
        }
        inner.cleanup_sends();
        *last_sent_gen = inner.last_sent_gen();
        true
    }

    /// Rolls back the receive edge of a departed peer: it no longer gates
    /// any tick at or after its ballot counter. Unblocked commits may now
    /// proceed.
    pub(crate) fn peer_read_closed(&self, remote_now: Tick) {
        let mut inner = self.lock();
        assert!(inner.players_blocking_total > 0, "peer count underflow");
        inner.players_blocking_total -= 1;
        let idx = inner.ballot_idx(remote_now);
        for b in inner.ballots.iter_mut().skip(idx) {
            assert!(*b > 0, "ballot counter underflow during teardown");
            *b -= 1;
        }
        if inner.cleanup_commits() {
            self.send_notify.notify_waiters();
        }
    }

    /// Rolls back the send edge of a departed peer: everything still queued
    /// for it is marked consumed so the queue can shrink.
    pub(crate) fn peer_write_closed(&self, last_sent_gen: u64) {
        let mut inner = self.lock();
        assert!(inner.players_waiting_on_send > 0, "send listener underflow");
        inner.players_waiting_on_send -= 1;
        let start = (last_sent_gen - inner.send_gen) as usize;
        for i in start..inner.send.len() {
            let s = &mut inner.send[i];
            assert!(s.still_blocked_on_send > 0, "send entry consumed twice");
            s.still_blocked_on_send -= 1;
        }
        inner.cleanup_sends();
    }

    // === Client-side handshake and stream ingestion ===

    /// Adopts the server's snapshot as both commit and live.
    pub(crate) fn client_adopt(&self, snapshot: &[u8]) -> Result<(), ProtocolError> {
        let mut inner = self.lock();
        let rb = &mut inner.rollback;
        rb.commit.unmarshal(snapshot)?;
        rb.live.copy_from(&rb.commit);
        Ok(())
    }

    /// Fast-forwards live to the server's current tick and starts feeding
    /// the server from our send queue.
    pub(crate) fn finish_client_handshake(&self, remote_live: Tick) {
        let mut inner = self.lock();
        let ticks = remote_live - inner.rollback.commit.now;
        for _ in 0..ticks {
            inner.rollback.live.tick();
        }
        inner.players_waiting_on_send += 1; // the server consumes our queue
    }

    /// Ingests one framed record from the server. `CommitTick` records must
    /// arrive exactly at our commit frontier; anything else is replayed into
    /// the rollback window.
    pub(crate) fn client_ingest(&self, when: Tick, cmd: Command) -> Result<(), ProtocolError> {
        let mut inner = self.lock();
        if cmd.opcode() == Some(OpCode::CommitTick) {
            if when != inner.rollback.commit.now {
                return Err(ProtocolError::CommitTickMismatch {
                    expected: inner.rollback.commit.now,
                    got: when,
                });
            }
            inner.rollback.tick_commit();
        } else if inner.rollback.submit(&[TimedCommand {
            cmd,
            reliable: true,
            when,
        }]) {
            self.state_notify.notify_waiters();
        }
        Ok(())
    }

    /// Drains new send-queue entries for the client's send loop.
    ///
    /// The client-to-server direction omits `when`: ordering is the
    /// protocol. Every `CommitTick` advances `send_time` by one tick, and
    /// each entry must carry exactly that tick, which catches any ordering
    /// bug before it reaches the wire.
    pub(crate) fn collect_client_outgoing(
        &self,
        last_sent_gen: &mut u64,
        send_time: &mut Tick,
        out: &mut Vec<u8>,
    ) -> bool {
        let mut inner = self.lock();
        if inner.last_sent_gen() == *last_sent_gen {
            return false;
        }
        out.clear();
        let start = (*last_sent_gen - inner.send_gen) as usize;
        for i in start..inner.send.len() {
            let s = &mut inner.send[i];
            assert!(s.still_blocked_on_send > 0, "send entry consumed twice");
            s.still_blocked_on_send -= 1;
            if s.cmd.opcode() == Some(OpCode::CommitTick) {
                *send_time += 1;
            }
            assert_eq!(
                s.when, *send_time,
                "outgoing record out of order: queued for tick {} while sending tick {}",
                s.when, send_time
            );
            out.extend_from_slice(s.cmd.wire_bytes());
        }
        inner.cleanup_sends();
        *last_sent_gen = inner.last_sent_gen();
        true
    }

    // === Render latch ===

    /// Encodes the live state if its generation moved past `rendered_gen`.
    /// The encoder runs under the lock and must not block; the caller
    /// writes `out` after this returns.
    pub(crate) fn encode_if_new(
        &self,
        rendered_gen: &mut u64,
        encoder: &mut impl FrameEncoder,
        out: &mut Vec<u8>,
    ) -> bool {
        let inner = self.lock();
        if inner.rollback.live_gen == *rendered_gen {
            return false;
        }
        *rendered_gen = inner.rollback.live_gen;
        out.clear();
        encoder.encode(&inner.rollback.live, out);
        true
    }

    // === Introspection (tests and status logging) ===

    pub fn commit_now(&self) -> Tick {
        self.lock().rollback.commit.now
    }

    pub fn live_now(&self) -> Tick {
        self.lock().rollback.live.now
    }

    pub fn clone_commit(&self) -> State {
        self.lock().rollback.commit.clone()
    }

    pub fn clone_live(&self) -> State {
        self.lock().rollback.live.clone()
    }
}
