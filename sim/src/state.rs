//! Simulation state: planes, runways, tick advance, command application and
//! the binary snapshot format sent to joining peers.

use log::warn;

use crate::command::{Command, CommandKind};
use crate::geometry::{Rect, Rot16, V2};
use crate::{Tick, SPEED, SUB_PIXEL_FACTOR, TAU, TICK_RATE, TURN_RADIUS, TURN_RATE};

/// A stabilized approach may be at most 10° off the runway axis.
const PATH_BOUNDS: i32 = (10 * TAU / 360) as i32;

/// An airplane.
///
/// Position is not stored per tick: `pos` and `heading` are only
/// materialized at `time`, and [`Plane::position`] projects them forward
/// analytically. That keeps straight flight and steady turns exact no matter
/// how many ticks elapse between materializations.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Plane {
    pub id: u32,
    /// Tick at which `pos` and `heading` were last materialized.
    pub time: Tick,
    pub pos: V2,
    pub want_heading: Rot16,
    pub heading: Rot16,
    /// Autopilot target, an index into [`State::runways`].
    pub going_to_runway: Option<u16>,
}

impl Plane {
    pub fn new(id: u32, time: Tick) -> Plane {
        Plane {
            id,
            time,
            ..Plane::default()
        }
    }

    fn flying_straight(&self) -> bool {
        self.want_heading == self.heading
    }

    /// Where the plane is (and which way it points) at `now`.
    ///
    /// Deterministic in `(pos, time, want_heading, heading, now)`: any peer
    /// evaluating this for the same plane state gets the same answer, and
    /// materializing the result back into the plane is a semantic no-op.
    pub fn position(&self, now: Tick) -> (V2, Rot16) {
        let dt = now - self.time;
        if dt == 0 {
            return (self.pos, self.heading);
        }

        if self.flying_straight() {
            let distance = (dt as u64 * SPEED as u64) as f64;
            let (sin, cos) = self.heading.sin_cos();
            let pos = V2::new(
                self.pos.x + (distance * sin) as i32,
                self.pos.y + (distance * cos) as i32,
            );
            return (pos, self.heading);
        }

        // Turning: the plane moves along a circle whose center sits a turn
        // radius to the side we are turning toward.
        let diff = (self.want_heading - self.heading).raw() as i16;
        let to_center = if diff < 0 {
            self.heading - Rot16::QUARTER // left turn
        } else {
            self.heading + Rot16::QUARTER // right turn
        };
        let (sin, cos) = to_center.sin_cos();
        let center = V2::new(
            self.pos.x + (TURN_RADIUS * sin) as i32,
            self.pos.y + (TURN_RADIUS * cos) as i32,
        );

        let mut arc = Rot16::new((dt as u16).wrapping_mul(TURN_RATE));
        if diff < 0 {
            arc = -arc;
        }
        let to_dest = to_center + Rot16::HALF + arc;
        let (sin, cos) = to_dest.sin_cos();
        let pos = V2::new(
            center.x + (TURN_RADIUS * sin) as i32,
            center.y + (TURN_RADIUS * cos) as i32,
        );
        (pos, self.heading + arc)
    }

    /// Advances the plane by one tick, snapping out of a turn once the
    /// accumulated rotation would overshoot the wanted heading.
    fn tick(&mut self, now: Tick) {
        if self.flying_straight() {
            return;
        }

        let dt = now - self.time;
        let remaining = u16::min(
            (self.heading - self.want_heading).raw(),
            (self.want_heading - self.heading).raw(),
        );
        if dt as u64 * TURN_RATE as u64 > remaining as u64 {
            let (pos, _) = self.position(now);
            self.pos = pos;
            self.heading = self.want_heading;
            self.time = now;
        }
    }

    /// Starts turning toward `heading`. Idempotent for the current target;
    /// otherwise materializes the present position so the new turn starts
    /// from where the plane actually is.
    pub fn turn(&mut self, now: Tick, heading: Rot16) {
        if heading == self.want_heading {
            return;
        }

        let (pos, h) = self.position(now);
        self.pos = pos;
        self.heading = h;
        self.want_heading = heading;
        self.time = now;
    }

    /// Puts the plane on autopilot toward a runway and immediately picks the
    /// first maneuver.
    pub fn goto_runway(&mut self, now: Tick, runway_id: u16, runway: Runway) {
        self.going_to_runway = Some(runway_id);
        self.pilot(now, runway);
    }

    /// Decides the next maneuver toward the targeted runway.
    fn pilot(&mut self, now: Tick, r: Runway) {
        let (pos, heading) = self.position(now);

        let (head_align, reversed) = heading.reversible_alignment(r.heading);
        if (head_align as i32).abs() > PATH_BOUNDS {
            return;
        }

        // We are aligned with the runway axis (one end or the other). Check
        // where the runway actually is relative to us.
        // atan2 takes x before y here: heading 0 points along +Y.
        let dir = Rot16::from_rad(f64::atan2(
            (r.pos.x - pos.x) as f64,
            (r.pos.y - pos.y) as f64,
        ));
        let (pos_align, pos_reversed) = dir.reversible_alignment(r.heading);

        let approach_end = if pos_reversed {
            r.heading + Rot16::HALF
        } else {
            r.heading
        };
        if pos_reversed != reversed {
            // Aligned with the axis but flying away from the runway.
            log::debug!("plane {} turning back toward runway", self.id);
            self.turn(now, approach_end);
        } else if (pos_align as i32).abs() <= PATH_BOUNDS {
            // On the approach path: proportional nudge around the runway
            // heading. No half-turn here, whichever end we approach from.
            let tgt = r.heading + Rot16::new(pos_align as u16);
            log::debug!("plane {} nudging to {}", self.id, tgt);
            self.turn(now, tgt);
        } else {
            // Right angle, wrong position: turn toward the runway and let a
            // later order line us up.
            log::debug!("plane {} turning toward runway", self.id);
            self.turn(now, approach_end);
        }
    }
}

/// A runway. Identified by its index in [`State::runways`]; that index is
/// the runway id on the wire.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Runway {
    pub pos: V2,
    pub heading: Rot16,
}

/// The whole simulated world at one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct State {
    pub now: Tick,
    pub next_plane_id: u32,
    /// Strictly increasing by id; command application binary-searches this.
    pub planes: Vec<Plane>,
    pub runways: Vec<Runway>,
    pub map_size: Rect,
    pub camera_size: Rect,
}

const HEADER_SIZE: usize = 4 // now
    + 4 // next_plane_id
    + 4 // planes len
    + 2; // runways len

const PLANE_SIZE: usize = 4 // id
    + 4 // time
    + 4 // x
    + 4 // y
    + 2 // want_heading
    + 2; // heading

const RUNWAY_SIZE: usize = 4 * 2 // pos
    + 2; // heading

/// Failure to decode a [`State`] snapshot.
///
/// Snapshots only ever come from the server we chose to join, so decoding
/// is trusting: these errors catch truncation and framing slips, not
/// adversarial input.
#[derive(Debug, thiserror::Error)]
pub enum StateDecodeError {
    #[error("state snapshot truncated while reading {0}")]
    Truncated(&'static str),
    #[error("{0} trailing bytes after state snapshot")]
    TrailingBytes(usize),
}

impl State {
    pub const HEADER_SIZE: usize = HEADER_SIZE;
    pub const PLANE_SIZE: usize = PLANE_SIZE;
    pub const RUNWAY_SIZE: usize = RUNWAY_SIZE;

    /// A fresh server world: empty sky over the default map.
    pub fn with_demo_map() -> State {
        let w = 1280 * SUB_PIXEL_FACTOR;
        let h = 720 * SUB_PIXEL_FACTOR;
        State {
            map_size: Rect::new(0, 0, w, h),
            camera_size: Rect::new(0, 0, w, h),
            runways: vec![
                Runway {
                    pos: V2::new(w / 2, h / 2),
                    heading: Rot16::new(0),
                },
                Runway {
                    pos: V2::new(w / 3, h / 2),
                    heading: Rot16::QUARTER,
                },
            ],
            ..State::default()
        }
    }

    /// Advances the world by one tick.
    pub fn tick(&mut self) {
        self.now += 1;

        // Generate some traffic for testing purposes.
        if self.now % (TICK_RATE * 5) == 1 && self.planes.len() < 2 {
            self.planes.push(Plane::new(self.next_plane_id, self.now));
            self.next_plane_id += 1;
        }

        let now = self.now;
        for p in &mut self.planes {
            p.tick(now);
        }
    }

    /// Applies a player command to the current tick.
    ///
    /// Lookup misses are tolerated: the player may be ordering around a
    /// plane that despawned between order entry and application. Anything
    /// other than a player command panics; the netcode layer screens
    /// opcodes before they get here.
    pub fn apply(&mut self, cmd: &Command) {
        match cmd.decode() {
            Some(CommandKind::GivePlaneHeading { plane_id, heading }) => {
                match self.planes.binary_search_by(|p| p.id.cmp(&plane_id)) {
                    Ok(i) => {
                        let now = self.now;
                        self.planes[i].turn(now, heading);
                        self.planes[i].going_to_runway = None;
                    }
                    Err(_) => warn!("GivePlaneHeading for missing plane {}", plane_id),
                }
            }
            Some(CommandKind::SendPlaneToRunway {
                plane_id,
                runway_id,
            }) => {
                let Ok(i) = self.planes.binary_search_by(|p| p.id.cmp(&plane_id)) else {
                    warn!("SendPlaneToRunway for missing plane {}", plane_id);
                    return;
                };
                let Some(&runway) = self.runways.get(runway_id as usize) else {
                    warn!("SendPlaneToRunway for missing runway {}", runway_id);
                    return;
                };
                let now = self.now;
                self.planes[i].goto_runway(now, runway_id, runway);
            }
            _ => panic!(
                "opcode {:#06x} is not applicable to the simulation",
                cmd.opcode_raw()
            ),
        }
    }

    /// Overwrites `self` with `other`, reusing the existing plane and runway
    /// storage so steady-state copies stay allocation free.
    pub fn copy_from(&mut self, other: &State) {
        self.now = other.now;
        self.next_plane_id = other.next_plane_id;
        self.planes.clear();
        self.planes.extend_from_slice(&other.planes);
        self.runways.clear();
        self.runways.extend_from_slice(&other.runways);
        self.map_size = other.map_size;
        self.camera_size = other.camera_size;
    }

    /// Size of the snapshot [`append_marshal`](State::append_marshal) emits.
    pub fn marshal_size(&self) -> usize {
        HEADER_SIZE + PLANE_SIZE * self.planes.len() + RUNWAY_SIZE * self.runways.len()
    }

    /// Appends the little-endian snapshot of the world to `out`.
    pub fn append_marshal(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.reserve(self.marshal_size());

        out.extend_from_slice(&self.now.to_le_bytes());
        out.extend_from_slice(&self.next_plane_id.to_le_bytes());
        out.extend_from_slice(&(self.planes.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.runways.len() as u16).to_le_bytes());

        for p in &self.planes {
            out.extend_from_slice(&p.id.to_le_bytes());
            out.extend_from_slice(&p.time.to_le_bytes());
            out.extend_from_slice(&p.pos.x.to_le_bytes());
            out.extend_from_slice(&p.pos.y.to_le_bytes());
            out.extend_from_slice(&p.want_heading.raw().to_le_bytes());
            out.extend_from_slice(&p.heading.raw().to_le_bytes());
        }

        for r in &self.runways {
            out.extend_from_slice(&r.pos.x.to_le_bytes());
            out.extend_from_slice(&r.pos.y.to_le_bytes());
            out.extend_from_slice(&r.heading.raw().to_le_bytes());
        }

        assert_eq!(
            out.len() - start,
            self.marshal_size(),
            "state marshal wrote a different size than it computed"
        );
    }

    /// Decodes a snapshot produced by [`append_marshal`](State::append_marshal),
    /// reusing `self`'s storage. The whole input must be consumed.
    pub fn unmarshal(&mut self, b: &[u8]) -> Result<(), StateDecodeError> {
        let mut r = Reader(b);

        self.now = r.u32("header")?;
        self.next_plane_id = r.u32("header")?;
        let n_planes = r.u32("header")? as usize;
        let n_runways = r.u16("header")? as usize;

        self.planes.clear();
        self.planes.reserve(n_planes);
        for _ in 0..n_planes {
            self.planes.push(Plane {
                id: r.u32("plane")?,
                time: r.u32("plane")?,
                pos: V2::new(r.u32("plane")? as i32, r.u32("plane")? as i32),
                want_heading: Rot16::new(r.u16("plane")?),
                heading: Rot16::new(r.u16("plane")?),
                going_to_runway: None,
            });
        }

        self.runways.clear();
        self.runways.reserve(n_runways);
        for _ in 0..n_runways {
            self.runways.push(Runway {
                pos: V2::new(r.u32("runway")? as i32, r.u32("runway")? as i32),
                heading: Rot16::new(r.u16("runway")?),
            });
        }

        if !r.0.is_empty() {
            return Err(StateDecodeError::TrailingBytes(r.0.len()));
        }
        Ok(())
    }
}

/// Cursor over a snapshot buffer.
struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&[u8], StateDecodeError> {
        if self.0.len() < n {
            return Err(StateDecodeError::Truncated(what));
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, StateDecodeError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, StateDecodeError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane_at(id: u32, pos: V2, heading: Rot16, want: Rot16, time: Tick) -> Plane {
        Plane {
            id,
            time,
            pos,
            want_heading: want,
            heading,
            going_to_runway: None,
        }
    }

    #[test]
    fn test_straight_flight_one_tick() {
        // Heading 0 is +Y, speed is 21 sub-pixels per tick.
        let p = plane_at(1, V2::new(0, 0), Rot16::new(0), Rot16::new(0), 0);
        let (pos, heading) = p.position(1);
        assert_eq!(pos, V2::new(0, 21));
        assert_eq!(heading, Rot16::new(0));
    }

    #[test]
    fn test_straight_flight_is_linear() {
        let p = plane_at(1, V2::new(100, -50), Rot16::QUARTER, Rot16::QUARTER, 10);
        let (pos, _) = p.position(70);
        // 60 ticks at 21 sub-pixels along +X.
        assert_eq!(pos.y, -50);
        assert!((pos.x - (100 + 60 * 21)).abs() <= 1);
    }

    #[test]
    fn test_turn_snap() {
        let mut p = plane_at(1, V2::new(0, 0), Rot16::new(0), Rot16::QUARTER, 0);
        // 109 Rot16/tick against a 16384 quarter turn: still turning at tick
        // 150, snapped at tick 151.
        for now in 1..=150 {
            p.tick(now);
        }
        assert_ne!(p.heading, p.want_heading);
        p.tick(151);
        assert_eq!(p.heading, Rot16::QUARTER);
        assert_eq!(p.want_heading, Rot16::QUARTER);
        assert_eq!(p.time, 151);
    }

    #[test]
    fn test_straight_materialization_is_idempotent() {
        let p = plane_at(3, V2::new(500, 700), Rot16::new(2000), Rot16::new(2000), 5);
        let (pos, heading) = p.position(40);

        let mut q = p;
        q.pos = pos;
        q.heading = heading;
        q.time = 40;

        for now in [40, 55, 90] {
            let (a, ah) = p.position(now);
            let (b, bh) = q.position(now);
            assert!((a.x - b.x).abs() <= 1, "x diverged at {}: {:?} {:?}", now, a, b);
            assert!((a.y - b.y).abs() <= 1, "y diverged at {}: {:?} {:?}", now, a, b);
            assert_eq!(ah, bh);
        }
    }

    #[test]
    fn test_turning_materialization_is_idempotent() {
        let p = plane_at(3, V2::new(500, 700), Rot16::new(2000), Rot16::new(60000), 5);
        let (pos, heading) = p.position(40);

        let mut q = p;
        q.pos = pos;
        q.heading = heading;
        q.time = 40;
        // Still turning toward the same target from the materialized point:
        // same circle, so only coordinate truncation may differ.

        for now in [40, 55, 70] {
            let (a, ah) = p.position(now);
            let (b, bh) = q.position(now);
            assert!((a.x - b.x).abs() <= 4, "x diverged at {}: {:?} {:?}", now, a, b);
            assert!((a.y - b.y).abs() <= 4, "y diverged at {}: {:?} {:?}", now, a, b);
            assert_eq!(ah, bh, "heading diverged at {}", now);
        }
    }

    #[test]
    fn test_turn_is_idempotent_for_same_target() {
        let mut p = plane_at(1, V2::new(0, 0), Rot16::new(0), Rot16::QUARTER, 0);
        let before = p;
        p.turn(10, Rot16::QUARTER);
        assert_eq!(p, before, "turning to the current target must not rebase time");
    }

    #[test]
    fn test_spawn_heuristic() {
        let mut s = State::default();
        s.tick();
        assert_eq!(s.planes.len(), 1);
        assert_eq!(s.planes[0].id, 0);
        assert_eq!(s.planes[0].time, 1);

        // No more spawns until the next five-second mark.
        for _ in 0..299 {
            s.tick();
        }
        assert_eq!(s.planes.len(), 1);
        s.tick();
        assert_eq!(s.planes.len(), 2);
        assert_eq!(s.planes[1].id, 1);

        // Capped at two planes.
        for _ in 0..600 {
            s.tick();
        }
        assert_eq!(s.planes.len(), 2);
    }

    #[test]
    fn test_give_plane_heading() {
        let mut s = State::default();
        s.tick();
        s.apply(&Command::give_plane_heading(0, Rot16::QUARTER));
        assert_eq!(s.planes[0].want_heading, Rot16::QUARTER);
        assert_eq!(s.planes[0].going_to_runway, None);
    }

    #[test]
    fn test_give_plane_heading_missing_plane() {
        let mut s = State::default();
        s.tick();
        let before = s.clone();
        s.apply(&Command::give_plane_heading(999, Rot16::new(0)));
        assert_eq!(s, before);
    }

    #[test]
    fn test_send_plane_to_runway_missing_ids() {
        let mut s = State::with_demo_map();
        s.tick();
        let before = s.clone();
        s.apply(&Command::send_plane_to_runway(999, 0));
        assert_eq!(s, before);
        s.apply(&Command::send_plane_to_runway(0, 42));
        assert_eq!(s, before);
    }

    #[test]
    fn test_send_plane_to_runway_sets_autopilot() {
        let mut s = State::with_demo_map();
        s.tick();
        s.apply(&Command::send_plane_to_runway(0, 0));
        assert_eq!(s.planes[0].going_to_runway, Some(0));
    }

    #[test]
    #[should_panic(expected = "not applicable")]
    fn test_apply_rejects_meta_opcodes() {
        let mut s = State::default();
        s.apply(&Command::commit_tick());
    }

    #[test]
    fn test_pilot_nudges_toward_centerline() {
        // Runway dead ahead along +Y; plane slightly right of the centerline
        // and heading straight. The autopilot should steer a little left,
        // toward the threshold.
        let runway = Runway {
            pos: V2::new(0, 20000),
            heading: Rot16::new(0),
        };
        let mut p = plane_at(1, V2::new(400, 0), Rot16::new(0), Rot16::new(0), 0);
        p.goto_runway(0, 0, runway);
        assert_eq!(p.going_to_runway, Some(0));
        let want = p.want_heading.raw();
        assert!(want > u16::MAX / 2, "expected a left nudge, got {}", want);
        // Still within the stabilized-approach cone.
        assert!(u16::MAX - want < 1820);
    }

    #[test]
    fn test_pilot_reversed_on_path_nudge_uses_forward_heading() {
        // Plane north of the runway flying south, dead on the extended
        // centerline: alignment and position both read as reversed, and the
        // nudge target is anchored on the runway's forward heading with no
        // half-turn added.
        let runway = Runway {
            pos: V2::new(0, 0),
            heading: Rot16::new(0),
        };
        let mut p = plane_at(1, V2::new(0, 20000), Rot16::HALF, Rot16::HALF, 0);
        p.goto_runway(0, 0, runway);
        assert_eq!(p.want_heading, Rot16::new(0));
    }

    #[test]
    fn test_pilot_turns_back_when_flying_away() {
        // Plane south of the runway but flying further south along the axis:
        // aimed away, should turn around to the forward approach heading.
        let runway = Runway {
            pos: V2::new(0, 20000),
            heading: Rot16::new(0),
        };
        let mut p = plane_at(1, V2::new(0, 0), Rot16::HALF, Rot16::HALF, 0);
        p.goto_runway(0, 0, runway);
        assert_eq!(p.want_heading, Rot16::new(0));
    }

    #[test]
    fn test_pilot_ignores_unaligned_plane() {
        // Way off the runway axis: the autopilot waits for a better setup.
        let runway = Runway {
            pos: V2::new(0, 20000),
            heading: Rot16::new(0),
        };
        let mut p = plane_at(1, V2::new(0, 0), Rot16::QUARTER, Rot16::QUARTER, 0);
        p.goto_runway(0, 0, runway);
        assert_eq!(p.want_heading, Rot16::QUARTER);
    }

    #[test]
    fn test_marshal_round_trip() {
        let mut s = State::with_demo_map();
        for _ in 0..400 {
            s.tick();
        }
        s.apply(&Command::give_plane_heading(0, Rot16::new(12345)));

        let mut bytes = Vec::new();
        s.append_marshal(&mut bytes);
        assert_eq!(bytes.len(), s.marshal_size());

        let mut back = State::default();
        back.unmarshal(&bytes).unwrap();
        // Autopilot targets do not travel in snapshots.
        let mut expected = s.clone();
        for p in &mut expected.planes {
            p.going_to_runway = None;
        }
        expected.map_size = Rect::default();
        expected.camera_size = Rect::default();
        assert_eq!(back, expected);
    }

    #[test]
    fn test_unmarshal_rejects_truncation_and_trailing() {
        let mut s = State::default();
        s.tick();
        let mut bytes = Vec::new();
        s.append_marshal(&mut bytes);

        let mut back = State::default();
        let err = back.unmarshal(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, StateDecodeError::Truncated(_)));

        bytes.push(0);
        let err = back.unmarshal(&bytes).unwrap_err();
        assert!(matches!(err, StateDecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_copy_from_reuses_storage() {
        let mut src = State::with_demo_map();
        for _ in 0..301 {
            src.tick();
        }

        let mut dst = State::default();
        dst.copy_from(&src);
        assert_eq!(dst, src);

        let planes_ptr = dst.planes.as_ptr();
        dst.copy_from(&src);
        assert_eq!(dst.planes.as_ptr(), planes_ptr, "copy reallocated plane storage");
    }
}
