//! The rollback window: tentative ticks between the committed past and the
//! live present, and the deterministic replay that absorbs late commands.

use std::collections::VecDeque;

use sim::{Command, State, Tick};

/// A command stamped with the tick it happens at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimedCommand {
    pub cmd: Command,
    /// Unreliable commands are tentatively applied to live but dropped at
    /// commit. Nothing produces them yet; the hook models a future
    /// datagram-style input channel.
    pub reliable: bool,
    pub when: Tick,
}

#[derive(Debug, Copy, Clone)]
struct Entry {
    cmd: Command,
    reliable: bool,
}

/// The pair of states plus the command slots joining them.
///
/// `join[i]` holds the commands for tick `commit.now + i`, each slot sorted
/// and deduplicated by the command's fixed-width byte representation. The
/// sort key is what makes replay order-independent: every peer applies
/// same-tick commands in the same order no matter how the network delivered
/// them.
#[derive(Debug, Default)]
pub struct Rollback {
    pub commit: State,
    pub live: State,
    /// Bumped whenever `live` is rebuilt or ticked. A rollback replay can
    /// leave `live.now` unchanged while the contents differ, so renderers
    /// watch this generation instead of the tick counter.
    pub live_gen: u64,
    join: VecDeque<Vec<Entry>>,
}

impl Rollback {
    /// Inserts commands into the window, keeping `live` up to date.
    ///
    /// Returns true when at least one command was new. Fast path: commands
    /// that land at the end of the slot for exactly `live.now` are applied
    /// directly on top of live. Anything else forces a full replay from
    /// `commit`.
    ///
    /// Panics if a command targets the committed past; the netcode layer
    /// must screen those out.
    pub fn submit(&mut self, cmds: &[TimedCommand]) -> bool {
        self.submit_inner(cmds, true)
    }

    /// Same as [`submit`](Rollback::submit) with the fast path disabled, so
    /// tests can check the two are observationally equal.
    #[cfg(test)]
    pub fn submit_replay_always(&mut self, cmds: &[TimedCommand]) -> bool {
        self.submit_inner(cmds, false)
    }

    fn submit_inner(&mut self, cmds: &[TimedCommand], allow_fast: bool) -> bool {
        let mut live_is_new = false;
        let mut on_top_of_live = allow_fast;
        for c in cmds {
            assert!(
                c.when > self.commit.now,
                "command for tick {} at or before the commit frontier {}",
                c.when,
                self.commit.now
            );
            let idx = self.grab_idx(c.when);
            match self.join[idx].binary_search_by(|e| e.cmd.cmp(&c.cmd)) {
                Ok(i) => {
                    // Duplicate: a reliable copy upgrades an unreliable one.
                    self.join[idx][i].reliable |= c.reliable;
                    continue;
                }
                Err(i) => {
                    on_top_of_live =
                        on_top_of_live && i == self.join[idx].len() && c.when == self.live.now;
                    if on_top_of_live {
                        self.live.apply(&c.cmd);
                    }
                    self.join[idx].insert(
                        i,
                        Entry {
                            cmd: c.cmd,
                            reliable: c.reliable,
                        },
                    );
                    live_is_new = true;
                }
            }
        }

        if live_is_new && !on_top_of_live {
            self.replay();
        }
        live_is_new
    }

    /// Rebuilds `live` from `commit` plus every slot in the window.
    fn replay(&mut self) {
        let target = self.live.now;
        self.live.copy_from(&self.commit);
        self.live_gen += 1;
        if let Some(slot) = self.join.front() {
            for e in slot {
                self.live.apply(&e.cmd);
            }
        }
        while self.live.now < target {
            self.live.tick();
            let idx = (self.live.now - self.commit.now) as usize;
            if let Some(slot) = self.join.get(idx) {
                for e in slot {
                    self.live.apply(&e.cmd);
                }
            }
        }
    }

    /// Advances live by one tick and applies the commands waiting for it.
    pub fn tick_live(&mut self) {
        self.check();
        self.live.tick();
        self.live_gen += 1;
        let idx = (self.live.now - self.commit.now) as usize;
        if let Some(slot) = self.join.get(idx) {
            for e in slot {
                self.live.apply(&e.cmd);
            }
        }
        self.check();
    }

    /// Promotes the oldest tentative tick to committed, applying only its
    /// reliable commands and dropping the slot.
    pub fn tick_commit(&mut self) {
        self.check();
        let idx = self.grab_idx(self.commit.now);
        assert_eq!(idx, 0, "committing out of order");
        let slot = self.join.pop_front().expect("grab_idx grew the window");
        for e in &slot {
            if !e.reliable {
                continue; // speculative input, never authoritative
            }
            self.commit.apply(&e.cmd);
        }
        self.commit.tick();
        self.check();
    }

    /// Iterates every command still in the window, oldest tick first. Used
    /// for the reliable catch-up stream sent to joining peers.
    pub fn joins(&self) -> impl Iterator<Item = TimedCommand> + '_ {
        let base = self.commit.now;
        self.join.iter().enumerate().flat_map(move |(i, slot)| {
            slot.iter().map(move |e| TimedCommand {
                cmd: e.cmd,
                reliable: e.reliable,
                when: base + i as Tick,
            })
        })
    }

    /// Index of the slot for `when`, growing the window as needed.
    fn grab_idx(&mut self, when: Tick) -> usize {
        let idx = (when - self.commit.now) as usize;
        while self.join.len() <= idx {
            self.join.push_back(Vec::new());
        }
        idx
    }

    fn check(&self) {
        assert!(
            self.commit.now < self.live.now,
            "live (tick {}) is not ahead of commit (tick {})",
            self.live.now,
            self.commit.now
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim::Rot16;

    /// A server-side rollback right after startup: live one tick ahead, the
    /// first demo plane (id 0) already spawned at tick 1.
    fn fresh() -> Rollback {
        let mut r = Rollback::default();
        r.live.tick();
        r
    }

    fn heading_cmd(plane: u32, raw: u16) -> Command {
        Command::give_plane_heading(plane, Rot16::new(raw))
    }

    fn reliable(cmd: Command, when: Tick) -> TimedCommand {
        TimedCommand {
            cmd,
            reliable: true,
            when,
        }
    }

    #[test]
    fn test_fast_path_applies_to_live() {
        let mut r = fresh();
        let gen = r.live_gen;
        assert!(r.submit(&[reliable(heading_cmd(0, 5000), 1)]));
        assert_eq!(r.live.planes[0].want_heading, Rot16::new(5000));
        // In-order insertion must not rebuild live.
        assert_eq!(r.live_gen, gen);
    }

    #[test]
    fn test_duplicate_is_ignored() {
        let mut r = fresh();
        let c = reliable(heading_cmd(0, 5000), 1);
        assert!(r.submit(&[c]));
        let snapshot = r.live.clone();
        assert!(!r.submit(&[c]));
        assert_eq!(r.live, snapshot);
    }

    #[test]
    fn test_late_insert_equals_from_scratch() {
        // Advance one window with no commands, then drop a command into its
        // past; the replayed live must equal a run that saw the command on
        // time.
        let mut late = fresh();
        for _ in 0..9 {
            late.tick_live();
        }
        assert_eq!(late.live.now, 10);
        let commit_before = late.commit.clone();
        late.submit(&[reliable(heading_cmd(0, 9000), 5)]);
        assert_eq!(late.commit, commit_before, "rollback must not touch commit");

        let mut on_time = fresh();
        for _ in 0..4 {
            on_time.tick_live();
        }
        on_time.submit(&[reliable(heading_cmd(0, 9000), 5)]);
        for _ in 0..5 {
            on_time.tick_live();
        }

        assert_eq!(late.live, on_time.live);
    }

    #[test]
    fn test_fast_path_matches_forced_replay() {
        let schedule = [
            (heading_cmd(0, 1000), 1),
            (heading_cmd(0, 2000), 3),
            (heading_cmd(1, 3000), 301),
            (heading_cmd(0, 100), 301),
            (heading_cmd(1, 60000), 302),
        ];

        let mut fast = fresh();
        let mut slow = fresh();
        for (cmd, when) in schedule {
            while fast.live.now < when {
                fast.tick_live();
                slow.tick_live();
            }
            fast.submit(&[reliable(cmd, when)]);
            slow.submit_replay_always(&[reliable(cmd, when)]);
            assert_eq!(fast.live, slow.live, "diverged at tick {}", when);
        }
    }

    #[test]
    fn test_insertion_order_is_irrelevant() {
        let cmds = [
            reliable(heading_cmd(0, 1000), 2),
            reliable(heading_cmd(0, 2000), 4),
            reliable(heading_cmd(0, 3000), 4),
            reliable(heading_cmd(0, 50), 7),
        ];

        let mut in_order = fresh();
        for _ in 0..7 {
            in_order.tick_live();
        }
        in_order.submit(&cmds);

        let mut reversed = fresh();
        for _ in 0..7 {
            reversed.tick_live();
        }
        for c in cmds.iter().rev() {
            reversed.submit(std::slice::from_ref(c));
        }

        assert_eq!(in_order.live, reversed.live);
    }

    #[test]
    fn test_unreliable_commands_never_commit() {
        let mut r = fresh();
        r.submit(&[TimedCommand {
            cmd: heading_cmd(0, 7777),
            reliable: false,
            when: 1,
        }]);
        assert_eq!(r.live.planes[0].want_heading, Rot16::new(7777));

        for _ in 0..2 {
            r.tick_live();
        }
        r.tick_commit(); // tick 0 -> 1, no commands
        r.tick_commit(); // tick 1 -> 2, the unreliable command is dropped
        assert_eq!(r.commit.now, 2);
        assert_eq!(r.commit.planes[0].want_heading, Rot16::new(0));
        // Live keeps the speculative effect until a replay rebuilds it.
        assert_eq!(r.live.planes[0].want_heading, Rot16::new(7777));
    }

    #[test]
    fn test_reliable_commands_survive_commit() {
        let mut r = fresh();
        r.submit(&[reliable(heading_cmd(0, 4242), 1)]);
        r.tick_live();
        r.tick_live();
        r.tick_commit();
        r.tick_commit();
        assert_eq!(r.commit.now, 2);
        assert_eq!(r.commit.planes[0].want_heading, Rot16::new(4242));
    }

    #[test]
    fn test_commit_then_live_stay_aligned() {
        let mut r = fresh();
        for _ in 0..20 {
            r.tick_live();
        }
        r.submit(&[reliable(heading_cmd(0, 31000), 8)]);
        for _ in 0..8 {
            r.tick_commit();
        }
        assert_eq!(r.commit.now, 8);
        assert_eq!(r.commit.planes[0].want_heading, Rot16::new(0));

        // Committing tick 8 applies the command to commit too.
        r.tick_commit();
        assert_eq!(r.commit.now, 9);
        assert_eq!(r.commit.planes[0].want_heading, Rot16::new(31000));
    }

    #[test]
    #[should_panic(expected = "commit frontier")]
    fn test_rejects_commands_for_the_committed_past() {
        let mut r = fresh();
        r.tick_live();
        r.tick_commit();
        r.submit(&[reliable(heading_cmd(0, 1), 1)]);
    }

    #[test]
    fn test_joins_reports_window_contents() {
        let mut r = fresh();
        for _ in 0..4 {
            r.tick_live();
        }
        let a = reliable(heading_cmd(0, 10), 2);
        let b = TimedCommand {
            cmd: heading_cmd(0, 20),
            reliable: false,
            when: 4,
        };
        r.submit(&[a, b]);

        let all: Vec<_> = r.joins().collect();
        assert_eq!(all, vec![a, b]);
    }
}
