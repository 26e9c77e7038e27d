use std::path::Path;

use tracing::{info, warn};

use crate::conversation::{ConversationLog, ConversationWindow, Message, Turn};
use crate::proximity::ProximityTracker;

/// All mutable per-session state, owned by the traffic controller.
#[derive(Debug)]
pub struct Session {
    window: ConversationWindow,
    /// Commits in the current cycle.
    turn_count: usize,
    /// 1-based number of the cycle being filled.
    cycle_number: usize,
    /// Commits since the session started.
    session_turns: usize,
    history: Vec<Turn>,
    history_cap: usize,
    pub(crate) proximity: ProximityTracker,
    log: ConversationLog,
    finalized: bool,
}

impl Session {
    pub fn new(log: ConversationLog, cycle_size: usize, history_cap: usize) -> Self {
        Self {
            window: ConversationWindow::new(cycle_size),
            turn_count: 0,
            cycle_number: 1,
            session_turns: 0,
            history: Vec::new(),
            history_cap,
            proximity: ProximityTracker::default(),
            log,
            finalized: false,
        }
    }

    pub fn window(&self) -> &ConversationWindow {
        &self.window
    }

    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    pub fn cycle_number(&self) -> usize {
        self.cycle_number
    }

    pub fn session_turns(&self) -> usize {
        self.session_turns
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn proximity(&self) -> &ProximityTracker {
        &self.proximity
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// No turn has been committed yet.
    pub fn is_first_turn(&self) -> bool {
        self.session_turns == 0
    }

    pub fn last_user_message(&self) -> Option<&Message> {
        self.history.last().map(|t| &t.user)
    }

    /// Record a committed turn.  Returns `true` when the cycle is full and
    /// the window should be compressed.
    pub fn commit(&mut self, turn: Turn) -> bool {
        if let Err(err) = self.log.append_turn(&turn) {
            warn!(error = %err, path = %self.log.path().display(), "conversation log write failed");
        }
        self.history.push(turn.clone());
        if self.history.len() > self.history_cap {
            let excess = self.history.len() - self.history_cap;
            self.history.drain(..excess);
        }
        self.turn_count += 1;
        self.session_turns += 1;
        self.window.push(turn) || self.turn_count >= self.window.capacity()
    }

    /// Clear the window and start the next cycle.
    pub fn close_cycle(&mut self) {
        self.window.clear();
        self.turn_count = 0;
        self.cycle_number += 1;
    }

    /// Run the end-of-session step.  Returns `false` if it already ran.
    pub fn finalize(&mut self) -> bool {
        if self.finalized {
            return false;
        }
        self.finalized = true;
        let cycles = self.cycle_number - 1;
        if let Err(err) = self.log.finish(self.session_turns, cycles) {
            warn!(error = %err, "writing session end failed");
        }
        info!(
            turns = self.session_turns,
            cycles,
            pending = self.window.len(),
            "session finalized"
        );
        true
    }
}

impl Drop for Session {
    /// Exit paths that never reach an explicit shutdown still close the log.
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session(dir: &TempDir, cycle: usize) -> Session {
        Session::new(ConversationLog::create(dir.path()).unwrap(), cycle, 3)
    }

    #[test]
    fn commit_signals_full_cycle() {
        let dir = TempDir::new().unwrap();
        let mut s = session(&dir, 2);
        assert!(s.is_first_turn());
        assert!(!s.commit(Turn::new("a", "b")));
        assert!(s.commit(Turn::new("c", "d")));
        s.close_cycle();
        assert_eq!((s.turn_count(), s.window().len(), s.cycle_number()), (0, 0, 2));
        assert_eq!(s.session_turns(), 2);
        assert!(!s.is_first_turn());
    }

    #[test]
    fn history_is_capped() {
        let dir = TempDir::new().unwrap();
        let mut s = session(&dir, 10);
        for i in 0..5 {
            s.commit(Turn::new(format!("u{i}"), "r"));
        }
        assert_eq!(s.history().len(), 3);
        assert_eq!(s.last_user_message().unwrap().text, "u4");
    }

    #[test]
    fn finalize_runs_once() {
        let dir = TempDir::new().unwrap();
        let mut s = session(&dir, 5);
        s.commit(Turn::new("hi", "hello"));
        assert!(s.finalize());
        assert!(!s.finalize());
        let raw = std::fs::read_to_string(s.log_path()).unwrap();
        assert_eq!(raw.matches("session_end").count(), 1);
    }

    #[test]
    fn dropping_an_open_session_finalizes_it() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut s = session(&dir, 5);
            s.commit(Turn::new("hi", "hello"));
            s.log_path().to_path_buf()
        };
        let raw = std::fs::read_to_string(path).unwrap();
        assert_eq!(raw.matches("session_end").count(), 1);
    }

    #[test]
    fn drop_after_finalize_does_not_repeat_it() {
        let dir = TempDir::new().unwrap();
        let path = {
            let mut s = session(&dir, 5);
            s.finalize();
            s.log_path().to_path_buf()
        };
        let raw = std::fs::read_to_string(path).unwrap();
        assert_eq!(raw.matches("session_end").count(), 1);
    }
}
