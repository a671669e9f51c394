//! Noise/stability state machine.
//! Separates genuine moves from hand occlusion: a hand touches many squares
//! at once and produces unstable per-frame change sets, while a real move
//! leaves a small set that repeats frame after frame once the hand withdraws.
//! Transitions are driven solely by the changed-square set fed in each tick.

use crate::config::Settings;
use shakmaty::Square;
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseState {
    /// Rest state, waiting for changes.
    Idle,
    /// Occlusion in progress; move processing is blocked.
    NoiseActive,
    /// A small change set is settling.
    MovePending,
}

/// Result of feeding one frame's changed squares through the machine.
#[derive(Clone, Debug)]
pub struct NoiseReport {
    pub state: NoiseState,
    /// True exactly when the pending set has survived the stability window;
    /// `squares` then carries the set for downstream resolution.
    pub stable: bool,
    pub squares: HashSet<Square>,
    /// Origin-square hint when a single square is pending (piece lifted).
    pub lifted: Option<Square>,
    /// Fraction of the stability (or cooldown) window elapsed, for UI.
    pub progress: f32,
}

impl NoiseReport {
    fn quiet(state: NoiseState) -> Self {
        NoiseReport {
            state,
            stable: false,
            squares: HashSet::new(),
            lifted: None,
            progress: 0.0,
        }
    }
}

pub struct NoiseHandler {
    noise_threshold: usize,
    stability_frames: u32,
    cooldown_frames: u32,
    state: NoiseState,
    pending: HashSet<Square>,
    stable_count: u32,
    cooldown_count: u32,
    lifted: Option<Square>,
}

impl NoiseHandler {
    pub fn new(settings: &Settings) -> Self {
        NoiseHandler {
            noise_threshold: settings.noise_square_threshold,
            stability_frames: settings.stability_frames.max(1),
            cooldown_frames: settings.cooldown_frames.max(1),
            state: NoiseState::Idle,
            pending: HashSet::new(),
            stable_count: 0,
            cooldown_count: 0,
            lifted: None,
        }
    }

    pub fn state(&self) -> NoiseState {
        self.state
    }

    /// True while move processing should be blocked (hand in frame).
    pub fn is_blocked(&self) -> bool {
        self.state == NoiseState::NoiseActive
    }

    pub fn reset(&mut self) {
        self.state = NoiseState::Idle;
        self.pending.clear();
        self.stable_count = 0;
        self.cooldown_count = 0;
        self.lifted = None;
    }

    /// Advances the machine by one frame.
    pub fn process(&mut self, changed: &HashSet<Square>) -> NoiseReport {
        match self.state {
            NoiseState::Idle => self.process_idle(changed),
            NoiseState::NoiseActive => self.process_noise(changed),
            NoiseState::MovePending => self.process_pending(changed),
        }
    }

    fn adopt_candidate(&mut self, changed: &HashSet<Square>) -> NoiseReport {
        self.state = NoiseState::MovePending;
        self.pending = changed.clone();
        self.stable_count = 1;
        self.lifted = if changed.len() == 1 {
            changed.iter().next().copied()
        } else {
            None
        };
        NoiseReport {
            state: NoiseState::MovePending,
            stable: false,
            squares: self.pending.clone(),
            lifted: self.lifted,
            progress: self.stable_count as f32 / self.stability_frames as f32,
        }
    }

    fn process_idle(&mut self, changed: &HashSet<Square>) -> NoiseReport {
        let n = changed.len();
        if n == 0 {
            NoiseReport::quiet(NoiseState::Idle)
        } else if n > self.noise_threshold {
            // too many simultaneous changes: a hand, not a move
            self.state = NoiseState::NoiseActive;
            self.cooldown_count = 0;
            NoiseReport::quiet(NoiseState::NoiseActive)
        } else {
            self.adopt_candidate(changed)
        }
    }

    fn process_noise(&mut self, changed: &HashSet<Square>) -> NoiseReport {
        let n = changed.len();
        if n > self.noise_threshold {
            self.cooldown_count = 0;
            return NoiseReport::quiet(NoiseState::NoiseActive);
        }

        self.cooldown_count += 1;
        if self.cooldown_count < self.cooldown_frames {
            let mut report = NoiseReport::quiet(NoiseState::NoiseActive);
            report.progress = self.cooldown_count as f32 / self.cooldown_frames as f32;
            return report;
        }

        // hand withdrawn
        if n == 0 {
            self.reset();
            NoiseReport::quiet(NoiseState::Idle)
        } else {
            // residual change pattern left behind
            self.adopt_candidate(changed)
        }
    }

    fn process_pending(&mut self, changed: &HashSet<Square>) -> NoiseReport {
        let n = changed.len();
        if n > self.noise_threshold {
            // hand interrupted the settle
            self.pending.clear();
            self.stable_count = 0;
            self.cooldown_count = 0;
            self.lifted = None;
            self.state = NoiseState::NoiseActive;
            return NoiseReport::quiet(NoiseState::NoiseActive);
        }

        if n == 0 {
            // changes cleared; the candidate set either completed or reverted
            self.stable_count += 1;
            if self.stable_count >= self.stability_frames {
                let squares = std::mem::take(&mut self.pending);
                self.reset();
                return NoiseReport {
                    state: NoiseState::Idle,
                    stable: true,
                    squares,
                    lifted: None,
                    progress: 1.0,
                };
            }
            return NoiseReport {
                state: NoiseState::MovePending,
                stable: false,
                squares: self.pending.clone(),
                lifted: None,
                progress: self.stable_count as f32 / self.stability_frames as f32,
            };
        }

        if *changed == self.pending {
            self.stable_count += 1;
            let stable = self.stable_count >= self.stability_frames;
            NoiseReport {
                state: NoiseState::MovePending,
                stable,
                squares: self.pending.clone(),
                lifted: if self.pending.len() == 1 { self.lifted } else { None },
                progress: (self.stable_count as f32 / self.stability_frames as f32).min(1.0),
            }
        } else {
            // set changed mid-settle: restart the count with the new candidate
            self.adopt_candidate(changed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> NoiseHandler {
        NoiseHandler::new(&Settings::default())
    }

    fn squares(list: &[Square]) -> HashSet<Square> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_empty_set_keeps_idle() {
        let mut h = handler();
        for _ in 0..10 {
            let report = h.process(&HashSet::new());
            assert_eq!(report.state, NoiseState::Idle);
            assert!(!report.stable);
        }
    }

    #[test]
    fn test_single_change_enters_pending_with_lifted_hint() {
        let mut h = handler();
        let report = h.process(&squares(&[Square::E2]));
        assert_eq!(report.state, NoiseState::MovePending);
        assert_eq!(report.lifted, Some(Square::E2));
        assert!(!report.stable);
    }

    #[test]
    fn test_many_changes_enter_noise_within_one_call() {
        let mut h = handler();
        let hand = squares(&[Square::A2, Square::B2, Square::C2, Square::D2, Square::E2]);
        let report = h.process(&hand);
        assert_eq!(report.state, NoiseState::NoiseActive);
        assert!(h.is_blocked());
    }

    #[test]
    fn test_identical_set_becomes_stable_on_exact_frame() {
        let settings = Settings::default();
        let mut h = NoiseHandler::new(&settings);
        let set = squares(&[Square::E2, Square::E4]);

        for i in 1..settings.stability_frames {
            let report = h.process(&set);
            assert!(!report.stable, "stable too early at frame {i}");
        }
        let report = h.process(&set);
        assert!(report.stable);
        assert_eq!(report.squares, set);
    }

    #[test]
    fn test_zero_change_completion_emits_pending_set() {
        let settings = Settings::default();
        let mut h = NoiseHandler::new(&settings);
        let set = squares(&[Square::E2, Square::E4]);
        h.process(&set);

        // changes fade to nothing; the recorded candidate is still the answer.
        // The first call above counted frame 1.
        let mut last = None;
        for _ in 1..settings.stability_frames {
            last = Some(h.process(&HashSet::new()));
        }
        let report = last.unwrap();
        assert!(report.stable);
        assert_eq!(report.squares, set);
        assert_eq!(h.state(), NoiseState::Idle);
    }

    #[test]
    fn test_noise_clears_after_cooldown() {
        let settings = Settings::default();
        let mut h = NoiseHandler::new(&settings);
        h.process(&squares(&[Square::A1, Square::B1, Square::C1, Square::D1, Square::E1]));
        assert!(h.is_blocked());

        let mut report = NoiseReport::quiet(NoiseState::NoiseActive);
        for _ in 0..settings.cooldown_frames {
            report = h.process(&HashSet::new());
        }
        assert_eq!(report.state, NoiseState::Idle);
        assert!(!h.is_blocked());
    }

    #[test]
    fn test_noise_resolves_to_pending_with_residual_changes() {
        let settings = Settings::default();
        let mut h = NoiseHandler::new(&settings);
        h.process(&squares(&[Square::A1, Square::B1, Square::C1, Square::D1]));

        let residual = squares(&[Square::E2, Square::E4]);
        let mut report = NoiseReport::quiet(NoiseState::NoiseActive);
        for _ in 0..settings.cooldown_frames {
            report = h.process(&residual);
        }
        assert_eq!(report.state, NoiseState::MovePending);
        assert_eq!(report.squares, residual);
    }

    #[test]
    fn test_hand_interrupts_pending() {
        let mut h = handler();
        h.process(&squares(&[Square::E2]));
        assert_eq!(h.state(), NoiseState::MovePending);

        let hand = squares(&[Square::A1, Square::B1, Square::C1, Square::D1, Square::E1]);
        let report = h.process(&hand);
        assert_eq!(report.state, NoiseState::NoiseActive);
        assert!(h.is_blocked());
    }

    #[test]
    fn test_changed_candidate_restarts_count() {
        let settings = Settings::default();
        let mut h = NoiseHandler::new(&settings);
        let first = squares(&[Square::E2]);
        let second = squares(&[Square::D2, Square::D4]);

        for _ in 0..5 {
            h.process(&first);
        }
        // different set replaces the candidate and restarts counting
        let report = h.process(&second);
        assert_eq!(report.state, NoiseState::MovePending);
        assert!(!report.stable);

        // the restart call above already counted frame 1
        for i in 2..settings.stability_frames {
            let report = h.process(&second);
            assert!(!report.stable, "stable too early at frame {i} after restart");
        }
        let report = h.process(&second);
        assert!(report.stable);
        assert_eq!(report.squares, second);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut h = handler();
        h.process(&squares(&[Square::E2, Square::E4]));
        h.reset();
        assert_eq!(h.state(), NoiseState::Idle);
        assert!(!h.is_blocked());
    }
}
