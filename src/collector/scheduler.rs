//! Deep-analysis state machine: idle -> analyzing -> cooling down -> idle
//!
//! Time is passed in explicitly (epoch ms) so every transition happens at a
//! deadline the state machine owns. The async loop that drives it and
//! issues the polls lives in [`super::hybrid`].

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::candidate::CandidateBoard;
use crate::config::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalysisPhase {
    Idle,
    Analyzing,
    CoolingDown,
}

/// What one scheduler tick decided
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickPlan {
    /// Symbols to poll this tick (the whole analyzing set)
    pub to_poll: Vec<String>,
    /// Symbols that entered analysis this tick
    pub started: Vec<String>,
    /// Symbols that moved from analyzing to cooling down this tick
    pub finished: Vec<String>,
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// symbol -> activated at
    analyzing: HashMap<String, i64>,
    /// symbol -> cooldown until
    cooldown: HashMap<String, i64>,
}

#[derive(Debug)]
pub struct AnalysisScheduler {
    threshold: u32,
    analysis_ms: i64,
    cooldown_ms: i64,
    state: Mutex<SchedulerState>,
}

impl AnalysisScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            threshold: config.candidate_threshold,
            analysis_ms: config.analysis_duration_ms(),
            cooldown_ms: config.cooldown_ms(),
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance to `now` against the current candidate scores.
    pub fn tick(&self, now: i64, board: &CandidateBoard) -> TickPlan {
        let mut state = self.lock();
        let mut plan = TickPlan::default();

        // analysis deadlines first, so a finished symbol is cooling before eligibility is computed
        let due: Vec<(String, i64)> = state
            .analyzing
            .iter()
            .filter(|&(_, &activated)| activated + self.analysis_ms <= now)
            .map(|(s, &a)| (s.clone(), a))
            .collect();
        for (symbol, activated) in due {
            state.analyzing.remove(&symbol);
            state
                .cooldown
                .insert(symbol.clone(), activated + self.analysis_ms + self.cooldown_ms);
            plan.finished.push(symbol);
        }

        state.cooldown.retain(|_, until| *until > now);

        let eligible: Vec<String> = board
            .at_or_above(self.threshold)
            .into_iter()
            .filter(|s| !state.cooldown.contains_key(s))
            .collect();

        for symbol in &eligible {
            if !state.analyzing.contains_key(symbol) {
                state.analyzing.insert(symbol.clone(), now);
                plan.started.push(symbol.clone());
            }
        }
        // a symbol that fell below the threshold leaves analysis without a cooldown
        state.analyzing.retain(|s, _| eligible.contains(s));

        plan.finished.sort();
        plan.to_poll = eligible;
        plan
    }

    pub fn phase(&self, symbol: &str) -> AnalysisPhase {
        let state = self.lock();
        if state.analyzing.contains_key(symbol) {
            AnalysisPhase::Analyzing
        } else if state.cooldown.contains_key(symbol) {
            AnalysisPhase::CoolingDown
        } else {
            AnalysisPhase::Idle
        }
    }

    pub fn analyzing(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.lock().analyzing.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn analyzing_count(&self) -> usize {
        self.lock().analyzing.len()
    }

    pub fn cooldown_count(&self) -> usize {
        self.lock().cooldown.len()
    }

    /// Drop every analysis and pending cooldown
    pub fn stop(&self) {
        let mut state = self.lock();
        state.analyzing.clear();
        state.cooldown.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::window::TickWindow;
    use crate::domain::{Tick, TickSource};

    fn board_with(symbols: &[&str]) -> CandidateBoard {
        let board = CandidateBoard::new();
        let mut window = TickWindow::new();
        for i in 0..20 {
            window.push(
                Tick::new("X", 100.0, 100.0, i * 1_000, TickSource::Streamed).unwrap(),
                180_000,
                180,
            );
        }
        for s in symbols {
            board.update(s, &window);
        }
        board
    }

    fn scheduler() -> AnalysisScheduler {
        AnalysisScheduler::new(&SchedulerConfig::default())
    }

    #[test]
    fn test_full_lifecycle_deadlines_are_exact() {
        let sched = scheduler();
        let board = board_with(&["A"]);

        let plan = sched.tick(1_000, &board);
        assert_eq!(plan.started, vec!["A".to_string()]);
        assert_eq!(plan.to_poll, vec!["A".to_string()]);
        assert_eq!(sched.phase("A"), AnalysisPhase::Analyzing);

        // one ms before the analysis deadline
        let plan = sched.tick(60_999, &board);
        assert!(plan.finished.is_empty());
        assert_eq!(sched.phase("A"), AnalysisPhase::Analyzing);

        let plan = sched.tick(61_000, &board);
        assert_eq!(plan.finished, vec!["A".to_string()]);
        assert!(plan.to_poll.is_empty());
        assert_eq!(sched.phase("A"), AnalysisPhase::CoolingDown);

        // cooldown ends exactly 180s after analysis ended
        sched.tick(240_999, &board);
        assert_eq!(sched.phase("A"), AnalysisPhase::CoolingDown);
        let plan = sched.tick(241_000, &board);
        // cooldown expired and the symbol is immediately eligible again
        assert_eq!(plan.started, vec!["A".to_string()]);
        assert_eq!(sched.phase("A"), AnalysisPhase::Analyzing);
    }

    #[test]
    fn test_late_tick_keeps_deadline_based_cooldown() {
        let sched = scheduler();
        let board = board_with(&["A"]);
        sched.tick(0, &board);
        // loop stalled; the cooldown is still anchored to the analysis deadline
        sched.tick(100_000, &board);
        assert_eq!(sched.phase("A"), AnalysisPhase::CoolingDown);
        sched.tick(239_999, &board);
        assert_eq!(sched.phase("A"), AnalysisPhase::CoolingDown);
        sched.tick(240_000, &board);
        assert_eq!(sched.phase("A"), AnalysisPhase::Analyzing);
    }

    #[test]
    fn test_never_analyzing_and_cooling() {
        let sched = scheduler();
        let board = board_with(&["A", "B"]);
        for now in (0..400_000).step_by(1_000) {
            sched.tick(now, &board);
            for s in ["A", "B"] {
                let state = sched.lock();
                assert!(!(state.analyzing.contains_key(s) && state.cooldown.contains_key(s)));
            }
        }
    }

    #[test]
    fn test_low_score_is_never_polled() {
        let sched = scheduler();
        let board = CandidateBoard::new();
        board.update("LOW", &TickWindow::new());
        let plan = sched.tick(0, &board);
        assert!(plan.to_poll.is_empty());
        assert_eq!(sched.phase("LOW"), AnalysisPhase::Idle);
    }

    #[test]
    fn test_dropping_below_threshold_leaves_analysis_without_cooldown() {
        let sched = scheduler();
        let board = board_with(&["A"]);
        sched.tick(0, &board);
        board.update("A", &TickWindow::new());
        let plan = sched.tick(1_000, &board);
        assert!(plan.to_poll.is_empty());
        assert_eq!(sched.phase("A"), AnalysisPhase::Idle);
        assert_eq!(sched.cooldown_count(), 0);
    }

    #[test]
    fn test_stop_clears_everything() {
        let sched = scheduler();
        let board = board_with(&["A", "B"]);
        sched.tick(0, &board);
        sched.tick(60_000, &board);
        assert_eq!(sched.cooldown_count(), 2);
        sched.stop();
        assert_eq!(sched.analyzing_count(), 0);
        assert_eq!(sched.cooldown_count(), 0);
    }
}
