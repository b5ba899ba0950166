//! Temporal voting with hysteresis.
//!
//! Converts a stream of noisy per-cycle votes into confirmed decisions:
//! an identity needs `votes_to_confirm` of the last `window` cycles, and a
//! confirmed "unknown" needs an uninterrupted streak of unknown votes outside
//! the protection window that follows every confirmed identity.

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Vote;

pub const DEFAULT_WINDOW: usize = 5;
pub const DEFAULT_VOTES_TO_CONFIRM: usize = 3;
pub const DEFAULT_UNKNOWN_STREAK: usize = 5;
pub const DEFAULT_PROTECT_SECS: i64 = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct VotingConfig {
    pub window: usize,
    pub votes_to_confirm: usize,
    pub unknown_streak: usize,
    /// How long a confirmed identity suppresses "unknown" decisions.
    pub protect_for: TimeDelta,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            votes_to_confirm: DEFAULT_VOTES_TO_CONFIRM,
            unknown_streak: DEFAULT_UNKNOWN_STREAK,
            protect_for: TimeDelta::seconds(DEFAULT_PROTECT_SECS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    Protected {
        employee_id: String,
        until: DateTime<Utc>,
    },
}

/// Decision emitted for one pushed vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Not enough evidence yet.
    Pending,
    Confirmed { employee_id: String },
    /// A face has been seen repeatedly without matching anyone enrolled.
    Unknown,
}

/// Bounded sliding window of the most recent cycles.
///
/// A cycle without a usable face occupies an empty slot: it counts for
/// nobody but still pushes the oldest vote out.
#[derive(Debug, Clone)]
pub struct VoteBuffer {
    slots: VecDeque<Option<Vote>>,
    capacity: usize,
}

impl VoteBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a vote, evicting the oldest beyond capacity.
    pub fn push(&mut self, vote: Vote) {
        self.push_slot(Some(vote));
    }

    /// Record a cycle that produced no vote.
    pub fn push_absent(&mut self) {
        self.push_slot(None);
    }

    fn push_slot(&mut self, slot: Option<Vote>) {
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(slot);
    }

    pub fn count(&self, vote: &Vote) -> usize {
        self.iter().filter(|v| *v == vote).count()
    }

    /// Slots in use, empty ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Votes in the window, oldest first, skipping empty slots.
    pub fn iter(&self) -> impl Iterator<Item = &Vote> {
        self.slots.iter().flatten()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecognitionState {
    pub last_confirmed: Option<String>,
    pub last_confirmed_at: Option<DateTime<Utc>>,
    pub unknown_streak: usize,
}

/// Voting state machine for one scanning session.
#[derive(Debug, Clone)]
pub struct VotingEngine {
    config: VotingConfig,
    state: ScanState,
    buffer: VoteBuffer,
    recognition: RecognitionState,
}

impl VotingEngine {
    pub fn new(config: VotingConfig) -> Self {
        let buffer = VoteBuffer::new(config.window);
        Self {
            config,
            state: ScanState::Idle,
            buffer,
            recognition: RecognitionState::default(),
        }
    }

    /// Enter `Scanning` from `Idle`. No effect while already scanning.
    pub fn start(&mut self) {
        if self.state == ScanState::Idle {
            self.state = ScanState::Scanning;
        }
    }

    /// Return to `Idle`, dropping every vote and all recognition state.
    pub fn stop(&mut self) {
        self.state = ScanState::Idle;
        self.buffer.clear();
        self.recognition = RecognitionState::default();
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn recognition(&self) -> &RecognitionState {
        &self.recognition
    }

    pub fn buffer(&self) -> &VoteBuffer {
        &self.buffer
    }

    /// Leave `Protected` once its window has elapsed.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if let ScanState::Protected { until, .. } = &self.state {
            if now >= *until {
                self.state = ScanState::Scanning;
            }
        }
    }

    pub fn is_protected(&self, now: DateTime<Utc>) -> bool {
        matches!(&self.state, ScanState::Protected { until, .. } if now < *until)
    }

    /// Record a cycle with no usable face. Ages the window without
    /// touching the unknown streak.
    pub fn absent(&mut self, now: DateTime<Utc>) -> Decision {
        if self.state == ScanState::Idle {
            return Decision::Pending;
        }
        self.refresh(now);
        self.buffer.push_absent();
        Decision::Pending
    }

    /// Feed one cycle's vote and return the resulting decision.
    pub fn push(&mut self, vote: Vote, now: DateTime<Utc>) -> Decision {
        if self.state == ScanState::Idle {
            tracing::debug!(?vote, "vote ignored while idle");
            return Decision::Pending;
        }
        self.refresh(now);
        self.buffer.push(vote.clone());

        match vote {
            Vote::Identity(employee_id) => {
                self.recognition.unknown_streak = 0;
                let votes = self.buffer.count(&Vote::Identity(employee_id.clone()));
                if votes >= self.config.votes_to_confirm {
                    return self.confirm(employee_id, votes, now);
                }
                Decision::Pending
            }
            Vote::Unknown => {
                self.recognition.unknown_streak += 1;
                if self.recognition.unknown_streak >= self.config.unknown_streak
                    && !self.is_protected(now)
                {
                    tracing::info!(
                        streak = self.recognition.unknown_streak,
                        "unrecognized face confirmed"
                    );
                    self.buffer.clear();
                    self.recognition.unknown_streak = 0;
                    return Decision::Unknown;
                }
                Decision::Pending
            }
        }
    }

    fn confirm(&mut self, employee_id: String, votes: usize, now: DateTime<Utc>) -> Decision {
        tracing::info!(employee_id = %employee_id, votes, "identity confirmed");
        self.recognition.last_confirmed = Some(employee_id.clone());
        self.recognition.last_confirmed_at = Some(now);
        self.recognition.unknown_streak = 0;
        self.buffer.clear();
        self.state = ScanState::Protected {
            employee_id: employee_id.clone(),
            until: now + self.config.protect_for,
        };
        Decision::Confirmed { employee_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const UNKNOWN: Vote = Vote::Unknown;
    const PENDING: Decision = Decision::Pending;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn id(s: &str) -> Vote {
        Vote::Identity(s.into())
    }

    fn scanning() -> VotingEngine {
        let mut engine = VotingEngine::new(VotingConfig::default());
        engine.start();
        engine
    }

    fn feed(engine: &mut VotingEngine, votes: &[Vote], start: i64) -> Vec<Decision> {
        votes
            .iter()
            .enumerate()
            .map(|(i, v)| engine.push(v.clone(), t(start + i as i64)))
            .collect()
    }

    #[test]
    fn test_confirms_on_third_vote() {
        let mut engine = scanning();
        let decisions = feed(&mut engine, &[id("A"), id("A"), id("A"), Vote::Unknown, id("A")], 0);
        assert_eq!(
            decisions,
            vec![
                Decision::Pending,
                Decision::Pending,
                Decision::Confirmed { employee_id: "A".into() },
                Decision::Pending,
                Decision::Pending,
            ]
        );
        assert_eq!(engine.recognition().last_confirmed.as_deref(), Some("A"));
        assert_eq!(engine.recognition().last_confirmed_at, Some(t(2)));
    }

    #[test]
    fn test_confirmation_clears_buffer_and_protects() {
        let mut engine = scanning();
        feed(&mut engine, &[id("A"), id("A"), id("A")], 0);
        assert!(engine.buffer().is_empty());
        assert_eq!(
            engine.state(),
            &ScanState::Protected { employee_id: "A".into(), until: t(8) }
        );
        assert!(engine.is_protected(t(7)));
        engine.refresh(t(8));
        assert_eq!(engine.state(), &ScanState::Scanning);
    }

    #[test]
    fn test_unknown_after_five_consecutive() {
        let mut engine = scanning();
        let decisions = feed(&mut engine, &[UNKNOWN; 5], 0);
        assert_eq!(&decisions[..4], &[PENDING; 4]);
        assert_eq!(decisions[4], Decision::Unknown);
        assert!(engine.buffer().is_empty());
        assert_eq!(engine.recognition().unknown_streak, 0);
    }

    #[test]
    fn test_unknown_does_not_retrigger_immediately() {
        let mut engine = scanning();
        feed(&mut engine, &[UNKNOWN; 5], 0);
        let again = feed(&mut engine, &[UNKNOWN; 5], 5);
        assert_eq!(&again[..4], &[PENDING; 4]);
        assert_eq!(again[4], Decision::Unknown);
    }

    #[test]
    fn test_identity_vote_breaks_unknown_streak() {
        let mut engine = scanning();
        let votes = [
            Vote::Unknown,
            Vote::Unknown,
            Vote::Unknown,
            Vote::Unknown,
            id("B"),
            Vote::Unknown,
        ];
        let decisions = feed(&mut engine, &votes, 0);
        assert!(decisions.iter().all(|d| *d == Decision::Pending));
        assert_eq!(engine.recognition().unknown_streak, 1);
    }

    #[test]
    fn test_unknown_suppressed_inside_protection() {
        let mut engine = scanning();
        feed(&mut engine, &[id("A"), id("A"), id("A")], 0);
        // Protected until t(8); five unknowns at t(3)..t(7) stay silent.
        let decisions = feed(&mut engine, &[UNKNOWN; 5], 3);
        assert!(decisions.iter().all(|d| *d == Decision::Pending));
        // First unknown after the window expires fires.
        assert_eq!(engine.push(Vote::Unknown, t(8)), Decision::Unknown);
    }

    #[test]
    fn test_split_votes_confirm_majority() {
        let mut engine = scanning();
        let decisions = feed(&mut engine, &[id("A"), id("B"), id("A"), id("B"), id("A")], 0);
        assert_eq!(decisions[4], Decision::Confirmed { employee_id: "A".into() });
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut engine = scanning();
        let votes = [
            id("A"),
            id("A"),
            Vote::Unknown,
            Vote::Unknown,
            Vote::Unknown,
            id("A"),
        ];
        let decisions = feed(&mut engine, &votes, 0);
        assert!(decisions.iter().all(|d| *d == Decision::Pending));
        assert_eq!(engine.buffer().len(), 5);
        assert_eq!(engine.buffer().count(&id("A")), 2);
    }

    #[test]
    fn test_second_person_needs_fresh_votes() {
        let mut engine = scanning();
        feed(&mut engine, &[id("A"), id("A"), id("A")], 0);
        let decisions = feed(&mut engine, &[id("B"), id("B"), id("B")], 3);
        assert_eq!(decisions[..2], [Decision::Pending, Decision::Pending]);
        assert_eq!(decisions[2], Decision::Confirmed { employee_id: "B".into() });
    }

    #[test]
    fn test_stop_clears_everything() {
        let mut engine = scanning();
        feed(&mut engine, &[id("A"), id("A"), id("A"), Vote::Unknown, id("C")], 0);
        engine.stop();
        assert_eq!(engine.state(), &ScanState::Idle);
        assert!(engine.buffer().is_empty());
        assert_eq!(engine.recognition(), &RecognitionState::default());
    }

    #[test]
    fn test_idle_ignores_votes() {
        let mut engine = VotingEngine::new(VotingConfig::default());
        let decisions = feed(&mut engine, &[id("A"), id("A"), id("A")], 0);
        assert!(decisions.iter().all(|d| *d == Decision::Pending));
        assert!(engine.buffer().is_empty());
    }

    #[test]
    fn test_absent_cycles_age_out_votes() {
        let mut engine = scanning();
        feed(&mut engine, &[id("A"), id("A")], 0);
        for s in 2..7 {
            assert_eq!(engine.absent(t(s)), PENDING);
        }
        assert_eq!(engine.buffer().len(), 5);
        assert_eq!(engine.buffer().count(&id("A")), 0);
        assert_eq!(engine.push(id("A"), t(7)), PENDING);
    }

    #[test]
    fn test_absent_keeps_recent_votes() {
        let mut engine = scanning();
        feed(&mut engine, &[id("A"), id("A")], 0);
        engine.absent(t(2));
        engine.absent(t(3));
        assert_eq!(engine.push(id("A"), t(4)), Decision::Confirmed { employee_id: "A".into() });
    }

    #[test]
    fn test_absent_leaves_unknown_streak() {
        let mut engine = scanning();
        feed(&mut engine, &[UNKNOWN; 3], 0);
        engine.absent(t(3));
        assert_eq!(engine.recognition().unknown_streak, 3);
    }

    #[test]
    fn test_vote_buffer_capacity() {
        let mut buf = VoteBuffer::new(2);
        buf.push(id("A"));
        buf.push(id("B"));
        buf.push(id("C"));
        let votes: Vec<_> = buf.iter().cloned().collect();
        assert_eq!(votes, vec![id("B"), id("C")]);
        buf.push_absent();
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.iter().cloned().collect::<Vec<_>>(), vec![id("C")]);
    }
}
