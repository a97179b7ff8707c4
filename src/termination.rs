// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Round-based termination for peer-style flows.
//!
//! Flows that iterate agents in rounds (peer-to-peer, auction, critic-review
//! loops) do not terminate by reaching an exit node; they stop when a
//! [`TerminationEvaluator`] says so. The evaluator is consulted once per
//! round with every participant's satisfaction score and output, and applies
//! its rules in a fixed priority order:
//!
//! 1. wall-clock timeout
//! 2. max rounds
//! 3. consensus (fraction of satisfied participants)
//! 4. aggregate quality
//! 5. convergence (scores stable across a window of rounds)
//!
//! Only the first matching rule fires. Several rules matching at once is not
//! an error; the ambiguity is logged and resolved by priority.
//!
//! Elapsed time uses `tokio::time::Instant`, so paused-clock tests can drive
//! the timeout rule deterministically.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// Why a round-based flow stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Enough participants reported satisfaction above their thresholds.
    ConsensusReached,
    /// Participant scores were stable across the convergence window.
    Converged,
    /// Aggregate quality met the quality threshold.
    QualityMet,
    /// The round limit was reached.
    MaxRoundsReached,
    /// The wall-clock budget for the whole flow expired.
    TimedOut,
}

/// Verdict for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDecision {
    /// Keep iterating.
    Continue,
    /// Stop, for the given reason.
    Stop(TerminationReason),
}

/// Thresholds and limits for a round-based flow.
#[derive(Debug, Clone)]
pub struct TerminationPolicy {
    /// Wall-clock budget for the whole flow.
    pub timeout: Duration,
    /// Maximum number of rounds.
    pub max_rounds: u32,
    /// Minimum fraction of satisfied participants for consensus.
    pub consensus_threshold: f64,
    /// Minimum aggregate quality score.
    pub quality_threshold: f64,
    /// Consecutive stable rounds required to declare convergence.
    pub convergence_window: u32,
    /// Maximum per-participant score drift still considered stable.
    pub convergence_tolerance: f64,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            max_rounds: 5,
            consensus_threshold: 0.6,
            quality_threshold: 0.85,
            convergence_window: 3,
            convergence_tolerance: 0.01,
        }
    }
}

/// One participant's report for a round.
#[derive(Debug, Clone)]
pub struct ParticipantReport {
    /// Participant id.
    pub participant: String,
    /// Satisfaction score in `[0, 1]`.
    pub satisfaction: f64,
    /// This participant counts as satisfied when `satisfaction >= threshold`.
    pub threshold: f64,
    /// The participant's output payload for the round.
    pub output: Value,
}

impl ParticipantReport {
    /// Report with an explicit satisfaction threshold.
    pub fn new(
        participant: impl Into<String>,
        satisfaction: f64,
        threshold: f64,
        output: Value,
    ) -> Self {
        Self {
            participant: participant.into(),
            satisfaction,
            threshold,
            output,
        }
    }

    fn is_satisfied(&self) -> bool {
        self.satisfaction >= self.threshold
    }
}

/// Everything the evaluator sees for one round.
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    /// Per-participant reports.
    pub participants: Vec<ParticipantReport>,
    /// Aggregate quality for the round. When absent, the mean participant
    /// satisfaction stands in.
    pub quality: Option<f64>,
}

impl RoundReport {
    /// Round built from participant reports only.
    pub fn from_participants(participants: Vec<ParticipantReport>) -> Self {
        Self {
            participants,
            quality: None,
        }
    }

    fn satisfied_fraction(&self) -> f64 {
        if self.participants.is_empty() {
            return 0.0;
        }
        let satisfied = self.participants.iter().filter(|p| p.is_satisfied()).count();
        satisfied as f64 / self.participants.len() as f64
    }

    fn aggregate_quality(&self) -> f64 {
        if let Some(quality) = self.quality {
            return quality;
        }
        if self.participants.is_empty() {
            return 0.0;
        }
        let total: f64 = self.participants.iter().map(|p| p.satisfaction).sum();
        total / self.participants.len() as f64
    }

    fn scores(&self) -> Vec<f64> {
        self.participants.iter().map(|p| p.satisfaction).collect()
    }
}

/// Stateful per-flow evaluator. Create one per run; it tracks the round
/// count, the start instant and the score history for convergence.
#[derive(Debug)]
pub struct TerminationEvaluator {
    policy: TerminationPolicy,
    started: Instant,
    rounds_seen: u32,
    score_history: Vec<Vec<f64>>,
}

impl TerminationEvaluator {
    /// Evaluator starting its clock now.
    pub fn new(policy: TerminationPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            rounds_seen: 0,
            score_history: Vec::new(),
        }
    }

    /// Rounds evaluated so far.
    pub fn rounds_seen(&self) -> u32 {
        self.rounds_seen
    }

    /// Record a round and decide whether the flow stops.
    pub fn evaluate(&mut self, round: &RoundReport) -> RoundDecision {
        self.rounds_seen += 1;
        self.score_history.push(round.scores());

        let mut matched = Vec::new();
        if self.started.elapsed() >= self.policy.timeout {
            matched.push(TerminationReason::TimedOut);
        }
        if self.rounds_seen >= self.policy.max_rounds {
            matched.push(TerminationReason::MaxRoundsReached);
        }
        if round.satisfied_fraction() >= self.policy.consensus_threshold
            && !round.participants.is_empty()
        {
            matched.push(TerminationReason::ConsensusReached);
        }
        if round.aggregate_quality() >= self.policy.quality_threshold
            && !round.participants.is_empty()
        {
            matched.push(TerminationReason::QualityMet);
        }
        if self.is_converged() {
            matched.push(TerminationReason::Converged);
        }

        if matched.len() > 1 {
            tracing::warn!(
                round = self.rounds_seen,
                matched = ?matched,
                "multiple termination rules matched; resolving by priority"
            );
        }

        // Fixed priority, independent of the match-collection order above.
        let winner = [
            TerminationReason::TimedOut,
            TerminationReason::MaxRoundsReached,
            TerminationReason::ConsensusReached,
            TerminationReason::QualityMet,
            TerminationReason::Converged,
        ]
        .into_iter()
        .find(|reason| matched.contains(reason));

        match winner {
            Some(reason) => {
                tracing::info!(round = self.rounds_seen, reason = ?reason, "flow terminated");
                RoundDecision::Stop(reason)
            }
            None => RoundDecision::Continue,
        }
    }

    /// Scores stable within tolerance for `convergence_window` consecutive
    /// rounds, participant by participant.
    fn is_converged(&self) -> bool {
        let window = self.policy.convergence_window as usize;
        if window < 2 || self.score_history.len() < window {
            return false;
        }
        let recent = &self.score_history[self.score_history.len() - window..];
        recent.windows(2).all(|pair| {
            pair[0].len() == pair[1].len()
                && pair[0]
                    .iter()
                    .zip(&pair[1])
                    .all(|(a, b)| (a - b).abs() <= self.policy.convergence_tolerance)
        })
    }
}
