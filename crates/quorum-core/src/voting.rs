// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Terminal-outcome detection over the coordination state.
//!
//! [`evaluate`] is a pure function of the state plus two orchestrator-observed
//! timing facts (`deadline_reached`, `stable`); it never mutates anything and
//! never sends notifications.  The orchestrator re-runs it after every
//! mutation.
//!
//! Decision rules, in order:
//! 1. every agent failed → `all_failed`
//! 2. exactly one non-failed agent with a working answer → `sole_survivor`
//! 3. every non-failed agent holds a live vote, all on one target → consensus
//! 4. (when enabled) every non-failed agent holds a live vote and nothing new
//!    arrived for the stability window → most-voted target wins
//! 5. deadline reached → most-voted answer-holding agent wins; with no
//!    answers at all the task degrades to `all_failed`
//!
//! Ties in 4 and 5 break by earliest first-answer timestamp, then by
//! lexicographic agent id.

use std::collections::HashSet;

use crate::state::{AgentId, CoordinationState, OutcomeReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Undecided,
    Decided {
        /// `None` only for `all_failed`.
        winner: Option<AgentId>,
        reason: OutcomeReason,
    },
}

impl Decision {
    pub fn is_decided(&self) -> bool {
        matches!(self, Decision::Decided { .. })
    }
}

/// Evaluate the decision rules against the current state.
///
/// `stable` reports that no working answer or vote has been emitted for the
/// configured stability window; `plurality_enabled` gates rule 4 entirely.
pub fn evaluate(
    state: &CoordinationState,
    deadline_reached: bool,
    stable: bool,
    plurality_enabled: bool,
) -> Decision {
    let alive = state.non_failed();

    // Rule 1: all failed.
    if alive.is_empty() {
        return Decision::Decided {
            winner: None,
            reason: OutcomeReason::AllFailed,
        };
    }

    // Rule 2: sole survivor with a working answer.
    if alive.len() == 1 {
        let survivor = &alive[0];
        if state.current_version(survivor) > 0 {
            return Decision::Decided {
                winner: Some(survivor.clone()),
                reason: OutcomeReason::SoleSurvivor,
            };
        }
        // A lone agent without an answer stays undecided until the deadline.
    }

    let live = state.live_votes();
    let all_voted = !alive.is_empty()
        && alive.iter().all(|a| live.iter().any(|v| v.voter == *a));

    // Rule 3: full consensus — every live vote on a single non-failed target.
    if all_voted {
        let targets: HashSet<&AgentId> = live.iter().map(|v| &v.target).collect();
        if targets.len() == 1 {
            let target = (*targets.iter().next().unwrap()).clone();
            return Decision::Decided {
                winner: Some(target),
                reason: OutcomeReason::Consensus,
            };
        }
    }

    // Rule 4: plurality after a quiet period.
    if plurality_enabled && stable && all_voted && !live.is_empty() {
        let candidates: Vec<AgentId> = live
            .iter()
            .map(|v| v.target.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if let Some(winner) = pick_most_voted(state, &candidates) {
            return Decision::Decided {
                winner: Some(winner),
                reason: OutcomeReason::Consensus,
            };
        }
    }

    // Rule 5: deadline fallback.
    if deadline_reached {
        let candidates: Vec<AgentId> = alive
            .iter()
            .filter(|a| state.current_version(a) > 0)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Decision::Decided {
                winner: None,
                reason: OutcomeReason::AllFailed,
            };
        }
        if let Some(winner) = pick_most_voted(state, &candidates) {
            return Decision::Decided {
                winner: Some(winner),
                reason: OutcomeReason::TimeoutFallback,
            };
        }
    }

    Decision::Undecided
}

/// Pick the candidate with the most live votes; break ties by earliest
/// first-answer timestamp, then lexicographic agent id.
fn pick_most_voted(state: &CoordinationState, candidates: &[AgentId]) -> Option<AgentId> {
    let tally = state.tally();
    candidates
        .iter()
        .min_by(|a, b| {
            let votes_a = tally.get(*a).copied().unwrap_or(0);
            let votes_b = tally.get(*b).copied().unwrap_or(0);
            votes_b
                .cmp(&votes_a)
                .then_with(|| state.first_answer_at(a).cmp(&state.first_answer_at(b)))
                .then_with(|| a.cmp(b))
        })
        .cloned()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
