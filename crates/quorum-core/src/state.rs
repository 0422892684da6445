// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Shared mutable state for one coordination task.
//!
//! [`CoordinationState`] is owned exclusively by the orchestrator's event
//! loop; every mutation goes through the methods here so the invariants hold
//! at all times:
//!
//! - working-answer versions per agent are strictly increasing and contiguous
//!   starting at 1, and every version is retained for audit;
//! - a vote is live iff both the voter's and the target's current versions
//!   still match the versions recorded at casting time;
//! - at most one vote per voter;
//! - a failed agent stays failed, and its votes (in both directions) are
//!   dropped while its last working answer is retained.

use std::collections::HashMap;
use std::time::Duration;

use quorum_backend::SnapshotRef;
use thiserror::Error;
use tokio::time::Instant;

// ─── Identifiers and statuses ────────────────────────────────────────────────

/// Opaque agent identifier, unique within a task and stable across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Pending,
    Starting,
    Working,
    Voted,
    Restarting,
    Failed,
    Presenting,
    Done,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Failed | AgentStatus::Done)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Starting => "starting",
            AgentStatus::Working => "working",
            AgentStatus::Voted => "voted",
            AgentStatus::Restarting => "restarting",
            AgentStatus::Failed => "failed",
            AgentStatus::Presenting => "presenting",
            AgentStatus::Done => "done",
        };
        write!(f, "{s}")
    }
}

// ─── Answers, votes, notifications ───────────────────────────────────────────

/// One version of an agent's candidate answer.
#[derive(Debug, Clone)]
pub struct WorkingAnswer {
    pub agent: AgentId,
    /// Strictly increasing per agent, starting at 1.
    pub version: u32,
    pub text: String,
    pub snapshot: Option<SnapshotRef>,
    pub published_at: Instant,
}

/// A live endorsement of a peer's current working answer.
#[derive(Debug, Clone)]
pub struct Vote {
    pub voter: AgentId,
    pub target: AgentId,
    pub reason: String,
    /// Target's answer version at casting time.
    pub target_version: u32,
    /// Voter's own answer version at casting time.
    pub voter_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    NewAnswer,
    VoteCast,
    /// Orchestrator-generated correction after a rejected protocol action.
    Corrective,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationKind::NewAnswer => "new_answer",
            NotificationKind::VoteCast => "vote_cast",
            NotificationKind::Corrective => "corrective",
        };
        write!(f, "{s}")
    }
}

/// A peer-state change rendered into another agent's next turn.
#[derive(Debug, Clone)]
pub struct Notification {
    pub origin: AgentId,
    pub kind: NotificationKind,
    pub summary: String,
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeReason {
    Consensus,
    SoleSurvivor,
    TimeoutFallback,
    AllFailed,
}

impl std::fmt::Display for OutcomeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeReason::Consensus => "consensus",
            OutcomeReason::SoleSurvivor => "sole_survivor",
            OutcomeReason::TimeoutFallback => "timeout_fallback",
            OutcomeReason::AllFailed => "all_failed",
        };
        write!(f, "{s}")
    }
}

/// The terminal result of one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// `None` only when every agent failed.
    pub winner: Option<AgentId>,
    pub final_text: String,
    pub statuses: Vec<(AgentId, AgentStatus)>,
    pub elapsed: Duration,
    pub reason: OutcomeReason,
}

/// A coordination action that is structurally invalid.  The offending
/// mutation is rejected; the agent is not failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("an agent may not vote for itself")]
    SelfVote,
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),
    #[error("vote rejected: voter has not published a working answer")]
    VoterHasNoAnswer,
    #[error("vote rejected: target has no working answer")]
    TargetHasNoAnswer,
    #[error("vote rejected: target has failed")]
    TargetFailed,
    #[error("coordination actions are ignored while presenting")]
    PresenterAction,
    #[error("agent has already failed")]
    AgentFailed,
}

// ─── CoordinationState ───────────────────────────────────────────────────────

/// Per-task mutable coordination state.  Single writer: the orchestrator.
#[derive(Debug)]
pub struct CoordinationState {
    pub task_id: String,
    pub query: String,
    /// Roster in registration order.
    agents: Vec<AgentId>,
    statuses: HashMap<AgentId, AgentStatus>,
    /// Every published version per agent, oldest first.
    answers: HashMap<AgentId, Vec<WorkingAnswer>>,
    /// Latest vote per voter; liveness is computed from versions.
    votes: HashMap<AgentId, Vote>,
    restarts: HashMap<AgentId, u32>,
    pub deadline: Instant,
}

impl CoordinationState {
    pub fn new(
        task_id: impl Into<String>,
        query: impl Into<String>,
        agents: Vec<AgentId>,
        deadline: Instant,
    ) -> Self {
        let statuses = agents
            .iter()
            .map(|a| (a.clone(), AgentStatus::Pending))
            .collect();
        Self {
            task_id: task_id.into(),
            query: query.into(),
            agents,
            statuses,
            answers: HashMap::new(),
            votes: HashMap::new(),
            restarts: HashMap::new(),
            deadline,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn agents(&self) -> &[AgentId] {
        &self.agents
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.agents.contains(agent)
    }

    pub fn status(&self, agent: &AgentId) -> AgentStatus {
        self.statuses
            .get(agent)
            .copied()
            .unwrap_or(AgentStatus::Failed)
    }

    pub fn non_failed(&self) -> Vec<AgentId> {
        self.agents
            .iter()
            .filter(|a| self.status(a) != AgentStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn all_failed(&self) -> bool {
        self.non_failed().is_empty()
    }

    /// Current answer version for an agent; 0 when nothing was published.
    pub fn current_version(&self, agent: &AgentId) -> u32 {
        self.answers
            .get(agent)
            .and_then(|v| v.last())
            .map(|a| a.version)
            .unwrap_or(0)
    }

    pub fn latest_answer(&self, agent: &AgentId) -> Option<&WorkingAnswer> {
        self.answers.get(agent).and_then(|v| v.last())
    }

    /// Full version history for audit; oldest first.
    pub fn answer_history(&self, agent: &AgentId) -> &[WorkingAnswer] {
        self.answers.get(agent).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Timestamp of an agent's first published answer (tie-break key).
    pub fn first_answer_at(&self, agent: &AgentId) -> Option<Instant> {
        self.answers
            .get(agent)
            .and_then(|v| v.first())
            .map(|a| a.published_at)
    }

    /// A vote is live iff the voter's and the target's current versions both
    /// match the versions recorded when it was cast.
    pub fn live_votes(&self) -> Vec<&Vote> {
        self.votes
            .values()
            .filter(|v| {
                self.current_version(&v.voter) == v.voter_version
                    && self.current_version(&v.target) == v.target_version
            })
            .collect()
    }

    pub fn live_vote_of(&self, voter: &AgentId) -> Option<&Vote> {
        self.live_votes().into_iter().find(|v| v.voter == *voter)
    }

    /// Live vote count per target.
    pub fn tally(&self) -> HashMap<AgentId, usize> {
        let mut counts: HashMap<AgentId, usize> = HashMap::new();
        for v in self.live_votes() {
            *counts.entry(v.target.clone()).or_default() += 1;
        }
        counts
    }

    pub fn restart_count(&self, agent: &AgentId) -> u32 {
        self.restarts.get(agent).copied().unwrap_or(0)
    }

    pub fn statuses_snapshot(&self) -> Vec<(AgentId, AgentStatus)> {
        self.agents
            .iter()
            .map(|a| (a.clone(), self.status(a)))
            .collect()
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Record a new working answer; returns the assigned version.
    ///
    /// Earlier votes on this agent and the agent's own outgoing vote become
    /// non-live implicitly, because liveness is computed from versions.
    pub fn publish_answer(
        &mut self,
        agent: &AgentId,
        text: String,
        snapshot: Option<SnapshotRef>,
    ) -> Result<u32, ProtocolViolation> {
        if !self.contains(agent) {
            return Err(ProtocolViolation::UnknownAgent(agent.clone()));
        }
        match self.status(agent) {
            AgentStatus::Failed => return Err(ProtocolViolation::AgentFailed),
            AgentStatus::Presenting | AgentStatus::Done => {
                return Err(ProtocolViolation::PresenterAction)
            }
            _ => {}
        }
        let version = self.current_version(agent) + 1;
        self.answers.entry(agent.clone()).or_default().push(WorkingAnswer {
            agent: agent.clone(),
            version,
            text,
            snapshot,
            published_at: Instant::now(),
        });
        // Publishing invalidates the agent's own outgoing vote.
        if self.status(agent) == AgentStatus::Voted {
            self.statuses.insert(agent.clone(), AgentStatus::Working);
        }
        Ok(version)
    }

    /// Record a vote, replacing any previous vote from the same voter.
    ///
    /// Returns `Ok(false)` when the vote is an exact duplicate of the live
    /// vote already held (idempotent re-cast).
    pub fn cast_vote(
        &mut self,
        voter: &AgentId,
        target: &AgentId,
        reason: String,
    ) -> Result<bool, ProtocolViolation> {
        if !self.contains(voter) {
            return Err(ProtocolViolation::UnknownAgent(voter.clone()));
        }
        if !self.contains(target) {
            return Err(ProtocolViolation::UnknownAgent(target.clone()));
        }
        if voter == target {
            return Err(ProtocolViolation::SelfVote);
        }
        match self.status(voter) {
            AgentStatus::Failed => return Err(ProtocolViolation::AgentFailed),
            AgentStatus::Presenting | AgentStatus::Done => {
                return Err(ProtocolViolation::PresenterAction)
            }
            _ => {}
        }
        if self.status(target) == AgentStatus::Failed {
            return Err(ProtocolViolation::TargetFailed);
        }
        let voter_version = self.current_version(voter);
        if voter_version == 0 {
            return Err(ProtocolViolation::VoterHasNoAnswer);
        }
        let target_version = self.current_version(target);
        if target_version == 0 {
            return Err(ProtocolViolation::TargetHasNoAnswer);
        }

        if let Some(existing) = self.votes.get(voter) {
            let duplicate = existing.target == *target
                && existing.target_version == target_version
                && existing.voter_version == voter_version;
            if duplicate {
                return Ok(false);
            }
        }

        self.votes.insert(
            voter.clone(),
            Vote {
                voter: voter.clone(),
                target: target.clone(),
                reason,
                target_version,
                voter_version,
            },
        );
        self.statuses.insert(voter.clone(), AgentStatus::Voted);
        Ok(true)
    }

    /// Transition an agent's status, honouring terminal-state monotonicity:
    /// `Failed` and `Done` are never left.
    pub fn set_status(&mut self, agent: &AgentId, status: AgentStatus) {
        if !self.contains(agent) {
            return;
        }
        if self.status(agent).is_terminal() {
            return;
        }
        self.statuses.insert(agent.clone(), status);
    }

    /// Mark an agent failed.  Its live vote and all live votes targeting it
    /// are dropped; its answer history is retained.
    pub fn mark_failed(&mut self, agent: &AgentId) {
        if !self.contains(agent) || self.status(agent) == AgentStatus::Done {
            return;
        }
        self.statuses.insert(agent.clone(), AgentStatus::Failed);
        self.votes
            .retain(|_, v| v.voter != *agent && v.target != *agent);
    }

    /// Consume one unit of restart budget.  Returns `false` once the budget
    /// is exhausted, in which case the caller must fall back to rendering
    /// the notification into the agent's next natural turn.
    pub fn record_restart(&mut self, agent: &AgentId, budget: u32) -> bool {
        let count = self.restarts.entry(agent.clone()).or_insert(0);
        if *count >= budget {
            return false;
        }
        *count += 1;
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn three_agents() -> CoordinationState {
        let agents = vec![AgentId::from("a"), AgentId::from("b"), AgentId::from("c")];
        CoordinationState::new(
            "task-1",
            "what is the answer?",
            agents,
            Instant::now() + Duration::from_secs(30),
        )
    }

    fn a() -> AgentId {
        AgentId::from("a")
    }
    fn b() -> AgentId {
        AgentId::from("b")
    }
    fn c() -> AgentId {
        AgentId::from("c")
    }

    // ── Versioning ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn versions_are_contiguous_from_one() {
        let mut s = three_agents();
        assert_eq!(s.publish_answer(&a(), "v1".into(), None).unwrap(), 1);
        assert_eq!(s.publish_answer(&a(), "v2".into(), None).unwrap(), 2);
        assert_eq!(s.publish_answer(&a(), "v3".into(), None).unwrap(), 3);
        let versions: Vec<u32> = s.answer_history(&a()).iter().map(|w| w.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(s.current_version(&a()), 3);
    }

    #[tokio::test]
    async fn all_versions_are_retained_for_audit() {
        let mut s = three_agents();
        s.publish_answer(&a(), "first".into(), None).unwrap();
        s.publish_answer(&a(), "second".into(), None).unwrap();
        assert_eq!(s.answer_history(&a()).len(), 2);
        assert_eq!(s.answer_history(&a())[0].text, "first");
        assert_eq!(s.latest_answer(&a()).unwrap().text, "second");
    }

    #[tokio::test]
    async fn snapshot_ref_is_attached_to_the_version() {
        let mut s = three_agents();
        let snap = quorum_backend::SnapshotRef::new("ws-1");
        s.publish_answer(&a(), "x".into(), Some(snap.clone())).unwrap();
        assert_eq!(s.latest_answer(&a()).unwrap().snapshot, Some(snap));
    }

    // ── Vote validity ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn self_vote_is_rejected() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        let err = s.cast_vote(&a(), &a(), "me".into()).unwrap_err();
        assert_eq!(err, ProtocolViolation::SelfVote);
    }

    #[tokio::test]
    async fn vote_before_publishing_is_rejected() {
        let mut s = three_agents();
        s.publish_answer(&b(), "x".into(), None).unwrap();
        let err = s.cast_vote(&a(), &b(), "nice".into()).unwrap_err();
        assert_eq!(err, ProtocolViolation::VoterHasNoAnswer);
    }

    #[tokio::test]
    async fn vote_for_agent_without_answer_is_rejected() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        let err = s.cast_vote(&a(), &b(), "nice".into()).unwrap_err();
        assert_eq!(err, ProtocolViolation::TargetHasNoAnswer);
    }

    #[tokio::test]
    async fn vote_for_unknown_agent_is_rejected() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        let ghost = AgentId::from("ghost");
        let err = s.cast_vote(&a(), &ghost, "who".into()).unwrap_err();
        assert_eq!(err, ProtocolViolation::UnknownAgent(ghost));
    }

    #[tokio::test]
    async fn valid_vote_records_versions_and_status() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        assert!(s.cast_vote(&a(), &b(), "clear".into()).unwrap());
        assert_eq!(s.status(&a()), AgentStatus::Voted);
        let live = s.live_votes();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].target_version, 1);
        assert_eq!(live[0].voter_version, 1);
    }

    #[tokio::test]
    async fn at_most_one_live_vote_per_voter() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        s.publish_answer(&c(), "z".into(), None).unwrap();
        s.cast_vote(&a(), &b(), "first".into()).unwrap();
        s.cast_vote(&a(), &c(), "changed my mind".into()).unwrap();
        let live = s.live_votes();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].target, c());
    }

    #[tokio::test]
    async fn duplicate_vote_is_idempotent() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        assert!(s.cast_vote(&a(), &b(), "ok".into()).unwrap());
        assert!(!s.cast_vote(&a(), &b(), "ok again".into()).unwrap());
        assert_eq!(s.live_votes().len(), 1);
        assert_eq!(s.live_votes()[0].reason, "ok");
    }

    // ── Vote invalidation ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn vote_invalidated_when_target_publishes_newer_version() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        s.cast_vote(&b(), &a(), "ok".into()).unwrap();
        assert_eq!(s.live_votes().len(), 1);

        s.publish_answer(&a(), "x2".into(), None).unwrap();
        assert!(s.live_votes().is_empty(), "vote on v1 must die at v2");
    }

    #[tokio::test]
    async fn own_publish_invalidates_own_vote() {
        // An agent that publishes an answer, casts a vote, then publishes
        // again ends up with no live vote and back in `working`.
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        s.cast_vote(&a(), &b(), "ok".into()).unwrap();
        assert_eq!(s.status(&a()), AgentStatus::Voted);

        s.publish_answer(&a(), "x2".into(), None).unwrap();
        assert!(s.live_vote_of(&a()).is_none());
        assert_eq!(s.status(&a()), AgentStatus::Working);
    }

    #[tokio::test]
    async fn failure_drops_votes_in_both_directions() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        s.publish_answer(&c(), "z".into(), None).unwrap();
        s.cast_vote(&b(), &a(), "ok".into()).unwrap();
        s.cast_vote(&a(), &c(), "ok".into()).unwrap();

        s.mark_failed(&a());
        assert!(s.live_votes().is_empty(), "votes by and on a failed agent die");
        assert!(s.latest_answer(&a()).is_some(), "answers are retained");
    }

    // ── Status monotonicity ───────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_agent_stays_failed() {
        let mut s = three_agents();
        s.mark_failed(&a());
        s.set_status(&a(), AgentStatus::Working);
        assert_eq!(s.status(&a()), AgentStatus::Failed);
        s.publish_answer(&a(), "late".into(), None).unwrap_err();
    }

    #[tokio::test]
    async fn presenting_agent_cannot_vote_or_publish() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        s.set_status(&a(), AgentStatus::Presenting);
        assert_eq!(
            s.cast_vote(&a(), &b(), "late".into()).unwrap_err(),
            ProtocolViolation::PresenterAction
        );
        assert_eq!(
            s.publish_answer(&a(), "late".into(), None).unwrap_err(),
            ProtocolViolation::PresenterAction
        );
    }

    #[tokio::test]
    async fn vote_on_failed_target_is_rejected() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        s.mark_failed(&b());
        assert_eq!(
            s.cast_vote(&a(), &b(), "late".into()).unwrap_err(),
            ProtocolViolation::TargetFailed
        );
    }

    // ── Restart budget ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn restart_budget_exhausts_after_limit() {
        let mut s = three_agents();
        for _ in 0..5 {
            assert!(s.record_restart(&a(), 5));
        }
        assert!(!s.record_restart(&a(), 5), "sixth restart must be refused");
        assert_eq!(s.restart_count(&a()), 5);
    }

    // ── Tally ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tally_counts_live_votes_per_target() {
        let mut s = three_agents();
        s.publish_answer(&a(), "x".into(), None).unwrap();
        s.publish_answer(&b(), "y".into(), None).unwrap();
        s.publish_answer(&c(), "z".into(), None).unwrap();
        s.cast_vote(&b(), &a(), "ok".into()).unwrap();
        s.cast_vote(&c(), &a(), "ok".into()).unwrap();
        s.cast_vote(&a(), &b(), "ok".into()).unwrap();

        let tally = s.tally();
        assert_eq!(tally.get(&a()), Some(&2));
        assert_eq!(tally.get(&b()), Some(&1));
        assert_eq!(tally.get(&c()), None);
    }

    /// Replaying the same mutation sequence against a fresh state yields the
    /// same observable result (determinism given identical ordering).
    #[tokio::test]
    async fn replaying_mutations_is_deterministic() {
        let run = || {
            let mut s = three_agents();
            s.publish_answer(&a(), "42".into(), None).unwrap();
            s.publish_answer(&b(), "42".into(), None).unwrap();
            s.publish_answer(&c(), "43".into(), None).unwrap();
            s.cast_vote(&a(), &b(), "concise".into()).unwrap();
            s.cast_vote(&b(), &a(), "clear".into()).unwrap();
            s.cast_vote(&c(), &a(), "agree".into()).unwrap();
            (
                s.tally().get(&a()).copied(),
                s.live_votes().len(),
                s.statuses_snapshot(),
            )
        };
        assert_eq!(run(), run());
    }
}
