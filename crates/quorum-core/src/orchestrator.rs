// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Top-level coordination state machine.
//!
//! One task, one event loop: the orchestrator is the single owner of
//! [`CoordinationState`], consumes the merged chunk stream, applies the
//! protocol mutations, re-runs the voting engine after every mutation, and
//! drives restarts, the deadline, the winner's final presentation, and the
//! terminal [`TaskOutcome`].  Runners only ever receive one-way control
//! messages; nothing outside this module mutates the state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quorum_backend::{Backend, Capability};
use quorum_limits::RateLimiterRegistry;

use crate::bus::{ChunkBus, DEFAULT_CHUNK_BUFFER};
use crate::chunk::{Chunk, ChunkBody};
use crate::events::TaskEvent;
use crate::planning;
use crate::prompts::{self, PeerDigest};
use crate::runner::{AgentRunner, Control, RunnerConfig, TurnContext};
use crate::session::SessionContext;
use crate::state::{
    AgentId, AgentStatus, CoordinationState, Notification, NotificationKind, OutcomeReason,
    TaskOutcome,
};
use crate::voting::{self, Decision};

/// Cap on the peer-notification summary of a published answer.
const NOTE_SUMMARY_CAP: usize = 200;

/// One agent in a task: identity, backend handle, optional extra prompt.
pub struct AgentSpec {
    pub id: AgentId,
    pub backend: Arc<dyn Backend>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanningMode {
    /// Run the irreversibility pre-check to decide.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    /// Hard wall-clock deadline for the coordination phase.  The winner's
    /// presentation gets one fresh window of the same length.
    pub deadline: Duration,
    /// Quiet period for the plurality rule; `None` disables it.
    pub stability_window: Option<Duration>,
    /// Forced restarts allowed per agent before notifications stop
    /// interrupting in-flight turns.
    pub restart_budget: u32,
    pub planning_mode: PlanningMode,
    /// Per-agent buffer between a runner and the merge bus.
    pub chunk_buffer: usize,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            stability_window: Some(Duration::from_secs(5)),
            restart_budget: 5,
            planning_mode: PlanningMode::Auto,
            chunk_buffer: DEFAULT_CHUNK_BUFFER,
        }
    }
}

pub struct Orchestrator {
    limits: Arc<RateLimiterRegistry>,
}

impl Orchestrator {
    pub fn new(limits: Arc<RateLimiterRegistry>) -> Self {
        Self { limits }
    }

    /// Run one query to its terminal outcome.
    ///
    /// Emits [`TaskEvent`]s for display as they happen; the returned
    /// [`TaskOutcome`] is also delivered as the final `TaskDone` event, so
    /// the stream never ends without a terminal event.
    pub async fn run_task(
        &self,
        query: &str,
        agents: Vec<AgentSpec>,
        session: &mut SessionContext,
        options: TaskOptions,
        events: mpsc::Sender<TaskEvent>,
    ) -> TaskOutcome {
        let started = Instant::now();
        let task_id = Uuid::new_v4().to_string();
        let deadline = started + options.deadline;
        let ids: Vec<AgentId> = agents.iter().map(|a| a.id.clone()).collect();
        let mut state = CoordinationState::new(task_id.clone(), query, ids.clone(), deadline);

        if agents.is_empty() {
            let outcome = TaskOutcome {
                winner: None,
                final_text: String::new(),
                statuses: Vec::new(),
                elapsed: started.elapsed(),
                reason: OutcomeReason::AllFailed,
            };
            session.record(query, &outcome);
            let _ = events
                .send(TaskEvent::TaskDone {
                    outcome: outcome.clone(),
                })
                .await;
            return outcome;
        }

        // ── Planning pre-check ───────────────────────────────────────────────
        let backends: Vec<Arc<dyn Backend>> =
            agents.iter().map(|a| Arc::clone(&a.backend)).collect();
        let planning_on = match options.planning_mode {
            PlanningMode::On => true,
            PlanningMode::Off => false,
            PlanningMode::Auto => {
                planning::requires_irreversible_actions(query, &backends).await
            }
        };
        if planning_on {
            for b in &backends {
                if b.supports(Capability::PlanningFilter) {
                    b.set_planning_mode(true);
                }
            }
        }
        info!(
            task_id = %task_id,
            agents = agents.len(),
            planning = planning_on,
            "task starting"
        );

        // ── Launch runners ───────────────────────────────────────────────────
        let mut bus = ChunkBus::new();
        let session_digest = session.render_recent();
        let mut controls: HashMap<AgentId, mpsc::Sender<Control>> = HashMap::new();
        for spec in &agents {
            let sender = bus.register(spec.id.clone(), options.chunk_buffer);
            let (ctl_tx, ctl_rx) = mpsc::channel(32);
            let cfg = RunnerConfig {
                id: spec.id.clone(),
                query: query.to_string(),
                system_prompt: prompts::system_prompt(
                    &spec.id,
                    &ids,
                    spec.system_prompt.as_deref(),
                ),
                session_digest: session_digest.clone(),
            };
            let runner = AgentRunner::new(
                cfg,
                Arc::clone(&spec.backend),
                sender,
                ctl_rx,
                self.limits.startup(spec.backend.class_tag()),
            );
            tokio::spawn(runner.run(TurnContext::default()));
            controls.insert(spec.id.clone(), ctl_tx);
            let _ = events
                .send(TaskEvent::AgentStarted {
                    agent: spec.id.clone(),
                })
                .await;
        }

        // ── Coordination loop ────────────────────────────────────────────────
        let plurality = options.stability_window.is_some();
        let mut deadline_fired = false;
        let mut bus_open = true;
        let mut last_mutation = Instant::now();
        let mut last_errors: Vec<String> = Vec::new();

        let decision = loop {
            let all_voted = {
                let alive = state.non_failed();
                let live = state.live_votes();
                !alive.is_empty() && alive.iter().all(|a| live.iter().any(|v| v.voter == *a))
            };
            let stability_at = options
                .stability_window
                .map(|w| last_mutation + w)
                .unwrap_or(deadline);
            let stability_armed = plurality && all_voted && !deadline_fired;

            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline), if !deadline_fired => {
                    deadline_fired = true;
                    debug!(task_id = %state.task_id, "task deadline reached");
                    let d = voting::evaluate(&state, true, false, plurality);
                    if d.is_decided() {
                        break d;
                    }
                }
                _ = tokio::time::sleep_until(stability_at), if stability_armed => {
                    let d = voting::evaluate(&state, deadline_fired, true, plurality);
                    if d.is_decided() {
                        break d;
                    }
                    last_mutation = Instant::now();
                }
                chunk = bus.next(), if bus_open => match chunk {
                    Some(chunk) => {
                        let mutated = apply_chunk(
                            &mut state,
                            chunk,
                            &events,
                            &controls,
                            &options,
                            &mut last_errors,
                        )
                        .await;
                        if mutated {
                            last_mutation = Instant::now();
                        }
                        let d = voting::evaluate(&state, deadline_fired, false, plurality);
                        if d.is_decided() {
                            break d;
                        }
                    }
                    None => {
                        // Every runner has exited; only the timers remain.
                        bus_open = false;
                    }
                }
            }
        };

        let (winner, reason) = match decision {
            Decision::Decided { winner, reason } => (winner, reason),
            Decision::Undecided => (None, OutcomeReason::AllFailed),
        };

        // ── Terminal phase ───────────────────────────────────────────────────
        let outcome = match winner {
            None => TaskOutcome {
                winner: None,
                final_text: last_errors.join("; "),
                statuses: state.statuses_snapshot(),
                elapsed: started.elapsed(),
                reason,
            },
            Some(winner) => {
                let _ = events
                    .send(TaskEvent::WinnerElected {
                        winner: winner.clone(),
                        reason,
                    })
                    .await;
                info!(task_id = %state.task_id, winner = %winner, reason = %reason, "winner elected");

                // Cancel every other runner before the final turn.
                for (id, ctl) in &controls {
                    if *id != winner {
                        let _ = ctl.try_send(Control::Shutdown);
                    }
                }
                // The presenter may execute any tool it needs; planning mode
                // is always off for the final turn.
                for b in &backends {
                    b.set_planning_mode(false);
                }
                state.set_status(&winner, AgentStatus::Presenting);

                let winner_backend = agents
                    .iter()
                    .find(|a| a.id == winner)
                    .map(|a| Arc::clone(&a.backend));
                let final_text = self
                    .run_presentation(
                        &mut state,
                        &winner,
                        winner_backend,
                        &mut bus,
                        &controls,
                        &options,
                        &events,
                    )
                    .await;
                state.set_status(&winner, AgentStatus::Done);

                TaskOutcome {
                    winner: Some(winner),
                    final_text,
                    statuses: state.statuses_snapshot(),
                    elapsed: started.elapsed(),
                    reason,
                }
            }
        };

        session.record(query, &outcome);
        let _ = events
            .send(TaskEvent::TaskDone {
                outcome: outcome.clone(),
            })
            .await;
        for ctl in controls.values() {
            let _ = ctl.try_send(Control::Shutdown);
        }
        info!(
            task_id = %state.task_id,
            reason = %outcome.reason,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "task done"
        );
        outcome
    }

    /// Drive the winner's final-presentation turn and collect its text.
    ///
    /// Falls back to the winner's last working answer when the presentation
    /// produces nothing (runner gone, presentation window expired, or the
    /// backend failed on the final turn).
    #[allow(clippy::too_many_arguments)]
    async fn run_presentation(
        &self,
        state: &mut CoordinationState,
        winner: &AgentId,
        winner_backend: Option<Arc<dyn Backend>>,
        bus: &mut ChunkBus,
        controls: &HashMap<AgentId, mpsc::Sender<Control>>,
        options: &TaskOptions,
        events: &mpsc::Sender<TaskEvent>,
    ) -> String {
        let fallback = |state: &CoordinationState| {
            state
                .latest_answer(winner)
                .map(|a| a.text.clone())
                .unwrap_or_default()
        };

        // Restore the workspace checkpoint attached to the winning answer so
        // the presentation starts from the state that produced it.
        if let Some(backend) = winner_backend {
            if backend.supports(Capability::Snapshot) {
                if let Some(snapshot) = state
                    .latest_answer(winner)
                    .and_then(|a| a.snapshot.clone())
                {
                    if let Err(e) = backend.restore(&snapshot).await {
                        warn!(
                            task_id = %state.task_id,
                            %snapshot,
                            error = %e,
                            "workspace restore failed before presentation"
                        );
                    }
                }
            }
        }

        let context = TurnContext {
            digest: digest_for(state, None),
            notes: Vec::new(),
        };
        // Keep draining the bus while the Present message is in flight; the
        // winner may be blocked writing into a full buffer, and those stale
        // coordination chunks are discarded below anyway.
        let sent = match controls.get(winner) {
            Some(ctl) => {
                let send_fut = ctl.send(Control::Present { context });
                tokio::pin!(send_fut);
                let mut draining = true;
                loop {
                    tokio::select! {
                        res = &mut send_fut => break res.is_ok(),
                        chunk = bus.next(), if draining => {
                            if chunk.is_none() {
                                draining = false;
                            }
                        }
                    }
                }
            }
            None => false,
        };
        if !sent {
            warn!(task_id = %state.task_id, "presenter unreachable, using last working answer");
            return fallback(state);
        }

        let present_deadline = Instant::now() + options.deadline;
        let mut final_text = String::new();
        // Chunks buffered before the Present control are leftovers of a
        // cancelled coordination turn; everything up to the presentation
        // marker is discarded.
        let mut presentation_started = false;
        loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(present_deadline) => {
                    warn!(task_id = %state.task_id, "presentation window expired");
                    break;
                }
                chunk = bus.next() => {
                    let chunk = match chunk {
                        Some(c) => c,
                        None => break,
                    };
                    if chunk.agent != *winner {
                        continue;
                    }
                    if !presentation_started {
                        presentation_started = matches!(
                            chunk.body,
                            ChunkBody::Status(AgentStatus::Presenting)
                        );
                        continue;
                    }
                    match chunk.body {
                        ChunkBody::Content(text) => {
                            final_text.push_str(&text);
                            let _ = events.send(TaskEvent::FinalChunk { text }).await;
                        }
                        ChunkBody::Reasoning(text) => {
                            let _ = events
                                .send(TaskEvent::Reasoning {
                                    agent: winner.clone(),
                                    text,
                                })
                                .await;
                        }
                        ChunkBody::ToolCall { name, arguments, .. } => {
                            let _ = events
                                .send(TaskEvent::ToolCall {
                                    agent: winner.clone(),
                                    name,
                                    arguments,
                                })
                                .await;
                        }
                        ChunkBody::ToolResult { content, .. } => {
                            let _ = events
                                .send(TaskEvent::ToolResult {
                                    agent: winner.clone(),
                                    content,
                                })
                                .await;
                        }
                        ChunkBody::Done => break,
                        ChunkBody::Failed { error } => {
                            warn!(task_id = %state.task_id, %error, "presenter failed mid-turn");
                            break;
                        }
                        // Votes and answers are ignored while presenting.
                        ChunkBody::AnswerPublished { .. } | ChunkBody::VoteCast { .. } => {
                            debug!(
                                task_id = %state.task_id,
                                "coordination action ignored during presentation"
                            );
                        }
                        ChunkBody::Status(_) | ChunkBody::RestartRequest => {}
                    }
                }
            }
        }

        if final_text.trim().is_empty() {
            fallback(state)
        } else {
            final_text
        }
    }
}

// ─── Chunk application ───────────────────────────────────────────────────────

/// Apply one chunk to the coordination state, emitting caller events, peer
/// notifications, and one structured `tracing` record per mutation
/// (`task_id`/`agent`/`kind` plus the mutation payload).  Returns whether an
/// answer/vote mutation happened (the stability clock only resets on those).
async fn apply_chunk(
    state: &mut CoordinationState,
    chunk: Chunk,
    events: &mpsc::Sender<TaskEvent>,
    controls: &HashMap<AgentId, mpsc::Sender<Control>>,
    options: &TaskOptions,
    last_errors: &mut Vec<String>,
) -> bool {
    let agent = chunk.agent;
    match chunk.body {
        ChunkBody::Content(text) => {
            let _ = events.send(TaskEvent::Content { agent, text }).await;
            false
        }
        ChunkBody::Reasoning(text) => {
            let _ = events.send(TaskEvent::Reasoning { agent, text }).await;
            false
        }
        ChunkBody::ToolCall {
            name, arguments, ..
        } => {
            let _ = events
                .send(TaskEvent::ToolCall {
                    agent,
                    name,
                    arguments,
                })
                .await;
            false
        }
        ChunkBody::ToolResult { content, .. } => {
            let _ = events.send(TaskEvent::ToolResult { agent, content }).await;
            false
        }
        ChunkBody::Status(status) => {
            // An agent whose vote is still live stays `voted` even when its
            // runner opens a fresh turn; vote liveness, not runner activity,
            // is what coordination reads.
            let holds_live_vote = state.live_vote_of(&agent).is_some();
            let runner_activity =
                matches!(status, AgentStatus::Starting | AgentStatus::Working);
            if !(holds_live_vote && runner_activity) {
                state.set_status(&agent, status);
            }
            false
        }
        // The agent stopped speaking this turn; nothing to record.
        ChunkBody::Done => false,
        ChunkBody::RestartRequest => {
            debug!(
                task_id = %state.task_id,
                agent = %agent,
                kind = "restart_request",
                "coordination mutation"
            );
            restart_agent(state, &agent, controls, options);
            false
        }
        ChunkBody::AnswerPublished { text, snapshot } => {
            let snapshot_attached = snapshot.is_some();
            match state.publish_answer(&agent, text.clone(), snapshot) {
                Ok(version) => {
                    debug!(
                        task_id = %state.task_id,
                        agent = %agent,
                        kind = "answer_published",
                        version,
                        chars = text.len(),
                        snapshot = snapshot_attached,
                        "coordination mutation"
                    );
                    let _ = events
                        .send(TaskEvent::AnswerPublished {
                            agent: agent.clone(),
                            version,
                            text: text.clone(),
                        })
                        .await;
                    reopen_invalidated_voters(state);
                    let note = Notification {
                        origin: agent.clone(),
                        kind: NotificationKind::NewAnswer,
                        summary: truncate(&text, NOTE_SUMMARY_CAP),
                    };
                    notify_peers(state, &agent, note, controls, options);
                    true
                }
                Err(violation) => {
                    reject(state, &agent, violation, controls);
                    false
                }
            }
        }
        ChunkBody::VoteCast { target, reason } => {
            match state.cast_vote(&agent, &target, reason.clone()) {
                Ok(true) => {
                    debug!(
                        task_id = %state.task_id,
                        agent = %agent,
                        kind = "vote_cast",
                        target = %target,
                        target_version = state.current_version(&target),
                        reason = %reason,
                        "coordination mutation"
                    );
                    let _ = events
                        .send(TaskEvent::VoteCast {
                            voter: agent.clone(),
                            target: target.clone(),
                            reason: reason.clone(),
                        })
                        .await;
                    let note = Notification {
                        origin: agent.clone(),
                        kind: NotificationKind::VoteCast,
                        summary: format!("voted for {target}: {reason}"),
                    };
                    notify_peers(state, &agent, note, controls, options);
                    true
                }
                // Exact duplicate: idempotent, no re-notification.
                Ok(false) => false,
                Err(violation) => {
                    reject(state, &agent, violation, controls);
                    false
                }
            }
        }
        ChunkBody::Failed { error } => {
            debug!(
                task_id = %state.task_id,
                agent = %agent,
                kind = "agent_failed",
                error = %error,
                "coordination mutation"
            );
            state.mark_failed(&agent);
            last_errors.push(format!("{agent}: {error}"));
            reopen_invalidated_voters(state);
            let _ = events.send(TaskEvent::AgentFailed { agent, error }).await;
            true
        }
    }
}

/// Agents whose live vote died with the latest mutation return to `working`.
fn reopen_invalidated_voters(state: &mut CoordinationState) {
    for agent in state.agents().to_vec() {
        if state.status(&agent) == AgentStatus::Voted && state.live_vote_of(&agent).is_none() {
            state.set_status(&agent, AgentStatus::Working);
        }
    }
}

/// Fan a notification out to every non-failed peer, restarting those with
/// budget left and queueing a note for the rest.
///
/// Control messages use `try_send`: the orchestrator must never block on a
/// runner that is itself blocked writing into a full bus buffer.  A dropped
/// message is harmless — the peer digest carries the same information into
/// the agent's next turn.
fn notify_peers(
    state: &mut CoordinationState,
    origin: &AgentId,
    note: Notification,
    controls: &HashMap<AgentId, mpsc::Sender<Control>>,
    options: &TaskOptions,
) {
    for peer in state.non_failed() {
        if peer == *origin {
            continue;
        }
        let Some(ctl) = controls.get(&peer) else {
            continue;
        };
        if state.record_restart(&peer, options.restart_budget) {
            let context = TurnContext {
                digest: digest_for(state, Some(&peer)),
                notes: vec![note.clone()],
            };
            if ctl.try_send(Control::Restart { context }).is_ok() {
                state.set_status(&peer, AgentStatus::Restarting);
            }
        } else {
            // Budget exhausted: the in-flight turn keeps running and the
            // note is rendered into the next natural turn.
            debug!(
                task_id = %state.task_id,
                agent = %peer,
                "restart budget exhausted, queueing notification"
            );
            let digest = digest_for(state, Some(&peer));
            let _ = ctl.try_send(Control::Notify {
                note: note.clone(),
                digest,
            });
        }
    }
}

/// Restart one agent on its own request.  Shares the budget with
/// notification-driven restarts — both paths funnel through here or
/// [`notify_peers`], and the runner never restarts autonomously.
fn restart_agent(
    state: &mut CoordinationState,
    agent: &AgentId,
    controls: &HashMap<AgentId, mpsc::Sender<Control>>,
    options: &TaskOptions,
) {
    let status = state.status(agent);
    if status.is_terminal() || status == AgentStatus::Presenting {
        return;
    }
    let Some(ctl) = controls.get(agent) else {
        return;
    };
    if state.record_restart(agent, options.restart_budget) {
        let context = TurnContext {
            digest: digest_for(state, Some(agent)),
            notes: Vec::new(),
        };
        if ctl.try_send(Control::Restart { context }).is_ok() {
            state.set_status(agent, AgentStatus::Restarting);
        }
    }
}

/// Reject a protocol violation: log it and send a corrective notification to
/// the offender.  Presenting agents get no correction — their coordination
/// actions are simply ignored.
fn reject(
    state: &CoordinationState,
    offender: &AgentId,
    violation: crate::state::ProtocolViolation,
    controls: &HashMap<AgentId, mpsc::Sender<Control>>,
) {
    warn!(
        task_id = %state.task_id,
        agent = %offender,
        error = %violation,
        "protocol violation rejected"
    );
    if state.status(offender) == AgentStatus::Presenting {
        return;
    }
    if let Some(ctl) = controls.get(offender) {
        let note = Notification {
            origin: offender.clone(),
            kind: NotificationKind::Corrective,
            summary: violation.to_string(),
        };
        let digest = digest_for(state, Some(offender));
        let _ = ctl.try_send(Control::Notify { note, digest });
    }
}

/// Snapshot the peer answers and live votes for one agent's next turn.
/// `exclude` omits the agent's own answer; `None` keeps everything (used for
/// the presenter, who needs the full picture).
fn digest_for(state: &CoordinationState, exclude: Option<&AgentId>) -> PeerDigest {
    let mut digest = PeerDigest::default();
    for agent in state.agents() {
        if Some(agent) == exclude {
            continue;
        }
        if let Some(answer) = state.latest_answer(agent) {
            digest.push_answer(answer);
        }
    }
    for vote in state.live_votes() {
        digest.push_vote(vote);
    }
    digest
}

fn truncate(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    let cut: String = s.chars().take(cap).collect();
    format!("{cut}…")
}
