// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Drives one agent from prompt assembly through chunk emission.
//!
//! A runner owns its backend stream and its ingress into the merge bus.  The
//! orchestrator steers it over a one-way control channel; the runner never
//! restarts itself on its own authority.  Every await point — startup
//! admission, connect, stream consumption, retry backoff — stays responsive
//! to control, with `biased` selects so a restart or shutdown is never
//! queued behind stream traffic.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use quorum_backend::{Backend, BackendError, Capability, Message, StreamEvent, TurnRequest};
use quorum_limits::RateLimiter;

use crate::bus::ChunkSender;
use crate::chunk::ChunkBody;
use crate::prompts::{self, PeerDigest};
use crate::state::{AgentId, AgentStatus, Notification};

/// Transient-error retry: base 1 s, doubling, three retries, ±20% jitter.
const RETRY_BASE: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 3;
const RETRY_JITTER: f64 = 0.2;

/// Orchestrator → runner control messages.
#[derive(Debug)]
pub enum Control {
    /// Cancel the in-flight turn (if any) and start over with fresh context.
    Restart { context: TurnContext },
    /// Queue a peer notification for the next natural turn.
    Notify {
        note: Notification,
        digest: PeerDigest,
    },
    /// Become the presenter: one final turn, no coordination tools.
    Present { context: TurnContext },
    /// Terminate the runner.
    Shutdown,
}

/// Read-only peer snapshot plus pending notifications for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    pub digest: PeerDigest,
    pub notes: Vec<Notification>,
}

/// Static per-agent inputs, fixed for the duration of a task.
pub struct RunnerConfig {
    pub id: AgentId,
    pub query: String,
    pub system_prompt: String,
    pub session_digest: Option<String>,
}

pub struct AgentRunner {
    cfg: RunnerConfig,
    backend: Arc<dyn Backend>,
    chunks: ChunkSender,
    control: mpsc::Receiver<Control>,
    startup: Arc<RateLimiter>,
    /// Notifications received mid-turn, rendered into the next natural turn.
    pending_notes: Vec<Notification>,
    /// Most recent peer digest seen on any control message.
    latest_digest: PeerDigest,
}

enum TurnKind {
    Coordination(TurnContext),
    Presentation(TurnContext),
}

enum TurnEnd {
    /// Turn completed; wait for control before doing anything else.
    Finished,
    /// Move straight into another turn (restart, presentation, queued notes).
    Switch(TurnKind),
    /// Runner is done (shutdown, bus gone, or terminal failure).
    Terminal,
}

enum CtrlAction {
    Continue,
    NewTurn(TurnKind),
    Stop,
}

impl AgentRunner {
    pub fn new(
        cfg: RunnerConfig,
        backend: Arc<dyn Backend>,
        chunks: ChunkSender,
        control: mpsc::Receiver<Control>,
        startup: Arc<RateLimiter>,
    ) -> Self {
        Self {
            cfg,
            backend,
            chunks,
            control,
            startup,
            pending_notes: Vec::new(),
            latest_digest: PeerDigest::default(),
        }
    }

    /// Run until shutdown.  `initial` is the peer snapshot at launch time
    /// (empty at task start).
    pub async fn run(mut self, initial: TurnContext) {
        let mut next = Some(TurnKind::Coordination(initial));
        loop {
            let turn = match next.take() {
                Some(t) => t,
                None => {
                    // Idle between turns: only control can wake us.
                    match self.control.recv().await {
                        Some(ctrl) => match self.absorb_control(Some(ctrl)) {
                            CtrlAction::NewTurn(t) => t,
                            CtrlAction::Continue => {
                                // A notification while idle starts the next
                                // natural turn with it rendered in.
                                let ctx = TurnContext {
                                    digest: self.latest_digest.clone(),
                                    notes: std::mem::take(&mut self.pending_notes),
                                };
                                TurnKind::Coordination(ctx)
                            }
                            CtrlAction::Stop => return,
                        },
                        None => return,
                    }
                }
            };
            match self.run_turn(turn).await {
                TurnEnd::Finished => {}
                TurnEnd::Switch(t) => next = Some(t),
                TurnEnd::Terminal => return,
            }
        }
    }

    /// Fold one control message into runner state.
    fn absorb_control(&mut self, ctrl: Option<Control>) -> CtrlAction {
        match ctrl {
            Some(Control::Notify { note, digest }) => {
                self.pending_notes.push(note);
                self.latest_digest = digest;
                CtrlAction::Continue
            }
            Some(Control::Restart { mut context }) => {
                // Pending notes ride along so nothing is lost on restart.
                let mut notes = std::mem::take(&mut self.pending_notes);
                notes.append(&mut context.notes);
                context.notes = notes;
                self.latest_digest = context.digest.clone();
                CtrlAction::NewTurn(TurnKind::Coordination(context))
            }
            Some(Control::Present { context }) => {
                self.pending_notes.clear();
                CtrlAction::NewTurn(TurnKind::Presentation(context))
            }
            Some(Control::Shutdown) | None => CtrlAction::Stop,
        }
    }

    async fn run_turn(&mut self, turn: TurnKind) -> TurnEnd {
        let presenting = matches!(turn, TurnKind::Presentation(_));
        // The presentation turn announces itself on the bus; the orchestrator
        // uses the marker to separate final chunks from stale coordination
        // chunks still buffered from a cancelled turn.
        let opening = if presenting {
            AgentStatus::Presenting
        } else {
            AgentStatus::Starting
        };
        if !self.chunks.send(ChunkBody::Status(opening)).await {
            return TurnEnd::Terminal;
        }

        // 1. Startup-scope admission — one per agent activation.  The
        //    acquire is cancellation-safe, so absorbing a restart here
        //    leaves no admission timestamp behind.
        let startup = Arc::clone(&self.startup);
        let admission = startup.acquire();
        tokio::pin!(admission);
        loop {
            tokio::select! {
                biased;
                ctrl = self.control.recv() => match self.absorb_control(ctrl) {
                    CtrlAction::Continue => continue,
                    CtrlAction::NewTurn(t) => return TurnEnd::Switch(t),
                    CtrlAction::Stop => return TurnEnd::Terminal,
                },
                _ = &mut admission => break,
            }
        }

        // 2. Turn input.
        let req = self.build_request(&turn);

        // 3. Connect-and-consume with bounded transient retries.
        let mut attempt = 0u32;
        'attempts: loop {
            let backend = Arc::clone(&self.backend);
            let r = req.clone();
            let connect = async move { backend.stream(r).await };
            tokio::pin!(connect);
            let connected = loop {
                tokio::select! {
                    biased;
                    ctrl = self.control.recv() => match self.absorb_control(ctrl) {
                        CtrlAction::Continue => continue,
                        CtrlAction::NewTurn(t) => return TurnEnd::Switch(t),
                        CtrlAction::Stop => return TurnEnd::Terminal,
                    },
                    res = &mut connect => break res,
                }
            };

            let mut stream = match connected {
                Ok(s) => s,
                Err(e) => match self.classify(e, &mut attempt).await {
                    RetryStep::Retry => continue 'attempts,
                    RetryStep::Abort(end) => return end,
                },
            };

            if !presenting
                && !self
                    .chunks
                    .send(ChunkBody::Status(AgentStatus::Working))
                    .await
            {
                return TurnEnd::Terminal;
            }

            // 4. Consume the stream; dropping it is the cancellation path.
            loop {
                tokio::select! {
                    biased;
                    ctrl = self.control.recv() => match self.absorb_control(ctrl) {
                        CtrlAction::Continue => continue,
                        CtrlAction::NewTurn(t) => return TurnEnd::Switch(t),
                        CtrlAction::Stop => return TurnEnd::Terminal,
                    },
                    ev = stream.next() => match ev {
                        Some(Ok(StreamEvent::Done)) | None => break 'attempts,
                        Some(Ok(event)) => {
                            if !self.forward_event(event).await {
                                return TurnEnd::Terminal;
                            }
                        }
                        Some(Err(BackendError::Cancelled)) => break 'attempts,
                        Some(Err(e)) => {
                            drop(stream);
                            match self.classify(e, &mut attempt).await {
                                RetryStep::Retry => continue 'attempts,
                                RetryStep::Abort(end) => return end,
                            }
                        }
                    }
                }
            }
        }

        // 5. Natural end of turn.
        if !self.chunks.send(ChunkBody::Done).await {
            return TurnEnd::Terminal;
        }
        if !presenting && !self.pending_notes.is_empty() {
            let ctx = TurnContext {
                digest: self.latest_digest.clone(),
                notes: std::mem::take(&mut self.pending_notes),
            };
            return TurnEnd::Switch(TurnKind::Coordination(ctx));
        }
        TurnEnd::Finished
    }

    fn build_request(&self, turn: &TurnKind) -> TurnRequest {
        let session = self.cfg.session_digest.as_deref();
        match turn {
            TurnKind::Coordination(ctx) => TurnRequest {
                messages: vec![
                    Message::system(&self.cfg.system_prompt),
                    Message::user(prompts::turn_prompt(
                        &self.cfg.query,
                        session,
                        &ctx.digest,
                        &ctx.notes,
                    )),
                ],
                tools: prompts::protocol_tools(),
            },
            // The presenter turn carries the full context but none of the
            // coordination tools; its job is the answer itself.
            TurnKind::Presentation(ctx) => TurnRequest {
                messages: vec![
                    Message::system(&self.cfg.system_prompt),
                    Message::user(prompts::presenter_prompt(
                        &self.cfg.query,
                        session,
                        &ctx.digest,
                    )),
                ],
                tools: Vec::new(),
            },
        }
    }

    /// Decide whether a backend error is worth another attempt; sleeps the
    /// backoff (responsive to control) when it is.
    async fn classify(&mut self, err: BackendError, attempt: &mut u32) -> RetryStep {
        if err.is_transient() && *attempt < MAX_RETRIES {
            *attempt += 1;
            let delay = backoff_delay(*attempt);
            debug!(
                agent = %self.cfg.id,
                attempt = *attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient backend error, backing off"
            );
            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    biased;
                    ctrl = self.control.recv() => match self.absorb_control(ctrl) {
                        CtrlAction::Continue => continue,
                        CtrlAction::NewTurn(t) => return RetryStep::Abort(TurnEnd::Switch(t)),
                        CtrlAction::Stop => return RetryStep::Abort(TurnEnd::Terminal),
                    },
                    _ = &mut sleep => return RetryStep::Retry,
                }
            }
        }
        warn!(agent = %self.cfg.id, error = %err, "agent failed");
        let _ = self
            .chunks
            .send(ChunkBody::Failed {
                error: err.to_string(),
            })
            .await;
        RetryStep::Abort(TurnEnd::Terminal)
    }

    /// Forward one stream event into the bus, translating protocol tool
    /// calls into their typed coordination chunks.
    async fn forward_event(&mut self, event: StreamEvent) -> bool {
        match event {
            StreamEvent::TextDelta(t) => self.chunks.send(ChunkBody::Content(t)).await,
            StreamEvent::ReasoningDelta(t) => self.chunks.send(ChunkBody::Reasoning(t)).await,
            StreamEvent::ToolResult { id, content } => {
                self.chunks.send(ChunkBody::ToolResult { id, content }).await
            }
            StreamEvent::ToolCall {
                id,
                name,
                arguments,
            } => self.forward_tool_call(id, name, arguments).await,
            StreamEvent::Done => true,
        }
    }

    async fn forward_tool_call(&mut self, id: String, name: String, arguments: String) -> bool {
        let args: Option<serde_json::Value> = serde_json::from_str(&arguments).ok();
        match name.as_str() {
            prompts::PUBLISH_ANSWER_TOOL => {
                let answer = args
                    .as_ref()
                    .and_then(|v| v.get("answer"))
                    .and_then(|a| a.as_str())
                    .map(str::to_string);
                match answer {
                    Some(text) => {
                        let snapshot = if self.backend.supports(Capability::Snapshot) {
                            self.backend.snapshot().await
                        } else {
                            None
                        };
                        self.chunks
                            .send(ChunkBody::AnswerPublished { text, snapshot })
                            .await
                    }
                    None => {
                        warn!(agent = %self.cfg.id, "malformed publish_answer arguments");
                        self.chunks
                            .send(ChunkBody::ToolCall {
                                id,
                                name,
                                arguments,
                            })
                            .await
                    }
                }
            }
            prompts::CAST_VOTE_TOOL => {
                let target = args
                    .as_ref()
                    .and_then(|v| v.get("agent_id"))
                    .and_then(|a| a.as_str())
                    .map(AgentId::from);
                let reason = args
                    .as_ref()
                    .and_then(|v| v.get("reason"))
                    .and_then(|a| a.as_str())
                    .unwrap_or("")
                    .to_string();
                match target {
                    Some(target) => {
                        self.chunks
                            .send(ChunkBody::VoteCast { target, reason })
                            .await
                    }
                    None => {
                        warn!(agent = %self.cfg.id, "malformed cast_vote arguments");
                        self.chunks
                            .send(ChunkBody::ToolCall {
                                id,
                                name,
                                arguments,
                            })
                            .await
                    }
                }
            }
            prompts::REQUEST_RESTART_TOOL => self.chunks.send(ChunkBody::RestartRequest).await,
            _ => {
                self.chunks
                    .send(ChunkBody::ToolCall {
                        id,
                        name,
                        arguments,
                    })
                    .await
            }
        }
    }
}

enum RetryStep {
    Retry,
    Abort(TurnEnd),
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = 1.0 + rand::thread_rng().gen_range(-RETRY_JITTER..RETRY_JITTER);
    Duration::from_secs_f64(base * jitter)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChunkBus;
    use crate::chunk::Chunk;
    use quorum_backend::{Script, ScriptedBackend};
    use serde_json::json;

    fn runner_for(
        backend: Arc<ScriptedBackend>,
        bus: &mut ChunkBus,
    ) -> (tokio::task::JoinHandle<()>, mpsc::Sender<Control>) {
        let id = AgentId::from("a");
        let sender = bus.register(id.clone(), 64);
        let (ctl_tx, ctl_rx) = mpsc::channel(16);
        let cfg = RunnerConfig {
            id: id.clone(),
            query: "the question".into(),
            system_prompt: prompts::system_prompt(&id, &[id.clone()], None),
            session_digest: None,
        };
        let runner = AgentRunner::new(
            cfg,
            backend,
            sender,
            ctl_rx,
            Arc::new(RateLimiter::unlimited()),
        );
        (tokio::spawn(runner.run(TurnContext::default())), ctl_tx)
    }

    /// Collect chunks until the predicate matches or the bus closes.  The
    /// generous timeout is virtual under paused-clock tests, where it must
    /// outlast the full retry backoff sequence.
    async fn collect_until(
        bus: &mut ChunkBus,
        mut stop: impl FnMut(&Chunk) -> bool,
    ) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_secs(30), bus.next()).await
        {
            let done = stop(&chunk);
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    // ── Protocol tool interception ────────────────────────────────────────────

    #[tokio::test]
    async fn publish_tool_call_becomes_answer_chunk() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::tool_call(
            prompts::PUBLISH_ANSWER_TOOL,
            json!({"answer": "42"}),
        )]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(backend, &mut bus);

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(&c.body, ChunkBody::AnswerPublished { text, .. } if text == "42")));
        assert!(chunks
            .iter()
            .any(|c| matches!(c.body, ChunkBody::Status(AgentStatus::Working))));

        let _ = ctl.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn vote_tool_call_becomes_vote_chunk() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::tool_call(
            prompts::CAST_VOTE_TOOL,
            json!({"agent_id": "b", "reason": "clearer"}),
        )]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(backend, &mut bus);

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        assert!(chunks.iter().any(|c| matches!(
            &c.body,
            ChunkBody::VoteCast { target, reason }
                if target.as_str() == "b" && reason == "clearer"
        )));

        let _ = ctl.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn malformed_protocol_args_pass_through_as_tool_call() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::tool_call(
            prompts::PUBLISH_ANSWER_TOOL,
            json!({"wrong_field": 1}),
        )]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(backend, &mut bus);

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        assert!(
            !chunks
                .iter()
                .any(|c| matches!(c.body, ChunkBody::AnswerPublished { .. })),
            "malformed args must not publish"
        );
        assert!(chunks
            .iter()
            .any(|c| matches!(&c.body, ChunkBody::ToolCall { name, .. }
                if name == prompts::PUBLISH_ANSWER_TOOL)));

        let _ = ctl.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn snapshot_is_attached_when_backend_supports_it() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Script::tool_call(
                prompts::PUBLISH_ANSWER_TOOL,
                json!({"answer": "with workspace"}),
            )])
            .with_snapshots(),
        );
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(backend, &mut bus);

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        let has_snapshot = chunks.iter().any(|c| {
            matches!(&c.body, ChunkBody::AnswerPublished { snapshot: Some(_), .. })
        });
        assert!(has_snapshot, "snapshot-capable backend must attach a ref");

        let _ = ctl.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    // ── Retry / failure behaviour ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_then_succeeds() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Script::transient("connection reset"),
            Script::text("recovered"),
        ]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(Arc::clone(&backend), &mut bus);

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(&c.body, ChunkBody::Content(t) if t == "recovered")));
        assert_eq!(backend.calls(), 2);

        let _ = ctl.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_promote_to_failure() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Script::transient("e1"),
            Script::transient("e2"),
            Script::transient("e3"),
            Script::transient("e4"),
        ]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(Arc::clone(&backend), &mut bus);

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Failed { .. })).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(c.body, ChunkBody::Failed { .. })));
        assert_eq!(backend.calls(), 4, "initial attempt plus three retries");

        drop(ctl);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retry() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::fatal("bad auth")]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(Arc::clone(&backend), &mut bus);

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Failed { .. })).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(&c.body, ChunkBody::Failed { error } if error.contains("bad auth"))));
        assert_eq!(backend.calls(), 1);

        drop(ctl);
        let _ = handle.await;
    }

    // ── Control channel behaviour ─────────────────────────────────────────────

    #[tokio::test]
    async fn restart_cancels_hanging_stream_and_reruns() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Script::hang(),
            Script::text("second turn"),
        ]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(Arc::clone(&backend), &mut bus);

        // Drain the first turn's status chunks, then restart mid-hang.
        let _ = collect_until(&mut bus, |c| {
            matches!(c.body, ChunkBody::Status(AgentStatus::Working))
        })
        .await;
        ctl.send(Control::Restart {
            context: TurnContext::default(),
        })
        .await
        .unwrap();

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(&c.body, ChunkBody::Content(t) if t == "second turn")));
        assert_eq!(backend.calls(), 2);

        let _ = ctl.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn notification_rendered_into_next_natural_turn() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Script::text("turn one"),
            Script::text("turn two"),
        ]));
        let mut bus = ChunkBus::new();

        let id = AgentId::from("a");
        let sender = bus.register(id.clone(), 64);
        let (ctl_tx, ctl_rx) = mpsc::channel(16);
        // Queue the notification before the runner starts: the biased select
        // absorbs it ahead of the first stream event, so it must surface in
        // the second turn's prompt.
        ctl_tx
            .send(Control::Notify {
                note: Notification {
                    origin: AgentId::from("b"),
                    kind: crate::state::NotificationKind::NewAnswer,
                    summary: "b republished".into(),
                },
                digest: PeerDigest::default(),
            })
            .await
            .unwrap();

        let cfg = RunnerConfig {
            id: id.clone(),
            query: "q".into(),
            system_prompt: "s".into(),
            session_digest: None,
        };
        let runner = AgentRunner::new(
            cfg,
            Arc::clone(&backend) as Arc<dyn Backend>,
            sender,
            ctl_rx,
            Arc::new(RateLimiter::unlimited()),
        );
        let handle = tokio::spawn(runner.run(TurnContext::default()));

        // Two turns run back to back: the second starts because notes are
        // pending when the first ends.
        let mut done_count = 0;
        let _ = collect_until(&mut bus, |c| {
            if matches!(c.body, ChunkBody::Done) {
                done_count += 1;
            }
            done_count == 2
        })
        .await;

        assert_eq!(backend.calls(), 2);
        let req = backend.last_request.lock().unwrap().clone().unwrap();
        let turn_text = &req.messages[1].content;
        assert!(
            turn_text.contains("b republished"),
            "second turn must render the notification: {turn_text}"
        );

        let _ = ctl_tx.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn present_control_runs_presentation_without_tools() {
        let backend = Arc::new(
            ScriptedBackend::new(vec![Script::text("coordination turn")]).with_route(
                prompts::PRESENTER_MARKER,
                Script::text("the final answer"),
            ),
        );
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(Arc::clone(&backend), &mut bus);

        let _ = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        ctl.send(Control::Present {
            context: TurnContext::default(),
        })
        .await
        .unwrap();

        let chunks = collect_until(&mut bus, |c| matches!(c.body, ChunkBody::Done)).await;
        assert!(chunks
            .iter()
            .any(|c| matches!(&c.body, ChunkBody::Content(t) if t == "the final answer")));

        let req = backend.last_request.lock().unwrap().clone().unwrap();
        assert!(req.tools.is_empty(), "presenter turn carries no tools");

        let _ = ctl.send(Control::Shutdown).await;
        let _ = handle.await;
    }

    #[tokio::test]
    async fn shutdown_terminates_runner() {
        let backend = Arc::new(ScriptedBackend::new(vec![Script::hang()]));
        let mut bus = ChunkBus::new();
        let (handle, ctl) = runner_for(backend, &mut bus);

        let _ = collect_until(&mut bus, |c| {
            matches!(c.body, ChunkBody::Status(AgentStatus::Working))
        })
        .await;
        ctl.send(Control::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runner must exit on shutdown")
            .unwrap();
    }

    #[test]
    fn backoff_grows_with_jitter_bounds() {
        for attempt in 1..=3 {
            let d = backoff_delay(attempt);
            let nominal = Duration::from_secs(1 << (attempt - 1));
            assert!(d >= nominal.mul_f64(1.0 - RETRY_JITTER));
            assert!(d <= nominal.mul_f64(1.0 + RETRY_JITTER));
        }
    }
}
