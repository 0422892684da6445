// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::{
    backend::EventStream, Backend, BackendError, Capability, Role, SnapshotRef, StreamEvent,
    TurnRequest,
};

/// Deterministic mock backend for tests.  Echoes the last user message back
/// as the response text.
#[derive(Default)]
pub struct MockBackend;

#[async_trait]
impl Backend for MockBackend {
    fn class_tag(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }
    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::ToolCalls)
    }

    async fn stream(&self, req: TurnRequest) -> Result<EventStream, BackendError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_else(|| "[no input]".into());

        let events: Vec<Result<StreamEvent, BackendError>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// One scripted response: the event sequence for a single `stream()` call.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub events: Vec<Result<StreamEvent, BackendError>>,
    /// Keep the stream open (pending forever) after the scripted events.
    /// Used to model a turn that only ends when the caller drops the stream.
    pub hang_at_end: bool,
    /// Sleep this long before each event.  Lets paused-clock tests spread a
    /// burst over virtual time so consumers observe events one at a time.
    pub event_gap: Option<std::time::Duration>,
}

impl Script {
    /// A plain text reply followed by a normal end of stream.
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            events: vec![
                Ok(StreamEvent::TextDelta(reply.into())),
                Ok(StreamEvent::Done),
            ],
            hang_at_end: false,
            event_gap: None,
        }
    }

    /// A single complete tool call followed by a normal end of stream.
    pub fn tool_call(name: impl Into<String>, args: serde_json::Value) -> Self {
        let name = name.into();
        Self {
            events: vec![
                Ok(StreamEvent::ToolCall {
                    id: format!("scripted-{name}"),
                    name,
                    arguments: args.to_string(),
                }),
                Ok(StreamEvent::Done),
            ],
            hang_at_end: false,
            event_gap: None,
        }
    }

    /// An arbitrary event sequence; `Done` is NOT appended implicitly.
    pub fn events(events: Vec<Result<StreamEvent, BackendError>>) -> Self {
        Self {
            events,
            hang_at_end: false,
            event_gap: None,
        }
    }

    /// `stream()` succeeds but the stream yields a transient error.
    pub fn transient(msg: impl Into<String>) -> Self {
        Self {
            events: vec![Err(BackendError::Transient(msg.into()))],
            hang_at_end: false,
            event_gap: None,
        }
    }

    /// `stream()` succeeds but the stream yields a fatal error.
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self {
            events: vec![Err(BackendError::Fatal(msg.into()))],
            hang_at_end: false,
            event_gap: None,
        }
    }

    /// A stream that never yields anything until dropped.
    pub fn hang() -> Self {
        Self {
            events: Vec::new(),
            hang_at_end: true,
            event_gap: None,
        }
    }

    /// Emit the scripted events, then stay open until dropped.
    pub fn then_hang(mut self) -> Self {
        // Strip a trailing Done so the stream genuinely stays open.
        if matches!(self.events.last(), Some(Ok(StreamEvent::Done))) {
            self.events.pop();
        }
        self.hang_at_end = true;
        self
    }

    /// Sleep `gap` before each event instead of yielding them all at once.
    pub fn spaced(mut self, gap: std::time::Duration) -> Self {
        self.event_gap = Some(gap);
        self
    }
}

/// A pre-scripted mock backend.  Each `stream()` call pops the next script
/// from the front of the queue, letting tests specify exact event sequences
/// — including coordination tool calls and failures — without network access.
///
/// Content routes take precedence over the queue: when any message of the
/// request contains a route's marker substring, that route's script is served
/// (without consuming the queue).  Routes are reusable.
pub struct ScriptedBackend {
    class: String,
    scripts: Mutex<Vec<Script>>,
    routes: Mutex<Vec<(String, Script)>>,
    planning: AtomicBool,
    has_planning_filter: bool,
    snapshot_counter: Option<AtomicU64>,
    calls: AtomicUsize,
    /// The last `TurnRequest` seen, so tests can inspect what was sent.
    pub last_request: Mutex<Option<TurnRequest>>,
    /// The planning-mode flag observed at each `stream()` call, in order.
    pub planning_log: Mutex<Vec<bool>>,
    /// Every snapshot token handed back through `restore`.
    pub restored: Mutex<Vec<SnapshotRef>>,
}

impl ScriptedBackend {
    /// Build a backend from an ordered list of per-call scripts.
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            class: "mock".into(),
            scripts: Mutex::new(scripts),
            routes: Mutex::new(Vec::new()),
            planning: AtomicBool::new(false),
            has_planning_filter: false,
            snapshot_counter: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            planning_log: Mutex::new(Vec::new()),
            restored: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a backend that always replies with one text script.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![Script::text(reply)])
    }

    /// Override the class tag (e.g. `"gemini"` to exercise startup limits).
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Serve `script` whenever a request message contains `marker`.
    pub fn with_route(self, marker: impl Into<String>, script: Script) -> Self {
        self.routes.lock().unwrap().push((marker.into(), script));
        self
    }

    /// Declare support for the planning-mode filter.
    pub fn with_planning_filter(mut self) -> Self {
        self.has_planning_filter = true;
        self
    }

    /// Declare snapshot support; `snapshot()` returns `mock-snap-<n>` tokens.
    pub fn with_snapshots(mut self) -> Self {
        self.snapshot_counter = Some(AtomicU64::new(0));
        self
    }

    /// Number of `stream()` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn class_tag(&self) -> &str {
        &self.class
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::ToolCalls => true,
            Capability::PlanningFilter => self.has_planning_filter,
            Capability::Snapshot => self.snapshot_counter.is_some(),
            _ => false,
        }
    }

    fn set_planning_mode(&self, enabled: bool) {
        self.planning.store(enabled, Ordering::SeqCst);
    }

    fn planning_mode(&self) -> bool {
        self.planning.load(Ordering::SeqCst)
    }

    async fn stream(&self, req: TurnRequest) -> Result<EventStream, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.planning_log.lock().unwrap().push(self.planning_mode());

        let routed = {
            let routes = self.routes.lock().unwrap();
            routes
                .iter()
                .find(|(marker, _)| req.messages.iter().any(|m| m.content.contains(marker)))
                .map(|(_, script)| script.clone())
        };

        *self.last_request.lock().unwrap() = Some(req);

        let script = routed.unwrap_or_else(|| {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Script::text("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        });

        use futures::StreamExt;
        let base: EventStream = match script.event_gap {
            Some(gap) => Box::pin(stream::iter(script.events).then(move |e| async move {
                tokio::time::sleep(gap).await;
                e
            })),
            None => Box::pin(stream::iter(script.events)),
        };
        if script.hang_at_end {
            Ok(Box::pin(base.chain(stream::pending())))
        } else {
            Ok(base)
        }
    }

    async fn snapshot(&self) -> Option<SnapshotRef> {
        self.snapshot_counter.as_ref().map(|c| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            SnapshotRef::new(format!("mock-snap-{n}"))
        })
    }

    async fn restore(&self, snapshot: &SnapshotRef) -> Result<(), BackendError> {
        self.restored.lock().unwrap().push(snapshot.clone());
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
