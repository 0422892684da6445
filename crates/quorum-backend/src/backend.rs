// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{BackendError, Capability, SnapshotRef, StreamEvent, TurnRequest};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, BackendError>> + Send>>;

/// The capability the coordination engine depends on.
///
/// A backend is shared by reference across agent runners and must be safe for
/// concurrent use across them; within one runner it is used sequentially.
/// Cancellation is dropping the returned stream — drivers must honour a drop
/// promptly (within one network round-trip) and leave no uncommitted side
/// effects behind.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Provider-family tag used for rate-limit keying (e.g. `"gemini"`).
    fn class_tag(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Capability negotiation.  Callers query rather than probe.
    fn supports(&self, capability: Capability) -> bool;

    /// Send one turn and return a streaming response.
    ///
    /// Drivers acquire a Call-scope rate-limit admission before every
    /// network request.
    async fn stream(&self, req: TurnRequest) -> Result<EventStream, BackendError>;

    /// While enabled, the backend MUST suppress tool calls classified as
    /// irreversible.  A no-op for backends without the planning filter
    /// capability.
    fn set_planning_mode(&self, _enabled: bool) {}

    /// Current planning-mode flag; `false` for backends without the filter.
    fn planning_mode(&self) -> bool {
        false
    }

    /// Take a checkpoint of the backend's workspace, if it carries one.
    ///
    /// The default implementation returns `None`; only backends reporting
    /// `Capability::Snapshot` override this.
    async fn snapshot(&self) -> Option<SnapshotRef> {
        None
    }

    /// Restore a previously taken checkpoint.
    async fn restore(&self, _snapshot: &SnapshotRef) -> Result<(), BackendError> {
        Ok(())
    }
}
