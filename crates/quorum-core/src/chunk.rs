// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use quorum_backend::SnapshotRef;

use crate::state::{AgentId, AgentStatus};

/// One typed event flowing from an agent runner into the merge bus.
///
/// Every chunk carries its originating agent and a monotone per-agent
/// sequence number stamped by the runner's [`crate::bus::ChunkSender`].
#[derive(Debug, Clone)]
pub struct Chunk {
    pub agent: AgentId,
    pub seq: u64,
    pub body: ChunkBody,
}

#[derive(Debug, Clone)]
pub enum ChunkBody {
    /// A text delta from the agent's backend
    Content(String),
    /// A reasoning delta from the agent's backend
    Reasoning(String),
    /// A non-protocol tool call passing through for display
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Result of a backend-executed tool, passing through for display
    ToolResult { id: String, content: String },
    /// Runner-reported status transition
    Status(AgentStatus),
    /// The agent published a new working answer (protocol tool call)
    AnswerPublished {
        text: String,
        snapshot: Option<SnapshotRef>,
    },
    /// The agent voted for a peer's working answer (protocol tool call)
    VoteCast { target: AgentId, reason: String },
    /// The agent asked to restart its own turn with fresh peer context
    RestartRequest,
    /// The backend stream ended normally; the agent stopped speaking
    Done,
    /// The agent failed terminally (retries exhausted or fatal error)
    Failed { error: String },
}
