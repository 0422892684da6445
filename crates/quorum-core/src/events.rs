// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use crate::state::{AgentId, OutcomeReason, TaskOutcome};

/// Events emitted by the orchestrator to the caller during one task.
/// Consumers (CLI renderer, logs) subscribe to these to drive their output;
/// the engine makes no display assumptions.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// An agent's runner was launched
    AgentStarted { agent: AgentId },
    /// A text chunk streamed from an agent during coordination
    Content { agent: AgentId, text: String },
    /// A reasoning chunk streamed from an agent
    Reasoning { agent: AgentId, text: String },
    /// A non-protocol tool call passing through for display
    ToolCall {
        agent: AgentId,
        name: String,
        arguments: String,
    },
    /// A backend-executed tool result passing through for display
    ToolResult { agent: AgentId, content: String },
    /// An agent published a new working answer version
    AnswerPublished {
        agent: AgentId,
        version: u32,
        text: String,
    },
    /// An agent cast a live vote
    VoteCast {
        voter: AgentId,
        target: AgentId,
        reason: String,
    },
    /// An agent failed terminally; the task continues with the rest
    AgentFailed { agent: AgentId, error: String },
    /// Coordination ended; the winner will now present
    WinnerElected {
        winner: AgentId,
        reason: OutcomeReason,
    },
    /// A text chunk of the winner's final presentation
    FinalChunk { text: String },
    /// Terminal event; always emitted exactly once per task
    TaskDone { outcome: TaskOutcome },
}
