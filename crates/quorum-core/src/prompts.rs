// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt and protocol-tool assembly for coordination turns.
//!
//! Every agent sees the same protocol: work on the query, publish candidate
//! answers with `publish_answer`, inspect peer answers rendered into each
//! turn, and endorse the best candidate with `cast_vote`.  The prompts here
//! are the only place that wording lives.

use serde_json::json;

use quorum_backend::ToolSchema;

use crate::state::{AgentId, Notification, Vote, WorkingAnswer};

/// Protocol tool: publish a new working-answer version.
pub const PUBLISH_ANSWER_TOOL: &str = "publish_answer";
/// Protocol tool: endorse a peer's current working answer.
pub const CAST_VOTE_TOOL: &str = "cast_vote";
/// Protocol tool: ask for a restart with fresh peer context.
pub const REQUEST_RESTART_TOOL: &str = "request_restart";

/// Distinctive phrase present only in the presenter turn.  Scripted test
/// backends route on it; models just read it as the instruction it is.
pub const PRESENTER_MARKER: &str = "You have been elected to deliver the final answer";

/// Tool schemas for the three coordination actions, offered on every
/// coordination turn.  All three are reversible by construction.
pub fn protocol_tools() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: PUBLISH_ANSWER_TOOL.into(),
            description: "Publish or replace your current candidate answer for the task. \
                          Peers see it and may vote for it."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "answer": {
                        "type": "string",
                        "description": "The complete candidate answer text"
                    }
                },
                "required": ["answer"]
            }),
            irreversible: false,
        },
        ToolSchema {
            name: CAST_VOTE_TOOL.into(),
            description: "Vote for the agent whose current answer best solves the task. \
                          You cannot vote for yourself; you must have published an answer first. \
                          A new vote replaces your previous one."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "agent_id": {
                        "type": "string",
                        "description": "Identifier of the agent you endorse"
                    },
                    "reason": {
                        "type": "string",
                        "description": "One sentence on why this answer is best"
                    }
                },
                "required": ["agent_id", "reason"]
            }),
            irreversible: false,
        },
        ToolSchema {
            name: REQUEST_RESTART_TOOL.into(),
            description: "Discard your current turn and start over with the latest peer context. \
                          Use when new information invalidates your approach."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" }
                }
            }),
            irreversible: false,
        },
    ]
}

/// Stable system prompt for one agent in one task.
pub fn system_prompt(agent: &AgentId, peers: &[AgentId], custom: Option<&str>) -> String {
    let peer_list = peers
        .iter()
        .filter(|p| *p != agent)
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = format!(
        "You are agent `{agent}`, one of several agents working the same task in parallel.\n\
         Your peers are: {peer_list}.\n\n\
         Protocol:\n\
         - Work on the task, then call `{PUBLISH_ANSWER_TOOL}` with your complete candidate answer.\n\
         - Each turn shows the peers' current answers and votes. When a peer's answer is better \
           than yours, call `{CAST_VOTE_TOOL}` for that agent instead of duplicating it.\n\
         - Publishing a new answer withdraws your previous vote; improve your answer or vote, \
           not both at once.\n\
         - Keep commentary brief; the published answer is what counts."
    );
    if let Some(extra) = custom {
        if !extra.trim().is_empty() {
            out.push_str("\n\n");
            out.push_str(extra.trim());
        }
    }
    out
}

// ─── Peer digest ─────────────────────────────────────────────────────────────

/// Read-only snapshot of peer coordination state rendered into a turn.
#[derive(Debug, Clone, Default)]
pub struct PeerDigest {
    pub answers: Vec<PeerAnswer>,
    pub votes: Vec<PeerVote>,
}

#[derive(Debug, Clone)]
pub struct PeerAnswer {
    pub agent: AgentId,
    pub version: u32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct PeerVote {
    pub voter: AgentId,
    pub target: AgentId,
    pub reason: String,
}

impl PeerDigest {
    pub fn is_empty(&self) -> bool {
        self.answers.is_empty() && self.votes.is_empty()
    }

    pub fn push_answer(&mut self, answer: &WorkingAnswer) {
        self.answers.push(PeerAnswer {
            agent: answer.agent.clone(),
            version: answer.version,
            text: answer.text.clone(),
        });
    }

    pub fn push_vote(&mut self, vote: &Vote) {
        self.votes.push(PeerVote {
            voter: vote.voter.clone(),
            target: vote.target.clone(),
            reason: vote.reason.clone(),
        });
    }

    fn render(&self) -> String {
        if self.is_empty() {
            return "No peer has published an answer yet.".into();
        }
        let mut out = String::new();
        if !self.answers.is_empty() {
            out.push_str("Current peer answers:\n");
            for a in &self.answers {
                out.push_str(&format!("- {} (v{}): {}\n", a.agent, a.version, a.text));
            }
        }
        if !self.votes.is_empty() {
            out.push_str("Current votes:\n");
            for v in &self.votes {
                out.push_str(&format!("- {} → {} ({})\n", v.voter, v.target, v.reason));
            }
        }
        out
    }
}

/// The user-side input for one coordination turn.
pub fn turn_prompt(
    query: &str,
    session: Option<&str>,
    digest: &PeerDigest,
    notes: &[Notification],
) -> String {
    let mut out = String::new();
    if let Some(history) = session {
        out.push_str(history.trim_end());
        out.push_str("\n\n");
    }
    out.push_str(&format!("Task: {query}\n\n"));
    out.push_str(&digest.render());
    if !notes.is_empty() {
        out.push_str("\nSince your last turn:\n");
        for n in notes {
            out.push_str(&format!("- [{}] {}: {}\n", n.kind, n.origin, n.summary));
        }
    }
    out
}

/// The user-side input for the winner's final-presentation turn.
pub fn presenter_prompt(query: &str, session: Option<&str>, digest: &PeerDigest) -> String {
    let mut out = String::new();
    if let Some(history) = session {
        out.push_str(history.trim_end());
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "{PRESENTER_MARKER} for this task.\n\n\
         Task: {query}\n\n"
    ));
    out.push_str(&digest.render());
    out.push_str(
        "\nWrite the final answer for the user now. Incorporate the strongest points from \
         the answers above. Respond with the answer itself; do not call coordination tools.",
    );
    out
}

/// The yes/no meta-question of the planning pre-check.
pub fn precheck_prompt(query: &str) -> String {
    format!(
        "Answer with a single word, yes or no.\n\
         Does completing this request require any irreversible external action \
         (sending messages, deploying, deleting or modifying shared state)?\n\n\
         Request: {query}"
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
