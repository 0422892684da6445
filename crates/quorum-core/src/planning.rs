// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Irreversibility pre-check for planning mode.
//!
//! One randomly chosen agent is asked whether the query needs any
//! irreversible external action.  The check fails safe: an unparseable
//! reply, a backend error on every agent, or an empty roster all count as
//! "yes", which turns planning mode on for the coordination phase.

use std::sync::Arc;

use futures::StreamExt;
use rand::seq::SliceRandom;
use tracing::debug;

use quorum_backend::{Backend, Message, StreamEvent, TurnRequest};

use crate::prompts;

/// Cap on collected reply text; a yes/no answer does not need more.
const REPLY_CAP: usize = 256;

/// Ask one responsive agent the yes/no meta-question.  Returns whether the
/// task requires irreversible actions (and therefore planning mode).
pub async fn requires_irreversible_actions(
    query: &str,
    backends: &[Arc<dyn Backend>],
) -> bool {
    let mut order: Vec<usize> = (0..backends.len()).collect();
    order.shuffle(&mut rand::thread_rng());

    for idx in order {
        let backend = &backends[idx];
        let req = TurnRequest {
            messages: vec![Message::user(prompts::precheck_prompt(query))],
            tools: Vec::new(),
        };
        let mut stream = match backend.stream(req).await {
            Ok(s) => s,
            // Unresponsive agent: try the next one.
            Err(e) => {
                debug!(class = backend.class_tag(), error = %e, "pre-check agent unresponsive");
                continue;
            }
        };

        let mut reply = String::new();
        while let Some(ev) = stream.next().await {
            match ev {
                Ok(StreamEvent::TextDelta(t)) => {
                    reply.push_str(&t);
                    if reply.len() >= REPLY_CAP {
                        break;
                    }
                }
                Ok(StreamEvent::Done) | Err(_) => break,
                Ok(_) => {}
            }
        }

        return match parse_yes_no(&reply) {
            Some(answer) => {
                debug!(reply = %reply.trim(), answer, "pre-check reply parsed");
                answer
            }
            // The chosen agent answered but not parseably: fail safe.
            None => true,
        };
    }

    // No responsive agents at all.
    true
}

/// Parse a yes/no reply by its first word, ignoring case and punctuation.
pub(crate) fn parse_yes_no(text: &str) -> Option<bool> {
    let first = text
        .trim()
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_alphabetic())
        .to_ascii_lowercase();
    match first.as_str() {
        "yes" => Some(true),
        "no" => Some(false),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
