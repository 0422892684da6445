// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::state::{AgentId, TaskOutcome};

/// Upper bound on the stored answer summary per entry.  Keeps follow-up
/// prompts small no matter how long a presentation ran.
const SUMMARY_CAP: usize = 400;

/// One completed task in the session log.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: String,
    pub at: DateTime<Utc>,
    pub query: String,
    pub summary: String,
    pub winner: Option<AgentId>,
}

/// Multi-turn conversation context.  Outlives individual tasks; the last K
/// entries are rendered into every agent's prompt on the next query.
#[derive(Debug)]
pub struct SessionContext {
    entries: Vec<SessionEntry>,
    keep_last: usize,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new(5)
    }
}

impl SessionContext {
    pub fn new(keep_last: usize) -> Self {
        Self {
            entries: Vec::new(),
            keep_last,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    /// Record a completed task.
    pub fn record(&mut self, query: &str, outcome: &TaskOutcome) {
        self.entries.push(SessionEntry {
            id: Uuid::new_v4().to_string(),
            at: Utc::now(),
            query: query.to_string(),
            summary: truncate_chars(&outcome.final_text, SUMMARY_CAP),
            winner: outcome.winner.clone(),
        });
    }

    /// Render the last K entries as a prompt block, newest last.
    /// Returns `None` when the session has no history yet.
    pub fn render_recent(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let skip = self.entries.len().saturating_sub(self.keep_last);
        let mut out = String::from("Earlier in this session:\n");
        for e in &self.entries[skip..] {
            out.push_str(&format!("- Q: {}\n  A: {}\n", e.query, e.summary));
        }
        Some(out)
    }

    /// Explicit `/clear`: drop all history.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Truncate on a char boundary, appending an ellipsis when cut.
fn truncate_chars(s: &str, cap: usize) -> String {
    if s.chars().count() <= cap {
        return s.to_string();
    }
    let cut: String = s.chars().take(cap).collect();
    format!("{cut}…")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
