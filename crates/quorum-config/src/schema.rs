// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_deadline() -> String {
    "30s".into()
}
fn default_stability_window() -> Option<String> {
    Some("5s".into())
}
fn default_restart_budget() -> u32 {
    5
}
fn default_chunk_buffer() -> usize {
    256
}
fn default_session_keep() -> usize {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The agent roster for a task.  Each entry becomes one concurrently
    /// running agent.  Order is preserved and used for display.
    ///
    /// ```yaml
    /// agents:
    ///   - id: scout
    ///     backend:
    ///       driver: gemini
    ///       model: gemini-2.0-flash
    ///   - id: critic
    ///     backend:
    ///       driver: openai
    ///       model: gpt-4o
    /// ```
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    /// Startup-scope rate limits keyed by backend class.  Classes not listed
    /// here are unlimited, except `gemini` which defaults to 7 activations
    /// per 60 s.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitEntry>,
    #[serde(default)]
    pub session: SessionConfig,
}

/// One agent in the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    /// Stable agent identifier.  Defaults to `agent-<index>` when omitted.
    pub id: Option<String>,
    pub backend: BackendConfig,
    /// Extra text appended to the agent's system prompt.
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Driver identifier.  Run `quorum list-backends` for the full list.
    /// Common values: "openai" | "gemini" | "groq" | "openrouter" | "ollama" | "mock"
    pub driver: String,
    /// Model name forwarded to the provider API
    pub model: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local servers and gateways.
    /// For hosted providers the correct default is auto-selected.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Per-request limit applied to the call-scope rate limiter for this
    /// backend's credential.  `None` leaves the credential unlimited.
    pub calls_per_minute: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            driver: "openai".into(),
            model: "gpt-4o".into(),
            // api_key_env is intentionally None here.  The backend factory
            // falls through to the driver registry, which knows the canonical
            // env-var name for each driver (OPENAI_API_KEY, GEMINI_API_KEY,
            // etc.).  Hard-coding it here would shadow the registry lookup
            // whenever the driver is overridden.
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            calls_per_minute: None,
        }
    }
}

/// Whether the planning-mode pre-check runs before coordination.
///
/// `Auto` (default) asks one randomly chosen agent whether the query needs
/// irreversible external actions and enables planning mode when the answer is
/// yes (or unparseable).  `On` skips the pre-check and always enables it,
/// `Off` never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanningModeSetting {
    #[default]
    Auto,
    On,
    Off,
}

impl std::fmt::Display for PlanningModeSetting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanningModeSetting::Auto => write!(f, "auto"),
            PlanningModeSetting::On => write!(f, "on"),
            PlanningModeSetting::Off => write!(f, "off"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Hard wall-clock deadline for one task, humantime format ("30s", "2m").
    #[serde(default = "default_deadline")]
    pub deadline: String,
    /// Quiet period after which an all-voted plurality is accepted as the
    /// outcome.  Set to null / omit the field entirely with `~` to disable
    /// the plurality rule and rely on full consensus or the deadline.
    #[serde(default = "default_stability_window")]
    pub stability_window: Option<String>,
    /// Forced restarts allowed per agent within one task before peer
    /// notifications stop interrupting its in-flight turn.
    #[serde(default = "default_restart_budget")]
    pub restart_budget: u32,
    #[serde(default)]
    pub planning_mode: PlanningModeSetting,
    /// Per-agent chunk buffer between a runner and the merge bus.  Producers
    /// block when the buffer is full.
    #[serde(default = "default_chunk_buffer")]
    pub chunk_buffer: usize,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            deadline: default_deadline(),
            stability_window: default_stability_window(),
            restart_budget: default_restart_budget(),
            planning_mode: PlanningModeSetting::default(),
            chunk_buffer: default_chunk_buffer(),
        }
    }
}

impl CoordinationConfig {
    /// Parse the humantime deadline string.  Falls back to 30 s on a
    /// malformed value so a typo in a config layer cannot disable the
    /// deadline entirely.
    pub fn deadline_duration(&self) -> Duration {
        humantime::parse_duration(&self.deadline).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the stability window.  `None` (or a malformed string) disables
    /// the plurality rule.
    pub fn stability_duration(&self) -> Option<Duration> {
        self.stability_window
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
    }
}

/// Startup-scope rate limit for one backend class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub max_requests: usize,
    /// Window length, humantime format ("60s", "1m").
    pub time_window: String,
}

impl RateLimitEntry {
    pub fn window_duration(&self) -> Duration {
        humantime::parse_duration(&self.time_window).unwrap_or(Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Number of prior (query, outcome) entries rendered into each agent's
    /// prompt on follow-up turns.
    #[serde(default = "default_session_keep")]
    pub keep_last: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_last: default_session_keep(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_agents() {
        let c = Config::default();
        assert!(c.agents.is_empty());
    }

    #[test]
    fn coordination_defaults_match_engine_defaults() {
        let c = CoordinationConfig::default();
        assert_eq!(c.deadline_duration(), Duration::from_secs(30));
        assert_eq!(c.stability_duration(), Some(Duration::from_secs(5)));
        assert_eq!(c.restart_budget, 5);
        assert_eq!(c.chunk_buffer, 256);
        assert_eq!(c.planning_mode, PlanningModeSetting::Auto);
    }

    #[test]
    fn malformed_deadline_falls_back_to_30s() {
        let c = CoordinationConfig {
            deadline: "not-a-duration".into(),
            ..CoordinationConfig::default()
        };
        assert_eq!(c.deadline_duration(), Duration::from_secs(30));
    }

    #[test]
    fn stability_window_null_disables_plurality() {
        let c: CoordinationConfig =
            serde_yaml::from_str("deadline: 30s\nstability_window: ~").unwrap();
        assert_eq!(c.stability_duration(), None);
    }

    #[test]
    fn rate_limit_entry_parses_window() {
        let e: RateLimitEntry =
            serde_yaml::from_str("max_requests: 7\ntime_window: 60s").unwrap();
        assert_eq!(e.max_requests, 7);
        assert_eq!(e.window_duration(), Duration::from_secs(60));
    }

    #[test]
    fn agent_roster_parses_from_yaml() {
        let yaml = "\
agents:
  - id: scout
    backend:
      driver: gemini
      model: gemini-2.0-flash
  - backend:
      driver: mock
      model: mock-model
";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.agents.len(), 2);
        assert_eq!(c.agents[0].id.as_deref(), Some("scout"));
        assert_eq!(c.agents[0].backend.driver, "gemini");
        assert!(c.agents[1].id.is_none());
    }

    #[test]
    fn planning_mode_parses_lowercase() {
        let c: CoordinationConfig = serde_yaml::from_str("planning_mode: off").unwrap();
        assert_eq!(c.planning_mode, PlanningModeSetting::Off);
    }
}
