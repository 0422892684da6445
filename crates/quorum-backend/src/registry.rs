// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Driver registry: static metadata for every supported backend driver.
//!
//! This module is the single source of truth for which driver IDs exist and
//! what their defaults are.  It does **not** contain construction logic –
//! that lives in [`crate::from_config`].  New drivers are added by extending
//! this table and the factory match at program start; there is no runtime
//! plugin discovery.

/// Metadata describing a registered backend driver.
#[derive(Debug, Clone)]
pub struct DriverMeta {
    /// Unique driver id used in the `backend.driver` config field (e.g. `"openai"`).
    pub id: &'static str,
    /// Human-readable display name (e.g. `"OpenAI"`).
    pub name: &'static str,
    /// One-line description shown by `quorum list-backends`.
    pub description: &'static str,
    /// Default environment variable that holds the API key.
    /// `None` for drivers that require no key (local servers, mock).
    pub default_api_key_env: Option<&'static str>,
    /// Default base URL when the user does not set `backend.base_url`.
    pub default_base_url: Option<&'static str>,
    /// Whether an explicit API key is required.
    pub requires_api_key: bool,
}

/// Complete registry of supported drivers.
pub static DRIVERS: &[DriverMeta] = &[
    DriverMeta {
        id: "openai",
        name: "OpenAI",
        description: "OpenAI GPT and o-series models",
        default_api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "gemini",
        name: "Google Gemini",
        description: "Google Gemini models via the Generative Language API",
        default_api_key_env: Some("GEMINI_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "groq",
        name: "Groq",
        description: "Groq-hosted open models (OpenAI-compatible)",
        default_api_key_env: Some("GROQ_API_KEY"),
        default_base_url: Some("https://api.groq.com/openai/v1"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "openrouter",
        name: "OpenRouter",
        description: "OpenRouter gateway to many hosted models (OpenAI-compatible)",
        default_api_key_env: Some("OPENROUTER_API_KEY"),
        default_base_url: Some("https://openrouter.ai/api/v1"),
        requires_api_key: true,
    },
    DriverMeta {
        id: "ollama",
        name: "Ollama",
        description: "Local Ollama server (OpenAI-compatible, no key needed)",
        default_api_key_env: None,
        default_base_url: Some("http://localhost:11434/v1"),
        requires_api_key: false,
    },
    DriverMeta {
        id: "mock",
        name: "Mock",
        description: "Deterministic in-process backend for tests",
        default_api_key_env: None,
        default_base_url: None,
        requires_api_key: false,
    },
];

/// Look up a driver by id.
pub fn get_driver(id: &str) -> Option<&'static DriverMeta> {
    DRIVERS.iter().find(|d| d.id == id)
}

/// All registered drivers, in display order.
pub fn list_drivers() -> &'static [DriverMeta] {
    DRIVERS
}

/// Iterator over the registered driver ids.
pub fn known_driver_ids() -> impl Iterator<Item = &'static str> {
    DRIVERS.iter().map(|d| d.id)
}
