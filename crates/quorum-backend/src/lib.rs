// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod registry;
mod backend;
mod error;
mod gemini;
mod mock;
mod openai_compat;
mod types;

pub use backend::{Backend, EventStream};
pub use error::BackendError;
pub use gemini::GeminiBackend;
pub use mock::{MockBackend, Script, ScriptedBackend};
pub use registry::{get_driver, known_driver_ids, list_drivers, DriverMeta};
pub use types::*;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use openai_compat::{AuthStyle, OpenAiCompatBackend};
use quorum_config::BackendConfig;
use quorum_limits::{RateLimiterRegistry, SlidingWindow};

/// Construct a shared [`Backend`] from configuration.
///
/// Selects the driver implementation based on `cfg.driver`.  Run
/// `quorum list-backends` to see all recognised driver ids.  The driver's
/// Call-scope rate limiter is resolved from `limits`, keyed by credential so
/// that agents sharing an API key share one admission window.
pub fn from_config(
    cfg: &BackendConfig,
    limits: &Arc<RateLimiterRegistry>,
) -> anyhow::Result<Arc<dyn Backend>> {
    let key = resolve_api_key(cfg);
    let limiter = limits.call(&credential_key(cfg, key.as_deref()), call_window(cfg));

    // Helper that reads `base_url` from config or falls back to the registry default.
    let base_url = |default: &str| -> String {
        cfg.base_url.clone().unwrap_or_else(|| default.into())
    };

    match cfg.driver.as_str() {
        "openai" => Ok(Arc::new(OpenAiCompatBackend::new(
            "openai",
            cfg.model.clone(),
            key,
            &base_url("https://api.openai.com/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::Bearer,
            limiter,
        ))),
        "groq" => Ok(Arc::new(OpenAiCompatBackend::new(
            "groq",
            cfg.model.clone(),
            key,
            &base_url("https://api.groq.com/openai/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::Bearer,
            limiter,
        ))),
        "openrouter" => Ok(Arc::new(OpenAiCompatBackend::new(
            "openrouter",
            cfg.model.clone(),
            key,
            &base_url("https://openrouter.ai/api/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::Bearer,
            limiter,
        ))),
        "ollama" => Ok(Arc::new(OpenAiCompatBackend::new(
            "ollama",
            cfg.model.clone(),
            None, // no key needed
            &base_url("http://localhost:11434/v1"),
            cfg.max_tokens,
            cfg.temperature,
            AuthStyle::None,
            limiter,
        ))),
        "gemini" => Ok(Arc::new(GeminiBackend::new(
            cfg.model.clone(),
            key,
            cfg.base_url.clone(),
            cfg.max_tokens,
            cfg.temperature,
            limiter,
        ))),
        "mock" => Ok(Arc::new(MockBackend)),

        other => {
            let known: Vec<&str> = known_driver_ids().collect();
            bail!(
                "unknown backend driver: {other:?}\n\
                 Run `quorum list-backends` for a full list, or check your config.\n\
                 Known drivers: {known}",
                known = known.join(", ")
            )
        }
    }
}

fn resolve_api_key(cfg: &BackendConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(env) = &cfg.api_key_env {
        return std::env::var(env).ok();
    }
    // Auto-resolve from registry default env var if neither is set.
    if let Some(meta) = get_driver(&cfg.driver) {
        if let Some(env_var) = meta.default_api_key_env {
            return std::env::var(env_var).ok();
        }
    }
    None
}

/// Call-scope rate limiting is shared per credential: two agents with the
/// same key share one window.  Keyless drivers fall back to a per-driver key
/// so local servers are still individually limitable.
fn credential_key(cfg: &BackendConfig, key: Option<&str>) -> String {
    match key {
        Some(k) => format!("{}:{k}", cfg.driver),
        None => format!("{}:anonymous", cfg.driver),
    }
}

fn call_window(cfg: &BackendConfig) -> Option<SlidingWindow> {
    cfg.calls_per_minute
        .map(|n| SlidingWindow::new(n, Duration::from_secs(60)))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
