// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Failure kinds surfaced by a backend.
///
/// `Transient` errors are retried by the agent runner with exponential
/// backoff; once retries are exhausted they are promoted to a terminal
/// failure.  `Fatal` errors (bad credentials, malformed responses) fail the
/// agent immediately.  `Cancelled` propagates silently when a stream is
/// dropped mid-turn.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("transient backend error: {0}")]
    Transient(String),
    #[error("backend failure: {0}")]
    Fatal(String),
    #[error("stream cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }

    /// Classify an HTTP response status.  429 and 5xx are retryable; every
    /// other error status (auth, bad request) is fatal.
    pub fn from_http_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if status == 429 || status >= 500 {
            BackendError::Transient(format!("HTTP {status}: {detail}"))
        } else {
            BackendError::Fatal(format!("HTTP {status}: {detail}"))
        }
    }

    /// Classify a reqwest transport error.  Connection-level failures are
    /// transient; request-building errors are fatal.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_body() || err.is_decode() {
            BackendError::Transient(err.to_string())
        } else {
            BackendError::Fatal(err.to_string())
        }
    }
}
