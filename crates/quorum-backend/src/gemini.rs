// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — native Generative Language API.
//!
//! Uses the `streamGenerateContent` endpoint with SSE framing.  Gemini is the
//! provider family this engine rate-limits by default at startup (7 agent
//! activations per 60 s), hence its class tag matters beyond wire plumbing.
//!
//! # Endpoint pattern
//! `POST https://generativelanguage.googleapis.com/v1beta/models/{model}:streamGenerateContent?alt=sse`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use quorum_limits::RateLimiter;

use crate::{
    backend::EventStream, Backend, BackendError, Capability, Role, StreamEvent, TurnRequest,
};

pub struct GeminiBackend {
    model: String,
    api_key: Option<String>,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    planning: AtomicBool,
    limiter: Arc<RateLimiter>,
    /// Gemini does not send tool-call ids; synthesize stable ones per call.
    call_counter: AtomicU64,
}

impl GeminiBackend {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".into()),
            max_tokens: max_tokens.unwrap_or(8192),
            temperature: temperature.unwrap_or(0.2),
            client: crate::openai_compat::http_client(),
            planning: AtomicBool::new(false),
            limiter,
            call_counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Backend for GeminiBackend {
    fn class_tag(&self) -> &str {
        "gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::ToolCalls | Capability::PlanningFilter)
    }

    fn set_planning_mode(&self, enabled: bool) {
        self.planning.store(enabled, Ordering::SeqCst);
    }

    fn planning_mode(&self) -> bool {
        self.planning.load(Ordering::SeqCst)
    }

    async fn stream(&self, req: TurnRequest) -> Result<EventStream, BackendError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| BackendError::Fatal("GEMINI_API_KEY not set".into()))?
            .to_string();

        self.limiter.acquire().await;

        // Separate system instruction from conversation.
        let mut system_parts: Vec<Value> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        for m in &req.messages {
            match m.role {
                Role::System => system_parts.push(json!({ "text": m.content })),
                Role::User => {
                    contents.push(json!({ "role": "user", "parts": [{ "text": m.content }] }))
                }
                Role::Assistant => {
                    contents.push(json!({ "role": "model", "parts": [{ "text": m.content }] }))
                }
            }
        }

        let planning = self.planning_mode();
        let declarations: Vec<Value> = req
            .tools
            .iter()
            .filter(|t| !(planning && t.irreversible))
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "maxOutputTokens": self.max_tokens,
                "temperature": self.temperature,
            }
        });
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({ "parts": system_parts });
        }
        if !declarations.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            key
        );

        debug!(model = %self.model, planning, "sending Gemini request");

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_http_status(status, text));
        }

        let counter_base = self.call_counter.fetch_add(1, Ordering::SeqCst);
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan((String::new(), 0u64), move |(buf, call_idx), chunk| {
                let events: Vec<Result<StreamEvent, BackendError>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_gemini_lines(buf, counter_base, call_idx)
                    }
                    Err(e) => vec![Err(BackendError::from_transport(&e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Drain all complete `data:`-prefixed lines from `buf` and parse them.
/// `call_idx` persists across TCP chunks so synthesized ids stay unique
/// within one stream.
fn drain_gemini_lines(
    buf: &mut String,
    counter_base: u64,
    call_idx: &mut u64,
) -> Vec<Result<StreamEvent, BackendError>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        let data = match line.strip_prefix("data: ") {
            Some(d) => d.trim(),
            None => continue,
        };
        if data.is_empty() {
            continue;
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => continue,
        };
        parse_gemini_chunk(&v, counter_base, call_idx, &mut events);
    }
    events
}

/// Parse one streamed response object into events.
///
/// Gemini streams whole parts rather than deltas for function calls, so each
/// `functionCall` part maps directly to a complete [`StreamEvent::ToolCall`].
fn parse_gemini_chunk(
    v: &Value,
    counter_base: u64,
    call_idx: &mut u64,
    events: &mut Vec<Result<StreamEvent, BackendError>>,
) {
    let candidate = &v["candidates"][0];
    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(fc) = part.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("").to_string();
                let args = fc
                    .get("args")
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "{}".into());
                let id = format!("gemini-call-{counter_base}-{call_idx}");
                *call_idx += 1;
                events.push(Ok(StreamEvent::ToolCall {
                    id,
                    name,
                    arguments: args,
                }));
            } else if part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false) {
                if let Some(text) = part["text"].as_str() {
                    events.push(Ok(StreamEvent::ReasoningDelta(text.to_string())));
                }
            } else if let Some(text) = part["text"].as_str() {
                if !text.is_empty() {
                    events.push(Ok(StreamEvent::TextDelta(text.to_string())));
                }
            }
        }
    }
    if candidate["finishReason"].as_str() == Some("STOP") {
        events.push(Ok(StreamEvent::Done));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
