// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared driver for OpenAI-compatible chat completion APIs.
//!
//! Several providers speak the same `/chat/completions` SSE wire format;
//! this module provides a single `OpenAiCompatBackend` that each driver
//! configures with its own defaults (URL, auth style, class tag).
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `None` — no authentication (local servers like Ollama)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use quorum_limits::RateLimiter;

use crate::{
    backend::EventStream, Backend, BackendError, Capability, StreamEvent, TurnRequest,
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — standard for most providers.
    Bearer,
    /// No authentication header — local servers.
    None,
}

/// OpenAI-compatible chat completion backend.
pub struct OpenAiCompatBackend {
    /// Driver id, also the rate-limit class tag.
    driver_name: &'static str,
    model: String,
    /// API key (pre-resolved from config or env).
    api_key: Option<String>,
    /// Full chat completions URL.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
    auth_style: AuthStyle,
    /// Suppress irreversible tool calls while set.  Shared across runners,
    /// hence atomic rather than `&mut self`.
    planning: AtomicBool,
    /// Call-scope admission gate, shared per credential.
    limiter: Arc<RateLimiter>,
}

impl OpenAiCompatBackend {
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        auth_style: AuthStyle,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: http_client(),
            auth_style,
            planning: AtomicBool::new(false),
            limiter,
        }
    }
}

#[async_trait]
impl Backend for OpenAiCompatBackend {
    fn class_tag(&self) -> &str {
        self.driver_name
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
        // One call-scope admission per network request, shared across every
        // agent using this credential.
        self.limiter.acquire().await;

        let planning = self.planning_mode();
        let tools: Vec<Value> = req
            .tools
            .iter()
            .filter(|t| !(planning && t.irreversible))
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": role_str(m),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = messages.len(),
            planning,
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if self.auth_style == AuthStyle::Bearer {
            let key = self.api_key.as_deref().ok_or_else(|| {
                BackendError::Fatal(format!(
                    "{}: API key not set; provide api_key or api_key_env in config",
                    self.driver_name
                ))
            })?;
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .map_err(|e| BackendError::from_transport(&e))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_http_status(status, text));
        }

        // SSE events can be split across TCP packets.  The decoder keeps a
        // line buffer and tool-call accumulation state across chunks.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(SseDecoder::default(), |decoder, chunk| {
                let events = match chunk {
                    Ok(b) => decoder.feed(&b),
                    Err(e) => vec![Err(BackendError::from_transport(&e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Per-request connect timeout, independent of the task deadline.  No total
/// timeout is set — streams legitimately run for minutes; a stalled stream
/// is handled by dropping it.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

fn role_str(m: &crate::Message) -> &'static str {
    match m.role {
        crate::Role::System => "system",
        crate::Role::User => "user",
        crate::Role::Assistant => "assistant",
    }
}

// ─── SSE decoding ─────────────────────────────────────────────────────────────

/// Accumulating tool call: OpenAI streams the id/name first and the JSON
/// arguments as deltas across subsequent chunks.
#[derive(Debug, Default)]
struct PendingCall {
    index: u64,
    id: String,
    name: String,
    arguments: String,
}

/// Incremental SSE decoder for the `/chat/completions` stream format.
///
/// Emits [`StreamEvent::ToolCall`] only once a call is complete (on the
/// `tool_calls` finish reason or the `[DONE]` sentinel) so that consumers
/// never see argument fragments.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: String,
    calls: Vec<PendingCall>,
}

impl SseDecoder {
    /// Feed raw bytes; returns every event completed by this chunk.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<Result<StreamEvent, BackendError>> {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(nl_pos) = self.buf.find('\n') {
            let line = self.buf[..nl_pos].trim_end_matches('\r').to_string();
            self.buf = self.buf[nl_pos + 1..].to_string();
            self.decode_line(&line, &mut events);
        }
        events
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<Result<StreamEvent, BackendError>>) {
        let data = match line.strip_prefix("data: ") {
            Some(d) => d.trim(),
            None => return,
        };
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.flush_calls(events);
            events.push(Ok(StreamEvent::Done));
            return;
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return,
        };

        let choice = &v["choices"][0];
        let delta = &choice["delta"];

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let entry = match self.calls.iter_mut().find(|c| c.index == index) {
                    Some(c) => c,
                    None => {
                        self.calls.push(PendingCall {
                            index,
                            ..PendingCall::default()
                        });
                        self.calls.last_mut().unwrap()
                    }
                };
                if let Some(id) = tc["id"].as_str() {
                    entry.id.push_str(id);
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
            }
            return;
        }

        // The finish reason arrives on a delta-free chunk once all argument
        // fragments have been streamed.
        if choice["finish_reason"].as_str() == Some("tool_calls") {
            self.flush_calls(events);
            return;
        }

        let thinking = delta
            .get("reasoning_content")
            .and_then(|c| c.as_str())
            .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
        if let Some(text) = thinking {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::ReasoningDelta(text.to_string())));
            }
            return;
        }

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                events.push(Ok(StreamEvent::TextDelta(text.to_string())));
            }
        }
    }

    fn flush_calls(&mut self, events: &mut Vec<Result<StreamEvent, BackendError>>) {
        for call in self.calls.drain(..) {
            events.push(Ok(StreamEvent::ToolCall {
                id: call.id,
                name: call.name,
                arguments: call.arguments,
            }));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(lines: &[&str]) -> Vec<StreamEvent> {
        let mut decoder = SseDecoder::default();
        let joined = lines.join("\n") + "\n";
        decoder
            .feed(joined.as_bytes())
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn text_deltas_decode_in_order() {
        let events = feed_all(&[
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            "data: [DONE]",
        ]);
        assert!(matches!(&events[0], StreamEvent::TextDelta(t) if t == "Hel"));
        assert!(matches!(&events[1], StreamEvent::TextDelta(t) if t == "lo"));
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[test]
    fn split_sse_line_survives_packet_boundary() {
        let mut decoder = SseDecoder::default();
        let first = decoder.feed(br#"data: {"choices":[{"delta":{"content":"#);
        assert!(first.is_empty(), "incomplete line must not emit events");
        let rest = decoder.feed("\"ok\"}}]}\n".as_bytes());
        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0].as_ref().unwrap(), StreamEvent::TextDelta(t) if t == "ok"));
    }

    #[test]
    fn tool_call_arguments_accumulate_across_deltas() {
        let events = feed_all(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"publish_answer","arguments":""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"answer\""}}]}}]}"#,
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":\"42\"}"}}]}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]);
        assert_eq!(events.len(), 1, "one complete tool call expected");
        match &events[0] {
            StreamEvent::ToolCall { id, name, arguments } => {
                assert_eq!(id, "c1");
                assert_eq!(name, "publish_answer");
                assert_eq!(arguments, r#"{"answer":"42"}"#);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn done_sentinel_flushes_pending_calls() {
        let events = feed_all(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"cast_vote","arguments":"{}"}}]}}]}"#,
            "data: [DONE]",
        ]);
        assert!(matches!(&events[0], StreamEvent::ToolCall { name, .. } if name == "cast_vote"));
        assert!(matches!(&events[1], StreamEvent::Done));
    }

    #[test]
    fn reasoning_deltas_use_either_field_name() {
        let events = feed_all(&[
            r#"data: {"choices":[{"delta":{"reasoning_content":"thinking"}}]}"#,
            r#"data: {"choices":[{"delta":{"reasoning":"more"}}]}"#,
        ]);
        assert!(matches!(&events[0], StreamEvent::ReasoningDelta(t) if t == "thinking"));
        assert!(matches!(&events[1], StreamEvent::ReasoningDelta(t) if t == "more"));
    }

    #[test]
    fn comment_and_blank_lines_are_ignored() {
        let events = feed_all(&[": keepalive", "", "data: ", "data: [DONE]"]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Done));
    }
}
