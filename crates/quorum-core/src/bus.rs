// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Merge bus for concurrent agent chunk streams.
//!
//! Each runner gets a bounded ingress channel; the orchestrator reads one
//! merged stream.  Guarantees:
//!
//! - per agent, chunks arrive in production order (single channel per agent);
//! - across agents, polling is fair — `StreamMap` rotates its start index so
//!   no active agent is starved;
//! - back-pressure, not loss: a producer blocks when its buffer is full, the
//!   consumer side never drops;
//! - dropping an agent's sender ends that agent's stream; the merged stream
//!   ends when every ingress is closed.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};

use crate::chunk::{Chunk, ChunkBody};
use crate::state::AgentId;

/// Default per-agent buffer between a runner and the bus.
pub const DEFAULT_CHUNK_BUFFER: usize = 256;

/// Producer handle for one agent.  Stamps the agent id and a monotone
/// per-agent sequence number on every chunk.
pub struct ChunkSender {
    agent: AgentId,
    seq: u64,
    tx: mpsc::Sender<Chunk>,
}

impl ChunkSender {
    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Send one chunk, waiting while the buffer is full.  Returns `false`
    /// when the bus side is gone (task shutting down).
    pub async fn send(&mut self, body: ChunkBody) -> bool {
        let chunk = Chunk {
            agent: self.agent.clone(),
            seq: self.seq,
            body,
        };
        self.seq += 1;
        self.tx.send(chunk).await.is_ok()
    }
}

/// The merged read side, owned by the orchestrator.
pub struct ChunkBus {
    streams: StreamMap<AgentId, ReceiverStream<Chunk>>,
}

impl Default for ChunkBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkBus {
    pub fn new() -> Self {
        Self {
            streams: StreamMap::new(),
        }
    }

    /// Register an agent and hand back its producer side.
    pub fn register(&mut self, agent: AgentId, capacity: usize) -> ChunkSender {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.streams.insert(agent.clone(), ReceiverStream::new(rx));
        ChunkSender { agent, seq: 0, tx }
    }

    /// Next chunk from any agent; `None` once every ingress has closed.
    pub async fn next(&mut self) -> Option<Chunk> {
        self.streams.next().await.map(|(_, chunk)| chunk)
    }

    /// Number of still-open ingress streams.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> AgentId {
        AgentId::from(s)
    }

    #[tokio::test]
    async fn per_agent_order_is_preserved() {
        let mut bus = ChunkBus::new();
        let mut tx = bus.register(id("a"), 16);
        for i in 0..5 {
            assert!(tx.send(ChunkBody::Content(format!("c{i}"))).await);
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(chunk) = bus.next().await {
            seen.push(chunk.seq);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn sequence_numbers_are_monotone_per_agent() {
        let mut bus = ChunkBus::new();
        let mut a = bus.register(id("a"), 16);
        let mut b = bus.register(id("b"), 16);
        a.send(ChunkBody::Done).await;
        b.send(ChunkBody::Done).await;
        a.send(ChunkBody::Done).await;
        drop(a);
        drop(b);

        let mut last_seq: std::collections::HashMap<AgentId, u64> = Default::default();
        while let Some(chunk) = bus.next().await {
            if let Some(prev) = last_seq.get(&chunk.agent) {
                assert!(chunk.seq > *prev, "seq must increase per agent");
            }
            last_seq.insert(chunk.agent, chunk.seq);
        }
    }

    #[tokio::test]
    async fn both_agents_make_progress() {
        let mut bus = ChunkBus::new();
        let mut a = bus.register(id("a"), 4);
        let mut b = bus.register(id("b"), 4);

        tokio::spawn(async move {
            for _ in 0..20 {
                a.send(ChunkBody::Content("a".into())).await;
            }
        });
        tokio::spawn(async move {
            for _ in 0..20 {
                b.send(ChunkBody::Content("b".into())).await;
            }
        });

        // Within the first 10 chunks both agents must have appeared: the
        // bounded buffers (4) make starvation impossible even under an
        // unfair scheduler, since a stalled reader side blocks the writer.
        let mut seen_a = false;
        let mut seen_b = false;
        for _ in 0..10 {
            let chunk = bus.next().await.unwrap();
            match chunk.agent.as_str() {
                "a" => seen_a = true,
                "b" => seen_b = true,
                _ => unreachable!(),
            }
        }
        assert!(seen_a && seen_b, "no agent may be starved");
    }

    #[tokio::test]
    async fn producer_blocks_when_buffer_full() {
        let mut bus = ChunkBus::new();
        let mut tx = bus.register(id("a"), 1);
        assert!(tx.send(ChunkBody::Done).await);

        // Second send must block until the consumer drains one chunk.
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            tx.send(ChunkBody::Done),
        )
        .await;
        assert!(blocked.is_err(), "send into a full buffer must block");

        let _ = bus.next().await;
        let unblocked =
            tokio::time::timeout(Duration::from_millis(100), tx.send(ChunkBody::Done)).await;
        assert!(unblocked.is_ok());
    }

    #[tokio::test]
    async fn merged_stream_ends_when_all_ingresses_close() {
        let mut bus = ChunkBus::new();
        let mut a = bus.register(id("a"), 4);
        let b = bus.register(id("b"), 4);
        a.send(ChunkBody::Done).await;
        drop(a);
        drop(b);

        assert!(bus.next().await.is_some());
        assert!(bus.next().await.is_none(), "bus must complete after close");
        assert_eq!(bus.open_streams(), 0);
    }

    #[tokio::test]
    async fn send_fails_after_bus_dropped() {
        let mut bus = ChunkBus::new();
        let mut tx = bus.register(id("a"), 4);
        drop(bus);
        assert!(!tx.send(ChunkBody::Done).await);
    }
}
