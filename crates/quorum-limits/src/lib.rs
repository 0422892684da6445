// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sliding-window request admission.
//!
//! Two independent scopes share the same algorithm:
//!
//! - **Startup scope** — one admission per agent activation, keyed by backend
//!   class.  Bounds how fast agents spin up against providers with strict
//!   per-minute quotas (Gemini defaults to 7 activations / 60 s).
//! - **Call scope** — one admission per network request, keyed by provider
//!   credential, shared across every agent using that credential.
//!
//! The [`RateLimiterRegistry`] is created once at process start and passed
//! explicitly into the orchestrator and the backend drivers.  There is no
//! global singleton.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Margin added to the computed wait so a re-check lands strictly after the
/// oldest in-window timestamp has expired.
const GRANT_SLACK: Duration = Duration::from_millis(5);

/// Parameters of one sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    pub max_requests: usize,
    pub time_window: Duration,
}

impl SlidingWindow {
    pub fn new(max_requests: usize, time_window: Duration) -> Self {
        Self {
            max_requests,
            time_window,
        }
    }

    /// Default startup window for providers with strict RPM quotas.
    pub fn gemini_startup() -> Self {
        Self::new(7, Duration::from_secs(60))
    }
}

/// Sliding-window admission gate for one key.
///
/// An admission timestamp is recorded only at the moment a grant is returned,
/// so a waiter that is cancelled (dropped) between retries leaves the window
/// untouched.  The deque mutex is never held across an await point; waiters
/// queue on the tokio mutex, which wakes them in FIFO order.
pub struct RateLimiter {
    window: Option<SlidingWindow>,
    admissions: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(window: SlidingWindow) -> Self {
        Self {
            window: Some(window),
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    /// A limiter that grants immediately and records nothing.
    pub fn unlimited() -> Self {
        Self {
            window: None,
            admissions: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.window.is_none()
    }

    /// Attempt an admission at `now`.  On grant the timestamp is recorded and
    /// `Ok(())` returned; otherwise the delay until the oldest in-window
    /// timestamp expires is returned and nothing is recorded.
    pub async fn try_acquire(&self) -> Result<(), Duration> {
        let window = match self.window {
            Some(w) => w,
            None => return Ok(()),
        };
        let now = Instant::now();
        let mut admissions = self.admissions.lock().await;
        // Drop timestamps that have aged out of the window.
        while let Some(&oldest) = admissions.front() {
            if now.duration_since(oldest) >= window.time_window {
                admissions.pop_front();
            } else {
                break;
            }
        }
        if admissions.len() < window.max_requests {
            admissions.push_back(now);
            return Ok(());
        }
        let oldest = *admissions.front().unwrap_or(&now);
        Err(window.time_window.saturating_sub(now.duration_since(oldest)))
    }

    /// Suspend until an admission is granted.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire().await {
                Ok(()) => return,
                Err(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate limit window full");
                    tokio::time::sleep(wait + GRANT_SLACK).await;
                }
            }
        }
    }

    /// Number of admissions currently inside the window.
    pub async fn in_window(&self) -> usize {
        let window = match self.window {
            Some(w) => w,
            None => return 0,
        };
        let now = Instant::now();
        let admissions = self.admissions.lock().await;
        admissions
            .iter()
            .filter(|t| now.duration_since(**t) < window.time_window)
            .count()
    }
}

/// Process-scoped registry of per-key limiters.
///
/// Created at process start, destroyed at process end; components receive it
/// as an `Arc` rather than reaching for a global.
pub struct RateLimiterRegistry {
    startup_windows: HashMap<String, SlidingWindow>,
    startup: StdMutex<HashMap<String, Arc<RateLimiter>>>,
    call: StdMutex<HashMap<String, Arc<RateLimiter>>>,
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        let mut startup_windows = HashMap::new();
        startup_windows.insert("gemini".to_string(), SlidingWindow::gemini_startup());
        Self::new(startup_windows)
    }
}

impl RateLimiterRegistry {
    pub fn new(startup_windows: HashMap<String, SlidingWindow>) -> Self {
        Self {
            startup_windows,
            startup: StdMutex::new(HashMap::new()),
            call: StdMutex::new(HashMap::new()),
        }
    }

    /// Startup-scope limiter for a backend class.  Classes without a
    /// configured window get an unlimited limiter.
    pub fn startup(&self, class: &str) -> Arc<RateLimiter> {
        let mut map = self.startup.lock().expect("startup limiter map poisoned");
        if let Some(l) = map.get(class) {
            return Arc::clone(l);
        }
        let limiter = match self.startup_windows.get(class) {
            Some(w) => Arc::new(RateLimiter::new(*w)),
            None => Arc::new(RateLimiter::unlimited()),
        };
        map.insert(class.to_string(), Arc::clone(&limiter));
        limiter
    }

    /// Call-scope limiter for a provider credential, shared across all agents
    /// using it.  The window supplied by the first caller for a key wins;
    /// `None` leaves the credential unlimited.
    pub fn call(&self, credential: &str, window: Option<SlidingWindow>) -> Arc<RateLimiter> {
        let mut map = self.call.lock().expect("call limiter map poisoned");
        if let Some(l) = map.get(credential) {
            return Arc::clone(l);
        }
        let limiter = match window {
            Some(w) => Arc::new(RateLimiter::new(w)),
            None => Arc::new(RateLimiter::unlimited()),
        };
        map.insert(credential.to_string(), Arc::clone(&limiter));
        limiter
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_window() -> SlidingWindow {
        SlidingWindow::new(3, Duration::from_secs(10))
    }

    // ── Basic admission ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn grants_up_to_max_requests_immediately() {
        let l = RateLimiter::new(small_window());
        for _ in 0..3 {
            assert!(l.try_acquire().await.is_ok());
        }
        assert!(l.try_acquire().await.is_err());
    }

    #[tokio::test]
    async fn denial_reports_wait_until_oldest_expires() {
        let l = RateLimiter::new(small_window());
        for _ in 0..3 {
            l.try_acquire().await.unwrap();
        }
        let wait = l.try_acquire().await.unwrap_err();
        assert!(wait <= Duration::from_secs(10));
        assert!(wait > Duration::from_secs(9), "wait was {wait:?}");
    }

    #[tokio::test]
    async fn unlimited_limiter_always_grants() {
        let l = RateLimiter::unlimited();
        for _ in 0..1000 {
            assert!(l.try_acquire().await.is_ok());
        }
        assert_eq!(l.in_window().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_and_grants_again() {
        let l = RateLimiter::new(small_window());
        for _ in 0..3 {
            l.try_acquire().await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(l.try_acquire().await.is_ok());
    }

    // ── acquire / blocking path ───────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn acquire_suspends_until_slot_opens() {
        let l = Arc::new(RateLimiter::new(SlidingWindow::new(1, Duration::from_secs(5))));
        l.try_acquire().await.unwrap();

        let before = Instant::now();
        l.acquire().await;
        let waited = before.elapsed();
        assert!(waited >= Duration::from_secs(5), "waited only {waited:?}");
    }

    /// Cancellation before any admission leaves the rate limiter state
    /// unchanged: a waiter that times out must not occupy a slot.
    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_no_timestamp() {
        let l = Arc::new(RateLimiter::new(SlidingWindow::new(1, Duration::from_secs(60))));
        l.try_acquire().await.unwrap();

        // Cancel the waiter after 1 s — long before a slot opens.
        let waiter = Arc::clone(&l);
        let cancelled =
            tokio::time::timeout(Duration::from_secs(1), async move { waiter.acquire().await })
                .await;
        assert!(cancelled.is_err());
        assert_eq!(l.in_window().await, 1, "cancelled waiter must not be recorded");

        // Once the original admission expires exactly one slot opens.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(l.try_acquire().await.is_ok());
        assert!(l.try_acquire().await.is_err());
    }

    // ── Throughput over many admissions ───────────────────────────────────────

    /// 50 startup admissions through a 7-per-60s window: the first 7 are
    /// immediate and no 60 s sliding interval ever holds more than 7; total
    /// elapsed is at least ceil((50-7)/7) full windows.
    #[tokio::test(start_paused = true)]
    async fn fifty_admissions_respect_seven_per_minute() {
        let l = RateLimiter::new(SlidingWindow::gemini_startup());
        let start = Instant::now();
        let mut grants = Vec::with_capacity(50);
        for _ in 0..50 {
            l.acquire().await;
            grants.push(Instant::now());
        }

        let first_batch = grants
            .iter()
            .filter(|t| t.duration_since(start) < Duration::from_secs(1))
            .count();
        assert_eq!(first_batch, 7, "first window batch should be exactly 7");

        // Sliding-window invariant: any 60 s interval holds at most 7 grants.
        for (i, t) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .filter(|u| u.duration_since(*t) < Duration::from_secs(60))
                .count();
            assert!(in_window <= 7, "window starting at grant {i} holds {in_window}");
        }

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(360),
            "50 admissions finished too fast: {elapsed:?}"
        );
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn registry_default_limits_gemini_startup() {
        let reg = RateLimiterRegistry::default();
        let gemini = reg.startup("gemini");
        assert!(!gemini.is_unlimited());
        let openai = reg.startup("openai");
        assert!(openai.is_unlimited());
    }

    #[tokio::test]
    async fn registry_shares_limiter_per_key() {
        let reg = RateLimiterRegistry::default();
        let a = reg.startup("gemini");
        let b = reg.startup("gemini");
        assert!(Arc::ptr_eq(&a, &b));

        let c1 = reg.call("key-1", Some(SlidingWindow::new(2, Duration::from_secs(60))));
        let c2 = reg.call("key-1", None);
        assert!(Arc::ptr_eq(&c1, &c2), "first window for a key wins");
        assert!(!c1.is_unlimited());
    }

    #[tokio::test]
    async fn registry_call_scope_unlimited_without_window() {
        let reg = RateLimiterRegistry::default();
        let l = reg.call("local", None);
        assert!(l.is_unlimited());
    }
}
