//! Progressive lockout for failed logins, keyed by client identity.
//!
//! Failures within the window accumulate; the lockout grows with the count:
//! 3 → 1 minute, 6 → 10 minutes, 10 → 1 hour. A gap longer than the window
//! since the last attempt starts the count over.

use super::Sweeper;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Failure count resets after this much quiet time.
pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last_attempt: Instant,
    locked_until: Option<Instant>,
}

impl Attempts {
    fn remaining_lockout(&self, now: Instant) -> Option<Duration> {
        self.locked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Lockout duration earned by `count` consecutive failures.
pub fn lockout_for(count: u32) -> Duration {
    match count {
        c if c >= 10 => Duration::from_secs(60 * 60),
        c if c >= 6 => Duration::from_secs(10 * 60),
        c if c >= 3 => Duration::from_secs(60),
        _ => Duration::ZERO,
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    entries: RwLock<HashMap<String, Attempts>>,
    window: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(ATTEMPT_WINDOW)
    }
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            window,
        }
    }

    /// Remaining lockout for `identity`, if it is currently locked out.
    pub async fn is_blocked(&self, identity: &str) -> Option<Duration> {
        self.is_blocked_at(identity, Instant::now()).await
    }

    pub async fn is_blocked_at(&self, identity: &str, now: Instant) -> Option<Duration> {
        let entries = self.entries.read().await;
        entries.get(identity).and_then(|a| a.remaining_lockout(now))
    }

    /// Count a failed attempt. Returns the lockout duration if this failure
    /// put the identity into lockout.
    pub async fn record_failure(&self, identity: &str) -> Option<Duration> {
        self.record_failure_at(identity, Instant::now()).await
    }

    pub async fn record_failure_at(&self, identity: &str, now: Instant) -> Option<Duration> {
        let mut entries = self.entries.write().await;
        let attempts = entries.entry(identity.to_string()).or_insert(Attempts {
            count: 0,
            last_attempt: now,
            locked_until: None,
        });

        if now.saturating_duration_since(attempts.last_attempt) > self.window {
            attempts.count = 0;
        }
        attempts.count += 1;
        attempts.last_attempt = now;

        let lockout = lockout_for(attempts.count);
        if lockout.is_zero() {
            return None;
        }
        attempts.locked_until = Some(now + lockout);
        warn!(
            identity,
            attempts = attempts.count,
            lockout_secs = lockout.as_secs(),
            "Too many failed logins, locking out"
        );
        Some(lockout)
    }

    /// Forget `identity` after a successful login.
    pub async fn record_success(&self, identity: &str) {
        if self.entries.write().await.remove(identity).is_some() {
            info!(identity, "Cleared failed login attempts");
        }
    }

    /// Drop entries that are both unlocked and quiet for longer than the
    /// window. Returns how many were removed.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, a| {
            let stale = now.saturating_duration_since(a.last_attempt) > self.window;
            !stale || a.remaining_lockout(now).is_some()
        });
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> Sweeper {
        let limiter = Arc::clone(self);
        Sweeper::spawn("rate_limiter", period, move || {
            let limiter = Arc::clone(&limiter);
            async move { limiter.sweep_at(Instant::now()).await }
        })
    }
}
