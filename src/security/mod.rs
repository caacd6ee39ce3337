//! Access gating for the bridge endpoints: login throttling, sessions and
//! client identity.

pub mod rate_limit;
pub mod session;

pub use rate_limit::RateLimiter;
pub use session::SessionStore;

use axum::http::HeaderMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// A periodic eviction pass over one of the shared maps. Runs until stopped
/// or dropped.
pub struct Sweeper {
    name: &'static str,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut sweep: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = usize> + Send,
    {
        let task = tokio::spawn(async move {
            let mut interval = interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = sweep().await;
                if evicted > 0 {
                    debug!(sweeper = name, evicted, "Evicted stale entries");
                }
            }
        });
        Self { name, task }
    }

    pub fn stop(self) {
        debug!(sweeper = self.name, "Stopping sweeper");
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Rate-limiter key for a request.
///
/// With `trust_proxy`, the first `X-Forwarded-For` entry (then `X-Real-IP`)
/// wins; otherwise only the socket peer counts, since headers are
/// client-controlled.
pub fn client_identity(headers: &HeaderMap, peer: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

/// Compare secrets without an early exit on the first differing byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn peer() -> SocketAddr {
        "10.0.0.7:51234".parse().unwrap()
    }

    #[test]
    fn identity_uses_peer_unless_proxy_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_identity(&headers, peer(), false), "10.0.0.7");
        assert_eq!(client_identity(&headers, peer(), true), "203.0.113.9");
    }

    #[test]
    fn identity_falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_identity(&headers, peer(), true), "10.0.0.7");
        headers.insert("x-real-ip", HeaderValue::from_static(" 198.51.100.4 "));
        assert_eq!(client_identity(&headers, peer(), true), "198.51.100.4");
    }

    #[test]
    fn constant_time_eq_compares_contents() {
        assert!(constant_time_eq(b"hunter2", b"hunter2"));
        assert!(!constant_time_eq(b"hunter2", b"hunter3"));
        assert!(!constant_time_eq(b"hunter2", b"hunter"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_ticks_until_dropped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let sweeper = Sweeper::spawn("test", Duration::from_secs(60), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                0
            }
        });

        tokio::time::sleep(Duration::from_secs(185)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        sweeper.stop();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }
}
