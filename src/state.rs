//! Shared application state.

use crate::config::Config;
use crate::security::{RateLimiter, SessionStore, Sweeper};
use std::sync::Arc;

/// Services constructed once at startup and handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let tunables = &config.tunables;
        let sessions = Arc::new(SessionStore::new(tunables.session_ttl));
        let limiter = Arc::new(RateLimiter::new(tunables.limiter_window));
        Self {
            config: Arc::new(config),
            sessions,
            limiter,
        }
    }

    /// Start the periodic eviction passes. They stop when the returned
    /// sweepers are stopped or dropped.
    pub fn start_sweepers(&self) -> Vec<Sweeper> {
        let tunables = &self.config.tunables;
        vec![
            self.sessions.spawn_sweeper(tunables.session_sweep),
            self.limiter.spawn_sweeper(tunables.limiter_sweep),
        ]
    }
}
