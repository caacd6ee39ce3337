//! Login sessions: opaque random tokens with a fixed lifetime.

use super::Sweeper;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Session lifetime (24 hours).
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const TOKEN_BYTES: usize = 32;

#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint and store a new token.
    pub async fn create(&self) -> String {
        self.create_at(Instant::now()).await
    }

    pub async fn create_at(&self, now: Instant) -> String {
        let token = generate_token();
        self.sessions
            .write()
            .await
            .insert(token.clone(), now + self.ttl);
        debug!("Created session");
        token
    }

    /// True iff `token` exists and has not expired. An expired token is
    /// removed on the spot.
    pub async fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Instant::now()).await
    }

    pub async fn validate_at(&self, token: &str, now: Instant) -> bool {
        match self.sessions.read().await.get(token) {
            None => return false,
            Some(expires) if *expires > now => return true,
            Some(_) => {}
        }

        let mut sessions = self.sessions.write().await;
        if sessions.get(token).is_some_and(|expires| *expires <= now) {
            sessions.remove(token);
            debug!("Evicted expired session on lookup");
        }
        false
    }

    /// Explicit logout. Returns whether the token existed.
    pub async fn remove(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, expires| *expires > now);
        before - sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> Sweeper {
        let store = Arc::clone(self);
        Sweeper::spawn("sessions", period, move || {
            let store = Arc::clone(&store);
            async move { store.sweep_at(Instant::now()).await }
        })
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
