//! Downstream session registry.
//!
//! Sessions carry no per-client state beyond the negotiated protocol
//! version: upstream connections are owned by the aggregator and shared by
//! every session.
//!
//! # Design Decisions
//! - A session idle for longer than the configured timeout is gone; lookups
//!   treat it as unknown and a periodic sweep reclaims the entry
//! - The number of live sessions is capped; `initialize` beyond the cap is
//!   refused rather than evicting someone else's session

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Session {
    created_at: Instant,
    last_seen: Instant,
    protocol_version: String,
}

/// Raised by [`SessionStore::create`] when the store is full.
#[derive(Debug, thiserror::Error)]
#[error("session limit of {0} reached")]
pub struct SessionLimitReached(pub usize);

/// Concurrent map of live `Mcp-Session-Id` values.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            max_sessions,
        }
    }

    /// Register a new session and return its id.
    pub fn create(&self, protocol_version: &str) -> Result<String, SessionLimitReached> {
        if self.sessions.len() >= self.max_sessions && self.sweep() == 0 {
            return Err(SessionLimitReached(self.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.sessions.insert(
            id.clone(),
            Session {
                created_at: now,
                last_seen: now,
                protocol_version: protocol_version.to_string(),
            },
        );
        Ok(id)
    }

    /// Mark a session as active and return its negotiated protocol version.
    /// Returns `None` for unknown or idle-expired sessions.
    pub fn touch(&self, id: &str) -> Option<String> {
        let mut session = self.sessions.get_mut(id)?;
        if session.last_seen.elapsed() > self.idle_timeout {
            drop(session);
            self.sessions.remove(id);
            tracing::debug!(session_id = id, "Session expired");
            return None;
        }
        session.last_seen = Instant::now();
        Some(session.protocol_version.clone())
    }

    /// Remove a session. Returns `false` if it was unknown.
    pub fn remove(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                tracing::debug!(
                    session_id = id,
                    age_ms = session.created_at.elapsed().as_millis() as u64,
                    "Session terminated"
                );
                true
            }
            None => false,
        }
    }

    /// Drop every session idle for longer than the timeout. Returns how many went.
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| session.last_seen.elapsed() <= self.idle_timeout);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, remaining = self.sessions.len(), "Expired idle sessions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
