//! Session affinity
//!
//! Maps a caller-chosen session key to one proxy for a bounded lifetime. The
//! map and its LRU order live under a single lock. Access order is tracked
//! with a monotonic counter rather than timestamps so concurrent touches
//! within the same clock tick still order correctly.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use super::to_chrono;
use crate::models::{Proxy, Session};

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Live sessions kept before the least recently used one is evicted (0 = unbounded)
    pub max_sessions: usize,
    /// Lifetime used when a caller does not give one
    pub default_timeout: Duration,
    /// Mutating operations between automatic expiry sweeps (0 disables)
    pub auto_cleanup_threshold: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10_000,
            default_timeout: Duration::from_secs(300),
            auto_cleanup_threshold: 100,
        }
    }
}

#[derive(Debug)]
struct Entry {
    session: Session,
    seq: u64,
}

#[derive(Debug, Default)]
struct SessionState {
    sessions: HashMap<String, Entry>,
    /// access sequence -> session id, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
    ops_since_cleanup: u64,
}

impl SessionState {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn remove(&mut self, id: &str) -> Option<Session> {
        let entry = self.sessions.remove(id)?;
        self.order.remove(&entry.seq);
        Some(entry.session)
    }

    fn promote(&mut self, id: &str) {
        let seq = self.next_seq();
        if let Some(entry) = self.sessions.get_mut(id) {
            self.order.remove(&entry.seq);
            entry.seq = seq;
            self.order.insert(seq, id.to_string());
        }
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, id) = self.order.pop_first()?;
        self.sessions.remove(&id);
        Some(id)
    }

    fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.session.is_expired_at(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        self.ops_since_cleanup = 0;
        expired.len()
    }
}

/// LRU + TTL map from session key to bound proxy
pub struct SessionManager {
    config: SessionConfig,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Bind `session_id` to `proxy`, replacing any previous binding
    pub fn create(&self, session_id: &str, proxy: &Proxy, timeout: Duration) -> Session {
        self.create_at(session_id, proxy.id(), timeout, Utc::now())
    }

    pub fn create_at(
        &self,
        session_id: &str,
        proxy_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Session {
        self.insert_at(session_id, proxy_id, timeout, now, 0)
    }

    /// Bind `session_id` to `proxy` and count the request that made the binding
    pub fn bind_for_request(&self, session_id: &str, proxy: &Proxy, timeout: Duration) -> Session {
        self.insert_at(session_id, proxy.id(), timeout, Utc::now(), 1)
    }

    fn insert_at(
        &self,
        session_id: &str,
        proxy_id: &str,
        timeout: Duration,
        now: DateTime<Utc>,
        request_count: u64,
    ) -> Session {
        let session = Session {
            session_id: session_id.to_string(),
            proxy_id: proxy_id.to_string(),
            created_at: now,
            last_used_at: now,
            expires_at: now + to_chrono(timeout),
            request_count,
        };

        let mut state = self.state.lock();
        self.tick(&mut state, now);
        state.remove(session_id);

        let max = self.config.max_sessions;
        if max > 0 && state.sessions.len() >= max {
            state.cleanup_expired(now);
            while state.sessions.len() >= max {
                match state.evict_lru() {
                    Some(evicted) => {
                        debug!(session_id = %evicted, "Evicted least recently used session")
                    }
                    None => break,
                }
            }
        }

        let seq = state.next_seq();
        state.order.insert(seq, session_id.to_string());
        state.sessions.insert(
            session_id.to_string(),
            Entry {
                session: session.clone(),
                seq,
            },
        );
        debug!(session_id = %session_id, proxy_id = %proxy_id, "Session bound");
        session
    }

    /// Live session for `session_id`, promoted to most recently used
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.get_at(session_id, Utc::now())
    }

    pub fn get_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        let mut state = self.state.lock();
        self.tick(&mut state, now);
        self.live(&mut state, session_id, now)?;
        state.promote(session_id);
        state.sessions.get(session_id).map(|e| e.session.clone())
    }

    /// Record a use of the session; false when it is missing or expired
    pub fn touch(&self, session_id: &str) -> bool {
        self.touch_at(session_id, Utc::now())
    }

    pub fn touch_at(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        self.get_and_touch_at(session_id, now).is_some()
    }

    /// Look up and record a use of the session under one lock
    ///
    /// Returns the session as it is after the use, or `None` when it is
    /// missing or expired.
    pub fn get_and_touch(&self, session_id: &str) -> Option<Session> {
        self.get_and_touch_at(session_id, Utc::now())
    }

    pub fn get_and_touch_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        let mut state = self.state.lock();
        self.tick(&mut state, now);
        self.live(&mut state, session_id, now)?;
        state.promote(session_id);
        let entry = state.sessions.get_mut(session_id)?;
        entry.session.request_count += 1;
        entry.session.last_used_at = now;
        Some(entry.session.clone())
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let mut state = self.state.lock();
        self.tick(&mut state, Utc::now());
        state.remove(session_id).is_some()
    }

    /// Drop every expired session, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    pub fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let removed = self.state.lock().cleanup_expired(now);
        if removed > 0 {
            debug!(removed, "Cleaned up expired sessions");
        }
        removed
    }

    pub fn clear_all(&self) {
        let mut state = self.state.lock();
        state.sessions.clear();
        state.order.clear();
        state.ops_since_cleanup = 0;
    }

    /// Non-expired sessions, least recently used first
    pub fn all(&self) -> Vec<Session> {
        self.all_at(Utc::now())
    }

    pub fn all_at(&self, now: DateTime<Utc>) -> Vec<Session> {
        let state = self.state.lock();
        state
            .order
            .values()
            .filter_map(|id| state.sessions.get(id))
            .filter(|entry| !entry.session.is_expired_at(now))
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Stored sessions, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().sessions.is_empty()
    }

    /// Drop `session_id` if expired; `None` means it is gone
    fn live(&self, state: &mut SessionState, session_id: &str, now: DateTime<Utc>) -> Option<()> {
        let expired = state.sessions.get(session_id)?.session.is_expired_at(now);
        if expired {
            state.remove(session_id);
            debug!(session_id = %session_id, "Session expired");
            return None;
        }
        Some(())
    }

    fn tick(&self, state: &mut SessionState, now: DateTime<Utc>) {
        if self.config.auto_cleanup_threshold == 0 {
            return;
        }
        state.ops_since_cleanup += 1;
        if state.ops_since_cleanup >= self.config.auto_cleanup_threshold {
            let removed = state.cleanup_expired(now);
            if removed > 0 {
                debug!(removed, "Automatic session sweep");
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
