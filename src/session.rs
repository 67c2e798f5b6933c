//! In-memory login session store. Holds the per-login `login_secret`
//! (the PBKDF2 base key) bound to a short-lived session id, from which the
//! session-scoped vault KEK is derived via HKDF. Never persisted: a
//! process restart invalidates every outstanding session, requiring a
//! fresh login before the vault can be unwrapped again.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use crate::crypto::Key32;

pub const SESSION_TTL_SECONDS: i64 = 3600;

struct SessionEntry {
    login_secret: Key32,
    expires_at: i64,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new session bound to `login_secret`, returning its id.
    pub fn create(&self, login_secret: Key32) -> String {
        let session_id = Uuid::new_v4().to_string();
        let expires_at = Utc::now().timestamp() + SESSION_TTL_SECONDS;
        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            SessionEntry {
                login_secret,
                expires_at,
            },
        );
        session_id
    }

    /// Registers a session under a caller-chosen id, overwriting any
    /// existing entry. Used for the dedicated "password-change" bootstrap
    /// context that rewraps the vault master key without a public session.
    pub fn create_with_id(&self, session_id: &str, login_secret: Key32) {
        let expires_at = Utc::now().timestamp() + SESSION_TTL_SECONDS;
        self.sessions.lock().unwrap().insert(
            session_id.to_string(),
            SessionEntry {
                login_secret,
                expires_at,
            },
        );
    }

    /// Returns the session's `login_secret`, or `None` if absent or
    /// expired. Expired entries are evicted on access.
    pub fn get(&self, session_id: &str) -> Option<Key32> {
        let mut sessions = self.sessions.lock().unwrap();
        let now = Utc::now().timestamp();
        match sessions.get(session_id) {
            Some(entry) if entry.expires_at > now => Some(entry.login_secret.clone()),
            Some(_) => {
                sessions.remove(session_id);
                None
            }
            None => None,
        }
    }

    pub fn destroy(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
    }

    pub fn cleanup_expired(&self) {
        let now = Utc::now().timestamp();
        self.sessions
            .lock()
            .unwrap()
            .retain(|_, entry| entry.expires_at > now);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key32;

    #[test]
    fn create_and_get_round_trip() {
        let store = SessionStore::new();
        let key = generate_key32();
        let id = store.create(key.clone());
        let fetched = store.get(&id).unwrap();
        assert_eq!(fetched.0, key.0);
    }

    #[test]
    fn destroy_removes_session() {
        let store = SessionStore::new();
        let id = store.create(generate_key32());
        store.destroy(&id);
        assert!(store.get(&id).is_none());
    }

    #[test]
    fn unknown_session_returns_none() {
        let store = SessionStore::new();
        assert!(store.get("nonexistent").is_none());
    }
}
