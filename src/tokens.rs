//! Persisted auth-token lifecycle: issuance, validation, CSRF
//! comparison, and revocation. Tokens are stored keyed by an HMAC of the
//! raw bearer value (under `ENCAPSILATION_KEY`) rather than the raw value
//! itself, so a leaked `tokens.json` cannot be replayed directly.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use rand::RngCore;

use crate::crypto::{self, Key32};
use crate::error::{AppError, AppResult};
use crate::model::Token;
use crate::persistence;

pub struct TokenStore {
    path: PathBuf,
    token_key: Key32,
    encapsilation_key: [u8; 32],
    token_age_seconds: i64,
    lock: Mutex<()>,
}

/// A freshly issued token: the raw bearer value (what goes in the
/// `auth_token` cookie) plus the CSRF value (what goes in the readable
/// `csrf_token` cookie). Neither is ever written to disk in this form.
pub struct IssuedToken {
    pub raw_token: String,
    pub csrf: String,
    pub auth_time: i64,
    pub expires_at: i64,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

impl TokenStore {
    pub fn new(path: PathBuf, token_key: Key32, encapsilation_key: [u8; 32], token_age_seconds: i64) -> Self {
        Self {
            path,
            token_key,
            encapsilation_key,
            token_age_seconds,
            lock: Mutex::new(()),
        }
    }

    /// Hashes a raw bearer token the same way on issuance and on lookup.
    pub fn hash_token(&self, raw_token: &str) -> String {
        crypto::hmac_hex(&self.encapsilation_key, raw_token.as_bytes())
    }

    /// `"***" + last 4 chars` of a raw bearer token, computed once at
    /// issuance and persisted on the token record. Never write the full
    /// raw token or its hash to the log stream.
    fn safe_log(raw_token: &str) -> String {
        let tail_len = raw_token.len().min(4);
        format!("***{}", &raw_token[raw_token.len() - tail_len..])
    }

    fn load(&self) -> AppResult<Vec<Token>> {
        persistence::read_tokens(&self.path, &self.token_key)
    }

    fn save(&self, tokens: &[Token]) -> AppResult<()> {
        persistence::write_tokens(&self.path, &self.token_key, &tokens.to_vec())
    }

    /// Issues a new token for `user_id`, pruning expired tokens first.
    pub fn issue(&self, user_id: &str) -> AppResult<IssuedToken> {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now().timestamp();

        let mut tokens = self.load()?;
        tokens.retain(|t| t.expires_at > now);

        let raw_token = random_hex(32);
        let csrf = random_hex(32);
        let token_id = self.hash_token(&raw_token);
        let expires_at = now + self.token_age_seconds;
        let safe_log = Self::safe_log(&raw_token);

        tokens.push(Token {
            token_id,
            user_id: user_id.to_string(),
            csrf: csrf.clone(),
            issued_at: now,
            auth_time: now,
            expires_at,
            safe_log,
        });
        self.save(&tokens)?;

        Ok(IssuedToken {
            raw_token,
            csrf,
            auth_time: now,
            expires_at,
        })
    }

    /// Resolves a raw bearer token to its persisted record, if valid and
    /// unexpired. Prunes expired entries as a side effect.
    pub fn validate(&self, raw_token: &str) -> AppResult<Option<Token>> {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now().timestamp();
        let token_id = self.hash_token(raw_token);

        let mut tokens = self.load()?;
        let before = tokens.len();
        tokens.retain(|t| t.expires_at > now);
        if tokens.len() != before {
            self.save(&tokens)?;
        }

        Ok(tokens.into_iter().find(|t| t.token_id == token_id))
    }

    pub fn verify_csrf(&self, token: &Token, header_value: &str) -> bool {
        crypto::constant_time_eq_str(&token.csrf, header_value)
    }

    /// Refreshes a token's `auth_time`, used after a fresh password
    /// re-verification inside the change-password authorization window.
    pub fn touch_auth_time(&self, raw_token: &str) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        let token_id = self.hash_token(raw_token);
        let now = Utc::now().timestamp();
        let mut tokens = self.load()?;
        if let Some(t) = tokens.iter_mut().find(|t| t.token_id == token_id) {
            t.auth_time = now;
        }
        self.save(&tokens)
    }

    pub fn remove(&self, raw_token: &str) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        let token_id = self.hash_token(raw_token);
        let mut tokens = self.load()?;
        tokens.retain(|t| t.token_id != token_id);
        self.save(&tokens)
    }

    pub fn remove_all_for_user(&self, user_id: &str) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        let mut tokens = self.load()?;
        tokens.retain(|t| t.user_id != user_id);
        self.save(&tokens)
    }

    pub fn list_for_user(&self, user_id: &str) -> AppResult<Vec<Token>> {
        let _guard = self.lock.lock().unwrap();
        let tokens = self.load()?;
        Ok(tokens.into_iter().filter(|t| t.user_id == user_id).collect())
    }

    pub fn list_all(&self) -> AppResult<Vec<Token>> {
        let _guard = self.lock.lock().unwrap();
        self.load()
    }

    pub fn clear_all(&self) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.save(&[])
    }

    /// Drops every token whose `expires_at` has passed.
    pub fn clean_expired(&self) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        let now = Utc::now().timestamp();
        let mut tokens = self.load()?;
        let before = tokens.len();
        tokens.retain(|t| t.expires_at > now);
        if tokens.len() != before {
            self.save(&tokens)?;
        }
        Ok(())
    }
}

pub fn map_missing_token() -> AppError {
    AppError::Unauthorized("Authentication required.".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_key32;

    fn store() -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::new(path, generate_key32(), [9u8; 32], 900);
        (dir, store)
    }

    #[test]
    fn issue_and_validate_round_trip() {
        let (_dir, store) = store();
        let issued = store.issue("user-1").unwrap();
        let token = store.validate(&issued.raw_token).unwrap().unwrap();
        assert_eq!(token.user_id, "user-1");
        assert_eq!(token.csrf, issued.csrf);
    }

    #[test]
    fn csrf_must_match_exactly() {
        let (_dir, store) = store();
        let issued = store.issue("user-1").unwrap();
        let token = store.validate(&issued.raw_token).unwrap().unwrap();
        assert!(store.verify_csrf(&token, &issued.csrf));
        assert!(!store.verify_csrf(&token, "wrong"));
    }

    #[test]
    fn remove_all_for_user_clears_only_that_user() {
        let (_dir, store) = store();
        let a = store.issue("user-a").unwrap();
        let b = store.issue("user-b").unwrap();
        store.remove_all_for_user("user-a").unwrap();
        assert!(store.validate(&a.raw_token).unwrap().is_none());
        assert!(store.validate(&b.raw_token).unwrap().is_some());
    }

    #[test]
    fn expired_tokens_are_pruned_on_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let store = TokenStore::new(path, generate_key32(), [9u8; 32], -1);
        let issued = store.issue("user-1").unwrap();
        assert!(store.validate(&issued.raw_token).unwrap().is_none());
    }
}
