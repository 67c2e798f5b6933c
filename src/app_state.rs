//! Shared server state: users and failed-attempt containers (each guarded
//! by their own lock spanning full read-modify-write cycles), the
//! in-memory session store, and the persisted token store. Wired together
//! once at startup and handed to the router as `Arc<AppState>`.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;

use crate::config::{Secrets, Settings};
use crate::crypto::Key32;
use crate::error::AppResult;
use crate::model::{FailedAttempt, FailedAttemptsMap, User};
use crate::persistence;
use crate::session::SessionStore;
use crate::tokens::TokenStore;

pub struct UsersStore {
    path: PathBuf,
    system_key: Key32,
    integrity_key: [u8; 32],
    replace_corrupted: bool,
    lock: Mutex<()>,
}

impl UsersStore {
    pub fn new(path: PathBuf, system_key: Key32, integrity_key: [u8; 32], replace_corrupted: bool) -> Self {
        Self {
            path,
            system_key,
            integrity_key,
            replace_corrupted,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> AppResult<Vec<User>> {
        persistence::read_signed(&self.path, &self.system_key, &self.integrity_key, self.replace_corrupted)
    }

    fn save(&self, users: &[User]) -> AppResult<()> {
        persistence::write_signed(&self.path, &self.system_key, &self.integrity_key, &users.to_vec())
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.is_empty())
    }

    pub fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.into_iter().find(|u| u.username == username))
    }

    pub fn find_by_id(&self, id: &str) -> AppResult<Option<User>> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.load()?.into_iter().find(|u| u.id == id))
    }

    pub fn list_all(&self) -> AppResult<Vec<User>> {
        let _guard = self.lock.lock().unwrap();
        self.load()
    }

    pub fn insert(&self, user: User) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        let mut users = self.load()?;
        users.push(user);
        self.save(&users)
    }

    /// Loads, applies `mutate` to the user matching `id`, and saves.
    /// Returns `false` without saving if no user matched.
    pub fn update<F: FnOnce(&mut User)>(&self, id: &str, mutate: F) -> AppResult<bool> {
        let _guard = self.lock.lock().unwrap();
        let mut users = self.load()?;
        let Some(user) = users.iter_mut().find(|u| u.id == id) else {
            return Ok(false);
        };
        mutate(user);
        self.save(&users)?;
        Ok(true)
    }
}

pub struct FailedAttemptsStore {
    path: PathBuf,
    system_key: Key32,
    integrity_key: [u8; 32],
    replace_corrupted: bool,
    lock: Mutex<()>,
    window_seconds: i64,
}

impl FailedAttemptsStore {
    pub fn new(
        path: PathBuf,
        system_key: Key32,
        integrity_key: [u8; 32],
        replace_corrupted: bool,
        window_seconds: i64,
    ) -> Self {
        Self {
            path,
            system_key,
            integrity_key,
            replace_corrupted,
            lock: Mutex::new(()),
            window_seconds,
        }
    }

    fn load(&self) -> AppResult<FailedAttemptsMap> {
        persistence::read_signed(&self.path, &self.system_key, &self.integrity_key, self.replace_corrupted)
    }

    fn save(&self, map: &FailedAttemptsMap) -> AppResult<()> {
        persistence::write_signed(&self.path, &self.system_key, &self.integrity_key, map)
    }

    /// Loads the container, prunes attempts for `username` older than the
    /// lockout window, and returns the surviving count.
    pub fn count_recent(&self, username: &str) -> AppResult<usize> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load()?;
        let now = Utc::now().timestamp();
        let changed = prune_user(&mut map, username, now, self.window_seconds);
        let count = map.get(username).map(|v| v.len()).unwrap_or(0);
        if changed {
            self.save(&map)?;
        }
        Ok(count)
    }

    /// Loads the container, prunes attempts for `username` older than the
    /// lockout window, and returns the oldest surviving timestamp, if any.
    pub fn oldest_recent(&self, username: &str) -> AppResult<Option<i64>> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load()?;
        let now = Utc::now().timestamp();
        let changed = prune_user(&mut map, username, now, self.window_seconds);
        let oldest = map.get(username).and_then(|v| v.iter().map(|a| a.timestamp).min());
        if changed {
            self.save(&map)?;
        }
        Ok(oldest)
    }

    pub fn record_failure(&self, username: &str) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load()?;
        let now = Utc::now().timestamp();
        prune_user(&mut map, username, now, self.window_seconds);
        map.entry(username.to_string())
            .or_default()
            .push(FailedAttempt { timestamp: now });
        self.save(&map)
    }

    pub fn clear_user(&self, username: &str) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load()?;
        map.remove(username);
        self.save(&map)
    }

    pub fn clear_all(&self) -> AppResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.save(&FailedAttemptsMap::new())
    }

    pub fn list_all(&self) -> AppResult<FailedAttemptsMap> {
        let _guard = self.lock.lock().unwrap();
        self.load()
    }
}

fn prune_user(map: &mut FailedAttemptsMap, username: &str, now: i64, window_seconds: i64) -> bool {
    let Some(attempts) = map.get_mut(username) else {
        return false;
    };
    let before = attempts.len();
    attempts.retain(|a| now - a.timestamp <= window_seconds);
    let changed = attempts.len() != before;
    if attempts.is_empty() {
        map.remove(username);
    }
    changed
}

pub struct AppState {
    pub settings: Settings,
    pub secrets: Secrets,
    pub sessions: SessionStore,
    pub tokens: TokenStore,
    pub users: UsersStore,
    pub failed_attempts: FailedAttemptsStore,
}

impl AppState {
    pub fn new(secrets: Secrets, settings: Settings) -> Self {
        let paths = settings.data_paths();
        let tokens = TokenStore::new(
            paths.tokens,
            Key32(secrets.token_key),
            secrets.encapsilation_key,
            settings.token_age,
        );
        let users = UsersStore::new(
            paths.users,
            Key32(secrets.system_key),
            secrets.integrity_key,
            settings.replace_corrupted_files,
        );
        let failed_attempts = FailedAttemptsStore::new(
            paths.failed_attempts,
            Key32(secrets.system_key),
            secrets.integrity_key,
            settings.replace_corrupted_files,
            settings.lockout_login_window,
        );
        Self {
            settings,
            secrets,
            sessions: SessionStore::new(),
            tokens,
            users,
            failed_attempts,
        }
    }
}
