//! Administrative operations, shared by the `admin_cli` binary's
//! subcommands: one function per privileged operation on users, sessions,
//! and failed-attempt records.

use chrono::DateTime;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::crypto;
use crate::error::{AppError, AppResult};
use crate::model::{PreferredContactMethod, ScalarValue, User};
use crate::vault;

/// Renders a Unix timestamp the way the admin CLI's human-facing listings
/// do (`%Y-%m-%d %H:%M:%S`, UTC).
fn human_timestamp(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Resolves the session id (the raw bearer token) supplied as the admin
/// CLI's first positional argument to the `dev_admin` user that owns it:
/// validate the token, or fail. There is no separate admin credential to
/// check here, since only a token minted by a `Surface::Admin` login
/// (which already gated on `dev_admin`) can resolve to anything at all.
pub fn authenticate_session(state: &AppState, raw_session_token: &str) -> AppResult<User> {
    let token = state
        .tokens
        .validate(raw_session_token)?
        .ok_or_else(|| AppError::Unauthorized("Invalid or expired session.".into()))?;
    let user = state
        .users
        .find_by_id(&token.user_id)?
        .ok_or_else(|| AppError::Unauthorized("Account no longer exists.".into()))?;
    if !user.dev_admin {
        return Err(AppError::Forbidden("This account is not permitted to use the admin surface.".into()));
    }
    Ok(user)
}

pub fn list_users(state: &AppState) -> AppResult<Value> {
    let users = state.users.list_all()?;
    let out: Vec<Value> = users
        .iter()
        .map(|u| {
            let failed_attempts = state.failed_attempts.count_recent(&u.username).unwrap_or(0);
            json!({
                "id": u.id,
                "username": u.username,
                "first_name": u.first_name,
                "last_name": u.last_name,
                "email": u.email,
                "phone": u.phone,
                "preferred_contact_method": u.preferred_contact_method,
                "admin": u.admin,
                "dev_admin": u.dev_admin,
                "2fa_enabled": u.two_fa_enabled,
                "root_auth": u.root_auth,
                "vault_len": u.vault_len(),
                "frozen": u.freeze,
                "failed_attempts": failed_attempts,
            })
        })
        .collect();
    Ok(json!({ "users": out }))
}

/// Tokens joined to their owning user (spec.md §4.8): each entry carries
/// the redacted `value` (never the raw bearer or its hash), the owning
/// `username`, and a human-rendered `login_time` (the token's `auth_time`).
pub fn list_sessions(state: &AppState) -> AppResult<Value> {
    let tokens = state.tokens.list_all()?;
    let users = state.users.list_all()?;
    let out: Vec<Value> = tokens
        .iter()
        .map(|t| {
            let username = users.iter().find(|u| u.id == t.user_id).map(|u| u.username.clone());
            json!({
                "session_id": t.token_id,
                "value": t.safe_log,
                "username": username,
                "login_time": human_timestamp(t.auth_time),
                "user_id": t.user_id,
            })
        })
        .collect();
    Ok(json!({ "sessions": out }))
}

/// Flattened failure log (spec.md §4.8): one header entry per username
/// with `timestamp: null`, followed by one entry per recorded failure with
/// a human-rendered timestamp.
pub fn list_attempts(state: &AppState) -> AppResult<Value> {
    let attempts = state.failed_attempts.list_all()?;
    let mut out: Vec<Value> = Vec::new();
    for (username, entries) in &attempts {
        out.push(json!({ "username": username, "timestamp": Value::Null }));
        for entry in entries {
            out.push(json!({
                "username": username,
                "timestamp": human_timestamp(entry.timestamp),
            }));
        }
    }
    Ok(json!({ "attempts": out }))
}

pub fn logout_user(state: &AppState, target_user_id: &str) -> AppResult<()> {
    state.tokens.remove_all_for_user(target_user_id)
}

/// Revokes only the token the caller authenticated this admin operation
/// with, leaving the operator's other sessions (if any) untouched.
pub fn logout_self(state: &AppState, raw_session_token: &str) -> AppResult<()> {
    state.tokens.remove(raw_session_token)
}

pub fn logout_all(state: &AppState) -> AppResult<()> {
    state.tokens.clear_all()
}

pub fn clear_all_attempts(state: &AppState) -> AppResult<()> {
    state.failed_attempts.clear_all()
}

/// `clear_attempts` is the one action that never touches the user record:
/// it looks up the username and clears that user's failed-attempt
/// history, returning early without saving users at all.
pub fn user_action(state: &AppState, target_user_id: &str, action: &str) -> AppResult<()> {
    if action == "clear_attempts" {
        let user = state
            .users
            .find_by_id(target_user_id)?
            .ok_or_else(|| AppError::Argument("No such user.".into()))?;
        return state.failed_attempts.clear_user(&user.username);
    }

    let updated = state.users.update(target_user_id, |u| match action {
        "freeze" => u.freeze = true,
        "unfreeze" => u.freeze = false,
        "promote_app_admin" => u.admin = true,
        "demote_app_admin" => u.admin = false,
        "promote_dev_admin" => u.dev_admin = true,
        "demote_dev_admin" => u.dev_admin = false,
        "grant_root_auth" => u.root_auth = true,
        "revoke_root_auth" => u.root_auth = false,
        _ => {}
    })?;

    if !updated {
        return Err(AppError::Argument("No such user.".into()));
    }
    if !matches!(
        action,
        "freeze" | "unfreeze" | "promote_app_admin" | "demote_app_admin" | "promote_dev_admin"
            | "demote_dev_admin" | "grant_root_auth" | "revoke_root_auth"
    ) {
        return Err(AppError::Argument(format!("Unknown action: {action}")));
    }
    Ok(())
}

/// Creates a user from `username`/`password` plus arbitrary `key=value`
/// overrides (already coerced via `ScalarValue::auto_cast`). Recognized
/// keys land on first-class `User` fields; anything else is kept in
/// `extras`.
pub fn create_user(state: &AppState, username: &str, password: &str, overrides: Vec<(String, ScalarValue)>) -> AppResult<String> {
    if state.users.find_by_username(username)?.is_some() {
        return Err(AppError::Conflict("Username already exists.".into()));
    }

    let salt = hex::encode(crypto::generate_salt());
    let base_key = crypto::derive_login_secret(password, &salt)?;
    let master_key = vault::generate_master_key();
    let wrapped = vault::wrap_long_term(&base_key, &master_key);

    let mut user = User {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        password_hash: crypto::hash_password(password),
        salt,
        root: false,
        root_auth: false,
        admin: false,
        dev_admin: false,
        freeze: false,
        two_fa_enabled: false,
        two_fa_setup_complete: false,
        two_fa_secret: None,
        first_name: None,
        last_name: None,
        email: None,
        phone: None,
        preferred_contact_method: PreferredContactMethod::Email,
        vault: None,
        vault_master_key_wrapped: Some(wrapped),
        extras: Default::default(),
    };

    for (key, value) in overrides {
        apply_override(&mut user, &key, value);
    }

    let id = user.id.clone();
    state.users.insert(user)?;
    Ok(id)
}

fn apply_override(user: &mut User, key: &str, value: ScalarValue) {
    match (key, value) {
        ("admin", ScalarValue::Bool(b)) => user.admin = b,
        ("dev_admin", ScalarValue::Bool(b)) => user.dev_admin = b,
        ("root_auth", ScalarValue::Bool(b)) => user.root_auth = b,
        ("freeze", ScalarValue::Bool(b)) => user.freeze = b,
        ("2fa_enabled", ScalarValue::Bool(b)) => user.two_fa_enabled = b,
        ("first_name", ScalarValue::String(s)) => user.first_name = Some(s),
        ("last_name", ScalarValue::String(s)) => user.last_name = Some(s),
        ("email", ScalarValue::String(s)) => user.email = Some(s),
        ("phone", ScalarValue::String(s)) => user.phone = Some(s),
        (key, value) => {
            user.extras.insert(key.to_string(), value);
        }
    }
}
