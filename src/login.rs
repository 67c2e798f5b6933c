//! Authentication state machine, shared by the public HTTP surface
//! and the admin CLI surface. `authenticate` implements the same decision
//! tree for both; the admin surface adds one extra gate (`dev_admin`
//! required) at the credential-check step.

use std::sync::OnceLock;

use uuid::Uuid;

use crate::app_state::AppState;
use crate::crypto::{self, Key32};
use crate::error::{AppError, AppResult};
use crate::model::User;
use crate::tokens::IssuedToken;
use crate::vault;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Surface {
    Public,
    Admin,
}

/// Numeric login outcome codes, stable across both surfaces (the admin
/// CLI prints these directly; the HTTP handlers map them to status codes
/// and messages).
pub mod code {
    pub const ROOT_SUCCESS: u8 = 0;
    pub const SUCCESS: u8 = 1;
    pub const CREDENTIALS_INVALID: u8 = 2;
    pub const TWO_FA_REQUIRED: u8 = 3;
    pub const TWO_FA_INVALID: u8 = 4;
    pub const TWO_FA_SETUP_REQUIRED: u8 = 5;
    pub const LOCKED: u8 = 6;
    pub const FROZEN: u8 = 7;
}

pub struct Authenticated {
    pub user: User,
    pub issued: IssuedToken,
    pub session_id: String,
    /// `code::ROOT_SUCCESS` if `user.root_auth`, else `code::SUCCESS`.
    pub code: u8,
}

pub enum AuthOutcome {
    Success(Box<Authenticated>),
    TwoFaSetupRequired { totp_uri: String },
    Failure { code: u8, message: String },
}

/// A fixed PBKDF2 hash verified against on every unknown-username or
/// locked-out attempt, so the credential check always costs the same
/// amount of CPU time whether or not a matching user exists.
fn dummy_hash() -> &'static str {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| crypto::hash_password("dummy-password-for-timing-parity"))
}

/// Floor division, matching the original's `int(window - elapsed) // 60`:
/// 899 remaining seconds reports "14 minutes", not "15".
fn remaining_lockout_minutes(oldest_failure: i64, window_seconds: i64, now: i64) -> i64 {
    let remaining_seconds = (oldest_failure + window_seconds - now).max(0);
    remaining_seconds / 60
}

/// Ordered decision tree: bootstrap, lockout, credentials (equalized by
/// always hashing), freeze, root-vs-public, 2FA, success. Each step's
/// ordering and side effects (which branches append a failed attempt)
/// is load-bearing — do not reorder.
pub fn authenticate(
    state: &AppState,
    username: &str,
    password: &str,
    totp_code: Option<&str>,
    surface: Surface,
) -> AppResult<AuthOutcome> {
    if state.users.is_empty()? {
        let (_user, totp_uri) = create_initial_admin(state, username, password)?;
        return Ok(AuthOutcome::TwoFaSetupRequired { totp_uri });
    }

    let user_opt = state.users.find_by_username(username)?;

    if let Some(oldest) = state.failed_attempts.oldest_recent(username)? {
        let attempt_count = state.failed_attempts.count_recent(username)?;
        if attempt_count >= state.settings.max_login_failures {
            let _ = crypto::verify_password(password, dummy_hash());
            let minutes = remaining_lockout_minutes(oldest, state.settings.lockout_login_window, chrono::Utc::now().timestamp());
            return Ok(AuthOutcome::Failure {
                code: code::LOCKED,
                message: format!("Try again in {minutes} minutes."),
            });
        }
    }

    let credentials_ok = match &user_opt {
        Some(user) => crypto::verify_password(password, &user.password_hash),
        None => {
            let _ = crypto::verify_password(password, dummy_hash());
            false
        }
    };
    let admin_gate_ok = match (&user_opt, surface) {
        (Some(user), Surface::Admin) => user.dev_admin,
        _ => true,
    };

    if !credentials_ok || !admin_gate_ok {
        state.failed_attempts.record_failure(username)?;
        return Ok(AuthOutcome::Failure {
            code: code::CREDENTIALS_INVALID,
            message: "Credentials do not match.".to_string(),
        });
    }

    let user = user_opt.expect("credentials_ok is only true when a user was found");

    if user.freeze {
        return Ok(AuthOutcome::Failure {
            code: code::FROZEN,
            message: "Account is frozen.".to_string(),
        });
    }

    if user.root && surface == Surface::Public {
        // Indistinguishable from a bad-credentials response, including the
        // failure-list side effect: a genuine credential failure against
        // this username would also have incremented the lockout counter.
        state.failed_attempts.record_failure(username)?;
        return Ok(AuthOutcome::Failure {
            code: code::CREDENTIALS_INVALID,
            message: "Credentials do not match.".to_string(),
        });
    }

    if state.settings.enable_2fa && (user.two_fa_enabled || state.settings.require_2fa) {
        if user.two_fa_secret.is_none() {
            let secret = crypto::generate_totp_secret();
            state.users.update(&user.id, |u| {
                u.two_fa_secret = Some(secret);
                u.two_fa_setup_complete = false;
            })?;
        }
        let user = state
            .users
            .find_by_id(&user.id)?
            .ok_or_else(|| AppError::internal("user vanished mid-2FA-gate"))?;
        let secret = user.two_fa_secret.clone().unwrap_or_default();

        if !user.two_fa_setup_complete {
            match totp_code {
                None => {
                    let uri = crypto::totp_provisioning_uri(&state.settings.app_name, &user.username, &secret);
                    return Ok(AuthOutcome::TwoFaSetupRequired { totp_uri: uri });
                }
                Some(submitted) => {
                    if !crypto::totp_verify(&secret, submitted) {
                        return Ok(AuthOutcome::Failure {
                            code: code::TWO_FA_INVALID,
                            message: "Invalid two-factor authentication code.".to_string(),
                        });
                    }
                    state.users.update(&user.id, |u| u.two_fa_setup_complete = true)?;
                }
            }
        } else {
            match totp_code {
                None => {
                    return Ok(AuthOutcome::Failure {
                        code: code::TWO_FA_REQUIRED,
                        message: "Two-factor authentication code required.".to_string(),
                    })
                }
                Some(submitted) => {
                    if !crypto::totp_verify(&secret, submitted) {
                        return Ok(AuthOutcome::Failure {
                            code: code::TWO_FA_INVALID,
                            message: "Invalid two-factor authentication code.".to_string(),
                        });
                    }
                }
            }
        }
    }

    let user = state
        .users
        .find_by_id(&user.id)?
        .ok_or_else(|| AppError::internal("user vanished before token issuance"))?;

    state.failed_attempts.clear_user(username)?;
    let base_key = crypto::derive_login_secret(password, &user.salt)?;
    state.tokens.remove_all_for_user(&user.id)?;
    let issued = state.tokens.issue(&user.id)?;
    let session_id = state.tokens.hash_token(&issued.raw_token);
    state.sessions.create_with_id(&session_id, base_key);

    let code = if user.root_auth { code::ROOT_SUCCESS } else { code::SUCCESS };

    Ok(AuthOutcome::Success(Box::new(Authenticated {
        user,
        issued,
        session_id,
        code,
    })))
}

/// Creates the sole root/dev-admin account when the user store is empty.
/// Reachable from whichever surface (public or admin) issues the
/// first-ever login call, and only while zero users exist.
pub fn create_initial_admin(state: &AppState, username: &str, password: &str) -> AppResult<(User, String)> {
    if !state.users.is_empty()? {
        return Err(AppError::Conflict("Users already exist; bootstrap is no longer available.".into()));
    }

    let salt = hex::encode(crypto::generate_salt());
    let secret = crypto::generate_totp_secret();
    let user = User {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        password_hash: crypto::hash_password(password),
        salt,
        root: true,
        root_auth: true,
        admin: true,
        dev_admin: true,
        freeze: false,
        two_fa_enabled: true,
        two_fa_setup_complete: false,
        two_fa_secret: Some(secret.clone()),
        first_name: None,
        last_name: None,
        email: None,
        phone: None,
        preferred_contact_method: Default::default(),
        vault: None,
        vault_master_key_wrapped: None,
        extras: Default::default(),
    };
    state.users.insert(user.clone())?;

    let uri = crypto::totp_provisioning_uri(&state.settings.app_name, username, &secret);
    Ok((user, uri))
}

/// Creates a new user from the template profile (all optional profile
/// fields gated behind the `DEFAULT_USER_TAKE_*` settings), generates a
/// fresh vault master key, and wraps it under the new password's
/// long-term KEK. Returns the new user's id.
pub struct SignupProfile {
    pub full_name: Option<(String, String)>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

pub fn signup(state: &AppState, username: &str, password: &str, profile: SignupProfile) -> AppResult<String> {
    if state.users.find_by_username(username)?.is_some() {
        return Err(AppError::Conflict("Username already exists.".into()));
    }

    let salt = hex::encode(crypto::generate_salt());
    let base_key = crypto::derive_login_secret(password, &salt)?;
    let master_key = vault::generate_master_key();
    let wrapped = vault::wrap_long_term(&base_key, &master_key);

    let settings = &state.settings;
    let (first_name, last_name) = if settings.default_user_take_full_name {
        profile.full_name.unzip()
    } else {
        (None, None)
    };
    let email = if settings.default_user_take_email {
        profile.email.or_else(|| Some(settings.template_user_email.clone()))
    } else {
        None
    };
    let phone = if settings.default_user_take_phone {
        profile.phone.or_else(|| Some(settings.template_user_phone.clone()))
    } else {
        None
    };

    let two_fa_secret = if settings.default_user_2fa {
        Some(crypto::generate_totp_secret())
    } else {
        None
    };

    let user = User {
        id: Uuid::new_v4().to_string(),
        username: username.to_string(),
        password_hash: crypto::hash_password(password),
        salt,
        root: false,
        root_auth: false,
        admin: false,
        dev_admin: false,
        freeze: false,
        two_fa_enabled: settings.default_user_2fa,
        two_fa_setup_complete: false,
        two_fa_secret,
        first_name,
        last_name,
        email,
        phone,
        preferred_contact_method: Default::default(),
        vault: None,
        vault_master_key_wrapped: Some(wrapped),
        extras: Default::default(),
    };
    let id = user.id.clone();
    state.users.insert(user)?;
    Ok(id)
}

/// Begins TOTP enrollment for an already-authenticated user: generates a
/// secret, stores it unconfirmed, and returns the provisioning URI.
pub fn enable_2fa_begin(state: &AppState, user_id: &str) -> AppResult<String> {
    let secret = crypto::generate_totp_secret();
    let username = state
        .users
        .find_by_id(user_id)?
        .ok_or_else(|| AppError::Unauthorized("Account no longer exists.".into()))?
        .username;
    let uri = crypto::totp_provisioning_uri(&state.settings.app_name, &username, &secret);

    let updated = state.users.update(user_id, |u| {
        u.two_fa_secret = Some(secret);
        u.two_fa_enabled = true;
        u.two_fa_setup_complete = false;
    })?;
    if !updated {
        return Err(AppError::Unauthorized("Account no longer exists.".into()));
    }
    Ok(uri)
}

/// Confirms TOTP enrollment by checking one code against the pending
/// secret, flipping `two_fa_setup_complete` on success.
pub fn enable_2fa_confirm(state: &AppState, user_id: &str, code: &str) -> AppResult<()> {
    let user = state
        .users
        .find_by_id(user_id)?
        .ok_or_else(|| AppError::Unauthorized("Account no longer exists.".into()))?;
    let secret = user
        .two_fa_secret
        .ok_or_else(|| AppError::Conflict("Two-factor enrollment was not started.".into()))?;
    if !crypto::totp_verify(&secret, code) {
        return Err(AppError::Unauthorized("Invalid two-factor authentication code.".into()));
    }
    state.users.update(user_id, |u| {
        u.two_fa_setup_complete = true;
    })?;
    Ok(())
}

pub fn disable_2fa(state: &AppState, user_id: &str) -> AppResult<()> {
    let updated = state.users.update(user_id, |u| {
        u.two_fa_enabled = false;
        u.two_fa_setup_complete = false;
        u.two_fa_secret = None;
    })?;
    if !updated {
        return Err(AppError::Unauthorized("Account no longer exists.".into()));
    }
    Ok(())
}

pub struct PasswordChangeOutcome {
    pub session_id: String,
    pub issued: IssuedToken,
}

/// Full change-password protocol: re-verify the current password, check
/// the change is happening within `PW_CHANGE_AUTH_WINDOW` of the token's
/// `auth_time`, hash the new password, rewrap the vault master key under
/// the new base key, revoke every outstanding token for this user, and
/// issue one fresh token/session pair for the caller so they stay logged
/// in under the new credentials.
pub fn change_password(
    state: &AppState,
    user_id: &str,
    old_password: &str,
    new_password: &str,
    token_auth_time: i64,
) -> AppResult<PasswordChangeOutcome> {
    let user = state
        .users
        .find_by_id(user_id)?
        .ok_or_else(|| AppError::Unauthorized("Account no longer exists.".into()))?;

    if !crypto::verify_password(old_password, &user.password_hash) {
        return Err(AppError::Unauthorized("Current password is incorrect.".into()));
    }

    let now = chrono::Utc::now().timestamp();
    if now - token_auth_time > state.settings.pw_change_auth_window {
        return Err(AppError::Unauthorized(
            "Re-authentication required before changing your password.".into(),
        ));
    }

    let old_base_key = crypto::derive_login_secret(old_password, &user.salt)?;
    let new_salt = hex::encode(crypto::generate_salt());
    let new_base_key = crypto::derive_login_secret(new_password, &new_salt)?;

    let new_wrapped = match &user.vault_master_key_wrapped {
        Some(wrapped) => Some(vault::rewrap_on_password_change(&old_base_key, &new_base_key, wrapped)?),
        None => None,
    };
    let new_hash = crypto::hash_password(new_password);

    state.users.update(user_id, |u| {
        u.password_hash = new_hash;
        u.salt = new_salt;
        u.vault_master_key_wrapped = new_wrapped;
    })?;

    state.tokens.remove_all_for_user(user_id)?;

    let issued = state.tokens.issue(user_id)?;
    let session_id = state.tokens.hash_token(&issued.raw_token);
    state.sessions.create_with_id(&session_id, new_base_key);

    Ok(PasswordChangeOutcome { session_id, issued })
}

pub fn logout(state: &AppState, session_id: &str, raw_token: &str) -> AppResult<()> {
    state.sessions.destroy(session_id);
    state.tokens.remove(raw_token)
}

pub fn force_logout(state: &AppState, user_id: &str) -> AppResult<()> {
    state.tokens.remove_all_for_user(user_id)
}

pub fn base_key_for_session(state: &AppState, session_id: &str) -> Option<Key32> {
    state.sessions.get(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_lockout_minutes_floors_not_ceils() {
        // spec.md §8 scenario 3: 899s left in a 900s window reports
        // "14 minutes", not a ceiling-rounded "15".
        assert_eq!(remaining_lockout_minutes(0, 900, 1), 14);
        assert_eq!(remaining_lockout_minutes(0, 900, 0), 15);
        assert_eq!(remaining_lockout_minutes(0, 900, 840), 1);
        assert_eq!(remaining_lockout_minutes(0, 900, 900), 0);
        assert_eq!(remaining_lockout_minutes(0, 900, 1000), 0);
    }
}
