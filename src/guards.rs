//! Request guards: the axum extractor that implements the shared
//! `auth_guard` steps (token required, root rejected on the public
//! surface, freeze check with cookie-clearing), plus the smaller
//! building blocks handlers compose for the steps that vary per endpoint
//! (admin-only, CSRF-protected, vault-key-bearing).

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use time::Duration;

use crate::app_state::AppState;
use crate::crypto::{self, Key32};
use crate::error::{AppError, AppResult};
use crate::model::{Token, User};
use crate::vault;

pub const AUTH_TOKEN_COOKIE: &str = "auth_token";
pub const AUTH_KEY_COOKIE: &str = "auth_key";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// The authenticated caller, resolved by `FromRequestParts`. Carries
/// everything a handler needs to apply whichever additional gates its
/// endpoint requires (admin-only, CSRF, vault access).
pub struct AuthUser {
    pub user: User,
    pub token: Token,
    pub raw_token: String,
    pub session_id: String,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let raw_token = jar
            .get(AUTH_TOKEN_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(|| AppError::Unauthorized("Authentication required.".into()))?;

        let token = state
            .tokens
            .validate(&raw_token)?
            .ok_or_else(|| AppError::Unauthorized("Session has expired. Please log in again.".into()))?;

        let user = state
            .users
            .find_by_id(&token.user_id)?
            .ok_or_else(|| AppError::Unauthorized("Account no longer exists.".into()))?;

        if user.root {
            return Err(AppError::Forbidden(
                "Root accounts must use the administrative interface.".into(),
            ));
        }

        if user.freeze {
            return Err(AppError::Forbidden("Account is frozen.".into()));
        }

        let session_id = state.tokens.hash_token(&raw_token);

        Ok(AuthUser {
            user,
            token,
            raw_token,
            session_id,
        })
    }
}

pub fn require_admin(user: &User) -> AppResult<()> {
    if user.admin {
        Ok(())
    } else {
        Err(AppError::Forbidden("Administrative privileges required.".into()))
    }
}

pub fn require_csrf(token: &Token, headers: &HeaderMap) -> AppResult<()> {
    let header_value = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Forbidden("Missing CSRF token.".into()))?;
    if crypto::constant_time_eq_str(&token.csrf, header_value) {
        Ok(())
    } else {
        Err(AppError::Forbidden("Invalid CSRF token.".into()))
    }
}

/// Recovers the vault master key for the current request: unwraps the
/// `auth_key` cookie under the session-bound KEK, which in turn requires
/// the process-memory session entry (the PBKDF2 base key) to still be
/// alive. A process restart invalidates every `auth_key` cookie even
/// though the underlying `auth_token` may still be valid.
pub fn vault_master_key(state: &AppState, session_id: &str, jar: &CookieJar) -> AppResult<Key32> {
    let base_key = state
        .sessions
        .get(session_id)
        .ok_or_else(|| AppError::Unauthorized("Session expired; please log in again to access the vault.".into()))?;
    let wrapped = jar
        .get(AUTH_KEY_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| AppError::Unauthorized("Missing vault authentication key.".into()))?;
    let kek = vault::session_kek(&base_key, session_id);
    vault::unwrap_master_key(&kek, &wrapped)
}

fn base_cookie<'a>(name: &'a str, value: String, http_only: bool, use_https: bool, max_age: Duration) -> Cookie<'a> {
    Cookie::build((name, value))
        .path("/")
        .http_only(http_only)
        .secure(use_https)
        .same_site(if http_only { SameSite::Strict } else { SameSite::Lax })
        .max_age(max_age)
        .build()
}

/// Builds the three response cookies issued on a successful login or
/// password change: `auth_token` (bearer, HttpOnly), `auth_key` (wrapped
/// vault master key, HttpOnly), and `csrf_token` (readable by client-side
/// script, so it can be echoed back in the `X-CSRF-Token` header).
pub fn build_auth_cookies(
    use_https: bool,
    token_age_seconds: i64,
    raw_token: &str,
    csrf: &str,
    session_id: &str,
    base_key: &Key32,
    master_key: &Key32,
) -> [Cookie<'static>; 3] {
    let max_age = Duration::seconds(token_age_seconds);
    let kek = vault::session_kek(base_key, session_id);
    let wrapped_master_key = vault::wrap_master_key(&kek, master_key);

    [
        base_cookie(AUTH_TOKEN_COOKIE, raw_token.to_string(), true, use_https, max_age),
        base_cookie(AUTH_KEY_COOKIE, wrapped_master_key, true, use_https, max_age),
        base_cookie(CSRF_COOKIE, csrf.to_string(), false, use_https, max_age),
    ]
}

/// The three expiring cookies set on logout / freeze / forced logout.
pub fn clear_auth_cookies(use_https: bool) -> [Cookie<'static>; 3] {
    let expired = Duration::seconds(0);
    [
        base_cookie(AUTH_TOKEN_COOKIE, String::new(), true, use_https, expired),
        base_cookie(AUTH_KEY_COOKIE, String::new(), true, use_https, expired),
        base_cookie(CSRF_COOKIE, String::new(), false, use_https, expired),
    ]
}
