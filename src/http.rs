//! HTTP surface: router construction, security-headers middleware, and
//! the nine public endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::error::{AppError, AppResult};
use crate::guards::{self, AuthUser};
use crate::login::{self, AuthOutcome, Surface};
use crate::model::User;
use crate::rate_limit::RateLimitLayer;
use crate::vault;

/// Per-endpoint rate-limit budgets from spec.md §6, `(max_requests, window)`.
/// Each route gets its own `RateLimitLayer` (and so its own per-IP window
/// state) rather than sharing one flat budget across the whole surface.
const SIGNUP_BUDGET: (u32, Duration) = (10, Duration::from_secs(60));
const LOGIN_BUDGET: (u32, Duration) = (6, Duration::from_secs(60));
const LOGOUT_BUDGET: (u32, Duration) = (10, Duration::from_secs(60));
const ENABLE_2FA_BUDGET: (u32, Duration) = (6, Duration::from_secs(3600));
const DISABLE_2FA_BUDGET: (u32, Duration) = (1, Duration::from_secs(3600));
const VAULT_WRITE_BUDGET: (u32, Duration) = (3, Duration::from_secs(60));
const PASSWORD_CHANGE_BUDGET: (u32, Duration) = (3, Duration::from_secs(7 * 24 * 3600));
const READ_BUDGET: (u32, Duration) = (5, Duration::from_secs(60));

fn rate_limit((max_requests, window): (u32, Duration)) -> RateLimitLayer {
    RateLimitLayer::new(max_requests, window)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/signup",
            post(signup).route_layer(rate_limit(SIGNUP_BUDGET)),
        )
        .route(
            "/login",
            post(login_handler).route_layer(rate_limit(LOGIN_BUDGET)),
        )
        .route(
            "/logout",
            post(logout_handler).route_layer(rate_limit(LOGOUT_BUDGET)),
        )
        .route(
            "/enable_2fa",
            post(enable_2fa).route_layer(rate_limit(ENABLE_2FA_BUDGET)),
        )
        .route(
            "/disable_2fa",
            post(disable_2fa).route_layer(rate_limit(DISABLE_2FA_BUDGET)),
        )
        .route(
            "/set_vault_information",
            post(set_vault_information).route_layer(rate_limit(VAULT_WRITE_BUDGET)),
        )
        .route(
            "/get_personal_information",
            get(get_personal_information).route_layer(rate_limit(READ_BUDGET)),
        )
        .route(
            "/change_password",
            post(change_password).route_layer(rate_limit(PASSWORD_CHANGE_BUDGET)),
        )
        .route(
            "/get_all_users",
            get(get_all_users).route_layer(rate_limit(READ_BUDGET)),
        )
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_credentials(true)
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::HeaderName::from_static(guards::CSRF_HEADER),
                ]),
        )
        .with_state(state)
}

async fn security_headers(request: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; frame-ancestors 'none'",
        ),
    );
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
    );
    response
}

fn ok(message: &str) -> Response {
    (StatusCode::OK, Json(json!({"success": true, "message": message}))).into_response()
}

#[derive(Deserialize)]
struct SignupRequest {
    username: String,
    password: String,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
}

async fn signup(State(state): State<Arc<AppState>>, Json(req): Json<SignupRequest>) -> AppResult<Response> {
    let full_name = match (req.first_name, req.last_name) {
        (Some(f), Some(l)) => Some((f, l)),
        _ => None,
    };
    // PBKDF2 (600k iterations) runs on a blocking-pool thread so it never
    // stalls the async acceptor.
    tokio::task::spawn_blocking(move || {
        login::signup(
            &state,
            &req.username,
            &req.password,
            login::SignupProfile {
                full_name,
                email: req.email,
                phone: req.phone,
            },
        )
    })
    .await
    .map_err(AppError::internal)??;
    Ok((StatusCode::CREATED, Json(json!({"success": true, "message": "Account created."}))).into_response())
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    totp_code: Option<String>,
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> AppResult<Response> {
    let outcome = {
        let state = state.clone();
        let LoginRequest { username, password, totp_code } = req;
        tokio::task::spawn_blocking(move || {
            login::authenticate(&state, &username, &password, totp_code.as_deref(), Surface::Public)
        })
        .await
        .map_err(AppError::internal)??
    };

    match outcome {
        AuthOutcome::Success(auth) => {
            let user = state
                .users
                .find_by_id(&auth.user.id)?
                .ok_or_else(|| AppError::internal("user vanished between authenticate and cookie issuance"))?;
            let base_key = login::base_key_for_session(&state, &auth.session_id)
                .ok_or_else(|| AppError::internal("session vanished immediately after creation"))?;
            let master_key = match &user.vault_master_key_wrapped {
                Some(wrapped) => vault::unwrap_long_term(&base_key, wrapped)?,
                None => vault::generate_master_key(),
            };

            let cookies = guards::build_auth_cookies(
                state.settings.use_https,
                state.settings.token_age,
                &auth.issued.raw_token,
                &auth.issued.csrf,
                &auth.session_id,
                &base_key,
                &master_key,
            );
            let mut jar = jar;
            for cookie in cookies {
                jar = jar.add(cookie);
            }
            Ok((
                jar,
                Json(json!({"success": true, "code": auth.code, "message": "Logged in."})),
            )
                .into_response())
        }
        AuthOutcome::TwoFaSetupRequired { totp_uri } => Ok((
            StatusCode::OK,
            Json(json!({
                "success": false,
                "code": login::code::TWO_FA_SETUP_REQUIRED,
                "message": "Two-factor authentication setup is required.",
                "totp_uri": totp_uri,
            })),
        )
            .into_response()),
        AuthOutcome::Failure { code, message } => {
            Ok((StatusCode::OK, Json(json!({"success": false, "code": code, "message": message}))).into_response())
        }
    }
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
) -> AppResult<Response> {
    guards::require_csrf(&auth.token, &headers)?;
    login::logout(&state, &auth.session_id, &auth.raw_token)?;
    let mut jar = jar;
    for cookie in guards::clear_auth_cookies(state.settings.use_https) {
        jar = jar.add(cookie);
    }
    Ok((jar, ok("Logged out.")).into_response())
}

#[derive(Deserialize)]
struct TwoFaRequest {
    code: Option<String>,
}

async fn enable_2fa(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: axum::http::HeaderMap,
    Json(req): Json<TwoFaRequest>,
) -> AppResult<Response> {
    guards::require_csrf(&auth.token, &headers)?;
    match req.code {
        None => {
            let totp_uri = login::enable_2fa_begin(&state, &auth.user.id)?;
            Ok((StatusCode::OK, Json(json!({"success": true, "totp_uri": totp_uri}))).into_response())
        }
        Some(code) => {
            login::enable_2fa_confirm(&state, &auth.user.id, &code)?;
            Ok(ok("Two-factor authentication enabled."))
        }
    }
}

async fn disable_2fa(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: axum::http::HeaderMap,
) -> AppResult<Response> {
    guards::require_csrf(&auth.token, &headers)?;
    login::disable_2fa(&state, &auth.user.id)?;
    Ok(ok("Two-factor authentication disabled."))
}

#[derive(Deserialize)]
struct SetVaultRequest {
    vault: serde_json::Value,
}

async fn set_vault_information(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(req): Json<SetVaultRequest>,
) -> AppResult<Response> {
    guards::require_csrf(&auth.token, &headers)?;
    let master_key = guards::vault_master_key(&state, &auth.session_id, &jar)?;

    let plaintext = serde_json::to_vec(&req.vault).map_err(AppError::internal)?;
    let encrypted = vault::encrypt_vault_body(&master_key, &plaintext);

    let updated = state.users.update(&auth.user.id, |u| {
        u.vault = Some(encrypted);
    })?;
    if !updated {
        return Err(AppError::Unauthorized("Account no longer exists.".into()));
    }
    Ok(ok("Vault updated."))
}

fn redact_user(user: &User, vault: Option<serde_json::Value>) -> serde_json::Value {
    json!({
        "id": user.id,
        "username": user.username,
        "first_name": user.first_name,
        "last_name": user.last_name,
        "email": user.email,
        "phone": user.phone,
        "preferred_contact_method": user.preferred_contact_method,
        "admin": user.admin,
        "dev_admin": user.dev_admin,
        "2fa_enabled": user.two_fa_enabled,
        "2fa_setup_complete": user.two_fa_setup_complete,
        "root_auth": user.root_auth,
        "vault": vault,
    })
}

async fn get_personal_information(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    jar: CookieJar,
) -> AppResult<Response> {
    let vault = match (&auth.user.vault, guards::vault_master_key(&state, &auth.session_id, &jar)) {
        (Some(ciphertext), Ok(master_key)) => {
            let plaintext = vault::decrypt_vault_body(&master_key, ciphertext)?;
            Some(serde_json::from_slice(&plaintext).map_err(AppError::internal)?)
        }
        _ => None,
    };
    Ok((StatusCode::OK, Json(json!({"success": true, "user": redact_user(&auth.user, vault)}))).into_response())
}

#[derive(Deserialize)]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
    Json(req): Json<ChangePasswordRequest>,
) -> AppResult<Response> {
    guards::require_csrf(&auth.token, &headers)?;

    let outcome = {
        let state = state.clone();
        let user_id = auth.user.id.clone();
        let auth_time = auth.token.auth_time;
        let ChangePasswordRequest { old_password, new_password } = req;
        tokio::task::spawn_blocking(move || {
            login::change_password(&state, &user_id, &old_password, &new_password, auth_time)
        })
        .await
        .map_err(AppError::internal)??
    };

    let user = state
        .users
        .find_by_id(&auth.user.id)?
        .ok_or_else(|| AppError::internal("user vanished during password change"))?;
    let new_base_key = login::base_key_for_session(&state, &outcome.session_id)
        .ok_or_else(|| AppError::internal("session vanished immediately after password change"))?;
    let master_key = match &user.vault_master_key_wrapped {
        Some(wrapped) => vault::unwrap_long_term(&new_base_key, wrapped)?,
        None => vault::generate_master_key(),
    };

    let settings = state.settings.clone();
    let notify_user = user.clone();
    tokio::spawn(async move {
        crate::notify::send_password_changed_notification(&settings, &notify_user).await;
    });

    let cookies = guards::build_auth_cookies(
        state.settings.use_https,
        state.settings.token_age,
        &outcome.issued.raw_token,
        &outcome.issued.csrf,
        &outcome.session_id,
        &new_base_key,
        &master_key,
    );
    let mut jar = jar;
    for cookie in cookies {
        jar = jar.add(cookie);
    }
    Ok((jar, ok("Password changed.")).into_response())
}

async fn get_all_users(State(state): State<Arc<AppState>>, auth: AuthUser) -> AppResult<Response> {
    guards::require_admin(&auth.user)?;
    let users = state.users.list_all()?;
    let redacted: Vec<_> = users.iter().map(|u| redact_user(u, None)).collect();
    Ok((StatusCode::OK, Json(json!({"success": true, "users": redacted}))).into_response())
}
