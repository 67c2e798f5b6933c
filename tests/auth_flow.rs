//! End-to-end exercises of the login state machine, token lifecycle, and
//! vault key protocol against a real (tempdir-backed) `AppState`.

use securevault_lib::config::{Secrets, Settings};
use securevault_lib::app_state::AppState;
use securevault_lib::login::{self, AuthOutcome, Surface};
use securevault_lib::{crypto, vault};

fn test_state(lockout_window: i64) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();

    let secrets = Secrets {
        system_key: [1u8; 32],
        integrity_key: [2u8; 32],
        encapsilation_key: [3u8; 32],
        token_key: [4u8; 32],
    };
    let settings = Settings {
        app_name: "SecureServerAdmin".to_string(),
        server_host: "127.0.0.1".to_string(),
        server_port: 8000,
        use_https: false,
        replace_corrupted_files: true,
        lockout_login_window: lockout_window,
        pw_change_auth_window: 120,
        max_login_failures: 5,
        token_age: 900,
        enable_2fa: true,
        require_2fa: false,
        default_user_2fa: false,
        default_user_take_full_name: true,
        default_user_take_email: false,
        default_user_take_phone: false,
        template_user_email: "email@example.com".to_string(),
        template_user_phone: "1234567890".to_string(),
        data_dir: data_dir.clone(),
        env_path: dir.path().join(".env"),
    };
    (dir, AppState::new(secrets, settings))
}

fn totp_code_for(secret: &str) -> String {
    use totp_rs::{Algorithm, Secret, TOTP};
    let bytes = Secret::Encoded(secret.to_string()).to_bytes().unwrap();
    let totp = TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, None, String::new()).unwrap();
    totp.generate_current().unwrap()
}

#[test]
fn bootstrap_creates_root_admin_and_requires_2fa_setup() {
    let (_dir, state) = test_state(900);

    let outcome = login::authenticate(&state, "alice", "Secret12!@", None, Surface::Public).unwrap();
    let totp_uri = match outcome {
        AuthOutcome::TwoFaSetupRequired { totp_uri } => totp_uri,
        _ => panic!("expected TwoFaSetupRequired on bootstrap"),
    };
    assert!(totp_uri.starts_with("otpauth://totp/SecureServerAdmin%3Aalice?"));

    let user = state.users.find_by_username("alice").unwrap().unwrap();
    assert!(user.root);
    assert!(user.root_auth);
    assert!(!user.two_fa_setup_complete);
}

#[test]
fn totp_setup_completion_succeeds_and_issues_valid_token() {
    let (_dir, state) = test_state(900);
    login::authenticate(&state, "alice", "Secret12!@", None, Surface::Public).unwrap();

    let secret = state.users.find_by_username("alice").unwrap().unwrap().two_fa_secret.unwrap();
    let code = totp_code_for(&secret);

    let outcome = login::authenticate(&state, "alice", "Secret12!@", Some(&code), Surface::Public).unwrap();
    let auth = match outcome {
        AuthOutcome::Success(auth) => auth,
        _ => panic!("expected success after valid TOTP"),
    };
    assert_eq!(auth.code, login::code::ROOT_SUCCESS);

    let validated = state.tokens.validate(&auth.issued.raw_token).unwrap();
    assert!(validated.is_some());

    let user = state.users.find_by_username("alice").unwrap().unwrap();
    assert!(user.two_fa_setup_complete);
}

#[test]
fn root_cannot_authenticate_on_public_surface_after_setup() {
    let (_dir, state) = test_state(900);
    login::authenticate(&state, "alice", "Secret12!@", None, Surface::Public).unwrap();
    let secret = state.users.find_by_username("alice").unwrap().unwrap().two_fa_secret.unwrap();
    let code = totp_code_for(&secret);
    login::authenticate(&state, "alice", "Secret12!@", Some(&code), Surface::Public).unwrap();

    // Root is now fully set up; any subsequent public-surface login must
    // fail indistinguishably from bad credentials, regardless of password
    // correctness.
    let outcome = login::authenticate(&state, "alice", "Secret12!@", Some(&totp_code_for(&secret)), Surface::Public).unwrap();
    match outcome {
        AuthOutcome::Failure { code, message } => {
            assert_eq!(code, login::code::CREDENTIALS_INVALID);
            assert_eq!(message, "Credentials do not match.");
        }
        _ => panic!("root must never succeed on the public surface"),
    }
}

#[test]
fn lockout_after_max_failures_reports_remaining_minutes() {
    let (_dir, state) = test_state(900);
    // Seed a non-root user via signup so lockout doesn't race the bootstrap path.
    login::signup(
        &state,
        "bob",
        "RightPass1!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();

    for _ in 0..5 {
        let outcome = login::authenticate(&state, "bob", "wrong", None, Surface::Public).unwrap();
        assert!(matches!(outcome, AuthOutcome::Failure { code, .. } if code == login::code::CREDENTIALS_INVALID));
    }

    // At least a second elapses between the oldest recorded failure and the
    // lockout check below, so the 900s window has strictly less than 900s
    // left: floor(899/60) == 14, matching spec.md §8 scenario 3 exactly
    // ("Try again in 14 minutes."), not a ceiling-rounded "15 minutes.".
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let outcome = login::authenticate(&state, "bob", "wrong", None, Surface::Public).unwrap();
    match outcome {
        AuthOutcome::Failure { code, message } => {
            assert_eq!(code, login::code::LOCKED);
            assert_eq!(message, "Try again in 14 minutes.");
        }
        _ => panic!("expected lockout"),
    }

    // A correct password attempt while still locked is still rejected as locked.
    let outcome = login::authenticate(&state, "bob", "RightPass1!", None, Surface::Public).unwrap();
    assert!(matches!(outcome, AuthOutcome::Failure { code, .. } if code == login::code::LOCKED));
}

#[test]
fn successful_login_clears_lockout_window() {
    // A 1-second lockout window lets the failures age out almost
    // immediately, rather than waiting out a real 15-minute window.
    let (_dir, state) = test_state(1);
    login::signup(
        &state,
        "bob",
        "RightPass1!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();

    for _ in 0..5 {
        login::authenticate(&state, "bob", "wrong", None, Surface::Public).unwrap();
    }
    std::thread::sleep(std::time::Duration::from_millis(1100));

    let outcome = login::authenticate(&state, "bob", "RightPass1!", None, Surface::Public).unwrap();
    assert!(matches!(outcome, AuthOutcome::Success(_)));

    let attempts = state.failed_attempts.list_all().unwrap();
    assert!(!attempts.contains_key("bob"));
}

#[test]
fn reissuing_a_token_on_new_login_revokes_the_previous_one() {
    let (_dir, state) = test_state(900);
    login::signup(
        &state,
        "carol",
        "LongPassw0rd!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();

    let first = match login::authenticate(&state, "carol", "LongPassw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success"),
    };
    assert!(state.tokens.validate(&first.issued.raw_token).unwrap().is_some());

    let second = match login::authenticate(&state, "carol", "LongPassw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success"),
    };

    assert!(state.tokens.validate(&first.issued.raw_token).unwrap().is_none());
    assert!(state.tokens.validate(&second.issued.raw_token).unwrap().is_some());
}

#[test]
fn vault_round_trip_hides_plaintext_on_disk() {
    let (_dir, state) = test_state(900);
    login::signup(
        &state,
        "carol",
        "LongPassw0rd!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();

    let auth = match login::authenticate(&state, "carol", "LongPassw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success"),
    };

    let base_key = login::base_key_for_session(&state, &auth.session_id).unwrap();
    let user = state.users.find_by_id(&auth.user.id).unwrap().unwrap();
    let master_key = vault::unwrap_long_term(&base_key, user.vault_master_key_wrapped.as_ref().unwrap()).unwrap();

    let ciphertext = vault::encrypt_vault_body(&master_key, b"hello world");
    state.users.update(&auth.user.id, |u| u.vault = Some(ciphertext.clone())).unwrap();

    let reloaded = state.users.find_by_id(&auth.user.id).unwrap().unwrap();
    let plaintext = vault::decrypt_vault_body(&master_key, reloaded.vault.as_ref().unwrap()).unwrap();
    assert_eq!(plaintext, b"hello world");
    assert!(!ciphertext.contains("hello world"));
}

#[test]
fn password_change_preserves_vault_access_across_rewrap() {
    let (_dir, state) = test_state(900);
    login::signup(
        &state,
        "dave",
        "OldPassw0rd!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();

    let auth = match login::authenticate(&state, "dave", "OldPassw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success"),
    };
    let old_base_key = login::base_key_for_session(&state, &auth.session_id).unwrap();
    let user = state.users.find_by_id(&auth.user.id).unwrap().unwrap();
    let master_key = vault::unwrap_long_term(&old_base_key, user.vault_master_key_wrapped.as_ref().unwrap()).unwrap();
    let ciphertext = vault::encrypt_vault_body(&master_key, b"top secret notes");
    state.users.update(&auth.user.id, |u| u.vault = Some(ciphertext)).unwrap();

    login::change_password(&state, &auth.user.id, "OldPassw0rd!", "NewPassw0rd!", auth.issued.auth_time).unwrap();

    // Log in again with the new password and confirm the vault still decrypts.
    let relogin = match login::authenticate(&state, "dave", "NewPassw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success after password change"),
    };
    let new_base_key = login::base_key_for_session(&state, &relogin.session_id).unwrap();
    let user = state.users.find_by_id(&relogin.user.id).unwrap().unwrap();
    let master_key = vault::unwrap_long_term(&new_base_key, user.vault_master_key_wrapped.as_ref().unwrap()).unwrap();
    let plaintext = vault::decrypt_vault_body(&master_key, user.vault.as_ref().unwrap()).unwrap();
    assert_eq!(plaintext, b"top secret notes");
}

#[test]
fn change_password_outside_auth_window_is_rejected() {
    let (_dir, state) = test_state(900);
    login::signup(
        &state,
        "erin",
        "OldPassw0rd!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();
    let auth = match login::authenticate(&state, "erin", "OldPassw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success"),
    };

    let stale_auth_time = auth.issued.auth_time - 1000;
    let result = login::change_password(&state, &auth.user.id, "OldPassw0rd!", "NewPassw0rd!", stale_auth_time);
    assert!(result.is_err());
}

#[test]
fn freeze_blocks_authentication_without_revealing_reason() {
    let (_dir, state) = test_state(900);
    login::signup(
        &state,
        "frank",
        "Passw0rd!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();
    let user = state.users.find_by_username("frank").unwrap().unwrap();
    state.users.update(&user.id, |u| u.freeze = true).unwrap();

    let outcome = login::authenticate(&state, "frank", "Passw0rd!", None, Surface::Public).unwrap();
    assert!(matches!(outcome, AuthOutcome::Failure { code, .. } if code == login::code::FROZEN));
}

#[test]
fn tampered_ciphertext_byte_breaks_decryption_not_just_parsing() {
    let (_dir, state) = test_state(900);
    login::signup(
        &state,
        "gina",
        "Passw0rd!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();
    let auth = match login::authenticate(&state, "gina", "Passw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success"),
    };
    let base_key = login::base_key_for_session(&state, &auth.session_id).unwrap();
    let user = state.users.find_by_id(&auth.user.id).unwrap().unwrap();
    let master_key = vault::unwrap_long_term(&base_key, user.vault_master_key_wrapped.as_ref().unwrap()).unwrap();

    let mut ciphertext = vault::encrypt_vault_body(&master_key, b"secret");
    // Flip one base64url character near the end (inside the AEAD tag).
    unsafe {
        let bytes = ciphertext.as_bytes_mut();
        let last = bytes.len() - 1;
        bytes[last] = if bytes[last] == b'A' { b'B' } else { b'A' };
    }
    assert!(vault::decrypt_vault_body(&master_key, &ciphertext).is_err());
}

#[test]
fn csrf_header_must_match_token_exactly() {
    use axum::http::{HeaderMap, HeaderValue};
    use securevault_lib::guards;

    let (_dir, state) = test_state(900);
    login::signup(
        &state,
        "henry",
        "Passw0rd!",
        login::SignupProfile { full_name: None, email: None, phone: None },
    )
    .unwrap();
    let auth = match login::authenticate(&state, "henry", "Passw0rd!", None, Surface::Public).unwrap() {
        AuthOutcome::Success(a) => a,
        _ => panic!("expected success"),
    };
    let token = state.tokens.validate(&auth.issued.raw_token).unwrap().unwrap();

    let mut headers = HeaderMap::new();
    headers.insert(
        guards::CSRF_HEADER,
        HeaderValue::from_str(&auth.issued.csrf).unwrap(),
    );
    assert!(guards::require_csrf(&token, &headers).is_ok());

    headers.insert(guards::CSRF_HEADER, HeaderValue::from_static("wrong-value"));
    assert!(guards::require_csrf(&token, &headers).is_err());

    let empty = HeaderMap::new();
    assert!(guards::require_csrf(&token, &empty).is_err());
}

#[test]
fn password_hash_round_trip_and_wrong_password_rejected() {
    let hash = crypto::hash_password("correct horse battery staple");
    assert!(crypto::verify_password("correct horse battery staple", &hash));
    assert!(!crypto::verify_password("incorrect", &hash));
}
