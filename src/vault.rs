//! Secret vault key management: the per-user master key that
//! encrypts vault contents, and the two contexts it is wrapped under.
//!
//! The master key is wrapped twice, under two different KEKs derived from
//! the same PBKDF2 `base_key` via HKDF with different `info` contexts:
//!
//! - **Long-term wrap** (`vault_master_key_wrapped`, persisted in the user
//!   record): KEK = `HKDF(base_key, info = "vault-master-key")`. Since
//!   `base_key` is a deterministic function of password + salt, this wrap
//!   survives process restarts and is recomputed identically on every
//!   successful login.
//! - **Session wrap** (the `auth_key` cookie, never persisted server-side):
//!   KEK = `HKDF(base_key, info = session_id)`. Lets the server avoid
//!   keeping the plaintext master key in memory between requests; each
//!   request round-trips it through the client as ciphertext bound to that
//!   session's id, unwrappable only while the session entry for that id is
//!   still live in the session store.

use crate::crypto::{self, Key32};
use crate::error::AppResult;

const LONG_TERM_INFO: &[u8] = b"vault-master-key";

pub fn generate_master_key() -> Key32 {
    crypto::generate_key32()
}

pub fn long_term_kek(base_key: &Key32) -> Key32 {
    crypto::derive_kek(base_key, LONG_TERM_INFO)
}

pub fn session_kek(base_key: &Key32, session_id: &str) -> Key32 {
    crypto::derive_kek(base_key, session_id.as_bytes())
}

pub fn wrap_master_key(kek: &Key32, master_key: &Key32) -> String {
    crypto::aead_encrypt_b64(kek, &master_key.0)
}

pub fn unwrap_master_key(kek: &Key32, wrapped: &str) -> AppResult<Key32> {
    let bytes = crypto::aead_decrypt_b64(kek, wrapped)?;
    if bytes.len() != 32 {
        return Err(crate::error::AppError::Crypto(
            "Invalid authentication key (unexpected key length).".into(),
        ));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(Key32(out))
}

/// Unwraps the long-term wrap under the current `base_key`, the canonical
/// way a freshly logged-in session recovers the vault master key.
pub fn unwrap_long_term(base_key: &Key32, wrapped: &str) -> AppResult<Key32> {
    unwrap_master_key(&long_term_kek(base_key), wrapped)
}

pub fn wrap_long_term(base_key: &Key32, master_key: &Key32) -> String {
    wrap_master_key(&long_term_kek(base_key), master_key)
}

/// Encrypts the vault body (the user's secret payload, itself arbitrary
/// JSON) under the master key.
pub fn encrypt_vault_body(master_key: &Key32, plaintext: &[u8]) -> String {
    crypto::aead_encrypt_b64(master_key, plaintext)
}

pub fn decrypt_vault_body(master_key: &Key32, ciphertext: &str) -> AppResult<Vec<u8>> {
    crypto::aead_decrypt_b64(master_key, ciphertext)
}

/// Rewraps the long-term wrap when a user's password changes: the master
/// key itself never changes, only the KEK protecting it, since `base_key`
/// changes whenever the password does. Unwraps under the old base key and
/// rewraps under the new one in a single step, so the master key is never
/// written to disk in plaintext form.
pub fn rewrap_on_password_change(
    old_base_key: &Key32,
    new_base_key: &Key32,
    wrapped: &str,
) -> AppResult<String> {
    let master_key = unwrap_long_term(old_base_key, wrapped)?;
    Ok(wrap_long_term(new_base_key, &master_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_term_wrap_round_trip() {
        let base_key = crypto::generate_key32();
        let master_key = generate_master_key();
        let wrapped = wrap_long_term(&base_key, &master_key);
        let unwrapped = unwrap_long_term(&base_key, &wrapped).unwrap();
        assert_eq!(unwrapped.0, master_key.0);
    }

    #[test]
    fn session_wrap_is_bound_to_session_id() {
        let base_key = crypto::generate_key32();
        let master_key = generate_master_key();
        let kek_a = session_kek(&base_key, "session-a");
        let kek_b = session_kek(&base_key, "session-b");
        let wrapped = wrap_master_key(&kek_a, &master_key);
        assert!(unwrap_master_key(&kek_b, &wrapped).is_err());
        assert_eq!(unwrap_master_key(&kek_a, &wrapped).unwrap().0, master_key.0);
    }

    #[test]
    fn rewrap_on_password_change_preserves_master_key() {
        let old_base = crypto::generate_key32();
        let new_base = crypto::generate_key32();
        let master_key = generate_master_key();
        let wrapped = wrap_long_term(&old_base, &master_key);

        let rewrapped = rewrap_on_password_change(&old_base, &new_base, &wrapped).unwrap();
        assert!(unwrap_long_term(&old_base, &rewrapped).is_err());
        assert_eq!(
            unwrap_long_term(&new_base, &rewrapped).unwrap().0,
            master_key.0
        );
    }

    #[test]
    fn vault_body_round_trip() {
        let master_key = generate_master_key();
        let ct = encrypt_vault_body(&master_key, br#"{"notes":"secret"}"#);
        let pt = decrypt_vault_body(&master_key, &ct).unwrap();
        assert_eq!(pt, br#"{"notes":"secret"}"#);
    }
}
