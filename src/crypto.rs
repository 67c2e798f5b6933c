//! Cryptographic primitives: password hashing, AEAD wrap/unwrap,
//! HKDF-derived key-encryption keys, HMAC integrity tags, and TOTP.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD as BASE64_STD, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine as _;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::AppError;

const PBKDF2_ITERATIONS: u32 = 600_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// A 32-byte key that zeroes itself on drop. Used for login secrets,
/// base keys, KEKs, and vault master keys alike.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key32(pub [u8; 32]);

impl Key32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_key32() -> Key32 {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    Key32(bytes)
}

fn pbkdf2_32(password: &[u8], salt: &[u8]) -> Key32 {
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password, salt, PBKDF2_ITERATIONS, &mut out);
    Key32(out)
}

/// Password hash on-disk encoding: base64(salt(16) ‖ PBKDF2(32)).
pub fn hash_password(password: &str) -> String {
    let salt = generate_salt();
    let key = pbkdf2_32(password.as_bytes(), &salt);
    let mut combined = Vec::with_capacity(SALT_LEN + 32);
    combined.extend_from_slice(&salt);
    combined.extend_from_slice(&key.0);
    BASE64_STD.encode(combined)
}

/// Constant-time verification against a `hash_password` encoding. Never
/// short-circuits on malformed `stored` before completing the same amount
/// of PBKDF2 work a well-formed comparison would do, so unknown users and
/// wrong passwords take indistinguishable time.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let decoded = match BASE64_STD.decode(stored) {
        Ok(d) if d.len() == SALT_LEN + 32 => d,
        _ => {
            // Malformed encoding: still do the KDF work against a fixed
            // dummy salt so the caller can't distinguish this from a
            // mismatch by timing.
            let _ = pbkdf2_32(password.as_bytes(), &[0u8; SALT_LEN]);
            return false;
        }
    };
    let (salt, expected_hash) = decoded.split_at(SALT_LEN);
    let actual = pbkdf2_32(password.as_bytes(), salt);
    bool::from(actual.0.ct_eq(expected_hash))
}

/// Derives the 32-byte PBKDF2 `login_secret`/`base_key` from a password and
/// a user's per-user salt (hex-encoded on the user record).
pub fn derive_login_secret(password: &str, salt_hex: &str) -> Result<Key32, AppError> {
    let salt = hex::decode(salt_hex).map_err(|e| AppError::internal(e))?;
    Ok(pbkdf2_32(password.as_bytes(), &salt))
}

/// HKDF-SHA256(base_key, salt=None, info=session_id) -> 32-byte KEK. The
/// `info` binds the KEK to whatever the caller passes as session context;
/// the public login path passes `session_id`, and vault rewrap on password
/// change passes a dedicated session-independent context (see vault.rs).
pub fn derive_kek(base_key: &Key32, info: &[u8]) -> Key32 {
    let hk = Hkdf::<Sha256>::new(None, &base_key.0);
    let mut out = [0u8; 32];
    hk.expand(info, &mut out)
        .expect("32 is a valid HKDF-SHA256 output length");
    Key32(out)
}

/// AES-256-GCM encrypt. Returns raw `nonce(12) ‖ ciphertext ‖ tag`.
pub fn aead_encrypt(key: &Key32, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new((&key.0).into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM encryption is infallible for valid key/nonce lengths");
    let mut blob = nonce_bytes.to_vec();
    blob.extend_from_slice(&ciphertext);
    blob
}

/// AES-256-GCM decrypt of a `nonce(12) ‖ ciphertext` blob.
pub fn aead_decrypt(key: &Key32, blob: &[u8]) -> Result<Vec<u8>, AppError> {
    if blob.len() < NONCE_LEN {
        return Err(AppError::Crypto("Invalid authentication key.".into()));
    }
    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new((&key.0).into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| AppError::Crypto("Invalid authentication key (decryption failed).".into()))
}

/// Encrypt and base64url(no-pad)-encode, the wire format used for the
/// `auth_key` cookie and for on-disk JSON containers.
pub fn aead_encrypt_b64(key: &Key32, plaintext: &[u8]) -> String {
    BASE64_URL.encode(aead_encrypt(key, plaintext))
}

pub fn aead_decrypt_b64(key: &Key32, encoded: &str) -> Result<Vec<u8>, AppError> {
    let raw = BASE64_URL
        .decode(encoded)
        .map_err(|_| AppError::Crypto("Invalid authentication key (bad encoding).".into()))?;
    aead_decrypt(key, &raw)
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over arbitrary bytes, hex-encoded. Used for both the
/// container integrity signature and the persisted token id.
pub fn hmac_hex(key: &[u8; 32], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

pub fn hmac_verify(key: &[u8; 32], data: &[u8], expected_hex: &str) -> bool {
    let actual = hmac_hex(key, data);
    bool::from(actual.as_bytes().ct_eq(expected_hex.as_bytes()))
}

/// Constant-time string equality, used for CSRF token comparison so a
/// mismatched token can't be timed to learn its prefix.
pub fn constant_time_eq_str(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Generates a random base32 TOTP secret (20 bytes of entropy).
pub fn generate_totp_secret() -> String {
    match Secret::generate_secret().to_encoded() {
        Secret::Encoded(s) => s,
        Secret::Raw(_) => unreachable!("to_encoded always returns Secret::Encoded"),
    }
}

fn totp_for(secret_b32: &str) -> Result<TOTP, AppError> {
    let bytes = Secret::Encoded(secret_b32.to_string())
        .to_bytes()
        .map_err(|e| AppError::internal(format!("invalid TOTP secret: {e}")))?;
    TOTP::new(Algorithm::SHA1, 6, 1, 30, bytes, None, String::new())
        .map_err(|e| AppError::internal(format!("invalid TOTP parameters: {e}")))
}

pub fn totp_verify(secret_b32: &str, code: &str) -> bool {
    match totp_for(secret_b32) {
        Ok(totp) => totp.check_current(code).unwrap_or(false),
        Err(_) => false,
    }
}

/// Standard provisioning URI with label `"{issuer}:{username}"`, both
/// URL-encoded, including the `&algorithm=SHA1&digits=6&period=30` suffix.
pub fn totp_provisioning_uri(issuer: &str, username: &str, secret_b32: &str) -> String {
    let label = urlencode(&format!("{issuer}:{username}"));
    let issuer_enc = urlencode(issuer);
    format!(
        "otpauth://totp/{label}?secret={secret_b32}&issuer={issuer_enc}&algorithm=SHA1&digits=6&period=30"
    )
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let hash = hash_password("correct horse battery staple");
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn kek_is_session_bound() {
        let base = generate_key32();
        let a = derive_kek(&base, b"session-a");
        let b = derive_kek(&base, b"session-b");
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn aead_round_trip() {
        let key = generate_key32();
        let ct = aead_encrypt_b64(&key, b"hello world");
        let pt = aead_decrypt_b64(&key, &ct).unwrap();
        assert_eq!(pt, b"hello world");
    }

    #[test]
    fn aead_rejects_tampered_ciphertext() {
        let key = generate_key32();
        let mut ct = aead_encrypt(&key, b"secret");
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(aead_decrypt(&key, &ct).is_err());
    }

    #[test]
    fn hmac_matches_and_rejects_tamper() {
        let key = [7u8; 32];
        let tag = hmac_hex(&key, b"payload");
        assert!(hmac_verify(&key, b"payload", &tag));
        assert!(!hmac_verify(&key, b"payload!", &tag));
    }

    #[test]
    fn totp_round_trip() {
        let secret = generate_totp_secret();
        let totp = totp_for(&secret).unwrap();
        let code = totp.generate_current().unwrap();
        assert!(totp_verify(&secret, &code));
        assert!(!totp_verify(&secret, "000000") || code == "000000");
    }

    #[test]
    fn provisioning_uri_matches_expected_shape() {
        let uri = totp_provisioning_uri("SecureServerAdmin", "alice", "ABCDEF");
        assert_eq!(
            uri,
            "otpauth://totp/SecureServerAdmin%3Aalice?secret=ABCDEF&issuer=SecureServerAdmin&algorithm=SHA1&digits=6&period=30"
        );
    }
}
