//! Encrypted, integrity-checked JSON persistence.
//!
//! `users.json` and `failed_attempts.json` each hold a single
//! base64url(nonce ‖ AES-256-GCM(container)) blob under `SYSTEM_KEY`, where
//! `container = {"data": ..., "signature": HMAC-SHA256(canonical(data))}`
//! under `INTEGRITY_KEY`. The signature covers the canonical (sorted-key,
//! 2-space-indent) JSON of `data` alone, reproducible regardless of
//! in-memory field order, and travels inside the ciphertext rather than
//! alongside it. `tokens.json` is a raw `nonce(12) ‖ ciphertext` blob under
//! `TOKEN_KEY` with no signature layer, since token state is already
//! bounded by expiry and isn't a target for the same tamper-detection
//! requirement.
//!
//! All writes go through a single process-wide lock and land atomically
//! via a temp file + rename.

use std::path::Path;
use std::sync::{Mutex, OnceLock};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::crypto::{self, Key32};
use crate::error::{AppError, AppResult};

fn write_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Canonical JSON: sorted keys, 2-space indent. `serde_json::Map` is
/// BTreeMap-backed (the `preserve_order` feature is not enabled), so
/// round-tripping through `Value` is enough to get deterministic key
/// ordering before pretty-printing.
pub fn canonical_json<T: Serialize>(value: &T) -> AppResult<Vec<u8>> {
    let as_value: Value = serde_json::to_value(value).map_err(AppError::internal)?;
    serde_json::to_vec_pretty(&as_value).map_err(AppError::internal)
}

fn atomic_write(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(AppError::internal)?;
    std::io::Write::write_all(&mut tmp, bytes).map_err(AppError::internal)?;
    tmp.persist(path).map_err(|e| AppError::internal(e.error))?;
    Ok(())
}

/// Builds `{"data": value, "signature": HMAC(canonical(data))}`, encrypts
/// the whole thing under `system_key`, and atomically persists the
/// base64url ciphertext to `path`.
pub fn write_signed<T: Serialize>(
    path: &Path,
    system_key: &Key32,
    integrity_key: &[u8; 32],
    value: &T,
) -> AppResult<()> {
    let _guard = write_lock().lock().unwrap();
    let canonical_data = canonical_json(value)?;
    let signature = crypto::hmac_hex(integrity_key, &canonical_data);
    let data_value: Value = serde_json::to_value(value).map_err(AppError::internal)?;
    let container = serde_json::json!({ "data": data_value, "signature": signature });
    let container_bytes = serde_json::to_vec(&container).map_err(AppError::internal)?;
    let encoded = crypto::aead_encrypt_b64(system_key, &container_bytes);
    atomic_write(path, encoded.as_bytes())
}

/// Decrypt, verify, and deserialize `path`. If the file is missing,
/// returns `T::default()`. If it exists but fails to parse/decrypt/verify,
/// behavior is governed by `replace_corrupted`: when true, the corrupted
/// file is moved aside and a fresh default is returned; when false, an
/// `AppError::Integrity` is raised.
pub fn read_signed<T: DeserializeOwned + Default>(
    path: &Path,
    system_key: &Key32,
    integrity_key: &[u8; 32],
    replace_corrupted: bool,
) -> AppResult<T> {
    let _guard = write_lock().lock().unwrap();

    if !path.exists() {
        return Ok(T::default());
    }

    let raw = std::fs::read_to_string(path).map_err(AppError::internal)?;

    let recover = |reason: &str| -> AppResult<T> {
        if replace_corrupted {
            let backup = path.with_extension("corrupted");
            let _ = std::fs::rename(path, &backup);
            tracing::error!(target: "securevault::persistence", file = %path.display(), reason, "replacing corrupted container with defaults");
            Ok(T::default())
        } else {
            Err(AppError::Integrity(format!(
                "{} failed integrity check: {reason}",
                path.display()
            )))
        }
    };

    let plaintext = match crypto::aead_decrypt_b64(system_key, raw.trim()) {
        Ok(p) => p,
        Err(_) => return recover("decryption failed"),
    };

    let container: Value = match serde_json::from_slice(&plaintext) {
        Ok(c) => c,
        Err(_) => return recover("malformed container"),
    };

    let (Some(data), Some(signature)) = (container.get("data"), container.get("signature").and_then(Value::as_str)) else {
        return recover("malformed container");
    };

    let canonical_data = match serde_json::to_vec_pretty(data) {
        Ok(bytes) => bytes,
        Err(_) => return recover("malformed data"),
    };

    if !crypto::hmac_verify(integrity_key, &canonical_data, signature) {
        return recover("signature mismatch");
    }

    match serde_json::from_value(data.clone()) {
        Ok(value) => Ok(value),
        Err(_) => recover("malformed plaintext"),
    }
}

/// Encrypt `value` under `token_key` as a raw `nonce ‖ ciphertext` blob
/// with no JSON envelope or signature.
pub fn write_tokens<T: Serialize>(path: &Path, token_key: &Key32, value: &T) -> AppResult<()> {
    let _guard = write_lock().lock().unwrap();
    let plaintext = canonical_json(value)?;
    let blob = crypto::aead_encrypt(token_key, &plaintext);
    atomic_write(path, &blob)
}

pub fn read_tokens<T: DeserializeOwned + Default>(
    path: &Path,
    token_key: &Key32,
) -> AppResult<T> {
    let _guard = write_lock().lock().unwrap();
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read(path).map_err(AppError::internal)?;
    let plaintext = crypto::aead_decrypt(token_key, &raw)?;
    serde_json::from_slice(&plaintext).map_err(AppError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn signed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let system_key = crypto::generate_key32();
        let integrity_key = [1u8; 32];

        let mut data: BTreeMap<String, i32> = BTreeMap::new();
        data.insert("a".into(), 1);
        data.insert("b".into(), 2);

        write_signed(&path, &system_key, &integrity_key, &data).unwrap();
        let read: BTreeMap<String, i32> =
            read_signed(&path, &system_key, &integrity_key, false).unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn tampered_ciphertext_is_rejected_without_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let system_key = crypto::generate_key32();
        let integrity_key = [2u8; 32];

        let data: BTreeMap<String, i32> = BTreeMap::from([("x".to_string(), 1)]);
        write_signed(&path, &system_key, &integrity_key, &data).unwrap();

        // Flip one byte of the on-disk ciphertext; AEAD must reject it
        // outright rather than yielding tampered plaintext.
        let mut encoded = std::fs::read_to_string(&path).unwrap();
        let flipped = match encoded.pop().unwrap() {
            'A' => 'B',
            _ => 'A',
        };
        encoded.push(flipped);
        std::fs::write(&path, encoded).unwrap();

        let result: AppResult<BTreeMap<String, i32>> =
            read_signed(&path, &system_key, &integrity_key, false);
        assert!(result.is_err());
    }

    #[test]
    fn different_system_key_cannot_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let system_key = crypto::generate_key32();
        let other_key = crypto::generate_key32();
        let integrity_key = [4u8; 32];

        let data: BTreeMap<String, i32> = BTreeMap::from([("x".to_string(), 1)]);
        write_signed(&path, &system_key, &integrity_key, &data).unwrap();

        let result: AppResult<BTreeMap<String, i32>> =
            read_signed(&path, &other_key, &integrity_key, false);
        assert!(result.is_err());
    }

    #[test]
    fn corrupted_file_is_replaced_when_policy_allows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, b"not json at all").unwrap();

        let system_key = crypto::generate_key32();
        let integrity_key = [3u8; 32];
        let result: BTreeMap<String, i32> =
            read_signed(&path, &system_key, &integrity_key, true).unwrap();
        assert!(result.is_empty());
        assert!(path.with_extension("corrupted").exists());
    }

    #[test]
    fn tokens_round_trip_as_raw_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let token_key = crypto::generate_key32();

        let data: Vec<i32> = vec![1, 2, 3];
        write_tokens(&path, &token_key, &data).unwrap();
        let raw = std::fs::read(&path).unwrap();
        // Not valid JSON/UTF-8 on its own: it's ciphertext.
        assert!(serde_json::from_slice::<Value>(&raw).is_err());

        let read: Vec<i32> = read_tokens(&path, &token_key).unwrap();
        assert_eq!(read, data);
    }
}
