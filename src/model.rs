//! On-disk data model: users, extensible scalar profile fields, tokens,
//! and failed-login tracking.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A loosely-typed scalar, used for the admin CLI's `createuser` free-form
/// `key=value` overrides and for any profile fields not promoted to a
/// first-class `User` field. Coercion precedence: trimmed+lowercased
/// `"true"`/`"false"` first, then `"null"`/`"none"`, then integers (digits,
/// optionally a leading `-`), then floats, and finally the original
/// string untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

impl ScalarValue {
    pub fn auto_cast(raw: &str) -> ScalarValue {
        let trimmed = raw.trim();
        match trimmed.to_lowercase().as_str() {
            "true" => return ScalarValue::Bool(true),
            "false" => return ScalarValue::Bool(false),
            "null" | "none" => return ScalarValue::Null,
            _ => {}
        }

        let looks_like_int = {
            let mut chars = trimmed.chars();
            match chars.next() {
                Some(c) if c.is_ascii_digit() => chars.all(|c| c.is_ascii_digit()),
                Some('-') => {
                    let rest = &trimmed[1..];
                    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
                }
                _ => false,
            }
        };
        if looks_like_int {
            if let Ok(i) = trimmed.parse::<i64>() {
                return ScalarValue::Int(i);
            }
        }

        if let Ok(f) = trimmed.parse::<f64>() {
            return ScalarValue::Float(f);
        }

        ScalarValue::String(raw.to_string())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum PreferredContactMethod {
    #[default]
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "sms")]
    Sms,
}

/// A single user record. Field names match the on-disk JSON exactly,
/// including the `freeze` name (the admin CLI's redacted `list_users`
/// view alone renames this to `frozen` for external consumption).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub salt: String,

    #[serde(default)]
    pub root: bool,
    #[serde(default)]
    pub root_auth: bool,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub dev_admin: bool,
    #[serde(default)]
    pub freeze: bool,

    #[serde(rename = "2fa_enabled", default)]
    pub two_fa_enabled: bool,
    #[serde(rename = "2fa_setup_complete", default)]
    pub two_fa_setup_complete: bool,
    #[serde(rename = "2fa_secret", default)]
    pub two_fa_secret: Option<String>,

    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub preferred_contact_method: PreferredContactMethod,

    /// Base64url(AES-256-GCM ciphertext) of the secret vault body, wrapped
    /// under the session-bound KEK-unwrapped master key.
    #[serde(default)]
    pub vault: Option<String>,
    /// The vault master key, wrapped under the user's base_key-derived KEK.
    #[serde(default)]
    pub vault_master_key_wrapped: Option<String>,

    /// Any profile fields an admin attached via `createuser`'s free-form
    /// overrides that aren't one of the first-class fields above.
    #[serde(flatten)]
    pub extras: BTreeMap<String, ScalarValue>,
}

impl User {
    pub fn vault_len(&self) -> usize {
        self.vault.as_ref().map(|v| v.len()).unwrap_or(0)
    }
}

/// A single failed login attempt, keyed by username in the container map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub timestamp: i64,
}

pub type FailedAttemptsMap = BTreeMap<String, Vec<FailedAttempt>>;

/// A persisted auth token. `auth_time` anchors the password-change
/// authorization window; `csrf` is compared against the `X-CSRF-Token`
/// header on state-changing requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub token_id: String,
    pub user_id: String,
    pub csrf: String,
    pub issued_at: i64,
    pub auth_time: i64,
    pub expires_at: i64,
    /// `"***" + last 4 chars` of the plaintext bearer value, computed once
    /// at issuance (the plaintext itself is never persisted). For logging
    /// and admin session listings only — never used for lookup.
    pub safe_log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_cast_precedence() {
        assert_eq!(ScalarValue::auto_cast("TRUE"), ScalarValue::Bool(true));
        assert_eq!(ScalarValue::auto_cast(" false "), ScalarValue::Bool(false));
        assert_eq!(ScalarValue::auto_cast("null"), ScalarValue::Null);
        assert_eq!(ScalarValue::auto_cast("None"), ScalarValue::Null);
        assert_eq!(ScalarValue::auto_cast("42"), ScalarValue::Int(42));
        assert_eq!(ScalarValue::auto_cast("-7"), ScalarValue::Int(-7));
        assert_eq!(ScalarValue::auto_cast("3.14"), ScalarValue::Float(3.14));
        assert_eq!(
            ScalarValue::auto_cast("hello"),
            ScalarValue::String("hello".to_string())
        );
        // "-" alone is not a valid int and not a valid float: falls through to string.
        assert_eq!(ScalarValue::auto_cast("-"), ScalarValue::String("-".to_string()));
    }
}
