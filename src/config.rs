use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Process-wide cryptographic secrets. Loaded once at startup, read-only
/// thereafter. Each raw value must be at least 32 characters; the 32-byte
/// key actually used for AEAD/HMAC is `SHA-256(raw)`.
#[derive(Clone)]
pub struct Secrets {
    pub system_key: [u8; 32],
    pub integrity_key: [u8; 32],
    pub encapsilation_key: [u8; 32],
    pub token_key: [u8; 32],
}

fn normalize_key(raw: &str) -> [u8; 32] {
    let digest = Sha256::digest(raw.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn required_env_key(name: &str) -> Result<[u8; 32]> {
    let value = std::env::var(name)
        .with_context(|| format!("{name} environment variable not set"))?;
    if value.len() < 32 {
        bail!("{name} must be at least 32 characters");
    }
    Ok(normalize_key(&value))
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            system_key: required_env_key("SYSTEM_KEY")?,
            integrity_key: required_env_key("INTEGRITY_KEY")?,
            encapsilation_key: required_env_key("ENCAPSILATION_KEY")?,
            token_key: required_env_key("TOKEN_KEY")?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct SmtpSettings {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TwilioSettings {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
}

/// Typed view over environment-derived tuning constants. Owns `.env` for
/// the setters that persist changes back to disk.
#[derive(Clone, Debug)]
pub struct Settings {
    pub app_name: String,
    pub server_host: String,
    pub server_port: u16,
    pub use_https: bool,

    pub replace_corrupted_files: bool,
    pub lockout_login_window: i64,
    pub pw_change_auth_window: i64,
    pub max_login_failures: usize,
    pub token_age: i64,

    pub enable_2fa: bool,
    pub require_2fa: bool,

    pub default_user_2fa: bool,
    pub default_user_take_full_name: bool,
    pub default_user_take_email: bool,
    pub default_user_take_phone: bool,
    pub template_user_email: String,
    pub template_user_phone: String,

    pub data_dir: PathBuf,
    pub env_path: PathBuf,
}

fn strip_quotes(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2
        && ((raw.starts_with('"') && raw.ends_with('"'))
            || (raw.starts_with('\'') && raw.ends_with('\'')))
    {
        &raw[1..raw.len() - 1]
    } else {
        raw
    }
}

fn get_str_env(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(raw) => strip_quotes(&raw).to_string(),
        Err(_) => default.to_string(),
    }
}

fn get_bool_env(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn get_int_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env(env_path: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            app_name: get_str_env("APP_NAME", "YourAppName"),
            server_host: get_str_env("SERVER_HOST", "127.0.0.1"),
            server_port: get_int_env("SERVER_PORT", 8000),
            use_https: get_bool_env("USE_HTTPS", false),

            replace_corrupted_files: get_bool_env("REPLACE_CORRUPTED_FILES", true),
            lockout_login_window: get_int_env("LOCKOUT_LOGIN_WINDOW", 900),
            pw_change_auth_window: get_int_env("PW_CHANGE_AUTH_WINDOW", 120),
            max_login_failures: get_int_env("MAX_LOGIN_FAILURES", 5),
            token_age: get_int_env("TOKEN_AGE", 900),

            enable_2fa: get_bool_env("ENABLE_2FA", false),
            require_2fa: get_bool_env("REQUIRE_2FA", false),

            default_user_2fa: get_bool_env("DEFAULT_USER_2FA", false),
            default_user_take_full_name: get_bool_env("DEFAULT_USER_TAKE_FULL_NAME", true),
            default_user_take_email: get_bool_env("DEFAULT_USER_TAKE_EMAIL", false),
            default_user_take_phone: get_bool_env("DEFAULT_USER_TAKE_PHONE", false),
            template_user_email: get_str_env("TEMPLATE_USER_EMAIL", "email@example.com"),
            template_user_phone: get_str_env("TEMPLATE_USER_PHONE", "1234567890"),

            data_dir,
            env_path,
        }
    }

    pub fn smtp(&self) -> Option<SmtpSettings> {
        let username = get_str_env("SMTP_USERNAME", "");
        let password = get_str_env("SMTP_PASSWORD", "");
        if username.is_empty() || password.is_empty() {
            return None;
        }
        let from = get_str_env("FROM_EMAIL", "");
        Some(SmtpSettings {
            server: get_str_env("SMTP_SERVER", "smtp.gmail.com"),
            port: get_int_env("SMTP_PORT", 587u16),
            username,
            password,
            from_address: if from.is_empty() { None } else { Some(from) },
        })
    }

    pub fn twilio(&self) -> Option<TwilioSettings> {
        let account_sid = get_str_env("TWILIO_ACCOUNT_SID", "");
        let auth_token = get_str_env("TWILIO_AUTH_TOKEN", "");
        let phone_number = get_str_env("TWILIO_PHONE_NUMBER", "");
        if account_sid.is_empty() || auth_token.is_empty() || phone_number.is_empty() {
            return None;
        }
        Some(TwilioSettings {
            account_sid,
            auth_token,
            phone_number,
        })
    }

    /// Persist a key=value pair to `.env`, preserving line order and
    /// untouched lines.
    pub fn set_persisted(&self, key: &str, value: &str) -> Result<()> {
        std::env::set_var(key, value);

        let existing = fs::read_to_string(&self.env_path).unwrap_or_default();
        let mut found = false;
        let mut new_lines: Vec<String> = Vec::new();

        for line in existing.lines() {
            if line.trim_start().starts_with(&format!("{key}=")) {
                new_lines.push(format!("{key}={value}"));
                found = true;
            } else {
                new_lines.push(line.to_string());
            }
        }
        if !found {
            new_lines.push(format!("{key}={value}"));
        }

        let mut content = new_lines.join("\n");
        content.push('\n');
        fs::write(&self.env_path, content)
            .with_context(|| format!("failed to write {}", self.env_path.display()))
    }

    pub fn data_paths(&self) -> DataPaths {
        DataPaths {
            users: self.data_dir.join("users.json"),
            tokens: self.data_dir.join("tokens.json"),
            failed_attempts: self.data_dir.join("failed_attempts.json"),
        }
    }
}

pub struct DataPaths {
    pub users: PathBuf,
    pub tokens: PathBuf,
    pub failed_attempts: PathBuf,
}

/// Resolve and load `.env`, then construct `Secrets` + `Settings`. The
/// default data directory is resolved via platform data-dir conventions
/// rather than a path relative to the binary, since a deployed server
/// has no source tree to anchor to.
pub fn load(env_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<(Secrets, Settings)> {
    let env_path = env_path.unwrap_or_else(|| PathBuf::from(".env"));
    if env_path.exists() {
        dotenvy::from_path_override(&env_path)
            .with_context(|| format!("failed to load {}", env_path.display()))?;
    }

    let data_dir = match data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let secrets = Secrets::from_env()?;
    let settings = Settings::from_env(env_path, data_dir);
    Ok((secrets, settings))
}

pub fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_local_dir().context("could not determine local data directory")?;
    Ok(base.join("securevault").join("data"))
}

/// Parse `.env`-style lines into a map, used only by tests to assert the
/// write-back preserves unrelated lines.
#[allow(dead_code)]
fn parse_env_lines(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir
        .parent()
        .unwrap_or(data_dir)
        .join("server.pid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_quotes_handles_both_styles() {
        assert_eq!(strip_quotes("\"hello\""), "hello");
        assert_eq!(strip_quotes("'hello'"), "hello");
        assert_eq!(strip_quotes("hello"), "hello");
    }

    #[test]
    fn normalize_key_is_32_bytes_and_deterministic() {
        let a = normalize_key("a very long secret string, at least 32 chars");
        let b = normalize_key("a very long secret string, at least 32 chars");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn set_persisted_preserves_unrelated_lines() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "FOO=bar\nSYSTEM_KEY=xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx\n").unwrap();

        let settings = Settings::from_env(env_path.clone(), dir.path().to_path_buf());
        settings.set_persisted("SERVER_PORT", "9001").unwrap();

        let content = fs::read_to_string(&env_path).unwrap();
        assert!(content.contains("FOO=bar"));
        assert!(content.contains("SERVER_PORT=9001"));
    }
}
