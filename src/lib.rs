//! SecureVault: a self-contained authentication and secret-vault server.
//!
//! [`crypto`] holds the password/TOTP/AEAD primitives, [`persistence`]
//! the encrypted-and-signed on-disk containers, [`session`] the
//! in-memory session store, [`tokens`] the bearer-token lifecycle,
//! [`login`] the authentication state machine, [`vault`] the per-user
//! vault key-wrapping protocol, [`guards`] the request-level auth
//! extractors, and [`admin`] the privileged operator surface. The
//! remaining modules ([`config`], [`model`], [`app_state`], [`error`],
//! [`http`], [`notify`], [`rate_limit`], [`logging`]) wire these into a
//! running server.

pub mod admin;
pub mod app_state;
pub mod config;
pub mod crypto;
pub mod error;
pub mod guards;
pub mod http;
pub mod logging;
pub mod login;
pub mod model;
pub mod notify;
pub mod persistence;
pub mod rate_limit;
pub mod session;
pub mod tokens;
pub mod vault;
