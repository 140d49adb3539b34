//! `presence_auth`: NPC handshake credentials.
//!
//! Two halves:
//! - [`token`]: decode + verify the compact HMAC-SHA256 manager token an
//!   agent presents when joining a room.
//! - [`secrets`]: resolve which HMAC secret to verify against, through a
//!   priority chain (static env, office tenant keys, per-agent registry
//!   credential) with TTL caches.
//!
//! Verification is purely syntactic here; matching token claims against the
//! join request is the room handshake's job.

mod secrets;
mod token;

pub use secrets::{
    ResolvedSecret, SecretResolver, SecretSource, SecretStore, DEFAULT_SECRET_TTL,
};
pub use token::{sign_manager_token, verify_manager_token, verify_manager_token_at, TokenError};
