//! Authentication: credential store, session tokens, anti-forgery guard.
//!
//! Provides:
//! - Identity registration with email/password (iterated SHA-256, 100k rounds + per-user salt)
//! - Session token management (opaque hex tokens, SHA-256 hashed for storage, time-limited)
//! - Double-submit anti-forgery tokens for state-changing requests
//! - SQLite-backed persistent storage
//!
//! ## Design Decisions
//! - No JWT dependency — sessions use opaque random tokens with server-side
//!   SHA-256 hashed lookup; validity is determined solely by that lookup.
//! - A structurally missing token table is a hard `Infrastructure` failure.
//!   There is no fallback credential path of any kind.

pub mod csrf;
pub mod store;

pub use csrf::CsrfGuard;
pub use store::{AuthSession, AuthStore, ProfileUpdate, Role};
