//! SQLite-backed credential store and session/token manager.
//!
//! Tables:
//! - `identities`: name, email (unique, case-insensitive), password_hash,
//!   salt, role, profile fields, avatar filename
//! - `sessions`: token_hash, identity_id, label, abilities, timestamps
//!
//! Session tokens are opaque 32-byte random values, hex-encoded. Only the
//! SHA-256 hash is persisted — the raw value is the lookup key and gets the
//! same at-rest protection as a password. A token moves one way through
//! Issued → Active → Expired | Revoked; there is no path back.

use crate::error::{ApiError, FieldError};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Token byte length before hex encoding (32 bytes = 64 hex chars).
const TOKEN_BYTES: usize = 32;

/// Salt byte length for password hashing.
const SALT_BYTES: usize = 16;

/// Number of SHA-256 iterations for password stretching.
const HASH_ITERATIONS: u32 = 100_000;

/// Minimum accepted password length.
const MIN_PASSWORD_LEN: usize = 8;

pub type StoreResult<T> = Result<T, ApiError>;

/// Closed set of account roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "standard-user")]
    Standard,
    #[serde(rename = "administrator")]
    Administrator,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "standard-user" => Some(Self::Standard),
            "administrator" => Some(Self::Administrator),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard-user",
            Self::Administrator => "administrator",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered identity. The password hash is deliberately not a field:
/// it can never leak through serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marital_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Stored avatar filename under the uploads directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: i64,
}

/// Partial profile update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub age: Option<u32>,
    pub sex: Option<String>,
    pub phone: Option<String>,
    pub marital_status: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    /// New avatar filename (already written to disk by the caller).
    pub image: Option<String>,
}

/// Outcome of a profile update: the fresh identity plus the previous avatar
/// filename when a new one replaced it, so the caller can delete the file.
#[derive(Debug)]
pub struct ProfileUpdated {
    pub identity: Identity,
    pub replaced_image: Option<String>,
}

/// An authenticated session, resolved from a presented bearer token.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub identity: Identity,
    pub label: String,
    pub abilities: Vec<String>,
    pub expires_at: Option<i64>,
}

/// SQLite-backed store for identities and session tokens.
pub struct AuthStore {
    conn: Mutex<rusqlite::Connection>,
    session_ttl_secs: u64,
}

impl AuthStore {
    /// Open (or create) the database at the given path.
    /// `session_ttl_secs = 0` makes issued tokens non-expiring.
    pub fn open(db_path: &Path, session_ttl_secs: u64) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(db_path)?;
        Self::init(conn, session_ttl_secs)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(session_ttl_secs: u64) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn, session_ttl_secs)
    }

    fn init(conn: rusqlite::Connection, session_ttl_secs: u64) -> anyhow::Result<Self> {
        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                role TEXT NOT NULL,
                age INTEGER,
                sex TEXT,
                phone TEXT,
                marital_status TEXT,
                address TEXT,
                city TEXT,
                state TEXT,
                country TEXT,
                image TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                label TEXT NOT NULL,
                abilities TEXT NOT NULL DEFAULT '[\"*\"]',
                created_at INTEGER NOT NULL,
                last_used_at INTEGER,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_identity ON sessions(identity_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            session_ttl_secs,
        })
    }

    // ── Credential Store ────────────────────────────────────────────

    /// Register a new identity. The password is stored only in stretched,
    /// salted form.
    pub fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> StoreResult<Identity> {
        let name = name.trim();
        let email = email.trim();

        let mut problems = Vec::new();
        if name.is_empty() {
            problems.push(FieldError::new("name", "Name cannot be empty"));
        }
        if name.len() > 255 {
            problems.push(FieldError::new("name", "Name too long (max 255 characters)"));
        }
        if !looks_like_email(email) {
            problems.push(FieldError::new("email", "Invalid email address"));
        }
        if password.len() < MIN_PASSWORD_LEN {
            problems.push(FieldError::new(
                "password",
                "Password must be at least 8 characters",
            ));
        }
        if !problems.is_empty() {
            return Err(ApiError::Validation(problems));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let salt = generate_salt();
        let password_hash = hash_password(password, &salt);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO identities (id, name, email, password_hash, salt, role, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![id, name, email, password_hash, salt, role.as_str(), now],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(ApiError::DuplicateEmail);
            }
            Err(e) => return Err(storage_error(e)),
        }

        drop(conn);
        self.get(&id)?
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("identity vanished after insert")))
    }

    /// Look up an identity by email (case-insensitive).
    pub fn find_by_email(&self, email: &str) -> StoreResult<Option<Identity>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE email = ?1 COLLATE NOCASE"),
            rusqlite::params![email.trim()],
            identity_from_row,
        );
        optional(row)
    }

    /// Look up an identity by id.
    pub fn get(&self, id: &str) -> StoreResult<Option<Identity>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
            rusqlite::params![id],
            identity_from_row,
        );
        optional(row)
    }

    /// Constant-time password check against the stored hash.
    pub fn verify_password(&self, identity: &Identity, password: &str) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let row: Result<(String, String), _> = conn.query_row(
            "SELECT password_hash, salt FROM identities WHERE id = ?1",
            rusqlite::params![identity.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        );
        match row {
            Ok((stored_hash, salt)) => {
                let attempt = hash_password(password, &salt);
                Ok(constant_time_eq(
                    stored_hash.as_bytes(),
                    attempt.as_bytes(),
                ))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(storage_error(e)),
        }
    }

    /// Resolve email + password to an identity. The failure is identical
    /// for an unknown email and a wrong password.
    pub fn login(&self, email: &str, password: &str) -> StoreResult<Identity> {
        match self.find_by_email(email)? {
            Some(identity) => {
                if self.verify_password(&identity, password)? {
                    Ok(identity)
                } else {
                    Err(ApiError::InvalidCredentials)
                }
            }
            None => {
                // Dummy hash to flatten the timing difference
                let _ = hash_password(password, "0000000000000000");
                Err(ApiError::InvalidCredentials)
            }
        }
    }

    /// Apply a partial profile update. Email uniqueness is re-checked by the
    /// UNIQUE constraint when the email changes.
    pub fn update_profile(&self, id: &str, update: &ProfileUpdate) -> StoreResult<ProfileUpdated> {
        if let Some(name) = &update.name {
            if name.trim().is_empty() {
                return Err(ApiError::validation("name", "Name cannot be empty"));
            }
        }
        if let Some(email) = &update.email {
            if !looks_like_email(email.trim()) {
                return Err(ApiError::validation("email", "Invalid email address"));
            }
        }
        if let Some(sex) = &update.sex {
            if !matches!(sex.as_str(), "male" | "female" | "other") {
                return Err(ApiError::validation("sex", "Must be male, female or other"));
            }
        }
        if let Some(status) = &update.marital_status {
            if !matches!(status.as_str(), "married" | "single" | "divorced") {
                return Err(ApiError::validation(
                    "marital_status",
                    "Must be married, single or divorced",
                ));
            }
        }

        let previous = self.get(id)?.ok_or(ApiError::NotFound("identity"))?;

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        macro_rules! set_field {
            ($column:literal, $value:expr) => {
                values.push(Box::new($value));
                sets.push(format!(concat!($column, " = ?{}"), values.len()));
            };
        }

        if let Some(v) = &update.name {
            set_field!("name", v.trim().to_string());
        }
        if let Some(v) = &update.email {
            set_field!("email", v.trim().to_string());
        }
        if let Some(v) = update.age {
            set_field!("age", v);
        }
        if let Some(v) = &update.sex {
            set_field!("sex", v.clone());
        }
        if let Some(v) = &update.phone {
            set_field!("phone", v.clone());
        }
        if let Some(v) = &update.marital_status {
            set_field!("marital_status", v.clone());
        }
        if let Some(v) = &update.address {
            set_field!("address", v.clone());
        }
        if let Some(v) = &update.city {
            set_field!("city", v.clone());
        }
        if let Some(v) = &update.state {
            set_field!("state", v.clone());
        }
        if let Some(v) = &update.country {
            set_field!("country", v.clone());
        }
        if let Some(v) = &update.image {
            set_field!("image", v.clone());
        }

        if !sets.is_empty() {
            values.push(Box::new(id.to_string()));
            let sql = format!(
                "UPDATE identities SET {} WHERE id = ?{}",
                sets.join(", "),
                values.len()
            );
            let conn = self.conn.lock();
            let params: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            match conn.execute(&sql, params.as_slice()) {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(ApiError::DuplicateEmail);
                }
                Err(e) => return Err(storage_error(e)),
            }
        }

        let identity = self.get(id)?.ok_or(ApiError::NotFound("identity"))?;
        let replaced_image = match (&update.image, &previous.image) {
            (Some(new), Some(old)) if new != old => Some(old.clone()),
            _ => None,
        };
        Ok(ProfileUpdated {
            identity,
            replaced_image,
        })
    }

    // ── Session/Token Manager ───────────────────────────────────────

    /// Issue an opaque bearer token bound to an identity. The plaintext
    /// value is returned exactly once; only its hash is persisted.
    pub fn issue_token(
        &self,
        identity: &Identity,
        label: &str,
        abilities: &[&str],
    ) -> StoreResult<String> {
        let token = generate_token();
        let token_hash = hash_token(&token);
        let now = epoch_secs() as i64;
        let expires_at = (self.session_ttl_secs > 0).then(|| now + self.session_ttl_secs as i64);
        let abilities_json =
            serde_json::to_string(abilities).map_err(|e| ApiError::Internal(e.into()))?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (token_hash, identity_id, label, abilities, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![token_hash, identity.id, label, abilities_json, now, expires_at],
        )
        .map_err(storage_error)?;

        Ok(token)
    }

    /// Validate a presented token and resolve the bound identity.
    ///
    /// Unknown tokens fail with `InvalidToken`, expired ones with
    /// `ExpiredToken`. The last-used timestamp update is best-effort and
    /// last-write-wins under concurrency.
    pub fn authenticate(&self, token: &str) -> StoreResult<AuthSession> {
        let token_hash = hash_token(token);
        let now = epoch_secs() as i64;

        let conn = self.conn.lock();
        let row: Result<(String, String, String, Option<i64>), _> = conn.query_row(
            "SELECT identity_id, label, abilities, expires_at
             FROM sessions WHERE token_hash = ?1",
            rusqlite::params![token_hash],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        );

        let (identity_id, label, abilities_json, expires_at) = match row {
            Ok(r) => r,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(ApiError::InvalidToken),
            Err(e) => return Err(storage_error(e)),
        };

        if let Some(deadline) = expires_at {
            if deadline <= now {
                // Terminal state; drop the row so the token can never revive.
                let _ = conn.execute(
                    "DELETE FROM sessions WHERE token_hash = ?1",
                    rusqlite::params![token_hash],
                );
                return Err(ApiError::ExpiredToken);
            }
        }

        if let Err(e) = conn.execute(
            "UPDATE sessions SET last_used_at = ?1 WHERE token_hash = ?2",
            rusqlite::params![now, token_hash],
        ) {
            tracing::warn!(error = %e, "failed to update session last_used_at");
        }
        drop(conn);

        let identity = self.get(&identity_id)?.ok_or(ApiError::InvalidToken)?;
        let abilities: Vec<String> =
            serde_json::from_str(&abilities_json).unwrap_or_else(|_| vec!["*".into()]);

        Ok(AuthSession {
            identity,
            label,
            abilities,
            expires_at,
        })
    }

    /// Revoke every token bound to an identity (logout-all semantics).
    pub fn revoke_all(&self, identity_id: &str) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM sessions WHERE identity_id = ?1",
                rusqlite::params![identity_id],
            )
            .map_err(storage_error)?;
        Ok(deleted as u64)
    }

    /// Delete sessions whose expiry has passed.
    pub fn sweep_expired(&self) -> StoreResult<u64> {
        let now = epoch_secs() as i64;
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM sessions WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                rusqlite::params![now],
            )
            .map_err(storage_error)?;
        Ok(deleted as u64)
    }

    /// Lightweight reachability probe for the health endpoint.
    pub fn ping(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM identities", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|_| ())
        .map_err(storage_error)
    }

    #[cfg(test)]
    fn force_expire(&self, token: &str) {
        let token_hash = hash_token(token);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sessions SET expires_at = 1 WHERE token_hash = ?1",
            rusqlite::params![token_hash],
        )
        .unwrap();
    }

    #[cfg(test)]
    fn drop_sessions_table(&self) {
        let conn = self.conn.lock();
        conn.execute_batch("DROP TABLE sessions;").unwrap();
    }
}

const IDENTITY_COLUMNS: &str = "id, name, email, role, age, sex, phone, marital_status, \
                                address, city, state, country, image, created_at";

fn identity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    let role_raw: String = row.get(3)?;
    Ok(Identity {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        role: Role::parse(&role_raw).unwrap_or(Role::Standard),
        age: row.get(4)?,
        sex: row.get(5)?,
        phone: row.get(6)?,
        marital_status: row.get(7)?,
        address: row.get(8)?,
        city: row.get(9)?,
        state: row.get(10)?,
        country: row.get(11)?,
        image: row.get(12)?,
        created_at: row.get(13)?,
    })
}

fn optional(row: rusqlite::Result<Identity>) -> StoreResult<Option<Identity>> {
    match row {
        Ok(identity) => Ok(Some(identity)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(storage_error(e)),
    }
}

/// Map a storage failure: a structurally missing table means the auth
/// system is unavailable and must be surfaced as such — never worked
/// around by issuing a weaker credential.
fn storage_error(e: rusqlite::Error) -> ApiError {
    let message = e.to_string();
    if message.contains("no such table") {
        ApiError::Infrastructure(anyhow::Error::new(e))
    } else {
        ApiError::Internal(anyhow::Error::new(e))
    }
}

/// Cheap structural email check; real deliverability is out of scope.
fn looks_like_email(email: &str) -> bool {
    if email.is_empty() || email.len() > 255 || email.contains(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

// ── Cryptographic helpers ───────────────────────────────────────────

/// Generate a random salt (hex-encoded).
fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random session token (hex-encoded).
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a password with salt using iterated SHA-256.
fn hash_password(password: &str, salt: &str) -> String {
    let mut hash = Sha256::new();
    hash.update(salt.as_bytes());
    hash.update(password.as_bytes());
    let mut result = hash.finalize();

    // Iterated hashing for key stretching
    for _ in 1..HASH_ITERATIONS {
        let mut h = Sha256::new();
        h.update(result);
        h.update(salt.as_bytes());
        result = h.finalize();
    }

    hex::encode(result)
}

/// Hash a session token (single pass — tokens are already high-entropy).
fn hash_token(token: &str) -> String {
    let mut h = Sha256::new();
    h.update(token.as_bytes());
    hex::encode(h.finalize())
}

/// Constant-time byte comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> AuthStore {
        AuthStore::open_in_memory(3600).unwrap()
    }

    fn register_alice(store: &AuthStore) -> Identity {
        store
            .register("Alice", "alice@example.com", "password123", Role::Standard)
            .unwrap()
    }

    #[test]
    fn register_and_login() {
        let store = test_store();
        let identity = register_alice(&store);
        assert_eq!(identity.email, "alice@example.com");
        assert_eq!(identity.role, Role::Standard);

        let resolved = store.login("alice@example.com", "password123").unwrap();
        assert_eq!(resolved.id, identity.id);
    }

    #[test]
    fn serialized_identity_never_contains_password_material() {
        let store = test_store();
        let identity = register_alice(&store);
        let json = serde_json::to_string(&identity).unwrap();
        assert!(!json.contains("password"));
        assert!(!json.contains("hash"));
        assert!(!json.contains("salt"));
    }

    #[test]
    fn duplicate_email_rejected() {
        let store = test_store();
        register_alice(&store);
        let result = store.register("Other", "alice@example.com", "password456", Role::Standard);
        assert!(matches!(result, Err(ApiError::DuplicateEmail)));
        // No partial record: the original identity is untouched.
        let found = store.find_by_email("alice@example.com").unwrap().unwrap();
        assert_eq!(found.name, "Alice");
    }

    #[test]
    fn duplicate_email_is_case_insensitive() {
        let store = test_store();
        register_alice(&store);
        let result = store.register("Other", "ALICE@Example.COM", "password456", Role::Standard);
        assert!(matches!(result, Err(ApiError::DuplicateEmail)));
    }

    #[test]
    fn short_password_rejected() {
        let store = test_store();
        let result = store.register("Bob", "bob@example.com", "short", Role::Standard);
        match result {
            Err(ApiError::Validation(fields)) => {
                assert!(fields.iter().any(|f| f.field == "password"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_email_rejected() {
        let store = test_store();
        for bad in ["", "plain", "a@b", "a b@example.com", "@example.com"] {
            let result = store.register("Bob", bad, "password123", Role::Standard);
            assert!(
                matches!(result, Err(ApiError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn wrong_password_and_unknown_email_are_indistinguishable() {
        let store = test_store();
        register_alice(&store);

        let wrong_pw = store
            .login("alice@example.com", "wrongpassword")
            .unwrap_err();
        let no_user = store.login("ghost@example.com", "wrongpassword").unwrap_err();
        assert_eq!(wrong_pw.to_string(), no_user.to_string());
        assert!(matches!(wrong_pw, ApiError::InvalidCredentials));
        assert!(matches!(no_user, ApiError::InvalidCredentials));
    }

    #[test]
    fn token_authenticates_until_revoked() {
        let store = test_store();
        let identity = register_alice(&store);
        let token = store.issue_token(&identity, "auth_token", &["*"]).unwrap();
        assert_eq!(token.len(), TOKEN_BYTES * 2);

        let session = store.authenticate(&token).unwrap();
        assert_eq!(session.identity.id, identity.id);
        assert_eq!(session.abilities, vec!["*".to_string()]);

        store.revoke_all(&identity.id).unwrap();
        assert!(matches!(
            store.authenticate(&token),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn token_is_distinct_from_password() {
        let store = test_store();
        let identity = register_alice(&store);
        let token = store.issue_token(&identity, "auth_token", &["*"]).unwrap();
        assert_ne!(token, "password123");
    }

    #[test]
    fn never_issued_token_rejected() {
        let store = test_store();
        assert!(matches!(
            store.authenticate("deadbeef".repeat(8).as_str()),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn expired_token_is_terminal() {
        let store = test_store();
        let identity = register_alice(&store);
        let token = store.issue_token(&identity, "auth_token", &["*"]).unwrap();
        store.force_expire(&token);

        assert!(matches!(
            store.authenticate(&token),
            Err(ApiError::ExpiredToken)
        ));
        // Second attempt: the row is gone, so the token can never revive.
        assert!(matches!(
            store.authenticate(&token),
            Err(ApiError::InvalidToken)
        ));
    }

    #[test]
    fn zero_ttl_means_no_expiry() {
        let store = AuthStore::open_in_memory(0).unwrap();
        let identity = register_alice(&store);
        let token = store.issue_token(&identity, "auth_token", &["*"]).unwrap();
        let session = store.authenticate(&token).unwrap();
        assert_eq!(session.expires_at, None);
    }

    #[test]
    fn revoke_all_counts_sessions() {
        let store = test_store();
        let identity = register_alice(&store);
        let t1 = store.issue_token(&identity, "web", &["*"]).unwrap();
        let t2 = store.issue_token(&identity, "phone", &["*"]).unwrap();
        assert_ne!(t1, t2);

        assert_eq!(store.revoke_all(&identity.id).unwrap(), 2);
        assert!(store.authenticate(&t1).is_err());
        assert!(store.authenticate(&t2).is_err());
    }

    #[test]
    fn missing_sessions_table_surfaces_unavailability() {
        let store = test_store();
        let identity = register_alice(&store);
        store.drop_sessions_table();

        // Issue must fail loudly, never fall back to a predictable token.
        let issue = store.issue_token(&identity, "auth_token", &["*"]);
        assert!(matches!(issue, Err(ApiError::Infrastructure(_))));

        let auth = store.authenticate(&"ab".repeat(32));
        assert!(matches!(auth, Err(ApiError::Infrastructure(_))));
    }

    #[test]
    fn profile_partial_update() {
        let store = test_store();
        let identity = register_alice(&store);

        let update = ProfileUpdate {
            city: Some("Lisbon".into()),
            age: Some(33),
            ..Default::default()
        };
        let result = store.update_profile(&identity.id, &update).unwrap();
        assert_eq!(result.identity.city.as_deref(), Some("Lisbon"));
        assert_eq!(result.identity.age, Some(33));
        // Untouched fields survive.
        assert_eq!(result.identity.name, "Alice");
        assert_eq!(result.identity.email, "alice@example.com");
    }

    #[test]
    fn profile_email_change_rechecks_uniqueness() {
        let store = test_store();
        let identity = register_alice(&store);
        store
            .register("Bob", "bob@example.com", "password456", Role::Standard)
            .unwrap();

        let update = ProfileUpdate {
            email: Some("bob@example.com".into()),
            ..Default::default()
        };
        let result = store.update_profile(&identity.id, &update);
        assert!(matches!(result, Err(ApiError::DuplicateEmail)));
    }

    #[test]
    fn profile_invalid_sex_rejected() {
        let store = test_store();
        let identity = register_alice(&store);
        let update = ProfileUpdate {
            sex: Some("unknown".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.update_profile(&identity.id, &update),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn profile_image_replacement_reports_old_file() {
        let store = test_store();
        let identity = register_alice(&store);

        let first = ProfileUpdate {
            image: Some("one.jpg".into()),
            ..Default::default()
        };
        let result = store.update_profile(&identity.id, &first).unwrap();
        assert_eq!(result.replaced_image, None);

        let second = ProfileUpdate {
            image: Some("two.jpg".into()),
            ..Default::default()
        };
        let result = store.update_profile(&identity.id, &second).unwrap();
        assert_eq!(result.replaced_image.as_deref(), Some("one.jpg"));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = test_store();
        let identity = register_alice(&store);
        let stale = store.issue_token(&identity, "old", &["*"]).unwrap();
        let fresh = store.issue_token(&identity, "new", &["*"]).unwrap();
        store.force_expire(&stale);

        assert_eq!(store.sweep_expired().unwrap(), 1);
        assert!(store.authenticate(&fresh).is_ok());
    }

    #[test]
    fn role_parse_round_trip() {
        assert_eq!(Role::parse("standard-user"), Some(Role::Standard));
        assert_eq!(Role::parse("administrator"), Some(Role::Administrator));
        assert_eq!(Role::parse("superuser"), None);
        assert_eq!(Role::Standard.as_str(), "standard-user");
    }

    #[test]
    fn password_hash_is_deterministic_with_same_salt() {
        let h1 = hash_password("test_password", "fixed_salt_value");
        let h2 = hash_password("test_password", "fixed_salt_value");
        assert_eq!(h1, h2);
    }

    #[test]
    fn password_hash_differs_with_different_salt() {
        let h1 = hash_password("test_password", "salt_a");
        let h2 = hash_password("test_password", "salt_b");
        assert_ne!(h1, h2);
    }

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
