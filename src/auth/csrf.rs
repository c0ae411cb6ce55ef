//! Anti-forgery (CSRF) token issue and validation.
//!
//! Double-submit scheme: `GET /api/csrf-token` hands the browser a random
//! value both as an `XSRF-TOKEN` cookie and in the response body; every
//! state-changing request must echo it back in the `X-XSRF-TOKEN` header.
//! The guard only accepts header values it issued itself and that have not
//! aged out, so a forged cross-site request cannot fabricate a valid pair.
//!
//! Tokens live in memory with TTL-based expiry; entries are swept lazily on
//! issue. Validation is constant-time.

use crate::auth::store::constant_time_eq;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Anti-forgery token byte length before hex encoding.
const CSRF_TOKEN_BYTES: usize = 32;

/// Cap on outstanding tokens; oldest are evicted past this point.
const MAX_ACTIVE_TOKENS: usize = 10_000;

/// In-memory issuer/validator for anti-forgery tokens.
pub struct CsrfGuard {
    issued: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl CsrfGuard {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            issued: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    /// Issue a fresh token and remember it until its TTL lapses.
    pub fn issue(&self) -> String {
        let mut bytes = [0u8; CSRF_TOKEN_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let now = Instant::now();
        let mut issued = self.issued.lock();
        issued.retain(|_, at| now.duration_since(*at) < self.ttl);
        if issued.len() >= MAX_ACTIVE_TOKENS {
            if let Some(oldest) = issued
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(t, _)| t.clone())
            {
                issued.remove(&oldest);
            }
        }
        issued.insert(token.clone(), now);
        token
    }

    /// Check a header/cookie pair: both present, equal (constant-time), and
    /// the value was issued here and is still live.
    pub fn validate(&self, header: Option<&str>, cookie: Option<&str>) -> bool {
        let (Some(header), Some(cookie)) = (header, cookie) else {
            return false;
        };
        if !constant_time_eq(header.as_bytes(), cookie.as_bytes()) {
            return false;
        }

        let issued = self.issued.lock();
        match issued.get(header) {
            Some(at) => at.elapsed() < self.ttl,
            None => false,
        }
    }

    #[cfg(test)]
    fn backdate(&self, token: &str, by: Duration) {
        let mut issued = self.issued.lock();
        if let Some(at) = issued.get_mut(token) {
            *at = Instant::now() - by;
        }
    }
}
