//! HTTP session client for the gateway.
//!
//! Owns an explicit `Session` value instead of ambient globals: login
//! installs it, logout and any 401 clear it. Before a state-changing
//! request the client ensures a cached anti-forgery token, collapsing
//! concurrent fetches onto a single request; a token the gateway
//! rejects is dropped and refetched once. Responses pass through one
//! normalization boundary that maps every accepted wire shape to the
//! canonical `Session` struct.

use crate::blog::Post;
use crate::config::ClientConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const XSRF_HEADER: &str = "X-XSRF-TOKEN";
const XSRF_COOKIE: &str = "XSRF-TOKEN";

/// Failures surfaced to client callers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The gateway rejected the session; local state has been cleared.
    #[error("session rejected")]
    Unauthorized,

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Response body did not carry the fields the protocol requires.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Identity fields the client keeps after login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientIdentity {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: String,
}

/// Canonical session state: the identity plus its bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: ClientIdentity,
    pub token: String,
}

/// Session slot with a generation counter. Every clear bumps the
/// generation, so a response that raced with a sign-out cannot
/// resurrect the old session.
#[derive(Debug, Default)]
struct SessionSlot {
    generation: u64,
    session: Option<Session>,
}

/// API client implementing the session bootstrap protocol.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    retry_attempts: u32,
    retry_backoff: Duration,
    /// Cached anti-forgery token. The async mutex is held across the
    /// fetch, so concurrent callers wait for the one in-flight request
    /// instead of issuing their own.
    csrf: tokio::sync::Mutex<Option<String>>,
    session: Mutex<SessionSlot>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            retry_attempts: config.retry_attempts,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            csrf: tokio::sync::Mutex::new(None),
            session: Mutex::new(SessionSlot::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Current session, if signed in.
    pub fn session(&self) -> Option<Session> {
        self.session.lock().session.clone()
    }

    /// Drop the session and bump the generation so late responses from
    /// the previous session are discarded.
    pub fn clear_session(&self) {
        let mut slot = self.session.lock();
        slot.generation += 1;
        slot.session = None;
    }

    fn install_session(&self, generation: u64, session: Session) -> Result<(), ClientError> {
        let mut slot = self.session.lock();
        if slot.generation != generation {
            return Err(ClientError::Malformed(
                "session changed while request was in flight".into(),
            ));
        }
        slot.session = Some(session);
        Ok(())
    }

    fn bearer_token(&self) -> Option<String> {
        self.session.lock().session.as_ref().map(|s| s.token.clone())
    }

    // ── Anti-forgery bootstrap ──────────────────────────────────────

    /// Return the cached anti-forgery token, fetching one if absent.
    /// Single-flight: N concurrent callers produce one HTTP request and
    /// N identical values.
    pub async fn ensure_csrf(&self) -> Result<String, ClientError> {
        let mut cached = self.csrf.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let response = self.http.get(self.url("/api/csrf-token")).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let body: Value = response.json().await?;
        let token = body
            .get("csrf_token")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Malformed("csrf_token missing".into()))?
            .to_owned();

        *cached = Some(token.clone());
        Ok(token)
    }

    /// Forget the cached anti-forgery token; the next state-changing
    /// request fetches a fresh one.
    pub async fn invalidate_csrf(&self) {
        *self.csrf.lock().await = None;
    }

    // ── Auth operations ─────────────────────────────────────────────

    /// Register a new account. Server failures are never auto-retried;
    /// only a rejected anti-forgery token triggers the single
    /// refresh-and-resend in `send_with_csrf`, with the header attached
    /// on every attempt.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        role: &str,
    ) -> Result<ClientIdentity, ClientError> {
        let payload = json!({
            "name": name,
            "email": email,
            "password": password,
            "role": role,
        });
        let body = self
            .send_with_csrf(|csrf| {
                self.http
                    .post(self.url("/api/register"))
                    .header(XSRF_HEADER, csrf)
                    .header(reqwest::header::COOKIE, format!("{XSRF_COOKIE}={csrf}"))
                    .json(&payload)
            })
            .await?;
        extract_identity(&body)
    }

    /// Sign in and install the resulting session. A server failure is
    /// reported as-is, never followed by a weaker retry without the
    /// anti-forgery header.
    pub async fn login(&self, email: &str, password: &str) -> Result<Session, ClientError> {
        let generation = self.session.lock().generation;
        let payload = json!({"email": email, "password": password});

        let body = self
            .send_with_csrf(|csrf| {
                self.http
                    .post(self.url("/api/login"))
                    .header(XSRF_HEADER, csrf)
                    .header(reqwest::header::COOKIE, format!("{XSRF_COOKIE}={csrf}"))
                    .json(&payload)
            })
            .await?;
        let session = normalize_auth_payload(&body)?;
        self.install_session(generation, session.clone())?;
        Ok(session)
    }

    /// Sign out. The local session is cleared no matter what the
    /// gateway answers, so a dropped response cannot leave a token
    /// lingering client-side.
    pub async fn logout(&self) -> Result<(), ClientError> {
        let token = match self.bearer_token() {
            Some(t) => t,
            None => return Ok(()),
        };

        let result = self
            .send_with_csrf(|csrf| {
                self.http
                    .post(self.url("/api/logout"))
                    .bearer_auth(&token)
                    .header(XSRF_HEADER, csrf)
                    .header(reqwest::header::COOKIE, format!("{XSRF_COOKIE}={csrf}"))
            })
            .await;

        self.clear_session();
        result.map(|_| ())
    }

    /// Update profile fields, optionally replacing the avatar, via the
    /// multipart endpoint. Returns the refreshed identity.
    pub async fn update_profile(
        &self,
        fields: &[(&str, &str)],
        avatar: Option<(&str, Vec<u8>)>,
    ) -> Result<ClientIdentity, ClientError> {
        let token = self.bearer_token().ok_or(ClientError::Unauthorized)?;

        let body = self
            .send_with_csrf(|csrf| {
                let mut form = reqwest::multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name.to_string(), value.to_string());
                }
                if let Some((filename, bytes)) = &avatar {
                    form = form.part(
                        "image",
                        reqwest::multipart::Part::bytes(bytes.clone())
                            .file_name(filename.to_string()),
                    );
                }
                self.http
                    .post(self.url("/api/profile/update"))
                    .bearer_auth(&token)
                    .header(XSRF_HEADER, csrf)
                    .header(reqwest::header::COOKIE, format!("{XSRF_COOKIE}={csrf}"))
                    .multipart(form)
            })
            .await?;
        extract_identity(&body)
    }

    /// Fetch the identity behind the current session.
    pub async fn current_user(&self) -> Result<ClientIdentity, ClientError> {
        let body = self.get_json("/api/user").await?;
        extract_identity(&body)
    }

    // ── Blog reads ──────────────────────────────────────────────────

    pub async fn fetch_posts(&self) -> Result<Vec<Post>, ClientError> {
        let body = self.get_json("/api/blogs").await?;
        extract_posts(&body)
    }

    pub async fn fetch_my_posts(&self) -> Result<Vec<Post>, ClientError> {
        let body = self.get_json("/api/my-blogs").await?;
        extract_posts(&body)
    }

    // ── Request plumbing ────────────────────────────────────────────

    /// Send a state-changing request with the anti-forgery pair
    /// attached. The cached token is fetched if absent; if the gateway
    /// rejects it (restart, TTL lapse) the cache is dropped and the
    /// request resent exactly once with a fresh token. Both attempts
    /// carry the header — it is never stripped, and no other failure
    /// triggers a resend.
    async fn send_with_csrf<F>(&self, build: F) -> Result<Value, ClientError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let csrf = self.ensure_csrf().await?;
        let response = build(&csrf).send().await?;
        match self.check(response).await {
            Err(ClientError::Rejected {
                status: 403,
                message,
            }) if is_csrf_rejection(&message) => {
                self.invalidate_csrf().await;
                let csrf = self.ensure_csrf().await?;
                let response = build(&csrf).send().await?;
                self.check(response).await
            }
            other => other,
        }
    }

    /// GET with bounded linear-backoff retry. Only transport failures
    /// retry; an HTTP response, whatever its status, is final.
    async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        let mut attempt = 0u32;
        loop {
            let mut request = self.http.get(self.url(path));
            if let Some(token) = self.bearer_token() {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => return self.check(response).await,
                Err(e) if attempt < self.retry_attempts => {
                    attempt += 1;
                    let delay = self.retry_backoff * attempt;
                    tracing::debug!(path, attempt, error = %e, "transport failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Convert a response into its JSON body, clearing the session on
    /// any 401.
    async fn check(&self, response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.clear_session();
            return Err(ClientError::Unauthorized);
        }
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or(Value::Null);
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_owned();
            return Err(ClientError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

/// Whether a 403 body is the gateway's anti-forgery rejection rather
/// than an ownership refusal.
fn is_csrf_rejection(message: &str) -> bool {
    message.to_ascii_lowercase().contains("anti-forgery")
}

// ── Normalization boundary ──────────────────────────────────────────
//
// Every wire shape the gateway (or an older deployment of it) emits is
// mapped here, and only here, to the canonical structs.

/// Token lives at `token`, `access_token`, or `data.token`.
fn extract_token(body: &Value) -> Option<String> {
    body.get("token")
        .or_else(|| body.get("access_token"))
        .or_else(|| body.get("data").and_then(|d| d.get("token")))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Identity lives at `user` or `data`.
fn extract_identity(body: &Value) -> Result<ClientIdentity, ClientError> {
    let raw = body
        .get("user")
        .or_else(|| body.get("data"))
        .ok_or_else(|| ClientError::Malformed("identity missing from response".into()))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| ClientError::Malformed(format!("identity shape: {e}")))
}

fn normalize_auth_payload(body: &Value) -> Result<Session, ClientError> {
    let token =
        extract_token(body).ok_or_else(|| ClientError::Malformed("token missing".into()))?;
    let identity = extract_identity(body)?;
    Ok(Session { identity, token })
}

fn extract_posts(body: &Value) -> Result<Vec<Post>, ClientError> {
    let raw = body
        .get("data")
        .cloned()
        .ok_or_else(|| ClientError::Malformed("data missing from response".into()))?;
    serde_json::from_value(raw).map_err(|e| ClientError::Malformed(format!("post shape: {e}")))
}
