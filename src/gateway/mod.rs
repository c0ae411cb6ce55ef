//! Axum-based HTTP gateway with body limits, timeouts, and CORS.
//!
//! Auth endpoints sit behind a sliding-window rate limiter, and every
//! state-changing route requires a valid anti-forgery pair — including
//! login and register, with no bypass on any error path.

use crate::auth::{AuthSession, AuthStore, CsrfGuard, ProfileUpdate, Role};
use crate::blog::{BlogStore, NewPost, PostUpdate, SearchFilter};
use crate::config::Config;
use crate::error::ApiError;
use anyhow::Result;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{delete, get, post, put},
    Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

/// Maximum request body size (4MB) — leaves room for avatar multipart parts.
pub const MAX_BODY_SIZE: usize = 4 * 1024 * 1024;
/// Request timeout (30s).
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Sliding window used by gateway rate limiting.
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// Cookie used by the double-submit anti-forgery scheme.
const XSRF_COOKIE: &str = "XSRF-TOKEN";
/// Header the client echoes the cookie value back in.
const XSRF_HEADER: &str = "x-xsrf-token";

/// Avatar extensions accepted for profile uploads.
const AVATAR_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

/// How often the rate limiter sweeps stale IP entries from its map.
const RATE_LIMITER_SWEEP_INTERVAL_SECS: u64 = 300; // 5 minutes

#[derive(Debug)]
struct SlidingWindowRateLimiter {
    limit_per_window: u32,
    window: Duration,
    requests: Mutex<(HashMap<String, Vec<Instant>>, Instant)>,
}

impl SlidingWindowRateLimiter {
    fn new(limit_per_window: u32, window: Duration) -> Self {
        Self {
            limit_per_window,
            window,
            requests: Mutex::new((HashMap::new(), Instant::now())),
        }
    }

    fn allow(&self, key: &str) -> bool {
        if self.limit_per_window == 0 {
            return true;
        }

        let now = Instant::now();
        let cutoff = now.checked_sub(self.window).unwrap_or_else(Instant::now);

        let mut guard = self.requests.lock();
        let (requests, last_sweep) = &mut *guard;

        // Periodic sweep: remove IPs with no recent requests
        if last_sweep.elapsed() >= Duration::from_secs(RATE_LIMITER_SWEEP_INTERVAL_SECS) {
            requests.retain(|_, timestamps| {
                timestamps.retain(|t| *t > cutoff);
                !timestamps.is_empty()
            });
            *last_sweep = now;
        }

        let entry = requests.entry(key.to_owned()).or_default();
        entry.retain(|instant| *instant > cutoff);

        if entry.len() >= self.limit_per_window as usize {
            return false;
        }

        entry.push(now);
        true
    }
}

/// Per-endpoint-group limiters for credential-guessing surfaces.
#[derive(Debug)]
pub struct GatewayRateLimiter {
    login: SlidingWindowRateLimiter,
    register: SlidingWindowRateLimiter,
}

impl GatewayRateLimiter {
    pub fn new(login_per_minute: u32, register_per_minute: u32) -> Self {
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);
        Self {
            login: SlidingWindowRateLimiter::new(login_per_minute, window),
            register: SlidingWindowRateLimiter::new(register_per_minute, window),
        }
    }
}

fn client_key_from_headers(headers: &HeaderMap) -> String {
    for header_name in ["X-Forwarded-For", "X-Real-IP"] {
        if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
            let first = value.split(',').next().unwrap_or("").trim();
            if !first.is_empty() {
                return first.to_owned();
            }
        }
    }
    "unknown".into()
}

/// Shared state for all axum handlers
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthStore>,
    pub blogs: Arc<BlogStore>,
    pub csrf: Arc<CsrfGuard>,
    pub rate_limiter: Arc<GatewayRateLimiter>,
    /// Directory avatar images are written to.
    pub uploads_dir: PathBuf,
    pub max_avatar_bytes: usize,
    pub allow_registration: bool,
}

/// Run the HTTP gateway.
pub async fn run_gateway(config: Config) -> Result<()> {
    let db_path = config.database.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let auth = Arc::new(AuthStore::open(&db_path, config.auth.session_ttl_secs)?);
    let blogs = Arc::new(BlogStore::open(&db_path)?);

    // Drop stale sessions left over from previous runs.
    match auth.sweep_expired() {
        Ok(n) if n > 0 => tracing::info!(count = n, "swept expired sessions"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "session sweep failed"),
    }

    let uploads_dir = config.uploads.resolved_dir();
    std::fs::create_dir_all(&uploads_dir)?;

    let state = AppState {
        auth,
        blogs,
        csrf: Arc::new(CsrfGuard::new(config.auth.csrf_ttl_secs)),
        rate_limiter: Arc::new(GatewayRateLimiter::new(10, 5)),
        uploads_dir,
        max_avatar_bytes: config.uploads.max_avatar_bytes,
        allow_registration: config.auth.allow_registration,
    };

    let app = build_router(state, &config.server.cors_allowed_origin)?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("gateway listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router with all middleware layers applied.
pub fn build_router(state: AppState, cors_origin: &str) -> Result<Router> {
    // Credentialed CORS requires an exact origin — a wildcard would break
    // the cookie half of the anti-forgery pair.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(cors_origin.parse()?))
        .allow_credentials(true)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(XSRF_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/api/csrf-token", get(handle_csrf_token))
        .route("/api/register", post(handle_register))
        .route("/api/login", post(handle_login))
        .route("/api/user", get(handle_current_user))
        .route("/api/logout", post(handle_logout))
        .route("/api/profile", get(handle_get_profile))
        .route("/api/profile/update", post(handle_update_profile))
        .route("/api/blogs", get(handle_blogs_list))
        .route("/api/blogs", post(handle_blog_create))
        .route("/api/blogs/search", get(handle_blogs_search))
        .route("/api/blogs/{id}", get(handle_blog_get))
        .route("/api/blogs/{id}", put(handle_blog_update))
        .route("/api/blogs/{id}", delete(handle_blog_delete))
        .route("/api/my-blogs", get(handle_my_blogs))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ));

    Ok(app)
}

/// Concrete return type for JSON handlers.
type ApiResponse = Result<(StatusCode, Json<Value>), ApiError>;

// ── Request guards ──────────────────────────────────────────────────

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Extract a named cookie value from the Cookie header.
fn extract_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Resolve the bearer token to a live session, or fail with 401.
fn require_session(state: &AppState, headers: &HeaderMap) -> Result<AuthSession, ApiError> {
    let token = extract_bearer_token(headers).ok_or(ApiError::InvalidToken)?;
    state.auth.authenticate(token)
}

/// Enforce the anti-forgery pair on a state-changing request. Applies to
/// every non-GET route, login/register included — there is no skip list
/// and no bypass on error.
fn require_csrf(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let header = headers.get(XSRF_HEADER).and_then(|v| v.to_str().ok());
    let cookie = extract_cookie(headers, XSRF_COOKIE);
    if state.csrf.validate(header, cookie) {
        Ok(())
    } else {
        Err(ApiError::CsrfMismatch)
    }
}

/// Decode an axum JSON extraction, turning rejections into 422s.
fn require_json<T>(
    body: Result<Json<T>, axum::extract::rejection::JsonRejection>,
) -> Result<T, ApiError> {
    match body {
        Ok(Json(inner)) => Ok(inner),
        Err(e) => Err(ApiError::validation("body", e.to_string())),
    }
}

// ── Health & anti-forgery ───────────────────────────────────────────

/// GET /health — database reachability probe.
async fn handle_health(State(state): State<AppState>) -> ApiResponse {
    match state.auth.ping() {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({"status": "ok", "database": "connected"})),
        )),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error", "database": "disconnected"})),
            ))
        }
    }
}

/// GET /api/csrf-token — issue an anti-forgery token as cookie + body.
async fn handle_csrf_token(State(state): State<AppState>) -> impl IntoResponse {
    let token = state.csrf.issue();
    let cookie = format!("{XSRF_COOKIE}={token}; Path=/; SameSite=Lax");
    (
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(json!({"csrf_token": token})),
    )
}

// ── Auth handlers ───────────────────────────────────────────────────

/// Request body for registration.
#[derive(Deserialize)]
struct RegisterBody {
    name: String,
    email: String,
    password: String,
    role: String,
}

/// Request body for login.
#[derive(Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

/// POST /api/register — create an identity.
async fn handle_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<RegisterBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    require_csrf(&state, &headers)?;

    if !state.allow_registration {
        return Ok((
            StatusCode::FORBIDDEN,
            Json(json!({"message": "Registration is disabled"})),
        ));
    }

    if !state
        .rate_limiter
        .register
        .allow(&client_key_from_headers(&headers))
    {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"message": "Too many registration attempts, slow down"})),
        ));
    }

    let body = require_json(body)?;
    let role = Role::parse(&body.role)
        .ok_or_else(|| ApiError::validation("role", "Must be standard-user or administrator"))?;

    let identity = state
        .auth
        .register(&body.name, &body.email, &body.password, role)?;

    tracing::info!(email = %identity.email, "identity registered");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "User registered successfully",
            "user": identity,
        })),
    ))
}

/// POST /api/login — verify credentials, issue a bearer token.
async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<LoginBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    require_csrf(&state, &headers)?;

    if !state
        .rate_limiter
        .login
        .allow(&client_key_from_headers(&headers))
    {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"message": "Too many login attempts, slow down"})),
        ));
    }

    let body = require_json(body)?;
    if body.email.trim().is_empty() || body.password.is_empty() {
        return Err(ApiError::validation(
            "email",
            "Email and password are required",
        ));
    }

    let identity = state.auth.login(&body.email, &body.password)?;
    let token = state.auth.issue_token(&identity, "auth_token", &["*"])?;

    tracing::info!(identity = %identity.id, "login succeeded");
    Ok((
        StatusCode::OK,
        Json(json!({
            "message": "Login successful",
            "user": identity,
            "token": token,
        })),
    ))
}

/// GET /api/user — current identity from the bearer token.
async fn handle_current_user(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let session = require_session(&state, &headers)?;
    Ok((StatusCode::OK, Json(json!({"user": session.identity}))))
}

/// POST /api/logout — revoke every token for the identity.
async fn handle_logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    require_csrf(&state, &headers)?;
    let session = require_session(&state, &headers)?;

    let revoked = state.auth.revoke_all(&session.identity.id)?;
    tracing::info!(identity = %session.identity.id, revoked, "logout, all sessions revoked");
    Ok((
        StatusCode::OK,
        Json(json!({"success": true, "message": "Successfully logged out."})),
    ))
}

// ── Profile handlers ────────────────────────────────────────────────

/// GET /api/profile — full profile of the current identity.
async fn handle_get_profile(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let session = require_session(&state, &headers)?;
    Ok((
        StatusCode::OK,
        Json(json!({"status": "success", "data": session.identity})),
    ))
}

/// POST /api/profile/update — multipart partial update, optional avatar.
async fn handle_update_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResponse {
    require_csrf(&state, &headers)?;
    let session = require_session(&state, &headers)?;

    let (mut update, avatar) = parse_profile_form(multipart, state.max_avatar_bytes).await?;

    // Persist the new avatar before touching the row, so a failed DB write
    // cannot leave the identity pointing at a file that does not exist.
    if let Some((extension, bytes)) = avatar {
        let filename = format!("{}.{extension}", Uuid::new_v4());
        tokio::fs::create_dir_all(&state.uploads_dir)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
        tokio::fs::write(state.uploads_dir.join(&filename), &bytes)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;
        update.image = Some(filename);
    }

    let outcome = state.auth.update_profile(&session.identity.id, &update)?;

    if let Some(old) = &outcome.replaced_image {
        if let Err(e) = tokio::fs::remove_file(state.uploads_dir.join(old)).await {
            tracing::warn!(file = %old, error = %e, "failed to delete replaced avatar");
        }
    }

    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": "Profile updated successfully",
            "data": outcome.identity,
        })),
    ))
}

/// Collect multipart fields into a `ProfileUpdate` plus optional avatar
/// bytes (extension, content).
async fn parse_profile_form(
    mut multipart: Multipart,
    max_avatar_bytes: usize,
) -> Result<(ProfileUpdate, Option<(String, Vec<u8>)>), ApiError> {
    let mut update = ProfileUpdate::default();
    let mut avatar = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation("body", e.to_string()))?
    {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };

        if name == "image" {
            let extension = field
                .file_name()
                .and_then(|f| f.rsplit_once('.'))
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default();
            if !AVATAR_EXTENSIONS.contains(&extension.as_str()) {
                return Err(ApiError::validation(
                    "image",
                    "Image must be jpeg, png, jpg or gif",
                ));
            }
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::validation("image", e.to_string()))?;
            if bytes.len() > max_avatar_bytes {
                return Err(ApiError::validation("image", "Image too large"));
            }
            avatar = Some((extension, bytes.to_vec()));
            continue;
        }

        let text = field
            .text()
            .await
            .map_err(|e| ApiError::validation("body", e.to_string()))?;
        if text.is_empty() {
            continue;
        }

        match name.as_str() {
            "name" => update.name = Some(text),
            "email" => update.email = Some(text),
            "age" => {
                let age = text
                    .parse::<u32>()
                    .map_err(|_| ApiError::validation("age", "Age must be a number"))?;
                update.age = Some(age);
            }
            "sex" => update.sex = Some(text),
            "phone" | "phoneNumber" => update.phone = Some(text),
            "status" | "marital_status" => update.marital_status = Some(text),
            "address" => update.address = Some(text),
            "city" => update.city = Some(text),
            "state" => update.state = Some(text),
            "country" => update.country = Some(text),
            _ => {} // unknown fields are ignored
        }
    }

    Ok((update, avatar))
}

// ── Blog handlers ───────────────────────────────────────────────────

/// Request body for creating/updating a post.
#[derive(Deserialize)]
struct PostBody {
    title: Option<String>,
    content: Option<String>,
    author_name: Option<String>,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    filter: Option<String>,
}

/// GET /api/blogs — all posts, newest first.
async fn handle_blogs_list(State(state): State<AppState>) -> ApiResponse {
    let posts = state.blogs.list_latest()?;
    Ok((
        StatusCode::OK,
        Json(json!({"status": "success", "data": posts})),
    ))
}

/// GET /api/blogs/{id}
async fn handle_blog_get(State(state): State<AppState>, Path(id): Path<String>) -> ApiResponse {
    let post = state.blogs.get(&id)?.ok_or(ApiError::NotFound("post"))?;
    Ok((
        StatusCode::OK,
        Json(json!({"status": "success", "data": post})),
    ))
}

/// GET /api/blogs/search?query=&filter=
async fn handle_blogs_search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResponse {
    let filter = SearchFilter::parse(params.filter.as_deref().unwrap_or("all"));
    let posts = state.blogs.search(&params.query, filter)?;
    Ok((
        StatusCode::OK,
        Json(json!({"status": "success", "data": posts})),
    ))
}

/// GET /api/my-blogs — posts owned by the current identity.
async fn handle_my_blogs(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let session = require_session(&state, &headers)?;
    let posts = state.blogs.list_by_user(&session.identity.id)?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "user": {
                "id": session.identity.id,
                "name": session.identity.name,
                "email": session.identity.email,
            },
            "total_posts": posts.len(),
            "data": posts,
        })),
    ))
}

/// POST /api/blogs — create a post owned by the current identity.
async fn handle_blog_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<PostBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    require_csrf(&state, &headers)?;
    let session = require_session(&state, &headers)?;
    let body = require_json(body)?;

    let post = state.blogs.create(&NewPost {
        user_id: session.identity.id.clone(),
        title: body.title.unwrap_or_default(),
        content: body.content.unwrap_or_default(),
        author_name: body
            .author_name
            .unwrap_or_else(|| session.identity.name.clone()),
    })?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"status": "success", "data": post})),
    ))
}

/// Owner-or-administrator check for mutating someone's post.
fn authorize_post_access(session: &AuthSession, owner_id: &str) -> Result<(), ApiError> {
    if session.identity.id == owner_id || session.identity.role == Role::Administrator {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// PUT /api/blogs/{id}
async fn handle_blog_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<PostBody>, axum::extract::rejection::JsonRejection>,
) -> ApiResponse {
    require_csrf(&state, &headers)?;
    let session = require_session(&state, &headers)?;
    let body = require_json(body)?;

    let post = state.blogs.get(&id)?.ok_or(ApiError::NotFound("post"))?;
    authorize_post_access(&session, &post.user_id)?;

    let updated = state.blogs.update(
        &id,
        &PostUpdate {
            title: body.title,
            content: body.content,
            author_name: body.author_name,
        },
    )?;

    Ok((
        StatusCode::OK,
        Json(json!({"status": "success", "data": updated})),
    ))
}

/// DELETE /api/blogs/{id}
async fn handle_blog_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResponse {
    require_csrf(&state, &headers)?;
    let session = require_session(&state, &headers)?;

    let post = state.blogs.get(&id)?.ok_or(ApiError::NotFound("post"))?;
    authorize_post_access(&session, &post.user_id)?;

    state.blogs.delete(&id)?;
    Ok((
        StatusCode::OK,
        Json(json!({"status": "success", "message": "Blog post deleted"})),
    ))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tempfile::TempDir;

    fn test_state() -> (TempDir, AppState) {
        let tmp = TempDir::new().unwrap();
        let state = AppState {
            auth: Arc::new(AuthStore::open_in_memory(3600).unwrap()),
            blogs: Arc::new(BlogStore::open_in_memory().unwrap()),
            csrf: Arc::new(CsrfGuard::new(3600)),
            rate_limiter: Arc::new(GatewayRateLimiter::new(100, 100)),
            uploads_dir: tmp.path().join("profiles"),
            max_avatar_bytes: 2 * 1024 * 1024,
            allow_registration: true,
        };
        (tmp, state)
    }

    /// Headers carrying a freshly issued anti-forgery pair.
    fn csrf_headers(state: &AppState) -> HeaderMap {
        let token = state.csrf.issue();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("{XSRF_COOKIE}={token}")).unwrap(),
        );
        headers.insert(XSRF_HEADER, HeaderValue::from_str(&token).unwrap());
        headers
    }

    fn bearer(headers: &mut HeaderMap, token: &str) {
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
    }

    fn register_body(email: &str) -> RegisterBody {
        RegisterBody {
            name: "Alice".into(),
            email: email.into(),
            password: "password123".into(),
            role: "standard-user".into(),
        }
    }

    async fn register(state: &AppState, email: &str) -> (StatusCode, Value) {
        let (status, Json(body)) = handle_register(
            State(state.clone()),
            csrf_headers(state),
            Ok(Json(register_body(email))),
        )
        .await
        .unwrap();
        (status, body)
    }

    async fn login(state: &AppState, email: &str, password: &str) -> ApiResponse {
        handle_login(
            State(state.clone()),
            csrf_headers(state),
            Ok(Json(LoginBody {
                email: email.into(),
                password: password.into(),
            })),
        )
        .await
    }

    #[tokio::test]
    async fn health_reports_connected() {
        let (_tmp, state) = test_state();
        let (status, Json(body)) = handle_health(State(state)).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["database"], "connected");
    }

    #[tokio::test]
    async fn csrf_endpoint_sets_cookie_matching_body() {
        let (_tmp, state) = test_state();
        let response = handle_csrf_token(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        assert!(cookie.starts_with("XSRF-TOKEN="));
    }

    #[tokio::test]
    async fn register_returns_identity_without_password() {
        let (_tmp, state) = test_state();
        let (status, body) = register(&state, "alice@example.com").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["email"], "alice@example.com");
        assert_eq!(body["user"]["role"], "standard-user");
        assert!(body["user"].get("password").is_none());
        assert!(body["user"].get("password_hash").is_none());
    }

    #[tokio::test]
    async fn register_without_csrf_is_rejected() {
        let (_tmp, state) = test_state();
        let result = handle_register(
            State(state.clone()),
            HeaderMap::new(),
            Ok(Json(register_body("alice@example.com"))),
        )
        .await;
        match result {
            Err(e) => assert_eq!(e.status(), StatusCode::FORBIDDEN),
            Ok(_) => panic!("expected CSRF rejection"),
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_422() {
        let (_tmp, state) = test_state();
        register(&state, "alice@example.com").await;

        let result = handle_register(
            State(state.clone()),
            csrf_headers(&state),
            Ok(Json(register_body("alice@example.com"))),
        )
        .await;
        match result {
            Err(e) => assert_eq!(e.status(), StatusCode::UNPROCESSABLE_ENTITY),
            Ok((status, _)) => panic!("expected duplicate error, got {status}"),
        }
    }

    #[tokio::test]
    async fn invalid_role_is_422() {
        let (_tmp, state) = test_state();
        let mut body = register_body("alice@example.com");
        body.role = "superuser".into();
        let result =
            handle_register(State(state.clone()), csrf_headers(&state), Ok(Json(body))).await;
        match result {
            Err(e) => assert_eq!(e.status(), StatusCode::UNPROCESSABLE_ENTITY),
            Ok(_) => panic!("expected validation error"),
        }
    }

    #[tokio::test]
    async fn full_session_lifecycle() {
        let (_tmp, state) = test_state();

        // Register: 201, identity visible, no password material.
        let (status, body) = register(&state, "alice@example.com").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["user"]["name"], "Alice");

        // Login: opaque token distinct from the password.
        let (status, Json(body)) = login(&state, "alice@example.com", "password123")
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        let token = body["token"].as_str().unwrap().to_owned();
        assert!(!token.is_empty());
        assert_ne!(token, "password123");

        // /api/user with the token: same identity.
        let mut headers = HeaderMap::new();
        bearer(&mut headers, &token);
        let (status, Json(body)) = handle_current_user(State(state.clone()), headers)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], "alice@example.com");

        // Logout revokes everything.
        let mut headers = csrf_headers(&state);
        bearer(&mut headers, &token);
        let (status, _) = handle_logout(State(state.clone()), headers).await.unwrap();
        assert_eq!(status, StatusCode::OK);

        // The token is dead now.
        let mut headers = HeaderMap::new();
        bearer(&mut headers, &token);
        let result = handle_current_user(State(state.clone()), headers).await;
        match result {
            Err(e) => assert_eq!(e.status(), StatusCode::UNAUTHORIZED),
            Ok(_) => panic!("revoked token must not authenticate"),
        }
    }

    #[tokio::test]
    async fn wrong_password_is_a_generic_401() {
        let (_tmp, state) = test_state();
        register(&state, "alice@example.com").await;

        let wrong_pw = login(&state, "alice@example.com", "wrongpassword")
            .await
            .unwrap_err();
        let no_user = login(&state, "ghost@example.com", "wrongpassword")
            .await
            .unwrap_err();

        assert_eq!(wrong_pw.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(no_user.status(), StatusCode::UNAUTHORIZED);
        // Indistinguishable messages: no account-existence oracle.
        assert_eq!(wrong_pw.to_string(), no_user.to_string());
    }

    #[tokio::test]
    async fn missing_bearer_is_401() {
        let (_tmp, state) = test_state();
        let result = handle_current_user(State(state), HeaderMap::new()).await;
        match result {
            Err(e) => assert_eq!(e.status(), StatusCode::UNAUTHORIZED),
            Ok(_) => panic!("expected 401"),
        }
    }

    async fn login_token(state: &AppState, email: &str) -> String {
        register(state, email).await;
        let (_, Json(body)) = login(state, email, "password123").await.unwrap();
        body["token"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn post_mutation_by_non_owner_is_403() {
        let (_tmp, state) = test_state();
        let alice = login_token(&state, "alice@example.com").await;
        let mallory = login_token(&state, "mallory@example.com").await;

        let mut headers = csrf_headers(&state);
        bearer(&mut headers, &alice);
        let (_, Json(created)) = handle_blog_create(
            State(state.clone()),
            headers,
            Ok(Json(PostBody {
                title: Some("Alice's post".into()),
                content: Some("hello".into()),
                author_name: None,
            })),
        )
        .await
        .unwrap();
        let post_id = created["data"]["id"].as_str().unwrap().to_owned();

        let mut headers = csrf_headers(&state);
        bearer(&mut headers, &mallory);
        let result =
            handle_blog_delete(State(state.clone()), Path(post_id.clone()), headers).await;
        match result {
            Err(e) => assert_eq!(e.status(), StatusCode::FORBIDDEN),
            Ok(_) => panic!("expected ownership rejection"),
        }

        // The post is still there.
        let (status, _) = handle_blog_get(State(state.clone()), Path(post_id))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn administrator_may_delete_any_post() {
        let (_tmp, state) = test_state();
        let alice = login_token(&state, "alice@example.com").await;

        let (_, Json(admin_reg)) = handle_register(
            State(state.clone()),
            csrf_headers(&state),
            Ok(Json(RegisterBody {
                name: "Root".into(),
                email: "root@example.com".into(),
                password: "password123".into(),
                role: "administrator".into(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(admin_reg["user"]["role"], "administrator");
        let (_, Json(body)) = login(&state, "root@example.com", "password123")
            .await
            .unwrap();
        let admin = body["token"].as_str().unwrap().to_owned();

        let mut headers = csrf_headers(&state);
        bearer(&mut headers, &alice);
        let (_, Json(created)) = handle_blog_create(
            State(state.clone()),
            headers,
            Ok(Json(PostBody {
                title: Some("To be moderated".into()),
                content: Some("spam".into()),
                author_name: None,
            })),
        )
        .await
        .unwrap();
        let post_id = created["data"]["id"].as_str().unwrap().to_owned();

        let mut headers = csrf_headers(&state);
        bearer(&mut headers, &admin);
        let (status, _) = handle_blog_delete(State(state.clone()), Path(post_id), headers)
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn search_endpoint_filters() {
        let (_tmp, state) = test_state();
        let token = login_token(&state, "alice@example.com").await;

        let mut headers = csrf_headers(&state);
        bearer(&mut headers, &token);
        handle_blog_create(
            State(state.clone()),
            headers,
            Ok(Json(PostBody {
                title: Some("Rust tips".into()),
                content: Some("borrow checker".into()),
                author_name: None,
            })),
        )
        .await
        .unwrap();

        let (status, Json(body)) = handle_blogs_search(
            State(state.clone()),
            Query(SearchParams {
                query: "rust".into(),
                filter: Some("title".into()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn rate_limiter_blocks_after_limit() {
        let limiter = SlidingWindowRateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(limiter.allow("1.2.3.4"));
        assert!(!limiter.allow("1.2.3.4"));
        // Different key is unaffected.
        assert!(limiter.allow("5.6.7.8"));
    }

    #[test]
    fn rate_limiter_zero_limit_allows_all() {
        let limiter = SlidingWindowRateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..100 {
            assert!(limiter.allow("1.2.3.4"));
        }
    }

    #[test]
    fn cookie_extraction_handles_multiple_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("session=abc; XSRF-TOKEN=tok123; theme=dark"),
        );
        assert_eq!(extract_cookie(&headers, "XSRF-TOKEN"), Some("tok123"));
        assert_eq!(extract_cookie(&headers, "missing"), None);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t0k"));
        assert_eq!(extract_bearer_token(&headers), Some("t0k"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn router_builds_with_exact_origin() {
        let (_tmp, state) = test_state();
        assert!(build_router(state, "http://localhost:5173").is_ok());
    }
}
