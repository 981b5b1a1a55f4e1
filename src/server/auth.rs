//! Authentication, sessions and the onboarding guard.
//!
//! Sessions are opaque server-side tokens: the cookie carries 256 random
//! bits and the session table maps them to a user and an expiry, so a
//! cookie cannot be forged without hitting `POST /api/auth/login` first.
//! Bearer requests are checked against the configured API key. With
//! `auth.method: none` every request acts as a virtual admin. Login and
//! setup attempts are rate-limited per client IP, and the setup guard
//! keeps everything except auth, health and restore endpoints behind a
//! 503 until onboarding has completed.

use crate::config::AuthMethod;
use crate::error::Error;
use crate::server::AppContext;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Method, Request, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use axum_extra::{
    extract::cookie::{Cookie, CookieJar},
    headers::{authorization::Bearer, Authorization},
    typed_header::TypedHeader,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SESSION_COOKIE_NAME: &str = "muximux_session";
const SESSION_TOKEN_BYTES: usize = 32;
const LOGIN_ATTEMPTS_PER_MINUTE: u32 = 5;
const BCRYPT_COST: u32 = 12;

// ── rate limiting ────────────────────────────────────────────────

/// Per-IP limiter for login and setup attempts.
pub struct LoginLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
    clock: DefaultClock,
}

impl LoginLimiter {
    pub fn new() -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(LOGIN_ATTEMPTS_PER_MINUTE).expect("nonzero quota"),
        );
        Self {
            limiter: RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), Error> {
        self.limiter.check_key(&ip).map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            Error::RateLimited {
                retry_after_secs: wait.as_secs().max(1),
            }
        })
    }

    /// Drop per-IP state that is no longer throttling anything.
    pub fn purge(&self) {
        self.limiter.retain_recent();
    }
}

impl Default for LoginLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// ── sessions ─────────────────────────────────────────────────────

struct Session {
    username: String,
    expires_at: SystemTime,
}

/// In-memory table of live sessions, keyed by opaque token. Lost on
/// restart, which simply asks users to log in again.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Mint a session. Returns the token and its unix expiry.
    pub fn issue(&self, username: &str, ttl_hours: u64) -> (String, u64) {
        let mut raw = [0u8; SESSION_TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);

        let expires_at = SystemTime::now() + Duration::from_secs(ttl_hours * 3600);
        self.sessions.write().insert(
            token.clone(),
            Session {
                username: username.to_string(),
                expires_at,
            },
        );

        let expires_unix = expires_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        (token, expires_unix)
    }

    /// Look a token up; expired entries resolve to nothing and are left
    /// for `purge_expired` to reap.
    pub fn resolve(&self, token: &str) -> Option<String> {
        let sessions = self.sessions.read();
        let session = sessions.get(token)?;
        if session.expires_at <= SystemTime::now() {
            return None;
        }
        Some(session.username.clone())
    }

    pub fn revoke(&self, token: &str) {
        self.sessions.write().remove(token);
    }

    pub fn purge_expired(&self) {
        let now = SystemTime::now();
        self.sessions.write().retain(|_, s| s.expires_at > now);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

// ── request authentication ───────────────────────────────────────

/// Who a request is acting as. Single-admin model: every principal holds
/// the admin role.
pub enum Principal {
    /// Auth method `none`: the virtual admin.
    VirtualAdmin,
    /// Matched the configured bearer API key.
    ApiKey,
    /// A live login session.
    User(String),
}

fn authenticate(
    ctx: &AppContext,
    bearer: Option<&str>,
    session_token: Option<&str>,
) -> Result<Principal, Error> {
    let auth = ctx.store.snapshot().auth;

    if auth.method == AuthMethod::None {
        return Ok(Principal::VirtualAdmin);
    }

    if let (Some(presented), Some(expected)) = (bearer, auth.api_key.as_deref()) {
        if presented == expected {
            return Ok(Principal::ApiKey);
        }
    }

    if let Some(token) = session_token {
        if let Some(username) = ctx.sessions.resolve(token) {
            return Ok(Principal::User(username));
        }
    }

    Err(Error::Unauthorized)
}

/// Middleware guarding admin endpoints.
pub async fn require_auth(
    State(ctx): State<AppContext>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    let bearer_token = bearer.map(|b| b.token().to_string());
    let session_token = jar.get(SESSION_COOKIE_NAME).map(|c| c.value().to_string());

    authenticate(&ctx, bearer_token.as_deref(), session_token.as_deref())?;

    Ok(next.run(request).await)
}

/// While onboarding is incomplete only auth, health and restore endpoints
/// respond; everything else gets 503 `setup_required`.
pub async fn setup_guard(
    State(ctx): State<AppContext>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Error> {
    if ctx.store.snapshot().auth.setup_complete {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path();
    let reachable = path.starts_with("/auth/")
        || path == "/setup"
        || path == "/config/import"
        || (request.method() == Method::GET && path.contains("/health"))
        || (request.method() == Method::POST && path.ends_with("/health/check"));

    if reachable {
        Ok(next.run(request).await)
    } else {
        Err(Error::SetupRequired)
    }
}

fn peer_ip(request_info: Option<&ConnectInfo<SocketAddr>>) -> IpAddr {
    request_info
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

// ── handlers ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

pub async fn login(
    State(ctx): State<AppContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), Error> {
    ctx.login_limiter.check(peer_ip(connect_info.as_ref()))?;

    let auth = ctx.store.snapshot().auth;

    if auth.method == AuthMethod::None {
        return Err(Error::Conflict("authentication is disabled".into()));
    }
    let (username, password_hash) = match (&auth.username, &auth.password_hash) {
        (Some(u), Some(h)) => (u.clone(), h.clone()),
        _ => return Err(Error::Conflict("authentication not configured".into())),
    };

    let verified = payload.username == username
        && bcrypt::verify(&payload.password, &password_hash).unwrap_or(false);
    if !verified {
        return Err(Error::Unauthorized);
    }

    let (token, expires_at) = ctx.sessions.issue(&username, auth.session_timeout_hours);

    let cookie = Cookie::build((SESSION_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .same_site(axum_extra::extract::cookie::SameSite::Lax)
        .max_age(time::Duration::hours(auth.session_timeout_hours as i64))
        .build();

    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            success: true,
            message: "Login successful".to_string(),
            expires_at: Some(expires_at),
        }),
    ))
}

pub async fn logout(
    State(ctx): State<AppContext>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(SESSION_COOKIE_NAME) {
        ctx.sessions.revoke(cookie.value());
    }

    let expired = Cookie::build((SESSION_COOKIE_NAME, ""))
        .path("/")
        .max_age(time::Duration::ZERO)
        .build();

    (jar.remove(expired), StatusCode::OK)
}

#[derive(Serialize)]
pub struct AuthStatusResponse {
    pub auth_enabled: bool,
    pub authenticated: bool,
    pub setup_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

pub async fn auth_status(
    State(ctx): State<AppContext>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    jar: CookieJar,
) -> Json<AuthStatusResponse> {
    let auth = ctx.store.snapshot().auth;

    let bearer_token = bearer.map(|b| b.token().to_string());
    let session_token = jar.get(SESSION_COOKIE_NAME).map(|c| c.value().to_string());

    let (auth_enabled, authenticated, username) =
        match authenticate(&ctx, bearer_token.as_deref(), session_token.as_deref()) {
            Ok(Principal::VirtualAdmin) => (false, true, None),
            Ok(Principal::ApiKey) => (true, true, None),
            Ok(Principal::User(name)) => (true, true, Some(name)),
            Err(_) => (true, false, None),
        };

    Json(AuthStatusResponse {
        auth_enabled,
        authenticated,
        setup_complete: auth.setup_complete,
        username,
    })
}

// ── credential helpers ───────────────────────────────────────────

/// Bcrypt hash for `auth.password_hash`.
pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, BCRYPT_COST)
}

/// Random API key for programmatic access.
pub fn generate_api_key() -> String {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("mx-{}", URL_SAFE_NO_PAD.encode(raw))
}
