//! Whole-config API routes: read, replace, export, import, setup.

use crate::config::{self, store::redact, Config};
use crate::error::{Error, Result};
use crate::server::{auth, AppContext};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;

pub fn config_routes() -> Router<AppContext> {
    Router::new()
        .route("/config", get(get_config).put(put_config))
        .route("/config/export", get(export_config))
        .route("/config/import", post(import_config))
}

pub fn setup_routes() -> Router<AppContext> {
    Router::new().route("/setup", post(complete_setup))
}

async fn get_config(State(ctx): State<AppContext>) -> Json<Config> {
    let mut config = ctx.store.snapshot();
    redact(&mut config);
    Json(config)
}

async fn put_config(
    State(ctx): State<AppContext>,
    Json(incoming): Json<Config>,
) -> Result<Json<Config>> {
    let mut after = ctx.store.mutate(move |config| {
        *config = merge_secrets(incoming, config);
        Ok(())
    })?;
    redact(&mut after);
    Ok(Json(after))
}

async fn export_config(State(ctx): State<AppContext>) -> Result<impl IntoResponse> {
    let body = ctx.store.export()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/x-yaml"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"muximux.yml\"",
            ),
        ],
        body,
    ))
}

async fn import_config(State(ctx): State<AppContext>, body: Bytes) -> Result<Json<Config>> {
    let text = std::str::from_utf8(&body)
        .map_err(|_| Error::InvalidInput("config import must be UTF-8 YAML".into()))?;
    let mut incoming: Config = serde_yaml::from_str(text)
        .map_err(|e| Error::InvalidInput(format!("invalid config document: {e}")))?;
    config::expand_env(&mut incoming);

    let mut after = ctx.store.mutate(move |config| {
        *config = merge_secrets(incoming, config);
        Ok(())
    })?;
    redact(&mut after);
    Ok(Json(after))
}

/// A document round-tripped through export has its secrets stripped; keep
/// the live values for any secret field the incoming document leaves
/// empty.
fn merge_secrets(mut incoming: Config, current: &Config) -> Config {
    if incoming.auth.password_hash.is_none() {
        incoming.auth.password_hash = current.auth.password_hash.clone();
    }
    if incoming.auth.api_key.is_none() {
        incoming.auth.api_key = current.auth.api_key.clone();
    }
    if incoming.auth.oidc_client_secret.is_none() {
        incoming.auth.oidc_client_secret = current.auth.oidc_client_secret.clone();
    }
    incoming
}

#[derive(Deserialize)]
pub struct SetupRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub generate_api_key: bool,
}

#[derive(serde::Serialize)]
pub struct SetupResponse {
    pub setup_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Finish onboarding: optionally set credentials, then open the rest of
/// the API. Running it twice is a conflict.
async fn complete_setup(
    State(ctx): State<AppContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(req): Json<SetupRequest>,
) -> Result<(StatusCode, Json<SetupResponse>)> {
    let ip = connect_info
        .map(|info| info.0.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    ctx.login_limiter.check(ip)?;

    if ctx.store.snapshot().auth.setup_complete {
        return Err(Error::Conflict("setup already complete".into()));
    }

    let password_hash = match req.password.as_deref() {
        Some(password) => Some(
            auth::hash_password(password)
                .map_err(|e| Error::InvalidInput(format!("failed to hash password: {e}")))?,
        ),
        None => None,
    };
    let api_key = req.generate_api_key.then(auth::generate_api_key);

    let api_key_out = api_key.clone();
    ctx.store.mutate(move |config| {
        if let Some(username) = req.username {
            config.auth.username = Some(username);
            config.auth.method = crate::config::AuthMethod::Basic;
        }
        if let Some(hash) = password_hash {
            config.auth.password_hash = Some(hash);
        }
        if let Some(key) = api_key {
            config.auth.api_key = Some(key);
        }
        config.auth.setup_complete = true;
        Ok(())
    })?;

    Ok((
        StatusCode::OK,
        Json(SetupResponse {
            setup_complete: true,
            api_key: api_key_out,
        }),
    ))
}
