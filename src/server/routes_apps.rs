//! App CRUD and health API routes.

use crate::config::App;
use crate::error::{Error, Result};
use crate::health::AppHealth;
use crate::server::AppContext;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

pub fn app_routes() -> Router<AppContext> {
    Router::new()
        .route("/apps", get(list_apps).post(create_app))
        .route("/apps/health", get(all_health))
        .route("/apps/:name/health", get(app_health))
        .route("/apps/:name/health/check", post(check_app_health))
        .route(
            "/app/:name",
            get(get_app).put(update_app).delete(delete_app),
        )
}

async fn list_apps(State(ctx): State<AppContext>) -> Json<Vec<App>> {
    let mut apps = ctx.store.snapshot().apps;
    apps.sort_by(|a, b| (a.group.clone(), a.order).cmp(&(b.group.clone(), b.order)));
    Json(apps)
}

async fn get_app(State(ctx): State<AppContext>, Path(name): Path<String>) -> Result<Json<App>> {
    ctx.store
        .snapshot()
        .apps
        .into_iter()
        .find(|a| a.name == name)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("app '{name}'")))
}

async fn create_app(
    State(ctx): State<AppContext>,
    Json(app): Json<App>,
) -> Result<impl IntoResponse> {
    if app.name.trim().is_empty() {
        return Err(Error::InvalidInput("app name cannot be empty".into()));
    }
    if ctx.store.snapshot().apps.iter().any(|a| a.name == app.name) {
        return Err(Error::Conflict(format!("app '{}' already exists", app.name)));
    }

    let created = app.clone();
    ctx.store.mutate(move |config| {
        config.apps.push(app);
        Ok(())
    })?;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_app(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    Json(app): Json<App>,
) -> Result<Json<App>> {
    let snapshot = ctx.store.snapshot();
    if !snapshot.apps.iter().any(|a| a.name == name) {
        return Err(Error::NotFound(format!("app '{name}'")));
    }
    if app.name != name && snapshot.apps.iter().any(|a| a.name == app.name) {
        return Err(Error::Conflict(format!("app '{}' already exists", app.name)));
    }

    let updated = app.clone();
    ctx.store.mutate(move |config| {
        let slot = config
            .apps
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::NotFound(format!("app '{name}'")))?;
        *slot = app;
        Ok(())
    })?;

    Ok(Json(updated))
}

async fn delete_app(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    ctx.store.mutate(|config| {
        let before = config.apps.len();
        config.apps.retain(|a| a.name != name);
        if config.apps.len() == before {
            return Err(Error::NotFound(format!("app '{name}'")));
        }
        Ok(())
    })?;

    Ok(StatusCode::NO_CONTENT)
}

async fn all_health(State(ctx): State<AppContext>) -> Json<Vec<AppHealth>> {
    Json(ctx.health.get_all())
}

async fn app_health(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<AppHealth>> {
    ctx.health
        .get_health(&name)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("app '{name}'")))
}

async fn check_app_health(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<AppHealth>> {
    ctx.health.check_now(&name).await.map(Json)
}
