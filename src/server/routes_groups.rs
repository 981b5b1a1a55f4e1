//! Group CRUD API routes.

use crate::config::Group;
use crate::error::{Error, Result};
use crate::server::AppContext;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

pub fn group_routes() -> Router<AppContext> {
    Router::new()
        .route("/groups", get(list_groups).post(create_group))
        .route(
            "/group/:name",
            get(get_group).put(update_group).delete(delete_group),
        )
}

async fn list_groups(State(ctx): State<AppContext>) -> Json<Vec<Group>> {
    let mut groups = ctx.store.snapshot().groups;
    groups.sort_by_key(|g| g.order);
    Json(groups)
}

async fn get_group(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<Group>> {
    ctx.store
        .snapshot()
        .groups
        .into_iter()
        .find(|g| g.name == name)
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("group '{name}'")))
}

async fn create_group(
    State(ctx): State<AppContext>,
    Json(group): Json<Group>,
) -> Result<impl IntoResponse> {
    if group.name.trim().is_empty() {
        return Err(Error::InvalidInput("group name cannot be empty".into()));
    }
    if ctx
        .store
        .snapshot()
        .groups
        .iter()
        .any(|g| g.name == group.name)
    {
        return Err(Error::Conflict(format!(
            "group '{}' already exists",
            group.name
        )));
    }

    let created = group.clone();
    ctx.store.mutate(move |config| {
        config.groups.push(group);
        Ok(())
    })?;

    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_group(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
    Json(group): Json<Group>,
) -> Result<Json<Group>> {
    let snapshot = ctx.store.snapshot();
    if !snapshot.groups.iter().any(|g| g.name == name) {
        return Err(Error::NotFound(format!("group '{name}'")));
    }
    if group.name != name && snapshot.groups.iter().any(|g| g.name == group.name) {
        return Err(Error::Conflict(format!(
            "group '{}' already exists",
            group.name
        )));
    }

    let updated = group.clone();
    ctx.store.mutate(move |config| {
        let slot = config
            .groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| Error::NotFound(format!("group '{name}'")))?;
        *slot = group;
        Ok(())
    })?;

    Ok(Json(updated))
}

async fn delete_group(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    // Apps referencing the group keep the dangling name and render
    // ungrouped.
    ctx.store.mutate(|config| {
        let before = config.groups.len();
        config.groups.retain(|g| g.name != name);
        if config.groups.len() == before {
            return Err(Error::NotFound(format!("group '{name}'")));
        }
        Ok(())
    })?;

    Ok(StatusCode::NO_CONTENT)
}
