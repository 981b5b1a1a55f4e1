//! HTTP server and component wiring.
//!
//! Startup order: config store, route table, proxy engine, health monitor,
//! event hub. Config change notifications rebuild the route table, re-seed
//! the monitor and broadcast `config_change`; health transitions broadcast
//! `health_update`. All callbacks run outside their originator's lock.

use crate::config::{Config, ConfigStore};
use crate::events::{Event, EventHub};
use crate::health::HealthMonitor;
use crate::proxy::{self, ProxyEngine};
use crate::routes::RouteTable;
use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{any, get, post},
    Router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod auth;
pub mod routes_apps;
pub mod routes_config;
pub mod routes_events;
pub mod routes_groups;

use self::auth::{LoginLimiter, SessionStore};

/// Shared application context.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<ConfigStore>,
    pub routes: Arc<RouteTable>,
    pub health: Arc<HealthMonitor>,
    pub hub: Arc<EventHub>,
    pub proxy: Arc<ProxyEngine>,
    pub login_limiter: Arc<LoginLimiter>,
    pub sessions: Arc<SessionStore>,
}

/// Build and wire all components from a loaded config. The health monitor
/// is seeded but not started; `start` launches it.
pub fn build_context(config: Config, config_path: Option<PathBuf>) -> Result<AppContext> {
    let proxy = Arc::new(ProxyEngine::new(config.server.proxy_timeout_secs)?);

    let routes = Arc::new(RouteTable::new());
    routes.rebuild(&config.apps);

    let health = HealthMonitor::new(&config.health)?;
    health.set_apps(&config.apps);

    let hub = EventHub::new();

    let store = ConfigStore::new(config, config_path);

    let hub_for_health = Arc::clone(&hub);
    health.set_change_callback(move |entry| {
        hub_for_health.broadcast(Event::health_update(&entry));
    });

    let routes_on_change = Arc::clone(&routes);
    let health_on_change = Arc::clone(&health);
    let hub_on_change = Arc::clone(&hub);
    store.subscribe(move |config| {
        routes_on_change.rebuild(&config.apps);
        health_on_change.set_apps(&config.apps);
        hub_on_change.broadcast(Event::config_change());
    });

    Ok(AppContext {
        store,
        routes,
        health,
        hub,
        proxy,
        login_limiter: Arc::new(LoginLimiter::new()),
        sessions: Arc::new(SessionStore::new()),
    })
}

/// Create the axum router with all routes.
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    // Auth + setup endpoints stay reachable without a session.
    let auth_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/status", get(auth::auth_status))
        .merge(routes_config::setup_routes());

    let protected_routes = routes_apps::app_routes()
        .merge(routes_groups::group_routes())
        .merge(routes_config::config_routes())
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_auth,
        ));

    let api = auth_routes
        .merge(protected_routes)
        .layer(middleware::from_fn_with_state(ctx.clone(), auth::setup_guard));

    // The proxy and event stream sit behind the same session/API-key check;
    // with auth method `none` the middleware waves everything through.
    let proxied = Router::new()
        .route("/proxy/*path", any(proxy::handle))
        .route("/ws", get(routes_events::ws_handler))
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            auth::require_auth,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(proxied)
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx.clone());

    match normalized_base_path(&ctx.store.snapshot().server.base_path) {
        Some(base) => Router::new().nest(&base, app),
        None => app,
    }
}

fn normalized_base_path(base: &str) -> Option<String> {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "/" {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the HTTP server and run until shutdown.
pub async fn start(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let addr: SocketAddr = config.server.socket_addr()?;

    let ctx = build_context(config, config_path)?;
    ctx.health.start();

    // Periodically shed idle rate-limiter state and expired sessions.
    let limiter = Arc::clone(&ctx.login_limiter);
    let sessions = Arc::clone(&ctx.sessions);
    let purge_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(300));
        loop {
            tick.tick().await;
            limiter.purge();
            sessions.purge_expired();
        }
    });

    let app = create_router(ctx.clone());

    tracing::info!("starting server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    ctx.health.stop();
    purge_task.abort();

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
