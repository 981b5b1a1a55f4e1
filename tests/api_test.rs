//! Admin API integration tests using axum's test utilities.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use muximux::config::{App, AuthMethod, Config, Group, OpenMode};
use muximux::server::{build_context, create_router, AppContext};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn app_entry(name: &str, url: &str) -> App {
    App {
        name: name.into(),
        url: url.into(),
        health_url: None,
        group: None,
        order: 0,
        enabled: true,
        proxy: true,
        open_mode: OpenMode::Iframe,
        health_check: false,
        proxy_timeout_secs: None,
        icon: None,
        color: None,
    }
}

fn ready_config() -> Config {
    let mut config = Config::default();
    config.auth.setup_complete = true;
    config
}

fn test_context(config: Config) -> AppContext {
    build_context(config, None).unwrap()
}

async fn body_json(body: Body) -> serde_json::Value {
    let bytes = body.collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ── onboarding guard ─────────────────────────────────────────────

#[tokio::test]
async fn api_is_gated_until_setup_completes() {
    let app = create_router(test_context(Config::default()));

    let response = app
        .clone()
        .oneshot(Request::get("/api/apps").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["error"], "setup_required");

    // Health stays reachable during onboarding.
    let response = app
        .clone()
        .oneshot(Request::get("/api/apps/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Completing setup opens the rest of the API.
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/setup")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::get("/api/apps").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // A second setup attempt is a conflict.
    let response = app
        .oneshot(
            Request::post("/api/setup")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

// ── app CRUD ─────────────────────────────────────────────────────

#[tokio::test]
async fn app_crud_lifecycle() {
    let app = create_router(test_context(ready_config()));

    // Create.
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/apps")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"name":"Plex","url":"http://localhost:32400"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Duplicate create conflicts.
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/apps")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"name":"Plex","url":"http://localhost:32400"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Read.
    let response = app
        .clone()
        .oneshot(Request::get("/api/app/Plex").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["name"], "Plex");
    assert_eq!(json["enabled"], true);
    assert_eq!(json["open_mode"], "iframe");

    // Update.
    let response = app
        .clone()
        .oneshot(
            Request::put("/api/app/Plex")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"name":"Plex","url":"http://localhost:32400","open_mode":"new_tab"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["open_mode"], "new_tab");

    // Delete.
    let response = app
        .clone()
        .oneshot(
            Request::delete("/api/app/Plex")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(Request::get("/api/app/Plex").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_app_url_is_rejected() {
    let app = create_router(test_context(ready_config()));

    let response = app
        .oneshot(
            Request::post("/api/apps")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"Files","url":"ftp://server"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["error"], "invalid_input");
}

#[tokio::test]
async fn group_crud_lifecycle() {
    let app = create_router(test_context(ready_config()));

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/groups")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"Media","order":1}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(Request::get("/api/groups").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response.into_body()).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["name"], "Media");

    let response = app
        .clone()
        .oneshot(
            Request::delete("/api/group/Media")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::delete("/api/group/Media")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ── config endpoints ─────────────────────────────────────────────

#[tokio::test]
async fn config_read_and_export_are_redacted() {
    let mut config = ready_config();
    config.auth.api_key = Some("mx-super-secret".into());
    config.auth.password_hash = Some("$2b$12$secrethash".into());
    let ctx = test_context(config);
    let app = create_router(ctx.clone());

    let response = app
        .clone()
        .oneshot(Request::get("/api/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert!(json["auth"]["api_key"].is_null());
    assert!(json["auth"]["password_hash"].is_null());

    let response = app
        .oneshot(
            Request::get("/api/config/export")
                .header("authorization", "Bearer mx-super-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/x-yaml"
    );
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let yaml = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(!yaml.contains("mx-super-secret"));

    // Export never mutates the live config.
    let live = ctx.store.snapshot();
    assert_eq!(live.auth.api_key.as_deref(), Some("mx-super-secret"));
}

#[tokio::test]
async fn config_put_preserves_secrets_left_empty() {
    let mut config = ready_config();
    config.auth.api_key = Some("mx-keep-me".into());
    let ctx = test_context(config);
    let app = create_router(ctx.clone());

    // Replace the whole config with a document that carries no secrets,
    // the way an exported document would.
    let incoming = serde_json::json!({
        "server": { "listen": ":8080" },
        "auth": { "setup_complete": true },
        "apps": [ { "name": "Plex", "url": "http://localhost:32400" } ]
    });
    let response = app
        .oneshot(
            Request::put("/api/config")
                .header("content-type", "application/json")
                .body(Body::from(incoming.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let live = ctx.store.snapshot();
    assert_eq!(live.auth.api_key.as_deref(), Some("mx-keep-me"));
    assert_eq!(live.apps.len(), 1);
}

#[tokio::test]
async fn config_import_restores_a_yaml_document() {
    let ctx = test_context(ready_config());
    let app = create_router(ctx.clone());

    let yaml = concat!(
        "auth:\n",
        "  setup_complete: true\n",
        "apps:\n",
        "  - name: Sonarr\n",
        "    url: http://localhost:8989\n",
    );

    let response = app
        .oneshot(
            Request::post("/api/config/import")
                .body(Body::from(yaml))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let live = ctx.store.snapshot();
    assert_eq!(live.apps.len(), 1);
    assert_eq!(live.apps[0].name, "Sonarr");
    // The route table was rebuilt by the change notification.
    assert!(ctx.routes.get("sonarr").is_some());
}

#[tokio::test]
async fn config_import_rejects_garbage() {
    let app = create_router(test_context(ready_config()));

    let response = app
        .oneshot(
            Request::post("/api/config/import")
                .body(Body::from("{{{{ not yaml"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── live route rebuild ───────────────────────────────────────────

#[tokio::test]
async fn creating_an_app_routes_immediately() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("alive"))
        .mount(&upstream)
        .await;

    let app = create_router(test_context(ready_config()));

    let response = app
        .clone()
        .oneshot(Request::get("/proxy/foo/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let create = serde_json::json!({ "name": "Foo", "url": upstream.uri() });
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/apps")
                .header("content-type", "application/json")
                .body(Body::from(create.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // No restart: the very next request resolves the new slug.
    let response = app
        .oneshot(Request::get("/proxy/foo/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ── auth ─────────────────────────────────────────────────────────

fn basic_auth_config() -> Config {
    let mut config = ready_config();
    config.auth.method = AuthMethod::Basic;
    config.auth.username = Some("admin".into());
    // Low cost keeps the test fast; production hashes use the default.
    config.auth.password_hash = Some(bcrypt::hash("hunter2", 4).unwrap());
    config.auth.api_key = Some("mx-test-key".into());
    config
}

#[tokio::test]
async fn basic_auth_blocks_anonymous_requests() {
    let app = create_router(test_context(basic_auth_config()));

    let response = app
        .clone()
        .oneshot(Request::get("/api/apps").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // The bearer API key opens the door.
    let response = app
        .oneshot(
            Request::get("/api/apps")
                .header("authorization", "Bearer mx-test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_issues_a_session_cookie() {
    let app = create_router(test_context(basic_auth_config()));

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"username":"admin","password":"wrong"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"username":"admin","password":"hunter2"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("muximux_session="));

    let session = cookie.split(';').next().unwrap().to_string();
    let response = app
        .oneshot(
            Request::get("/api/apps")
                .header("cookie", session)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn login_is_rate_limited_per_ip() {
    let app = create_router(test_context(basic_auth_config()));

    let mut last_status = StatusCode::OK;
    let mut retry_after = None;
    for _ in 0..8 {
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/auth/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"username":"admin","password":"wrong"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        last_status = response.status();
        retry_after = response
            .headers()
            .get("retry-after")
            .map(|v| v.to_str().unwrap().to_string());
    }

    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
    assert!(retry_after.is_some());
}

#[tokio::test]
async fn auth_status_reports_mode() {
    let app = create_router(test_context(ready_config()));

    let response = app
        .oneshot(
            Request::get("/api/auth/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response.into_body()).await;
    assert_eq!(json["auth_enabled"], false);
    assert_eq!(json["authenticated"], true);
}

// ── group ordering ───────────────────────────────────────────────

#[tokio::test]
async fn groups_support_multiple_entries() {
    let mut config = ready_config();
    config.groups = vec![
        Group {
            name: "Media".into(),
            order: 2,
            icon: None,
        },
        Group {
            name: "Downloads".into(),
            order: 1,
            icon: None,
        },
    ];
    config.apps = vec![app_entry("Plex", "http://localhost:32400")];
    let app = create_router(test_context(config));

    let response = app
        .oneshot(Request::get("/api/groups").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response.into_body()).await;
    // Sorted by order.
    assert_eq!(json[0]["name"], "Downloads");
    assert_eq!(json[1]["name"], "Media");
}
