mod common;

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use common::{test_app, TestApp, ACCESS_TTL};
use identity_service::models::{Project, SystemRole};
use identity_service::store::AccessStore;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.4");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn register(router: &Router, username: &str) -> Value {
    let (status, body) = send(
        router,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({
            "username": username,
            "email": format!("{}@example.com", username),
            "password": "a-long-password",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body
}

fn setup() -> (TestApp, Router) {
    let app = test_app();
    let router = app.router();
    (app, router)
}

#[tokio::test]
async fn health_reports_store_status() {
    let (_app, router) = setup();
    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
        "nosniff"
    );
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn register_login_and_me() {
    let (_app, router) = setup();
    let registered = register(&router, "erin").await;
    assert_eq!(registered["token_type"], "Bearer");
    assert_eq!(registered["expires_in"], ACCESS_TTL);
    assert!(registered["user"].get("password_hash").is_none());

    let (status, login) = send(
        &router,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({"login": "erin@example.com", "password": "a-long-password"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let token = login["access_token"].as_str().unwrap();
    let (status, me) = send(&router, Method::GET, "/auth/me", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "erin");

    let (status, sessions) = send(&router, Method::GET, "/auth/sessions", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sessions.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn invalid_payloads_are_rejected() {
    let (_app, router) = setup();
    let (status, body) = send(
        &router,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({"username": "x", "password": "short"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "Validation error");
    assert!(body["details"].is_string());

    let (status, body) = send(
        &router,
        Method::POST,
        "/auth/login",
        None,
        Some(json!({"login": "ghost", "password": "whatever"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid credentials");
}

#[tokio::test]
async fn protected_routes_require_bearer() {
    let (_app, router) = setup();
    let (status, _) = send(&router, Method::GET, "/auth/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&router, Method::GET, "/auth/me", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_reuse_is_unauthorized() {
    let (_app, router) = setup();
    let registered = register(&router, "frank").await;
    let refresh = registered["refresh_token"].as_str().unwrap();

    let (status, rotated) = send(
        &router,
        Method::POST,
        "/auth/refresh",
        None,
        Some(json!({"refresh_token": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(rotated["refresh_token"], registered["refresh_token"]);

    let (status, body) = send(
        &router,
        Method::POST,
        "/auth/refresh",
        None,
        Some(json!({"refresh_token": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Refresh token has been revoked");
}

#[tokio::test]
async fn logout_all_revokes_sessions() {
    let (_app, router) = setup();
    let registered = register(&router, "gwen").await;
    let token = registered["access_token"].as_str().unwrap();

    let (status, body) = send(&router, Method::POST, "/auth/logout-all", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked_sessions"], 1);

    let (status, _) = send(
        &router,
        Method::POST,
        "/auth/refresh",
        None,
        Some(json!({"refresh_token": registered["refresh_token"]})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn oidc_authorize_and_unknown_provider() {
    let (app, router) = setup();
    let (status, body) = send(
        &router,
        Method::GET,
        "/auth/oidc/acme/authorize?redirect_uri=https%3A%2F%2Fapp.example.com%2Fcb",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["auth_url"].as_str().unwrap().contains("code_challenge="));
    assert_eq!(app.state.pkce.len(), 1);

    let (status, _) = send(
        &router,
        Method::GET,
        "/auth/oidc/nope/authorize?redirect_uri=https%3A%2F%2Fapp.example.com%2Fcb",
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &router,
        Method::POST,
        "/auth/oidc/acme/callback",
        None,
        Some(json!({"code": "c", "state": "never-issued"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn role_management_is_gated_by_membership() {
    let (app, router) = setup();
    let owner = register(&router, "olive").await;
    let outsider = register(&router, "oscar").await;
    let owner_id: Uuid = owner["user"]["user_id"].as_str().unwrap().parse().unwrap();
    let outsider_id: Uuid = outsider["user"]["user_id"].as_str().unwrap().parse().unwrap();
    let owner_token = owner["access_token"].as_str().unwrap();
    let outsider_token = outsider["access_token"].as_str().unwrap();

    let org_id = Uuid::new_v4();
    app.state
        .permissions
        .assign_org_role(org_id, owner_id, SystemRole::Owner.id())
        .await
        .unwrap();

    let create = json!({
        "role_name": "Reviewer",
        "scope": "project",
        "permissions": ["project:view", "card:view"],
    });
    let (status, _) = send(
        &router,
        Method::POST,
        &format!("/organizations/{}/roles", org_id),
        Some(outsider_token),
        Some(create.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, role) = send(
        &router,
        Method::POST,
        &format!("/organizations/{}/roles", org_id),
        Some(owner_token),
        Some(create),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", role);

    let (status, _) = send(
        &router,
        Method::DELETE,
        &format!("/roles/{}", SystemRole::Admin.id()),
        Some(owner_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, roles) = send(
        &router,
        Method::GET,
        &format!("/organizations/{}/roles", org_id),
        Some(owner_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(roles.as_array().unwrap().len(), SystemRole::ALL.len() + 1);

    // Sole owner cannot demote themselves.
    let (status, _) = send(
        &router,
        Method::PUT,
        &format!("/organizations/{}/members/{}", org_id, owner_id),
        Some(owner_token),
        Some(json!({"role_id": SystemRole::Member.id()})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, membership) = send(
        &router,
        Method::PUT,
        &format!("/organizations/{}/members/{}", org_id, outsider_id),
        Some(owner_token),
        Some(json!({"role_id": SystemRole::Member.id()})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(membership["role_id"], SystemRole::Member.id().to_string());

    // A member cannot grant ownership.
    let (status, _) = send(
        &router,
        Method::PUT,
        &format!("/organizations/{}/members/{}", org_id, outsider_id),
        Some(outsider_token),
        Some(json!({"role_id": SystemRole::Owner.id()})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn permission_queries() {
    let (app, router) = setup();
    let user = register(&router, "paula").await;
    let user_id: Uuid = user["user"]["user_id"].as_str().unwrap().parse().unwrap();
    let token = user["access_token"].as_str().unwrap();

    let project = Project {
        project_id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
    };
    app.store.upsert_project(&project).await.unwrap();
    app.state
        .permissions
        .assign_org_role(project.organization_id, user_id, SystemRole::Guest.id())
        .await
        .unwrap();

    let (status, check) = send(
        &router,
        Method::GET,
        &format!(
            "/permissions/check?code=card:edit&resource_type=project&resource_id={}",
            project.project_id
        ),
        Some(token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(check["allowed"], false);

    let (status, mine) = send(
        &router,
        Method::GET,
        &format!(
            "/permissions/mine?resource_type=project&resource_id={}",
            project.project_id
        ),
        Some(token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let codes: Vec<&str> = mine["permissions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(codes.contains(&"card:view"));
    assert!(!codes.contains(&"card:edit"));

    let (status, catalog) = send(&router, Method::GET, "/permissions", Some(token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(catalog.as_array().unwrap().len() > 20);
}
