//! HTTP API tests driving the router in-process.

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

use task_relay::auth::{AuthService, TokenIssuer};
use task_relay::config::{AuthConfig, WebSocketConfig};
use task_relay::db::Database;
use task_relay::notify::RegistryDispatcher;
use task_relay::registry::{Channel, ConnectionRegistry};
use task_relay::scheduler::{BoundDelayScheduler, CompletionHandler};
use task_relay::server::ws::authorize_socket;
use task_relay::server::{AppState, build_router};
use task_relay::service::TaskService;
use task_relay::store::TaskStore;

const PASSWORD: &str = "Passw0rd!";

struct TestApp {
    router: Router,
    state: AppState,
    registry: Arc<ConnectionRegistry>,
}

fn setup_app() -> TestApp {
    setup_app_with(WebSocketConfig::default())
}

fn setup_app_with(websocket: WebSocketConfig) -> TestApp {
    let db = Arc::new(Database::open_in_memory().expect("Failed to create in-memory database"));
    let store: Arc<dyn TaskStore> = db.clone();
    let registry = Arc::new(ConnectionRegistry::new());
    let handler = Arc::new(CompletionHandler::new(
        store.clone(),
        Arc::new(RegistryDispatcher::new(registry.clone())),
    ));
    let scheduler = Arc::new(BoundDelayScheduler::new(handler));

    let auth_config = AuthConfig {
        jwt_secret: "test-secret".into(),
        bcrypt_cost: 4,
        ..AuthConfig::default()
    };
    let auth = Arc::new(AuthService::new(
        db,
        Arc::new(TokenIssuer::new(&auth_config)),
        auth_config.bcrypt_cost,
    ));
    let tasks = Arc::new(TaskService::new(store, scheduler, Duration::from_secs(10)));

    let state = AppState {
        auth,
        tasks,
        registry: registry.clone(),
        websocket,
    };
    TestApp {
        router: build_router(state.clone()),
        state,
        registry,
    }
}

struct Response {
    status: StatusCode,
    www_authenticate: Option<String>,
    body: Value,
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> Response {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let www_authenticate = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .map(|v| v.to_str().unwrap().to_string());
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        Response {
            status,
            www_authenticate,
            body,
        }
    }

    async fn json(&self, method: &str, uri: &str, token: Option<&str>, body: Value) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> Response {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn delete(&self, uri: &str, token: &str) -> Response {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn register(&self, email: &str, role: &str) -> Response {
        self.json(
            "POST",
            "/auth/register",
            None,
            json!({"email": email, "password": PASSWORD, "name": "Test User", "role": role}),
        )
        .await
    }

    async fn login(&self, email: &str, password: &str) -> Response {
        let form = format!(
            "username={}&password={}",
            email.replace('@', "%40"),
            password.replace('!', "%21")
        );
        let request = Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();
        self.send(request).await
    }

    /// Register and log in; returns (user id, access token, refresh token).
    async fn user(&self, email: &str, role: &str) -> (String, String, String) {
        let registered = self.register(email, role).await;
        assert_eq!(registered.status, StatusCode::CREATED, "{}", registered.body);
        let login = self.login(email, PASSWORD).await;
        assert_eq!(login.status, StatusCode::OK, "{}", login.body);
        (
            registered.body["user_id"].as_str().unwrap().to_string(),
            login.body["access_token"].as_str().unwrap().to_string(),
            login.body["refresh_token"].as_str().unwrap().to_string(),
        )
    }

    async fn create_task(&self, token: &str, title: &str) -> Response {
        self.json(
            "POST",
            "/tasks/create",
            Some(token),
            json!({"title": title, "description": "d"}),
        )
        .await
    }
}

/// WebSocket stand-in that records frames.
#[derive(Default)]
struct RecordingSocket {
    frames: Mutex<Vec<String>>,
}

#[async_trait]
impl Channel for RecordingSocket {
    async fn accept(&self) -> Result<()> {
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.frames.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

mod end_to_end_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn task_completes_after_delay_and_owner_is_notified() {
        let app = setup_app();
        let (user_id, token, _) = app.user("a@x.com", "user").await;

        let socket = Arc::new(RecordingSocket::default());
        app.registry.register(&user_id, socket.clone()).await.unwrap();

        let created = app.create_task(&token, "T1").await;
        assert_eq!(created.status, StatusCode::CREATED, "{}", created.body);
        assert_eq!(created.body["message"], "Task created successfully");
        assert_eq!(created.body["task"]["status"], "pending");
        let task_id = created.body["task_id"].as_str().unwrap().to_string();

        let listed = app.get("/tasks/user/tasks", Some(&token)).await;
        assert_eq!(listed.body["tasks"][0]["status"], "pending");

        tokio::time::sleep(Duration::from_secs(11)).await;

        let listed = app.get("/tasks/user/tasks", Some(&token)).await;
        assert_eq!(listed.status, StatusCode::OK);
        let tasks = listed.body["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["title"], "T1");
        assert_eq!(tasks[0]["status"], "completed");

        let frames = socket.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["type"], "task_completed");
        assert_eq!(frame["task_id"], task_id.as_str());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_owner_still_gets_completed_task() {
        let app = setup_app();
        let (_, token, _) = app.user("a@x.com", "user").await;

        app.create_task(&token, "T1").await;
        tokio::time::sleep(Duration::from_secs(11)).await;

        let listed = app.get("/tasks/user/tasks", Some(&token)).await;
        assert_eq!(listed.body["tasks"][0]["status"], "completed");
    }
}

mod auth_tests {
    use super::*;

    #[tokio::test]
    async fn register_returns_created_user_id() {
        let app = setup_app();
        let response = app.register("a@x.com", "user").await;

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body["message"], "User successfully created");
        assert!(response.body["user_id"].is_string());
    }

    #[tokio::test]
    async fn login_token_subject_matches_user() {
        let app = setup_app();
        let (user_id, token, _) = app.user("a@x.com", "user").await;

        let claims = app.state.auth.tokens().authenticate(&token).unwrap();
        assert_eq!(claims.sub, user_id);
    }

    #[tokio::test]
    async fn login_response_shape() {
        let app = setup_app();
        app.register("a@x.com", "user").await;

        let response = app.login("a@x.com", PASSWORD).await;

        assert_eq!(response.body["token_type"], "bearer");
        assert_eq!(response.body["expires_in"], 600);
        assert!(response.body["refresh_token"].is_string());
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let app = setup_app();
        app.register("a@x.com", "user").await;

        let response = app.register("A@X.com", "user").await;

        assert_eq!(response.status, StatusCode::CONFLICT);
        assert_eq!(response.body["message"], "Email already exists");
        assert_eq!(response.body["code"], "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn weak_password_rejected() {
        let app = setup_app();
        let response = app
            .json(
                "POST",
                "/auth/register",
                None,
                json!({"email": "a@x.com", "password": "password", "name": "Al"}),
            )
            .await;

        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.body["field"], "password");
    }

    #[tokio::test]
    async fn unknown_role_rejected() {
        let app = setup_app();
        let response = app.register("a@x.com", "root").await;
        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.body["field"], "role");
    }

    #[tokio::test]
    async fn wrong_password_unauthorized() {
        let app = setup_app();
        app.register("a@x.com", "user").await;

        let response = app.login("a@x.com", "Wrong0ne!").await;

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["message"], "Invalid email or password");
    }

    #[tokio::test]
    async fn unknown_email_unauthorized() {
        let app = setup_app();
        let response = app.login("ghost@x.com", PASSWORD).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["message"], "Invalid email or password");
    }

    #[tokio::test]
    async fn malformed_login_email_is_bad_request() {
        let app = setup_app();
        let response = app.login("not-an-email", PASSWORD).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body["message"], "Invalid email format");
    }

    #[tokio::test]
    async fn me_returns_profile_without_hash() {
        let app = setup_app();
        let (user_id, token, _) = app.user("a@x.com", "admin").await;

        let response = app.get("/auth/me", Some(&token)).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["id"], user_id.as_str());
        assert_eq!(response.body["email"], "a@x.com");
        assert_eq!(response.body["role"], "admin");
        assert!(response.body.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn missing_token_challenges() {
        let app = setup_app();

        let response = app.get("/auth/me", None).await;

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["message"], "Not authenticated");
        assert_eq!(response.www_authenticate.as_deref(), Some("Bearer"));
    }

    #[tokio::test]
    async fn garbage_token_rejected() {
        let app = setup_app();
        let response = app.get("/tasks/user/tasks", Some("not.a.jwt")).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["message"], "Could not validate credentials");
    }

    #[tokio::test]
    async fn refresh_token_not_accepted_as_bearer() {
        let app = setup_app();
        let (_, _, refresh) = app.user("a@x.com", "user").await;

        let response = app.get("/tasks/user/tasks", Some(&refresh)).await;

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.body["message"], "Invalid token type");
    }
}

mod task_route_tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_title_conflicts() {
        let app = setup_app();
        let (_, token, _) = app.user("a@x.com", "user").await;
        app.create_task(&token, "T1").await;

        let response = app.create_task(&token, "T1").await;

        assert_eq!(response.status, StatusCode::CONFLICT);
        assert_eq!(response.body["message"], "Task already exists");
    }

    #[tokio::test]
    async fn non_pending_status_on_create_rejected() {
        let app = setup_app();
        let (_, token, _) = app.user("a@x.com", "user").await;

        let response = app
            .json(
                "POST",
                "/tasks/create",
                Some(&token),
                json!({"title": "T1", "description": "d", "status": "completed"}),
            )
            .await;

        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn malformed_body_is_validation_error() {
        let app = setup_app();
        let (_, token, _) = app.user("a@x.com", "user").await;

        let response = app
            .json("POST", "/tasks/create", Some(&token), json!({"description": "no title"}))
            .await;

        assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.body["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn owner_update_returns_task_details() {
        let app = setup_app();
        let (_, token, _) = app.user("a@x.com", "user").await;
        let id = app.create_task(&token, "T1").await.body["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .json(
                "PUT",
                &format!("/tasks/update/{}", id),
                Some(&token),
                json!({"status": "in_progress"}),
            )
            .await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["message"], "Task updated successfully");
        assert_eq!(response.body["task_details"]["status"], "in_progress");
        assert_eq!(response.body["task_details"]["title"], "T1");
    }

    #[tokio::test]
    async fn non_owner_update_not_found() {
        let app = setup_app();
        let (_, alice, _) = app.user("a@x.com", "user").await;
        let (_, mallory, _) = app.user("m@x.com", "user").await;
        let id = app.create_task(&alice, "T1").await.body["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let response = app
            .json(
                "PUT",
                &format!("/tasks/update/{}", id),
                Some(&mallory),
                json!({"title": "mine now"}),
            )
            .await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.body["message"], "Task not found");
        let listed = app.get("/tasks/user/tasks", Some(&alice)).await;
        assert_eq!(listed.body["tasks"][0]["title"], "T1");
    }

    #[tokio::test]
    async fn delete_by_owner_and_non_owner() {
        let app = setup_app();
        let (_, alice, _) = app.user("a@x.com", "user").await;
        let (_, mallory, _) = app.user("m@x.com", "user").await;
        let id = app.create_task(&alice, "T1").await.body["task_id"]
            .as_str()
            .unwrap()
            .to_string();
        let uri = format!("/tasks/delete/{}", id);

        let denied = app.delete(&uri, &mallory).await;
        assert_eq!(denied.status, StatusCode::NOT_FOUND);

        let deleted = app.delete(&uri, &alice).await;
        assert_eq!(deleted.status, StatusCode::OK);
        assert_eq!(deleted.body["message"], "Task deleted successfully");

        let listed = app.get("/tasks/user/tasks", Some(&alice)).await;
        assert!(listed.body["tasks"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_task_id_is_bad_request() {
        let app = setup_app();
        let (_, token, _) = app.user("a@x.com", "user").await;

        let response = app.delete("/tasks/delete/not-a-uuid", &token).await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body["code"], "INVALID_ID");
    }

    #[tokio::test]
    async fn all_tasks_requires_admin() {
        let app = setup_app();
        let (_, admin, _) = app.user("root@x.com", "admin").await;
        let (_, alice, _) = app.user("a@x.com", "user").await;
        app.create_task(&alice, "A").await;
        app.create_task(&admin, "B").await;

        let denied = app.get("/tasks/all", Some(&alice)).await;
        assert_eq!(denied.status, StatusCode::FORBIDDEN);
        assert_eq!(denied.body["message"], "Not enough permissions");

        let allowed = app.get("/tasks/all", Some(&admin)).await;
        assert_eq!(allowed.status, StatusCode::OK);
        assert_eq!(allowed.body["tasks"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn health_reports_connections() {
        let app = setup_app();
        app.registry
            .register("u1", Arc::new(RecordingSocket::default()))
            .await
            .unwrap();

        let response = app.get("/health", None).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["status"], "healthy");
        assert_eq!(response.body["connections"], 1);
    }
}

mod websocket_auth_tests {
    use super::*;

    #[tokio::test]
    async fn open_endpoint_by_default() {
        let app = setup_app();
        assert!(authorize_socket(&app.state, "anyone", None).is_ok());
    }

    #[tokio::test]
    async fn token_required_when_configured() {
        let app = setup_app_with(WebSocketConfig {
            require_token: true,
        });
        let (user_id, token, _) = app.user("a@x.com", "user").await;

        assert!(authorize_socket(&app.state, &user_id, None).is_err());
        assert!(authorize_socket(&app.state, "someone-else", Some(&token)).is_err());
        assert!(authorize_socket(&app.state, &user_id, Some(&token)).is_ok());
    }
}
