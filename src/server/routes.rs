//! REST handlers and the bearer-token extractor.

use axum::Json;
use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{Form, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{StatusCode, header};
use serde::Serialize;
use serde_json::{Value, json};

use super::AppState;
use crate::auth::{LoginForm, RegisterRequest, TokenPair};
use crate::error::{ApiError, ApiResult};
use crate::service::CreateTask;
use crate::types::{Role, TaskPatch, User};

/// The authenticated caller, taken from an access token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
    pub role: Role,
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApiError::unauthorized("Not authenticated"))?;

        let claims = state.auth.tokens().authenticate(token)?;
        Ok(CurrentUser {
            id: claims.sub,
            email: claims.email,
            role: claims.role,
        })
    }
}

/// A caller whose token carries the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub CurrentUser);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let user = CurrentUser::from_request_parts(parts, state).await?;
        if user.role != Role::Admin {
            tracing::warn!(user_id = %user.id, "Non-admin denied");
            return Err(ApiError::forbidden());
        }
        Ok(AdminUser(user))
    }
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError::validation("body", rejection.body_text())
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    /// Users with a live WebSocket.
    pub connections: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.registry.len(),
    })
}

pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(bad_json)?;
    let user = state.auth.register(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"message": "User successfully created", "user_id": user.id})),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    form: Result<Form<LoginForm>, FormRejection>,
) -> ApiResult<Json<TokenPair>> {
    let Form(form) = form.map_err(|r| ApiError::validation("body", r.body_text()))?;
    let pair = state.auth.login(&form.username, &form.password).await?;
    Ok(Json(pair))
}

pub async fn me(State(state): State<AppState>, user: CurrentUser) -> ApiResult<Json<User>> {
    Ok(Json(state.auth.me(&user.id)?))
}

pub async fn create_task(
    State(state): State<AppState>,
    user: CurrentUser,
    body: Result<Json<CreateTask>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let Json(req) = body.map_err(bad_json)?;
    let task = state.tasks.create(req, &user.id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Task created successfully",
            "task_id": task.id,
            "task": task,
        })),
    ))
}

pub async fn update_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(task_id): Path<String>,
    body: Result<Json<TaskPatch>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(patch) = body.map_err(bad_json)?;
    let task = state.tasks.update(&task_id, patch, &user.id).await?;
    Ok(Json(json!({
        "message": "Task updated successfully",
        "task_details": task,
    })))
}

pub async fn delete_task(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.tasks.delete(&task_id, &user.id).await?;
    Ok(Json(json!({"message": "Task deleted successfully"})))
}

pub async fn user_tasks(State(state): State<AppState>, user: CurrentUser) -> ApiResult<Json<Value>> {
    let tasks = state.tasks.list(Some(&user.id)).await?;
    Ok(Json(json!({"tasks": tasks})))
}

pub async fn all_tasks(State(state): State<AppState>, AdminUser(_): AdminUser) -> ApiResult<Json<Value>> {
    let tasks = state.tasks.list(None).await?;
    Ok(Json(json!({"tasks": tasks})))
}
