/// 节点发现接口

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::models::{DiscoveryResult, DiscoveryStatus, DiscoveryTask};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::app_state::AppState;
use crate::db::models::discovery_task::{DiscoveryTaskListResponse, ScanRequest};

/// API 错误响应
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse {
            error: status.canonical_reason().unwrap_or("Unknown").to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<common::Error> for ApiError {
    fn from(err: common::Error) -> Self {
        use common::Error;

        let message = err.to_string();
        match err {
            Error::Validation(_) | Error::InvalidRange(_) => ApiError::BadRequest(message),
            Error::NotFound(_) => ApiError::NotFound(message),
            Error::Conflict(_) | Error::InvalidTransition { .. } => ApiError::Conflict(message),
            _ => {
                error!("请求处理失败: {}", message);
                ApiError::Internal(message)
            }
        }
    }
}

/// 查询参数
#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    pub status: Option<String>,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    20
}

/// 发现路由
pub fn discovery_routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/results", get(list_results))
}

/// 创建发现任务
///
/// POST /api/discovery/tasks
/// Body: ScanRequest
pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<(StatusCode, Json<DiscoveryTask>), ApiError> {
    let task = state.discovery().create_task(req).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// 获取任务列表
///
/// GET /api/discovery/tasks?page=1&page_size=20&status=running
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<DiscoveryTaskListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<DiscoveryStatus>)
        .transpose()
        .map_err(|_| ApiError::BadRequest(format!("未知的任务状态: {:?}", query.status)))?;

    let result = state
        .discovery()
        .list_tasks(query.page, query.page_size, status)
        .await?;
    Ok(Json(result))
}

/// 获取任务详情
///
/// GET /api/discovery/tasks/:id
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DiscoveryTask>, ApiError> {
    Ok(Json(state.discovery().get_task(&id).await?))
}

/// 删除已结束的任务
///
/// DELETE /api/discovery/tasks/:id
pub async fn delete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.discovery().delete_task(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 取消运行中的任务
///
/// POST /api/discovery/tasks/:id/cancel
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DiscoveryTask>, ApiError> {
    Ok(Json(state.discovery().cancel_task(&id).await?))
}

/// 获取任务的探测结果
///
/// GET /api/discovery/tasks/:id/results
pub async fn list_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<DiscoveryResult>>, ApiError> {
    Ok(Json(state.discovery().list_results(&id).await?))
}
