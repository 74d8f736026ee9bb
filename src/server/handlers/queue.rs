// 任务队列API处理器

use crate::queue::QueueItem;
use crate::server::handlers::ApiResponse;
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::error;

/// 查询任务状态
///
/// GET /api/queue/:task_id
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ApiResponse<QueueItem>>, StatusCode> {
    match state.orchestrator.queue().get(&task_id) {
        Ok(Some(item)) => Ok(Json(ApiResponse::success(item))),
        Ok(None) => Ok(Json(ApiResponse::error(404, format!("任务不存在: {}", task_id)))),
        Err(e) => {
            error!("查询任务失败: {}, 错误: {}", task_id, e);
            Ok(Json(e.into()))
        }
    }
}
