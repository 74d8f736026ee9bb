// 分片上传API处理器

use crate::driver::{CapabilitySet, PreupRequest, UploadInfo};
use crate::server::handlers::ApiResponse;
use crate::server::AppState;
use crate::uploader::{CompleteResult, PreupResult, SliceOutcome};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 预上传
///
/// POST /api/fs/preup
pub async fn preup(
    State(state): State<AppState>,
    Json(req): Json<PreupRequest>,
) -> Result<Json<ApiResponse<PreupResult>>, StatusCode> {
    info!(
        "API: 预上传 storage={}, path={}, name={}, size={}",
        req.storage, req.dst.path, req.name, req.size
    );

    let cancel = state.cancel.child_token();
    match state.orchestrator.preup(req, &cancel).await {
        Ok(result) => Ok(Json(ApiResponse::success(result))),
        Err(e) => {
            warn!("预上传失败: {}", e);
            Ok(Json(e.into()))
        }
    }
}

/// 分片上传查询参数
#[derive(Debug, Deserialize)]
pub struct SliceUploadQuery {
    pub upload_id: i64,
    /// 分片序号（从 0 开始）
    pub slice_num: usize,
    /// 第一个分片为逗号分隔的全部分片哈希，其余分片为本分片哈希
    #[serde(default)]
    pub slice_hash: String,
}

#[derive(Debug, Serialize)]
pub struct SliceUploadData {
    pub outcome: SliceOutcome,
}

/// 上传一个分片（请求体为分片原始内容）
///
/// PUT /api/fs/slice_upload?upload_id=1&slice_num=0&slice_hash=...
pub async fn slice_upload(
    State(state): State<AppState>,
    Query(params): Query<SliceUploadQuery>,
    body: Bytes,
) -> Result<Json<ApiResponse<SliceUploadData>>, StatusCode> {
    let cancel = state.cancel.child_token();
    match state
        .orchestrator
        .upload_slice(
            params.upload_id,
            params.slice_num,
            &params.slice_hash,
            body.to_vec(),
            &cancel,
        )
        .await
    {
        Ok(outcome) => Ok(Json(ApiResponse::success(SliceUploadData { outcome }))),
        Err(e) => {
            warn!(
                "分片上传失败: upload_id={}, slice_num={}, 错误: {}",
                params.upload_id, params.slice_num, e
            );
            Ok(Json(e.into()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SliceCompleteRequest {
    pub upload_id: i64,
}

/// 完成分片上传
///
/// POST /api/fs/slice_upload_complete
pub async fn slice_upload_complete(
    State(state): State<AppState>,
    Json(req): Json<SliceCompleteRequest>,
) -> Result<Json<ApiResponse<CompleteResult>>, StatusCode> {
    info!("API: 完成上传 upload_id={}", req.upload_id);

    let cancel = state.cancel.child_token();
    match state.orchestrator.slice_complete(req.upload_id, &cancel).await {
        Ok(result) => Ok(Json(ApiResponse::success(result))),
        Err(e) => {
            warn!("完成上传失败: upload_id={}, 错误: {}", req.upload_id, e);
            Ok(Json(e.into()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadInfoQuery {
    pub storage: String,
}

#[derive(Debug, Serialize)]
pub struct UploadInfoData {
    #[serde(flatten)]
    pub info: UploadInfo,
    pub capabilities: CapabilitySet,
}

/// 查询存储的哈希要求与能力
///
/// GET /api/fs/upload_info?storage=xxx
pub async fn upload_info(
    State(state): State<AppState>,
    Query(params): Query<UploadInfoQuery>,
) -> Result<Json<ApiResponse<UploadInfoData>>, StatusCode> {
    let orchestrator = &state.orchestrator;
    let data = orchestrator.upload_info(&params.storage).and_then(|info| {
        Ok(UploadInfoData {
            info,
            capabilities: orchestrator.capabilities(&params.storage)?,
        })
    });
    match data {
        Ok(data) => Ok(Json(ApiResponse::success(data))),
        Err(e) => Ok(Json(e.into())),
    }
}
