// 应用状态

use crate::uploader::UploadOrchestrator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 上传编排器
    pub orchestrator: Arc<UploadOrchestrator>,
    /// 进程级取消令牌，请求使用其子令牌
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Arc<UploadOrchestrator>, cancel: CancellationToken) -> Self {
        Self {
            orchestrator,
            cancel,
        }
    }
}
