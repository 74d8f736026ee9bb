// 本地缓冲文件的后台上传
//
// 任务载荷是序列化的上传会话。处理器重新打开缓冲文件，经由后端的一次性上传接口
// 发送，成功后把会话标记为完成并删除缓冲文件；失败交给任务队列按策略重试。

use super::buffer::TempBuffer;
use super::hash::hash_file;
use super::session::{SessionStatus, UploadSession};
use crate::driver::{LocalFile, ObjRef, StorageRegistry};
use crate::error::GatewayError;
use crate::persistence::SessionStore;
use crate::queue::{QueueItem, TaskHandler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 任务类型
pub const PROXY_UPLOAD_TASK: &str = "proxy_upload";

pub struct ProxyUploadHandler {
    registry: Arc<StorageRegistry>,
    store: Arc<dyn SessionStore>,
    buffer: TempBuffer,
}

impl ProxyUploadHandler {
    pub fn new(registry: Arc<StorageRegistry>, store: Arc<dyn SessionStore>, buffer: TempBuffer) -> Self {
        Self {
            registry,
            store,
            buffer,
        }
    }
}

#[async_trait]
impl TaskHandler for ProxyUploadHandler {
    async fn handle(&self, item: &QueueItem, cancel: &CancellationToken) -> Result<()> {
        let mut session: UploadSession =
            serde_json::from_str(&item.payload).context("解析上传会话失败")?;

        // 重复提交的任务不再上传；Preup 只会删除已完成的会话
        match self.store.get(session.id)? {
            Some(current) if current.status != SessionStatus::Complete => {}
            Some(_) | None => {
                info!(
                    "会话已完成，跳过后台上传: task_id={}, session={}",
                    item.task_id, session.id
                );
                return Ok(());
            }
        }

        let temp_file = session
            .temp_file
            .clone()
            .with_context(|| format!("会话缺少缓冲文件: id={}", session.id))?;

        let driver = self.registry.get(&session.storage_id)?;
        let put = driver
            .as_direct_put()
            .ok_or(GatewayError::Unsupported("DirectPut"))?;

        // 按后端要求补齐哈希
        let need = driver.upload_info();
        let mut hash = session.hash.clone();
        if (need.hash_md5_need && hash.md5.is_none())
            || (need.hash_md5_256kb_need && hash.md5_256kb.is_none())
            || (need.hash_sha1_need && hash.sha1.is_none())
        {
            hash = hash_file(&temp_file).await?;
        }

        let file = LocalFile {
            path: temp_file.clone(),
            name: session.name.clone(),
            size: session.size,
            hash,
        };
        let dir = ObjRef::dir(session.dst_id.clone(), session.dst_path.clone());
        let obj = put
            .put(&dir, &file, session.overwrite, cancel)
            .await
            .with_context(|| format!("上传到后端失败: {}", session.remote_path()))?;

        session.status = SessionStatus::Complete;
        session.message.clear();
        session.temp_file = None;
        session.touch();
        match self.store.update(&session) {
            Ok(()) => {}
            // 上传期间会话被删除
            Err(GatewayError::NoSuchSession(id)) => warn!("会话已不存在，跳过状态更新: id={}", id),
            Err(e) => return Err(e.into()),
        }
        self.buffer.remove(&temp_file).await?;

        info!(
            "后台上传完成: task_id={}, session={}, path={}",
            item.task_id, session.id, obj.path
        );
        Ok(())
    }
}
