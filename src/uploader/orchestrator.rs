//! 分片上传编排
//!
//! 三步状态机：Preup → UploadSlice（任意顺序，第一个分片必须最先成功）→ SliceComplete。
//!
//! - 每一步先检查驱动能力：有原生分片上传就直接转发，
//!   没有则把分片写入本地缓冲文件，合并后提交 `proxy_upload` 任务异步上传。
//! - 会话持久化在数据库中，内存里只缓存进行中的会话（按需加载，完成后移除）。
//! - 同一会话的位图更新由会话锁串行化；第一个分片在持锁状态下上传，
//!   其余分片只在更新位图与持久化时持锁，可以并发上传。

use super::buffer::TempBuffer;
use super::cache::SessionCache;
use super::hash::{hash_eq, parse_manifest};
use super::proxy::PROXY_UPLOAD_TASK;
use super::session::{slice_count, SessionStatus, SliceBitmap, UploadSession};
use crate::config::UploadConfig;
use crate::driver::{
    CapabilitySet, LocalFile, ObjRef, PreupRequest, RenameObj, SliceReceipt, StorageDriver,
    StorageRegistry, UploadInfo,
};
use crate::error::{GatewayError, Result};
use crate::persistence::SessionStore;
use crate::queue::{TaskQueue, TaskStatus};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Preup 结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreupResult {
    /// 会话 ID（秒传时为 0）
    pub upload_id: i64,
    pub slice_size: u64,
    pub slice_count: usize,
    pub bitmap: SliceBitmap,
    /// 秒传成功，无需上传分片
    pub reuse: bool,
}

impl PreupResult {
    fn from_session(session: &UploadSession) -> Self {
        Self {
            upload_id: session.id,
            slice_size: session.slice_size,
            slice_count: session.slice_count,
            bitmap: session.bitmap.clone(),
            reuse: false,
        }
    }
}

/// UploadSlice 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceOutcome {
    Uploaded,
    /// 分片此前已上传，本次未调用后端
    AlreadyUploaded,
}

/// SliceComplete 结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompleteResult {
    pub complete: bool,
    /// 未完成时返回当前位图，客户端据此续传
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmap: Option<SliceBitmap>,
    /// 已提交到任务队列异步完成时的任务 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl CompleteResult {
    fn done() -> Self {
        Self {
            complete: true,
            bitmap: None,
            task_id: None,
        }
    }

    /// 是否转入异步完成
    pub fn accepted_async(&self) -> bool {
        self.task_id.is_some()
    }
}

/// 上传编排器
pub struct UploadOrchestrator {
    registry: Arc<StorageRegistry>,
    cache: SessionCache,
    buffer: TempBuffer,
    queue: Arc<TaskQueue>,
    default_slice_size: u64,
    max_slice_size: u64,
}

impl UploadOrchestrator {
    pub fn new(
        registry: Arc<StorageRegistry>,
        store: Arc<dyn SessionStore>,
        queue: Arc<TaskQueue>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            registry,
            cache: SessionCache::new(store),
            buffer: TempBuffer::new(&config.temp_dir),
            queue,
            default_slice_size: config.default_slice_size,
            max_slice_size: config.max_slice_size,
        }
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// 单个分片允许的最大字节数
    pub fn max_slice_size(&self) -> u64 {
        self.max_slice_size
    }

    fn store(&self) -> &Arc<dyn SessionStore> {
        self.cache.store()
    }

    // =====================================================
    // 分片上传状态机
    // =====================================================

    /// 预上传
    ///
    /// 相同 (存储, 路径, 文件名, 大小, 哈希) 的未完成会话直接返回，不再调用后端；
    /// 已完成的旧会话会被删除后重新创建。
    pub async fn preup(&self, req: PreupRequest, cancel: &CancellationToken) -> Result<PreupResult> {
        // 大小需能以 i64 入库
        if i64::try_from(req.size).is_err() {
            return Err(GatewayError::InvalidUploadSize {
                size: req.size,
                slice_size: self.default_slice_size,
            });
        }
        let driver = self.registry.get(&req.storage)?;

        let now = Utc::now();
        let mut session = UploadSession {
            id: 0,
            storage_id: req.storage.clone(),
            dst_path: req.dst.path.clone(),
            dst_id: req.dst.id.clone(),
            name: req.name.clone(),
            size: req.size,
            hash: req.hash.clone(),
            overwrite: req.overwrite,
            preup_id: String::new(),
            server: None,
            slice_size: self.default_slice_size,
            slice_count: 0,
            bitmap: SliceBitmap::new(0),
            slice_hashes: Vec::new(),
            temp_file: None,
            task_id: None,
            status: SessionStatus::Created,
            message: String::new(),
            created_at: now,
            updated_at: now,
        };

        if let Some(existing) = self.store().find_by_key(&session.key())? {
            if existing.status != SessionStatus::Complete {
                info!(
                    "复用已有上传会话: id={}, path={}, 已上传 {}/{}",
                    existing.id,
                    existing.remote_path(),
                    existing.bitmap.uploaded(),
                    existing.slice_count
                );
                return Ok(PreupResult::from_session(&existing));
            }
            debug!("删除已完成的旧会话: id={}", existing.id);
            self.store().delete(existing.id)?;
            self.cache.evict(existing.id);
        }

        if let Some(preupload) = driver.as_preupload() {
            let info = preupload.preup(&req, cancel).await?;
            if info.reuse {
                info!("秒传成功: {}", session.remote_path());
                return Ok(PreupResult {
                    upload_id: 0,
                    slice_size: info.slice_size,
                    slice_count: 0,
                    bitmap: SliceBitmap::new(0),
                    reuse: true,
                });
            }
            session.preup_id = info.preup_id;
            session.slice_size = info.slice_size;
            session.server = info.server;
        }

        if session.slice_size == 0 || session.slice_size > self.max_slice_size {
            return Err(GatewayError::Other(anyhow::anyhow!(
                "分片大小无效: storage={}, slice_size={}, 上限={}",
                req.storage,
                session.slice_size,
                self.max_slice_size
            )));
        }
        session.slice_count = slice_count(session.size, session.slice_size)?;
        session.bitmap = SliceBitmap::new(session.slice_count);

        let (saved, created) = self.store().insert(&session)?;
        if created {
            info!(
                "创建上传会话: id={}, path={}, size={}, slice_size={}, slice_count={}",
                saved.id,
                saved.remote_path(),
                saved.size,
                saved.slice_size,
                saved.slice_count
            );
        } else {
            info!("并发预上传，沿用已有会话: id={}", saved.id);
        }
        Ok(PreupResult::from_session(&saved))
    }

    /// 上传一个分片
    ///
    /// # 参数
    /// * `upload_id` - Preup 返回的会话 ID
    /// * `index` - 分片序号（从 0 开始）
    /// * `slice_hash` - 第一个分片为逗号分隔的全部分片哈希，其余分片为本分片哈希
    /// * `data` - 分片内容
    pub async fn upload_slice(
        &self,
        upload_id: i64,
        index: usize,
        slice_hash: &str,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SliceOutcome> {
        let handle = self.cache.get(upload_id)?;
        let mut session = handle.lock().await;

        if index >= session.slice_count {
            return Err(GatewayError::SliceOutOfRange {
                index,
                slice_count: session.slice_count,
            });
        }
        if session.bitmap.is_set(index) {
            debug!("分片已上传: id={}, index={}", upload_id, index);
            return Ok(SliceOutcome::AlreadyUploaded);
        }
        let expected_len = session.slice_len(index);
        if data.len() as u64 != expected_len {
            return Err(GatewayError::SliceSizeMismatch {
                index,
                expected: expected_len,
                actual: data.len() as u64,
            });
        }
        let driver = self.registry.get(&session.storage_id)?;

        if index == 0 {
            let manifest = parse_manifest(slice_hash);
            if manifest.len() != session.slice_count {
                return Err(GatewayError::InvalidManifest(format!(
                    "需要 {} 个分片哈希，实际 {} 个",
                    session.slice_count,
                    manifest.len()
                )));
            }
            session.slice_hashes = manifest;
            if driver.as_slice_upload().is_none() && session.temp_file.is_none() {
                session.temp_file = Some(self.buffer.create(session.size).await?);
            }

            // 第一个分片持锁上传，其余分片在它成功前都会被拒绝
            let result = self.dispatch(driver.as_ref(), &session, index, data, cancel).await;
            return self.finish_slice(&mut session, index, result);
        }

        if !session.bitmap.is_set(0) {
            return Err(GatewayError::SliceZeroPending);
        }
        let expected = session.slice_hashes.get(index).cloned().unwrap_or_default();
        if !hash_eq(&expected, slice_hash) {
            return Err(GatewayError::HashMismatch {
                index,
                expected,
                actual: slice_hash.trim().to_string(),
            });
        }

        let snapshot = session.clone();
        drop(session);
        let result = self.dispatch(driver.as_ref(), &snapshot, index, data, cancel).await;

        let mut session = handle.lock().await;
        if result.is_ok() && session.bitmap.is_set(index) {
            // 同一分片并发上传，另一个请求已先完成
            return Ok(SliceOutcome::AlreadyUploaded);
        }
        self.finish_slice(&mut session, index, result)
    }

    /// 把分片交给后端或写入本地缓冲
    async fn dispatch(
        &self,
        driver: &dyn StorageDriver,
        session: &UploadSession,
        index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SliceReceipt> {
        if let Some(slice_upload) = driver.as_slice_upload() {
            return slice_upload.slice_upload(session, index, data, cancel).await;
        }

        let path = session
            .temp_file
            .as_deref()
            .ok_or_else(|| GatewayError::Other(anyhow::anyhow!("会话缺少缓冲文件: id={}", session.id)))?;
        self.buffer
            .write_at(path, session.slice_offset(index), &data)
            .await?;
        Ok(SliceReceipt::default())
    }

    /// 根据分发结果更新会话并持久化（调用方持有会话锁）
    fn finish_slice(
        &self,
        session: &mut UploadSession,
        index: usize,
        result: Result<SliceReceipt>,
    ) -> Result<SliceOutcome> {
        match result {
            Ok(receipt) => {
                session.bitmap.set(index);
                if let Some(preup_id) = receipt.preup_id {
                    session.preup_id = preup_id;
                }
                session.status = SessionStatus::Uploading;
                session.message.clear();
                session.touch();
                self.store().update(session)?;
                debug!(
                    "分片上传成功: id={}, index={}, 进度 {}/{}",
                    session.id,
                    index,
                    session.bitmap.uploaded(),
                    session.slice_count
                );
                Ok(SliceOutcome::Uploaded)
            }
            Err(e) => {
                // 位图保持不变，客户端可以重试同一分片
                if !e.is_caller_error() && !matches!(e, GatewayError::Cancelled) {
                    warn!("分片上传失败: id={}, index={}, 错误: {}", session.id, index, e);
                    session.mark_failed(e.to_string());
                    if let Err(persist) = self.store().update(session) {
                        error!("保存会话失败状态出错: id={}, 错误: {}", session.id, persist);
                    }
                }
                Err(e)
            }
        }
    }

    /// 完成上传
    pub async fn slice_complete(&self, upload_id: i64, cancel: &CancellationToken) -> Result<CompleteResult> {
        let handle = self.cache.get(upload_id)?;
        let mut session = handle.lock().await;

        if session.status == SessionStatus::Complete {
            return Ok(CompleteResult::done());
        }
        if !session.bitmap.is_complete() {
            debug!(
                "分片未全部上传: id={}, 进度 {}/{}",
                upload_id,
                session.bitmap.uploaded(),
                session.slice_count
            );
            return Ok(CompleteResult {
                complete: false,
                bitmap: Some(session.bitmap.clone()),
                task_id: None,
            });
        }

        let driver = self.registry.get(&session.storage_id)?;
        if let Some(slice_complete) = driver.as_slice_complete() {
            if let Err(e) = slice_complete.slice_complete(&session, cancel).await {
                if !matches!(e, GatewayError::Cancelled) {
                    warn!("合并分片失败: id={}, 错误: {}", upload_id, e);
                    session.mark_failed(e.to_string());
                    self.store().update(&session)?;
                }
                return Err(e);
            }

            session.status = SessionStatus::Complete;
            session.message.clear();
            session.touch();
            let temp_file = session.temp_file.take();
            self.store().update(&session)?;
            if let Some(path) = temp_file {
                if let Err(e) = self.buffer.remove(&path).await {
                    warn!("删除缓冲文件失败: {:?}, 错误: {:#}", path, e);
                }
            }
            info!("上传完成: id={}, path={}", upload_id, session.remote_path());
            drop(session);
            self.cache.evict(upload_id);
            return Ok(CompleteResult::done());
        }

        // 本地缓冲路径：提交任务队列，由后台一次性上传
        if let Some(task_id) = self.pending_task(&session)? {
            debug!("后台上传任务已提交: id={}, task_id={}", upload_id, task_id);
            // 会话此后由后台任务更新，缓存副本不再可信
            drop(session);
            self.cache.evict(upload_id);
            return Ok(CompleteResult {
                complete: true,
                bitmap: None,
                task_id: Some(task_id),
            });
        }
        if session.temp_file.is_none() {
            // 空文件没有分片
            session.temp_file = Some(self.buffer.create(session.size).await?);
        }

        // 任务 ID 先随会话入库，处理器可能在入队后立即执行
        let task_id = uuid::Uuid::new_v4().to_string();
        session.task_id = Some(task_id.clone());
        session.touch();
        self.store().update(&session)?;
        self.queue.enqueue_with_id(&task_id, PROXY_UPLOAD_TASK, &*session)?;
        info!(
            "分片已合并，提交后台上传: id={}, task_id={}, path={}",
            upload_id,
            task_id,
            session.remote_path()
        );
        drop(session);
        self.cache.evict(upload_id);

        Ok(CompleteResult {
            complete: true,
            bitmap: None,
            task_id: Some(task_id),
        })
    }

    /// 会话已提交且未失败的后台任务
    fn pending_task(&self, session: &UploadSession) -> Result<Option<String>> {
        let task_id = match session.task_id.as_deref() {
            Some(task_id) => task_id,
            None => return Ok(None),
        };
        match self.queue.get(task_id)? {
            Some(item) if !matches!(item.status, TaskStatus::Failed | TaskStatus::Cancelled) => {
                Ok(Some(task_id.to_string()))
            }
            _ => Ok(None),
        }
    }

    /// 会话当前状态
    pub async fn session(&self, upload_id: i64) -> Result<UploadSession> {
        let handle = self.cache.get(upload_id)?;
        let session = handle.lock().await;
        Ok(session.clone())
    }

    // =====================================================
    // 其他能力分发
    // =====================================================

    pub fn upload_info(&self, storage: &str) -> Result<UploadInfo> {
        Ok(self.registry.get(storage)?.upload_info())
    }

    pub fn capabilities(&self, storage: &str) -> Result<CapabilitySet> {
        Ok(self.registry.get(storage)?.capabilities())
    }

    /// 批量重命名，后端不支持时逐个重命名
    pub async fn batch_rename(
        &self,
        storage: &str,
        dir: &ObjRef,
        items: &[RenameObj],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let driver = self.registry.get(storage)?;
        if let Some(batch) = driver.as_batch_rename() {
            return batch.batch_rename(dir, items, cancel).await;
        }

        for item in items {
            let obj = ObjRef {
                id: item.id.clone(),
                path: dir.child_path(&item.src_name),
                name: item.src_name.clone(),
                is_dir: false,
            };
            driver.rename(&obj, &item.new_name, cancel).await?;
        }
        Ok(())
    }

    /// 批量删除，后端不支持时逐个删除
    pub async fn batch_remove(
        &self,
        storage: &str,
        dir: &ObjRef,
        objs: &[ObjRef],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let driver = self.registry.get(storage)?;
        if let Some(batch) = driver.as_batch_remove() {
            return batch.batch_remove(dir, objs, cancel).await;
        }

        for obj in objs {
            let target = ObjRef {
                path: dir.child_path(&obj.name),
                ..obj.clone()
            };
            driver.remove(&target, cancel).await?;
        }
        Ok(())
    }

    /// 离线下载
    pub async fn put_url(
        &self,
        storage: &str,
        dir: &ObjRef,
        name: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let driver = self.registry.get(storage)?;
        let put_url = driver.as_put_url().ok_or(GatewayError::Unsupported("PutURL"))?;
        put_url.put_url(dir, name, url, cancel).await
    }

    /// 一次性上传本地文件
    pub async fn put_directly(
        &self,
        storage: &str,
        dir: &ObjRef,
        file: &LocalFile,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<ObjRef> {
        let driver = self.registry.get(storage)?;
        let put = driver.as_direct_put().ok_or(GatewayError::Unsupported("DirectPut"))?;
        put.put(dir, file, overwrite, cancel).await
    }
}
