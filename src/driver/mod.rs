//! 存储驱动
//!
//! 每个后端实现 [`StorageDriver`] 的基本操作，并按需暴露可选能力：
//! Preupload / SliceUpload / SliceComplete / BatchRename / BatchRemove / DirectPut / PutURL。
//! 编排器在每一步通过能力访问器做存在性检查，缺失能力选择回退路径，不视为错误。

pub mod baidu_netdisk;
pub mod local;
pub mod open123;
mod registry;
mod types;

pub use registry::StorageRegistry;
pub use types::{
    CapabilitySet, LocalFile, ObjRef, PreupInfo, PreupRequest, RenameObj, SliceReceipt, UploadInfo,
};

use crate::error::Result;
use crate::uploader::session::UploadSession;
use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// 预上传：分配分片大小与上传句柄，或直接秒传
#[async_trait]
pub trait Preupload: Send + Sync {
    async fn preup(&self, req: &PreupRequest, cancel: &CancellationToken) -> Result<PreupInfo>;
}

/// 原生分片上传
#[async_trait]
pub trait SliceUpload: Send + Sync {
    /// # 参数
    /// * `session` - 当前会话（含句柄、上传域名、哈希清单）
    /// * `index` - 分片序号（从 0 开始）
    /// * `data` - 分片内容
    async fn slice_upload(
        &self,
        session: &UploadSession,
        index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SliceReceipt>;
}

/// 原生分片合并
#[async_trait]
pub trait SliceComplete: Send + Sync {
    async fn slice_complete(&self, session: &UploadSession, cancel: &CancellationToken) -> Result<()>;
}

#[async_trait]
pub trait BatchRename: Send + Sync {
    async fn batch_rename(
        &self,
        dir: &ObjRef,
        items: &[RenameObj],
        cancel: &CancellationToken,
    ) -> Result<()>;
}

#[async_trait]
pub trait BatchRemove: Send + Sync {
    async fn batch_remove(&self, dir: &ObjRef, objs: &[ObjRef], cancel: &CancellationToken) -> Result<()>;
}

/// 一次性上传本地文件
#[async_trait]
pub trait DirectPut: Send + Sync {
    async fn put(
        &self,
        dir: &ObjRef,
        file: &LocalFile,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<ObjRef>;
}

/// 离线下载：由后端从 URL 拉取
#[async_trait]
pub trait PutUrl: Send + Sync {
    /// # 返回
    /// 后端的任务 ID
    async fn put_url(
        &self,
        dir: &ObjRef,
        name: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String>;
}

/// 存储驱动
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// 挂载 ID
    fn id(&self) -> &str;

    /// 驱动类型名
    fn kind(&self) -> &'static str;

    fn upload_info(&self) -> UploadInfo;

    async fn rename(&self, obj: &ObjRef, new_name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn remove(&self, obj: &ObjRef, cancel: &CancellationToken) -> Result<()>;

    fn as_preupload(&self) -> Option<&dyn Preupload> {
        None
    }

    fn as_slice_upload(&self) -> Option<&dyn SliceUpload> {
        None
    }

    fn as_slice_complete(&self) -> Option<&dyn SliceComplete> {
        None
    }

    fn as_batch_rename(&self) -> Option<&dyn BatchRename> {
        None
    }

    fn as_batch_remove(&self) -> Option<&dyn BatchRemove> {
        None
    }

    fn as_direct_put(&self) -> Option<&dyn DirectPut> {
        None
    }

    fn as_put_url(&self) -> Option<&dyn PutUrl> {
        None
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            preupload: self.as_preupload().is_some(),
            slice_upload: self.as_slice_upload().is_some(),
            slice_complete: self.as_slice_complete().is_some(),
            batch_rename: self.as_batch_rename().is_some(),
            batch_remove: self.as_batch_remove().is_some(),
            direct_put: self.as_direct_put().is_some(),
            put_url: self.as_put_url().is_some(),
        }
    }

    /// 卸载时释放资源（关闭限流器等）
    async fn shutdown(&self) {}
}

// =====================================================
// 本地文件读取
// =====================================================

/// 以流的形式发送本地文件
///
/// 请求构建回调在每次重试时都会调用，因此每次都重新打开文件
pub(crate) fn file_body(path: &Path) -> reqwest::Body {
    match std::fs::File::open(path) {
        Ok(file) => reqwest::Body::wrap_stream(ReaderStream::new(tokio::fs::File::from_std(file))),
        Err(e) => reqwest::Body::wrap_stream(futures::stream::iter([Err::<Vec<u8>, _>(e)])),
    }
}

/// 读取文件中的一段
pub(crate) async fn read_range(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}
