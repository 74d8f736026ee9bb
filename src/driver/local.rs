//! 本地目录存储
//!
//! 只实现一次性上传与批量删除，分片上传全部经由本地缓冲 + 任务队列完成。

use super::{BatchRemove, DirectPut, LocalFile, ObjRef, StorageDriver, UploadInfo};
use crate::config::LocalConfig;
use crate::error::{GatewayError, Result};
use anyhow::Context;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct LocalStorage {
    id: String,
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(config: &LocalConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("创建存储根目录失败: {:?}", config.root))?;
        Ok(Self {
            id: config.id.clone(),
            root: config.root.clone(),
        })
    }

    /// 把存储内路径映射到本地路径，拒绝越出根目录的路径
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(GatewayError::Other(anyhow::anyhow!("非法路径: {}", path)));
                }
            }
        }
        Ok(resolved)
    }
}

#[async_trait]
impl StorageDriver for LocalStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    fn upload_info(&self) -> UploadInfo {
        UploadInfo::default()
    }

    async fn rename(&self, obj: &ObjRef, new_name: &str, _cancel: &CancellationToken) -> Result<()> {
        let src = self.resolve(&obj.path)?;
        let dst = match src.parent() {
            Some(parent) => parent.join(new_name),
            None => return Err(GatewayError::Other(anyhow::anyhow!("无法重命名根目录"))),
        };
        if dst.parent() != src.parent() {
            return Err(GatewayError::Other(anyhow::anyhow!("非法文件名: {}", new_name)));
        }
        fs::rename(&src, &dst).await?;
        debug!("重命名: {:?} -> {:?}", src, dst);
        Ok(())
    }

    async fn remove(&self, obj: &ObjRef, _cancel: &CancellationToken) -> Result<()> {
        let path = self.resolve(&obj.path)?;
        if path == self.root {
            return Err(GatewayError::Other(anyhow::anyhow!("不能删除存储根目录")));
        }
        if fs::metadata(&path).await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        debug!("删除: {:?}", path);
        Ok(())
    }

    fn as_batch_remove(&self) -> Option<&dyn BatchRemove> {
        Some(self)
    }

    fn as_direct_put(&self) -> Option<&dyn DirectPut> {
        Some(self)
    }
}

#[async_trait]
impl BatchRemove for LocalStorage {
    async fn batch_remove(&self, dir: &ObjRef, objs: &[ObjRef], cancel: &CancellationToken) -> Result<()> {
        for obj in objs {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let target = ObjRef {
                path: dir.child_path(&obj.name),
                ..obj.clone()
            };
            self.remove(&target, cancel).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DirectPut for LocalStorage {
    async fn put(
        &self,
        dir: &ObjRef,
        file: &LocalFile,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<ObjRef> {
        let remote_path = dir.child_path(&file.name);
        let dst = self.resolve(&remote_path)?;
        if !overwrite && fs::try_exists(&dst).await? {
            return Err(GatewayError::BackendRejected {
                code: 409,
                message: format!("文件已存在: {}", remote_path),
            });
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先写入临时文件再改名，避免留下半个文件
        let partial = dst.with_extension(format!("{}.partial", uuid::Uuid::new_v4().simple()));
        let copied = tokio::select! {
            copied = fs::copy(&file.path, &partial) => copied,
            _ = cancel.cancelled() => {
                let _ = fs::remove_file(&partial).await;
                return Err(GatewayError::Cancelled);
            }
        };
        if let Err(e) = copied {
            let _ = fs::remove_file(&partial).await;
            return Err(e.into());
        }
        fs::rename(&partial, &dst).await?;

        info!("本地存储写入完成: {:?}, size={}", dst, file.size);
        Ok(ObjRef {
            id: String::new(),
            path: remote_path,
            name: file.name.clone(),
            is_dir: false,
        })
    }
}
