// 本地缓冲文件
//
// 后端不支持原生分片上传时，分片按 index * slice_size 的偏移写入一个
// 预先截断到文件总大小的临时文件，合并后交给任务队列一次性上传。

use anyhow::{Context, Result};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// 临时缓冲文件管理
#[derive(Debug, Clone)]
pub struct TempBuffer {
    dir: PathBuf,
}

impl TempBuffer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 创建一个预分配到 `size` 字节的临时文件
    pub async fn create(&self, size: u64) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("创建临时目录失败: {:?}", self.dir))?;

        let path = self
            .dir
            .join(format!("{}.slices", uuid::Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await
            .with_context(|| format!("创建临时文件失败: {:?}", path))?;
        file.set_len(size)
            .await
            .with_context(|| format!("预分配临时文件失败: {:?}", path))?;

        debug!("创建缓冲文件: {:?}, size={}", path, size);
        Ok(path)
    }

    /// 在指定偏移写入分片
    ///
    /// 每次写入使用独立的文件句柄，不同分片可以并发写入
    pub async fn write_at(&self, path: &Path, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("打开缓冲文件失败: {:?}", path))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data)
            .await
            .with_context(|| format!("写入缓冲文件失败: {:?}, offset={}", path, offset))?;
        file.flush().await?;
        Ok(())
    }

    /// 删除临时文件（不存在时忽略）
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("删除缓冲文件: {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("删除缓冲文件失败: {:?}", path)),
        }
    }
}
