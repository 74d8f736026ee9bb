// 文件与分片哈希
//
// - md5: 完整内容 MD5
// - md5_256kb: 前 256KB 的 MD5（百度网盘 slice-md5）
// - sha1: 完整内容 SHA1
// 分片清单由客户端计算，随第一个分片以逗号分隔的形式上传

use anyhow::{Context, Result};
use md5::Context as Md5Context;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// 前 256KB 的大小
pub const HEAD_SLICE_SIZE: usize = 256 * 1024;

/// 文件哈希信息（按后端需要提供，缺失的为 None）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_256kb: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
}

impl HashInfo {
    pub fn with_md5(md5: impl Into<String>) -> Self {
        Self {
            md5: Some(md5.into()),
            ..Default::default()
        }
    }

    /// 完整 MD5，后端强制要求时使用
    pub fn require_md5(&self) -> Result<&str> {
        self.md5
            .as_deref()
            .filter(|s| !s.is_empty())
            .context("缺少文件 MD5")
    }
}

/// 单个分片的 MD5
pub fn slice_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// 哈希比较（忽略大小写与首尾空白）
pub fn hash_eq(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// 解析第一个分片携带的哈希清单
pub fn parse_manifest(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// 计算本地文件的完整哈希信息
pub async fn hash_file(path: &Path) -> Result<HashInfo> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_sync(&path))
        .await
        .context("计算哈希任务执行失败")?
}

fn hash_file_sync(path: &Path) -> Result<HashInfo> {
    let file = std::fs::File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);

    let mut full = Md5Context::new();
    let mut head = Md5Context::new();
    let mut sha1 = Sha1::new();
    let mut head_read = 0usize;
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer).context("读取文件失败")?;
        if n == 0 {
            break;
        }
        full.consume(&buffer[..n]);
        sha1.update(&buffer[..n]);

        if head_read < HEAD_SLICE_SIZE {
            let take = n.min(HEAD_SLICE_SIZE - head_read);
            head.consume(&buffer[..take]);
            head_read += take;
        }
    }

    let info = HashInfo {
        md5: Some(format!("{:x}", full.compute())),
        md5_256kb: Some(format!("{:x}", head.compute())),
        sha1: Some(hex::encode(sha1.finalize())),
    };
    debug!("文件哈希计算完成: path={:?}, md5={:?}", path, info.md5);
    Ok(info)
}

/// 按分片大小计算每个分片的 MD5（预创建接口的 block_list）
pub async fn block_list(path: &Path, slice_size: u64) -> Result<Vec<String>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || block_list_sync(&path, slice_size))
        .await
        .context("计算 block_list 任务执行失败")?
}

fn block_list_sync(path: &Path, slice_size: u64) -> Result<Vec<String>> {
    if slice_size == 0 {
        anyhow::bail!("分片大小必须大于 0");
    }
    let file = std::fs::File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
    let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);

    let mut list = Vec::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut hasher = Md5Context::new();
    let mut in_slice = 0u64;

    loop {
        let n = reader.read(&mut buffer).context("读取文件失败")?;
        if n == 0 {
            break;
        }
        let mut offset = 0usize;
        while offset < n {
            let take = ((slice_size - in_slice) as usize).min(n - offset);
            hasher.consume(&buffer[offset..offset + take]);
            in_slice += take as u64;
            offset += take;
            if in_slice == slice_size {
                list.push(format!("{:x}", std::mem::replace(&mut hasher, Md5Context::new()).compute()));
                in_slice = 0;
            }
        }
    }
    if in_slice > 0 {
        list.push(format!("{:x}", hasher.compute()));
    }
    Ok(list)
}
