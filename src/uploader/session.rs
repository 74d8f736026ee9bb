// 分片上传会话
//
// 一个会话对应一次可断点续传的上传：
// - 分片数 = ceil(size / slice_size)
// - 位图按字节存储，长度 = ceil(分片数 / 8)，字节内高位在前（bit 0 = 0x80）
// - 第一个分片携带全部分片哈希（逗号分隔），之后的分片按清单校验

use super::hash::HashInfo;
use crate::error::GatewayError;
use bit_set::BitSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 单个会话允许的最大分片数
pub const MAX_SLICE_COUNT: usize = 1 << 20;

/// 计算分片数
///
/// 文件大小需能以 i64 入库，分片数不超过 [`MAX_SLICE_COUNT`]
pub fn slice_count(size: u64, slice_size: u64) -> crate::error::Result<usize> {
    let invalid = || GatewayError::InvalidUploadSize { size, slice_size };
    if slice_size == 0 || i64::try_from(size).is_err() {
        return Err(invalid());
    }
    usize::try_from(size.div_ceil(slice_size))
        .ok()
        .filter(|count| *count <= MAX_SLICE_COUNT)
        .ok_or_else(invalid)
}

/// 分片上传位图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "BitmapRepr", try_from = "BitmapRepr")]
pub struct SliceBitmap {
    bits: BitSet,
    count: usize,
}

#[derive(Serialize, Deserialize)]
struct BitmapRepr {
    count: usize,
    bytes: Vec<u8>,
}

impl From<SliceBitmap> for BitmapRepr {
    fn from(bitmap: SliceBitmap) -> Self {
        Self {
            count: bitmap.count,
            bytes: bitmap.to_bytes(),
        }
    }
}

impl TryFrom<BitmapRepr> for SliceBitmap {
    type Error = String;

    fn try_from(repr: BitmapRepr) -> Result<Self, Self::Error> {
        SliceBitmap::from_bytes(&repr.bytes, repr.count)
    }
}

impl SliceBitmap {
    /// 全部未上传的位图
    pub fn new(count: usize) -> Self {
        Self {
            bits: BitSet::with_capacity(count),
            count,
        }
    }

    /// 从持久化的字节恢复
    pub fn from_bytes(bytes: &[u8], count: usize) -> Result<Self, String> {
        let expected = Self::byte_len(count);
        if bytes.len() != expected {
            return Err(format!(
                "位图长度不匹配: bytes={}, expected={}, slices={}",
                bytes.len(),
                expected,
                count
            ));
        }

        let mut bitmap = Self::new(count);
        for index in 0..count {
            if bytes[index / 8] & (0x80 >> (index % 8)) != 0 {
                bitmap.bits.insert(index);
            }
        }
        Ok(bitmap)
    }

    /// 位图字节长度
    pub fn byte_len(count: usize) -> usize {
        (count + 7) / 8
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; Self::byte_len(self.count)];
        for index in self.bits.iter().filter(|i| *i < self.count) {
            bytes[index / 8] |= 0x80 >> (index % 8);
        }
        bytes
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.bits.contains(index)
    }

    /// 标记分片已上传，返回是否为新标记
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.count {
            return false;
        }
        self.bits.insert(index)
    }

    /// 已上传分片数
    pub fn uploaded(&self) -> usize {
        self.bits.len()
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded() == self.count
    }

    /// 尚未上传的分片序号
    pub fn missing(&self) -> Vec<usize> {
        (0..self.count).filter(|i| !self.bits.contains(*i)).collect()
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// 已创建，尚未收到分片
    Created,
    /// 上传中
    Uploading,
    /// 已完成
    Complete,
    /// 失败（可通过重新上传未完成的分片恢复）
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Uploading => "uploading",
            SessionStatus::Complete => "complete",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(SessionStatus::Created),
            "uploading" => Some(SessionStatus::Uploading),
            "complete" => Some(SessionStatus::Complete),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

/// 会话唯一键，用于 Preup 的幂等重入
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub storage_id: String,
    pub dst_path: String,
    pub name: String,
    pub size: u64,
    pub hash_md5: String,
    pub hash_md5_256kb: String,
}

/// 分片上传会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    /// 自增 ID（未入库时为 0）
    pub id: i64,
    /// 所属存储
    pub storage_id: String,
    /// 目标目录路径
    pub dst_path: String,
    /// 目标目录在后端的 ID
    pub dst_id: String,
    pub name: String,
    pub size: u64,
    pub hash: HashInfo,
    pub overwrite: bool,
    /// 后端上传句柄（PreupID / uploadid）
    pub preup_id: String,
    /// 后端分配的上传域名
    pub server: Option<String>,
    pub slice_size: u64,
    pub slice_count: usize,
    pub bitmap: SliceBitmap,
    /// 分片哈希清单（第一个分片上传前为空）
    pub slice_hashes: Vec<String>,
    /// 本地缓冲文件
    pub temp_file: Option<PathBuf>,
    /// 已提交的后台上传任务（仅本地缓冲路径）
    #[serde(default)]
    pub task_id: Option<String>,
    pub status: SessionStatus,
    /// 失败信息
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            storage_id: self.storage_id.clone(),
            dst_path: self.dst_path.clone(),
            name: self.name.clone(),
            size: self.size,
            hash_md5: self.hash.md5.clone().unwrap_or_default(),
            hash_md5_256kb: self.hash.md5_256kb.clone().unwrap_or_default(),
        }
    }

    /// 远程完整路径
    pub fn remote_path(&self) -> String {
        let dir = self.dst_path.trim_end_matches('/');
        format!("{}/{}", dir, self.name)
    }

    /// 分片在文件中的偏移
    pub fn slice_offset(&self, index: usize) -> u64 {
        index as u64 * self.slice_size
    }

    /// 分片的实际长度（最后一个分片可能较短）
    pub fn slice_len(&self, index: usize) -> u64 {
        let offset = self.slice_offset(index);
        self.slice_size.min(self.size.saturating_sub(offset))
    }

    /// 记录失败信息
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.message = message.into();
        self.updated_at = Utc::now();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_slice_count() {
        assert_eq!(slice_count(10_000_000, 4_194_304).unwrap(), 3);
        assert_eq!(slice_count(4_194_304, 4_194_304).unwrap(), 1);
        assert_eq!(slice_count(4_194_305, 4_194_304).unwrap(), 2);
        assert_eq!(slice_count(0, 4_194_304).unwrap(), 0);
        assert!(slice_count(100, 0).is_err());
    }

    #[test]
    fn test_slice_count_rejects_unrepresentable_sizes() {
        // 不能溢出或 panic
        assert!(matches!(
            slice_count(u64::MAX, 4_194_304),
            Err(GatewayError::InvalidUploadSize { size: u64::MAX, .. })
        ));
        assert!(slice_count(i64::MAX as u64 + 1, u64::MAX).is_err());
        assert_eq!(slice_count(i64::MAX as u64, u64::MAX).unwrap(), 1);

        // 分片数上限
        assert_eq!(slice_count(MAX_SLICE_COUNT as u64, 1).unwrap(), MAX_SLICE_COUNT);
        assert!(slice_count(MAX_SLICE_COUNT as u64 + 1, 1).is_err());
        assert!(slice_count(i64::MAX as u64, 4).is_err());
    }

    #[test]
    fn test_bitmap_layout_is_msb_first() {
        let mut bitmap = SliceBitmap::new(10);
        assert_eq!(bitmap.to_bytes(), vec![0, 0]);

        bitmap.set(0);
        bitmap.set(1);
        bitmap.set(9);
        assert_eq!(bitmap.to_bytes(), vec![0b1100_0000, 0b0100_0000]);
        assert_eq!(bitmap.missing(), vec![2, 3, 4, 5, 6, 7, 8]);

        // 越界不标记
        assert!(!bitmap.set(10));
        assert_eq!(bitmap.uploaded(), 3);
    }

    #[test]
    fn test_bitmap_rejects_wrong_length() {
        assert!(SliceBitmap::from_bytes(&[0, 0], 3).is_err());
        assert!(SliceBitmap::from_bytes(&[], 0).is_ok());
    }

    #[test]
    fn test_bitmap_serde_roundtrip_through_json() {
        let mut bitmap = SliceBitmap::new(3);
        bitmap.set(1);
        let json = serde_json::to_string(&bitmap).unwrap();
        let back: SliceBitmap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bitmap);
        assert!(back.is_set(1));
    }

    #[test]
    fn test_slice_len_of_last_slice() {
        let session = UploadSession {
            id: 1,
            storage_id: "s".into(),
            dst_path: "/a/".into(),
            dst_id: "0".into(),
            name: "f.bin".into(),
            size: 10_000_000,
            hash: HashInfo::default(),
            overwrite: false,
            preup_id: String::new(),
            server: None,
            slice_size: 4_194_304,
            slice_count: 3,
            bitmap: SliceBitmap::new(3),
            slice_hashes: Vec::new(),
            temp_file: None,
            task_id: None,
            status: SessionStatus::Created,
            message: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(session.slice_len(0), 4_194_304);
        assert_eq!(session.slice_len(2), 10_000_000 - 2 * 4_194_304);
        assert_eq!(session.remote_path(), "/a/f.bin");
    }

    proptest! {
        #[test]
        fn prop_bitmap_bytes_roundtrip(count in 0usize..200, picks in proptest::collection::vec(0usize..200, 0..64)) {
            let mut bitmap = SliceBitmap::new(count);
            for p in &picks {
                bitmap.set(*p);
            }
            let bytes = bitmap.to_bytes();
            prop_assert_eq!(bytes.len(), (count + 7) / 8);

            let restored = SliceBitmap::from_bytes(&bytes, count).unwrap();
            prop_assert_eq!(&restored, &bitmap);
            prop_assert_eq!(restored.is_complete(), restored.missing().is_empty());
        }

        #[test]
        fn prop_slice_count_covers_size(size in 0u64..1_000_000_000, slice_size in 1024u64..50_000_000) {
            let count = slice_count(size, slice_size).unwrap() as u64;
            prop_assert!(count * slice_size >= size);
            prop_assert!(count == 0 || (count - 1) * slice_size < size);
        }
    }
}
