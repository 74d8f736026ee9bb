// 驱动层数据类型

use crate::uploader::hash::HashInfo;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 后端对象引用
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjRef {
    /// 后端对象 ID（没有 ID 概念的后端留空）
    #[serde(default)]
    pub id: String,
    /// 存储内的完整路径
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
}

impl ObjRef {
    pub fn dir(id: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            id: id.into(),
            path,
            name,
            is_dir: true,
        }
    }

    /// 目录下子对象的路径
    pub fn child_path(&self, name: &str) -> String {
        format!("{}/{}", self.path.trim_end_matches('/'), name)
    }
}

/// 预上传请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreupRequest {
    /// 存储 ID
    pub storage: String,
    /// 目标目录
    pub dst: ObjRef,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub hash: HashInfo,
    #[serde(default)]
    pub overwrite: bool,
}

/// 后端预上传结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreupInfo {
    /// 后端上传句柄；为空表示在第一个分片时才分配
    pub preup_id: String,
    pub slice_size: u64,
    /// 秒传成功
    pub reuse: bool,
    /// 后端分配的上传域名
    pub server: Option<String>,
}

/// 分片上传回执
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceReceipt {
    /// 后端在本次上传中分配的新句柄
    pub preup_id: Option<String>,
}

/// 后端对上传哈希的要求
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    pub slice_hash_need: bool,
    pub hash_md5_need: bool,
    pub hash_md5_256kb_need: bool,
    pub hash_sha1_need: bool,
}

/// 批量重命名项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameObj {
    #[serde(default)]
    pub id: String,
    pub src_name: String,
    pub new_name: String,
}

/// 待上传的本地文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub hash: HashInfo,
}

/// 驱动实现的能力集合
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub preupload: bool,
    pub slice_upload: bool,
    pub slice_complete: bool,
    pub batch_rename: bool,
    pub batch_remove: bool,
    pub direct_put: bool,
    pub put_url: bool,
}
