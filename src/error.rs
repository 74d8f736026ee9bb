//! 网关错误类型
//!
//! 可恢复错误（鉴权过期、限流、后端暂时不可用）在请求客户端内部按重试预算处理，
//! 其余错误原样返回给分片状态机，由状态机写入会话的失败信息。

use thiserror::Error;

/// 网关统一错误
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 访问令牌失效（刷新后仍失败时才会向上返回）
    #[error("访问令牌已失效: {0}")]
    AuthExpired(String),

    /// 后端限流
    #[error("请求过于频繁: {0}")]
    RateLimited(String),

    /// 后端暂时不可用（如文件仍在校验中）
    #[error("后端暂时不可用: {0}")]
    TransientBackend(String),

    /// 分片哈希与清单不一致
    #[error("分片哈希不匹配: index={index}, expected={expected}, actual={actual}")]
    HashMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    /// 后端明确拒绝
    #[error("后端拒绝请求: code={code}, message={message}")]
    BackendRejected { code: i64, message: String },

    /// 重试次数耗尽
    #[error("超过最大重试次数: api={api}, attempts={attempts}")]
    MaxRetriesExceeded { api: String, attempts: u32 },

    /// 非 2xx 响应
    #[error("HTTP 状态异常: status={status}, body={body}")]
    HttpStatus { status: u16, body: String },

    #[error("上传会话不存在: {0}")]
    NoSuchSession(i64),

    /// 第一个分片携带的哈希清单不合法
    #[error("分片哈希清单无效: {0}")]
    InvalidManifest(String),

    #[error("分片序号越界: index={index}, slice_count={slice_count}")]
    SliceOutOfRange { index: usize, slice_count: usize },

    /// 分片长度与会话的分片大小不一致
    #[error("分片长度不匹配: index={index}, expected={expected}, actual={actual}")]
    SliceSizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// 文件大小或分片大小超出可处理范围
    #[error("上传大小无效: size={size}, slice_size={slice_size}")]
    InvalidUploadSize { size: u64, slice_size: u64 },

    /// 第一个分片尚未上传成功，其余分片不接受
    #[error("第一个分片尚未上传完成")]
    SliceZeroPending,

    #[error("存储不存在: {0}")]
    StorageNotFound(String),

    #[error("存储不支持该操作: {0}")]
    Unsupported(&'static str),

    #[error("请求已取消")]
    Cancelled,

    #[error("限流器已关闭")]
    LimiterClosed,

    #[error("HTTP 请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("获取数据库连接失败: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON 解析失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// 是否属于客户端自身的错误（不应标记会话失败）
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            GatewayError::HashMismatch { .. }
                | GatewayError::InvalidManifest(_)
                | GatewayError::SliceOutOfRange { .. }
                | GatewayError::SliceSizeMismatch { .. }
                | GatewayError::InvalidUploadSize { .. }
                | GatewayError::SliceZeroPending
                | GatewayError::NoSuchSession(_)
        )
    }

    /// 是否可以稍后重试
    pub fn is_retriable(&self) -> bool {
        match self {
            GatewayError::AuthExpired(_)
            | GatewayError::RateLimited(_)
            | GatewayError::TransientBackend(_)
            | GatewayError::MaxRetriesExceeded { .. } => true,
            GatewayError::Http(e) => e.is_timeout() || e.is_connect(),
            GatewayError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors_are_not_retriable() {
        let err = GatewayError::HashMismatch {
            index: 2,
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(err.is_caller_error());
        assert!(!err.is_retriable());

        assert!(GatewayError::SliceZeroPending.is_caller_error());
    }

    #[test]
    fn test_backend_error_classification() {
        assert!(GatewayError::RateLimited("x".into()).is_retriable());
        assert!(GatewayError::HttpStatus {
            status: 502,
            body: String::new()
        }
        .is_retriable());
        assert!(!GatewayError::HttpStatus {
            status: 403,
            body: String::new()
        }
        .is_retriable());
        assert!(!GatewayError::BackendRejected {
            code: 1,
            message: "no".into()
        }
        .is_retriable());
    }
}
