// API处理器模块

pub mod queue;
pub mod upload;

pub use queue::*;
pub use upload::*;

use crate::error::GatewayError;
use axum::Json;
use serde::Serialize;

/// 统一响应结构
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    /// 状态码 (0: 成功, 其他: 错误码)
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "Success".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, message: String) -> Self {
        Self {
            code,
            message,
            data: None,
        }
    }
}

impl<T> From<GatewayError> for ApiResponse<T> {
    fn from(e: GatewayError) -> Self {
        Self::error(error_code(&e), e.to_string())
    }
}

/// 错误对应的响应码（沿用 HTTP 状态码的含义）
pub fn error_code(e: &GatewayError) -> i32 {
    match e {
        GatewayError::NoSuchSession(_) | GatewayError::StorageNotFound(_) => 404,
        GatewayError::Unsupported(_) => 501,
        GatewayError::AuthExpired(_) => 401,
        GatewayError::RateLimited(_) => 429,
        GatewayError::Cancelled => 499,
        e if e.is_caller_error() => 400,
        e if e.is_retriable() => 503,
        _ => 500,
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "netdisk-gateway".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(error_code(&GatewayError::NoSuchSession(1)), 404);
        assert_eq!(error_code(&GatewayError::SliceZeroPending), 400);
        assert_eq!(error_code(&GatewayError::Unsupported("PutURL")), 501);
        assert_eq!(error_code(&GatewayError::TransientBackend("x".into())), 503);
        assert_eq!(
            error_code(&GatewayError::BackendRejected {
                code: 1,
                message: "no".into()
            }),
            500
        );

        let resp: ApiResponse<()> = GatewayError::SliceZeroPending.into();
        assert_eq!(resp.code, 400);
        assert!(resp.data.is_none());
    }
}
