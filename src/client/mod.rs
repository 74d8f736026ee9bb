//! 限流、自动刷新令牌的请求客户端
//!
//! 所有后端驱动的远程调用都经过 [`ApiClient::request`]：
//! 令牌过期先刷新 → 获取接口限流许可 → 最多 N 次尝试，按响应码分支处理。
//! 不同后端的鉴权方式与业务码含义由 [`ApiDialect`] 描述。

mod api;
mod rate_limit;
mod token;

pub use api::{ApiClient, Endpoint, EndpointSet, RetryPolicy};
pub use rate_limit::{RateLimiter, RatePermit, DEFAULT_RELEASE_WINDOW};
pub use token::{AccessToken, TokenManager};

use crate::error::Result;
use async_trait::async_trait;
use reqwest::RequestBuilder;

/// 单次响应的业务结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOutcome {
    Success,
    /// 令牌失效，刷新后重试
    AuthExpired(String),
    /// 请求过快，退避后重试
    RateLimited(String),
    /// 后端暂时不可用，固定间隔后重试
    Transient(String),
    /// 其他业务错误，不重试
    Rejected { code: i64, message: String },
}

/// 后端接口方言
#[async_trait]
pub trait ApiDialect: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &str;

    /// 在请求上附加访问令牌
    fn authorize(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder;

    /// 解析响应体的业务码
    fn classify(&self, body: &[u8]) -> Result<ApiOutcome>;

    /// 获取新的访问令牌
    async fn refresh_token(
        &self,
        http: &reqwest::Client,
        current: &AccessToken,
    ) -> Result<AccessToken>;
}
