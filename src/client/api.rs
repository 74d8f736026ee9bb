// 请求执行：限流 + 令牌刷新 + 有界重试

use super::{AccessToken, ApiDialect, ApiOutcome, RateLimiter, TokenManager};
use crate::common::Clock;
use crate::config::ClientConfig;
use crate::error::{GatewayError, Result};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 限流退避的上限
const MAX_RATE_LIMIT_DELAY: Duration = Duration::from_secs(30);

/// 远程接口描述：地址 + 该接口的限流器
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: String,
    limiter: Arc<RateLimiter>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, qps: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            url: url.into(),
            limiter: Arc::new(RateLimiter::new(qps, window, clock)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// 替换地址但共享限流器（上传域名由后端动态分配时使用）
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

/// 一个后端驱动的接口表（QPS 限制与账号绑定，每个驱动实例各持一份）
#[derive(Debug, Default)]
pub struct EndpointSet {
    endpoints: HashMap<&'static str, Endpoint>,
}

impl EndpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &'static str, endpoint: Endpoint) {
        self.endpoints.insert(name, endpoint);
    }

    pub fn get(&self, name: &str) -> Result<&Endpoint> {
        self.endpoints
            .get(name)
            .ok_or_else(|| GatewayError::Other(anyhow::anyhow!("未注册的接口: {}", name)))
    }

    /// 关闭全部限流器
    pub fn close_all(&self) {
        for endpoint in self.endpoints.values() {
            endpoint.limiter().close();
        }
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub max_attempts: u32,
    /// 限流退避基数，第 n 次退避为 base * 2^(n-1)
    pub rate_limit_backoff: Duration,
    /// 后端暂时不可用时的固定等待
    pub transient_delay: Duration,
    /// 令牌提前过期量
    pub token_skew: chrono::Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            rate_limit_backoff: Duration::from_millis(config.rate_limit_backoff_ms),
            transient_delay: Duration::from_millis(config.transient_retry_ms),
            token_skew: chrono::Duration::seconds(config.token_expiry_skew_secs),
        }
    }

    /// 第 `attempt` 次（从 1 开始）被限流后的等待时长
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.rate_limit_backoff
            .saturating_mul(factor)
            .min(MAX_RATE_LIMIT_DELAY)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

/// 后端 API 客户端
pub struct ApiClient {
    http: reqwest::Client,
    dialect: Arc<dyn ApiDialect>,
    tokens: TokenManager,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ApiClient {
    pub fn new(
        dialect: Arc<dyn ApiDialect>,
        token: AccessToken,
        config: &ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            dialect,
            tokens: TokenManager::new(token),
            policy: RetryPolicy::from_config(config),
            clock,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 发送一次逻辑请求，返回成功响应的原始内容
    ///
    /// # 参数
    /// * `endpoint` - 目标接口（地址 + 限流器）
    /// * `method` - HTTP 方法
    /// * `build` - 构建请求参数的回调，每次尝试都会重新调用
    /// * `cancel` - 取消令牌
    pub async fn request<F>(
        &self,
        endpoint: &Endpoint,
        method: Method,
        build: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        self.tokens
            .ensure_fresh(&self.http, self.dialect.as_ref(), self.policy.token_skew)
            .await?;

        let limiter = endpoint.limiter();
        debug!(
            "API: {}, QPS: {}, 占用: {}",
            endpoint.url(),
            limiter.qps(),
            limiter.occupied()
        );
        let _permit = tokio::select! {
            permit = limiter.acquire() => permit?,
            _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let mut rate_limited = 0u32;
        for attempt in 1..=self.policy.max_attempts {
            // 每次尝试都使用最新令牌，刷新后的令牌在下一次尝试生效
            let token = self.tokens.access_token();
            let request = self.dialect.authorize(
                build(self.http.request(method.clone(), endpoint.url())),
                &token,
            );

            let response = tokio::select! {
                response = request.send() => response?,
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            };
            let status = response.status();
            let body = response.bytes().await?.to_vec();

            if !status.is_success() {
                return Err(GatewayError::HttpStatus {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }

            match self.dialect.classify(&body)? {
                ApiOutcome::Success => return Ok(body),
                ApiOutcome::AuthExpired(message) => {
                    warn!(
                        "API: {}, 令牌失效，刷新后重试 ({}/{}): {}",
                        endpoint.url(),
                        attempt,
                        self.policy.max_attempts,
                        message
                    );
                    self.tokens
                        .refresh_after_rejection(&self.http, self.dialect.as_ref(), &token)
                        .await?;
                }
                ApiOutcome::RateLimited(message) => {
                    rate_limited += 1;
                    let delay = self.policy.rate_limit_delay(rate_limited);
                    warn!(
                        "API: {}, QPS: {}, 请求太频繁，{:?} 后重试: {}",
                        endpoint.url(),
                        limiter.qps(),
                        delay,
                        message
                    );
                    self.pause(delay, cancel).await?;
                }
                ApiOutcome::Transient(message) => {
                    debug!(
                        "API: {}, 后端暂时不可用，{:?} 后重试: {}",
                        endpoint.url(),
                        self.policy.transient_delay,
                        message
                    );
                    self.pause(self.policy.transient_delay, cancel).await?;
                }
                ApiOutcome::Rejected { code, message } => {
                    return Err(GatewayError::BackendRejected { code, message });
                }
            }
        }

        Err(GatewayError::MaxRetriesExceeded {
            api: endpoint.url().to_string(),
            attempts: self.policy.max_attempts,
        })
    }

    /// 发送请求并把响应解析为 `T`
    pub async fn request_json<T, F>(
        &self,
        endpoint: &Endpoint,
        method: Method,
        build: F,
        cancel: &CancellationToken,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync,
    {
        let body = self.request(endpoint, method, build, cancel).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = self.clock.sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }
}
