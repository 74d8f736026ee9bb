//! 访问令牌管理
//!
//! 保存后端驱动的访问令牌和过期时间，刷新时只允许一个刷新请求在途，
//! 其他调用方等待后直接复用新令牌。

use super::ApiDialect;
use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// 访问令牌
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccessToken {
    pub access_token: String,
    /// 第三方授权应用的刷新令牌
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 过期时间，None 表示未知（按未过期处理）
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    pub fn new(access_token: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at,
        }
    }

    /// 是否已过期（提前 `skew` 视为过期）
    pub fn is_expired(&self, skew: chrono::Duration) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(expires_at) => Utc::now() + skew >= expires_at,
            None => false,
        }
    }
}

/// 令牌管理器
pub struct TokenManager {
    current: RwLock<AccessToken>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(initial: AccessToken) -> Self {
        Self {
            current: RwLock::new(initial),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 当前令牌快照
    pub fn snapshot(&self) -> AccessToken {
        self.current.read().clone()
    }

    /// 当前访问令牌字符串
    pub fn access_token(&self) -> String {
        self.current.read().access_token.clone()
    }

    /// 令牌过期时先刷新
    pub async fn ensure_fresh(
        &self,
        http: &reqwest::Client,
        dialect: &dyn ApiDialect,
        skew: chrono::Duration,
    ) -> Result<()> {
        if !self.current.read().is_expired(skew) {
            return Ok(());
        }

        let _guard = self.refresh_lock.lock().await;
        // 等锁期间可能已被其他调用方刷新
        if !self.current.read().is_expired(skew) {
            return Ok(());
        }
        self.do_refresh(http, dialect).await
    }

    /// 后端报告令牌失效后强制刷新
    ///
    /// `stale` 为失败请求所携带的令牌；若令牌已被其他调用方换新则不再重复刷新
    pub async fn refresh_after_rejection(
        &self,
        http: &reqwest::Client,
        dialect: &dyn ApiDialect,
        stale: &str,
    ) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        if self.current.read().access_token != stale {
            return Ok(());
        }
        self.do_refresh(http, dialect).await
    }

    async fn do_refresh(&self, http: &reqwest::Client, dialect: &dyn ApiDialect) -> Result<()> {
        let current = self.snapshot();
        match dialect.refresh_token(http, &current).await {
            Ok(mut fresh) => {
                // 后端未轮换刷新令牌时沿用旧值
                if fresh.refresh_token.is_none() {
                    fresh.refresh_token = current.refresh_token;
                }
                info!(
                    "访问令牌已刷新: backend={}, expires_at={:?}",
                    dialect.name(),
                    fresh.expires_at
                );
                *self.current.write() = fresh;
                Ok(())
            }
            Err(e) => {
                warn!("刷新访问令牌失败: backend={}, 错误: {}", dialect.name(), e);
                Err(e)
            }
        }
    }
}
