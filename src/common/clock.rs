//! 可注入时钟
//!
//! 限流器和请求重试的等待都经过 [`Clock`]，测试中使用 [`ManualClock`]
//! 直接推进时间，不产生真实的 sleep。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::time::Duration;
use tokio::time::Instant;

/// 单调时钟
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// 自时钟创建以来经过的时间
    fn now(&self) -> Duration;

    /// 等待指定时长
    async fn sleep(&self, duration: Duration);
}

/// 基于 tokio 计时器的系统时钟
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 手动推进的时钟
///
/// `sleep` 不会真正等待，而是把时间推进到唤醒点并记录等待时长。
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// 推进时间
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }

    /// 所有 sleep 调用的时长（按调用顺序）
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        // 让出执行权，模拟真实等待期间其他任务可以运行
        tokio::task::yield_now().await;
    }
}
