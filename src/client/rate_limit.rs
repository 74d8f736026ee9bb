//! 接口限流器
//!
//! 每个远程接口一个限流器。许可使用结束后不会立即归还，而是进入冷却队列，
//! 冷却窗口结束后才重新可用，因此任意时刻
//! `持有中的许可 + 窗口内刚释放的许可 <= qps`，形成滚动窗口的 QPS 上限。
//!
//! 冷却队列由限流器自身持有，不依赖后台任务；[`RateLimiter::close`]
//! 会清空所有待归还的许可并唤醒等待者。

use crate::common::Clock;
use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// 默认冷却窗口: 1 秒
pub const DEFAULT_RELEASE_WINDOW: Duration = Duration::from_secs(1);

struct LimiterState {
    /// 正在使用的许可数
    in_flight: usize,
    /// 冷却中的许可到期时间（单调递增）
    cooling: VecDeque<Duration>,
    closed: bool,
}

impl LimiterState {
    /// 回收已到期的冷却许可
    fn reclaim(&mut self, now: Duration) {
        while matches!(self.cooling.front(), Some(at) if *at <= now) {
            self.cooling.pop_front();
        }
    }

    fn occupied(&self) -> usize {
        self.in_flight + self.cooling.len()
    }
}

/// 滚动窗口限流器
pub struct RateLimiter {
    /// 0 表示不限流
    qps: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
    released: Notify,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("qps", &self.qps)
            .field("window", &self.window)
            .field("occupied", &self.occupied())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(qps: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            qps,
            window,
            clock,
            state: Mutex::new(LimiterState {
                in_flight: 0,
                cooling: VecDeque::new(),
                closed: false,
            }),
            released: Notify::new(),
        }
    }

    pub fn qps(&self) -> usize {
        self.qps
    }

    pub fn is_unlimited(&self) -> bool {
        self.qps == 0
    }

    /// 当前被占用的许可数（持有中 + 冷却中）
    pub fn occupied(&self) -> usize {
        let mut state = self.state.lock();
        state.reclaim(self.clock.now());
        state.occupied()
    }

    /// 获取一个许可，许可不足时等待
    pub async fn acquire(self: &Arc<Self>) -> Result<RatePermit> {
        if self.is_unlimited() {
            return Ok(RatePermit { limiter: None });
        }

        loop {
            // 先注册唤醒，避免检查与等待之间丢失释放通知
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(GatewayError::LimiterClosed);
                }
                let now = self.clock.now();
                state.reclaim(now);
                if state.occupied() < self.qps {
                    state.in_flight += 1;
                    return Ok(RatePermit {
                        limiter: Some(Arc::clone(self)),
                    });
                }
                state.cooling.front().map(|at| at.saturating_sub(now))
            };

            match wait {
                // 最早的冷却许可到期后重试
                Some(delay) => {
                    debug!("限流等待: qps={}, delay={:?}", self.qps, delay);
                    self.clock.sleep(delay).await;
                }
                // 全部许可都在使用中，等待释放
                None => notified.await,
            }
        }
    }

    /// 关闭限流器，丢弃所有冷却中的许可
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.cooling.clear();
        }
        self.released.notify_waiters();
    }

    fn release(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if !state.closed {
                let at = self.clock.now() + self.window;
                state.cooling.push_back(at);
            }
        }
        self.released.notify_waiters();
    }
}

/// 限流许可（RAII）
///
/// drop 时许可进入冷却队列，窗口结束后才能被再次获取
#[must_use]
pub struct RatePermit {
    limiter: Option<Arc<RateLimiter>>,
}

impl Drop for RatePermit {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.release();
        }
    }
}
