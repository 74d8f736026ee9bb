// 持久任务队列
//
// 功能：
// - 任务先写入数据库再唤醒工作协程，进程重启后不丢失
// - 固定数量的工作协程按类型分发给已注册的处理器
// - 失败按指数退避重试，超过最大尝试次数后记录失败原因
// - 重启时把运行中的任务放回等待队列（至少执行一次）

use super::types::{QueueItem, TaskStatus};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::persistence::QueueStore;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 退避上限（秒）
const MAX_RETRY_BACKOFF_SECS: u64 = 600;

/// 任务处理器
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// 执行任务；返回错误时按队列的重试策略处理
    async fn handle(&self, item: &QueueItem, cancel: &CancellationToken) -> anyhow::Result<()>;
}

/// 持久任务队列
pub struct TaskQueue {
    store: QueueStore,
    config: QueueConfig,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    /// 运行中任务的取消令牌
    running: DashMap<String, CancellationToken>,
    notify: Notify,
    cancel: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(store: QueueStore, config: QueueConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            handlers: DashMap::new(),
            running: DashMap::new(),
            notify: Notify::new(),
            cancel,
            workers: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// 注册任务类型的处理器（重复注册会覆盖）
    pub fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        info!("注册任务处理器: {}", task_type);
        self.handlers.insert(task_type, handler);
        self.notify.notify_waiters();
    }

    /// 写入任务并唤醒工作协程
    ///
    /// # 返回
    /// 任务 ID
    pub fn enqueue<T: Serialize>(&self, task_type: &str, payload: &T) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.enqueue_with_id(&task_id, task_type, payload)?;
        Ok(task_id)
    }

    /// 使用调用方预先分配的任务 ID 入队（调用方需要在入队前记录 ID 时使用）
    pub fn enqueue_with_id<T: Serialize>(&self, task_id: &str, task_type: &str, payload: &T) -> Result<()> {
        let payload = serde_json::to_string(payload)?;
        let mut item = QueueItem::new(task_type, payload, self.config.max_attempts);
        item.task_id = task_id.to_string();
        self.store.insert(&item)?;
        info!("任务已入队: task_id={}, type={}", item.task_id, task_type);
        self.notify.notify_one();
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<QueueItem>> {
        self.store.get(task_id)
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<QueueItem>> {
        self.store.list_by_status(status)
    }

    /// 取消任务：等待中的直接标记取消，运行中的通知处理器停止
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        if self.store.cancel(task_id)? {
            info!("任务已取消: {}", task_id);
            return Ok(true);
        }
        match self.running.get(task_id) {
            Some(token) => {
                info!("通知运行中的任务停止: {}", task_id);
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// 恢复上次进程退出时未完成的任务
    pub fn recover(&self) -> Result<usize> {
        let count = self.store.recover_running()?;
        if count > 0 {
            info!("恢复了 {} 个中断的任务", count);
            self.notify.notify_waiters();
        }
        Ok(count)
    }

    /// 启动工作协程
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            warn!("任务队列已启动，忽略重复启动");
            return;
        }
        for worker_id in 0..self.config.concurrency.max(1) {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
        info!("任务队列已启动: {} 个工作协程", workers.len());
    }

    /// 停止全部工作协程并等待退出
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("工作协程退出异常: {}", e);
            }
        }
        info!("任务队列已停止");
    }

    // =====================================================
    // 工作协程
    // =====================================================

    async fn worker_loop(&self, worker_id: usize) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        debug!("工作协程 #{} 启动", worker_id);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            // 先登记唤醒，避免入队通知在领取与等待之间丢失
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task_types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
            match self.store.claim_next(&task_types, Utc::now()) {
                Ok(Some(item)) => {
                    self.run_item(worker_id, item).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => error!("领取任务失败: {}", e),
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(poll_interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        debug!("工作协程 #{} 退出", worker_id);
    }

    async fn run_item(&self, worker_id: usize, item: QueueItem) {
        let Some(handler) = self.handlers.get(&item.task_type).map(|h| Arc::clone(h.value())) else {
            // 领取后处理器被移除的情况不会出现，仍按失败记录
            self.record(&item.task_id, TaskStatus::Failed, "未注册的任务类型");
            return;
        };

        info!(
            "工作协程 #{} 开始执行任务: task_id={}, type={}, 第 {}/{} 次",
            worker_id, item.task_id, item.task_type, item.attempts, item.max_attempts
        );

        let token = self.cancel.child_token();
        self.running.insert(item.task_id.clone(), token.clone());
        let result = handler.handle(&item, &token).await;
        self.running.remove(&item.task_id);

        match result {
            Ok(()) => {
                info!("任务执行成功: {}", item.task_id);
                self.record(&item.task_id, TaskStatus::Success, "");
            }
            Err(e) if self.cancel.is_cancelled() => {
                // 进程退出，任务留给下次启动恢复
                warn!("任务被中断，等待下次启动恢复: {}, 原因: {:#}", item.task_id, e);
                if let Err(e) = self.store.reschedule(&item.task_id, &format!("{:#}", e), Utc::now()) {
                    error!("写回任务状态失败: {}, 错误: {}", item.task_id, e);
                }
            }
            Err(_) if token.is_cancelled() => {
                info!("任务已取消: {}", item.task_id);
                self.record(&item.task_id, TaskStatus::Cancelled, "已取消");
            }
            Err(e) => {
                let message = format!("{:#}", e);
                if item.attempts >= item.max_attempts {
                    error!(
                        "任务失败且不再重试: task_id={}, 尝试 {} 次, 错误: {}",
                        item.task_id, item.attempts, message
                    );
                    self.record(&item.task_id, TaskStatus::Failed, &message);
                } else {
                    let delay = self.retry_delay(item.attempts);
                    warn!(
                        "任务失败，{:?} 后重试: task_id={}, 错误: {}",
                        delay, item.task_id, message
                    );
                    let run_after = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    if let Err(e) = self.store.reschedule(&item.task_id, &message, run_after) {
                        error!("写回任务状态失败: {}, 错误: {}", item.task_id, e);
                    }
                }
            }
        }
    }

    fn record(&self, task_id: &str, status: TaskStatus, message: &str) {
        if let Err(e) = self.store.finish(task_id, status, message) {
            error!("写回任务状态失败: {}, 错误: {}", task_id, e);
        }
    }

    /// 第 `attempts` 次失败后的等待时长
    fn retry_delay(&self, attempts: u32) -> Duration {
        let factor = 1u64 << attempts.saturating_sub(1).min(16);
        let secs = self
            .config
            .retry_backoff_secs
            .saturating_mul(factor)
            .min(MAX_RETRY_BACKOFF_SECS);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// 前 `fail_times` 次返回错误
    struct Flaky {
        fail_times: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, _item: &QueueItem, _cancel: &CancellationToken) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                anyhow::bail!("第 {} 次失败", n + 1);
            }
            Ok(())
        }
    }

    /// 一直等到被取消
    struct Blocking;

    #[async_trait]
    impl TaskHandler for Blocking {
        async fn handle(&self, _item: &QueueItem, cancel: &CancellationToken) -> anyhow::Result<()> {
            cancel.cancelled().await;
            anyhow::bail!("cancelled")
        }
    }

    fn queue(dir: &TempDir, max_attempts: u32) -> Arc<TaskQueue> {
        let db = Database::open(&dir.path().join("queue.db")).unwrap();
        let config = QueueConfig {
            concurrency: 2,
            max_attempts,
            retry_backoff_secs: 0,
            poll_interval_ms: 20,
        };
        TaskQueue::new(QueueStore::new(db), config, CancellationToken::new())
    }

    async fn wait_status(queue: &TaskQueue, task_id: &str, status: TaskStatus) -> QueueItem {
        for _ in 0..200 {
            let item = queue.get(task_id).unwrap().unwrap();
            if item.status == status {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never reached {:?}", task_id, status);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir, 3);
        let handler = Arc::new(Flaky {
            fail_times: 2,
            calls: AtomicUsize::new(0),
        });
        queue.register_handler("proxy_upload", handler.clone());
        queue.start();

        let task_id = queue.enqueue("proxy_upload", &serde_json::json!({"id": 1})).unwrap();
        let item = wait_status(&queue, &task_id, TaskStatus::Success).await;
        assert_eq!(item.attempts, 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failure_recorded_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir, 2);
        queue.register_handler(
            "proxy_upload",
            Arc::new(Flaky {
                fail_times: usize::MAX,
                calls: AtomicUsize::new(0),
            }),
        );
        queue.start();

        let task_id = queue.enqueue("proxy_upload", &1).unwrap();
        let item = wait_status(&queue, &task_id, TaskStatus::Failed).await;
        assert_eq!(item.attempts, 2);
        assert_eq!(item.message, "第 2 次失败");

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir, 3);
        queue.register_handler("block", Arc::new(Blocking));
        queue.start();

        let task_id = queue.enqueue("block", &()).unwrap();
        wait_status(&queue, &task_id, TaskStatus::Running).await;
        // 等待处理器登记运行令牌
        for _ in 0..100 {
            if queue.running.contains_key(&task_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.cancel(&task_id).unwrap());
        wait_status(&queue, &task_id, TaskStatus::Cancelled).await;

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_recover_requeues_interrupted_tasks() {
        let dir = TempDir::new().unwrap();
        let queue = queue(&dir, 3);
        let task_id = queue.enqueue("proxy_upload", &()).unwrap();

        // 模拟上次进程领取后崩溃
        queue
            .store
            .claim_next(&["proxy_upload".to_string()], Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(queue.recover().unwrap(), 1);

        queue.register_handler(
            "proxy_upload",
            Arc::new(Flaky {
                fail_times: 0,
                calls: AtomicUsize::new(0),
            }),
        );
        queue.start();
        let item = wait_status(&queue, &task_id, TaskStatus::Success).await;
        assert_eq!(item.attempts, 2);

        queue.shutdown().await;
    }

    #[test]
    fn test_retry_delay_grows() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("q.db")).unwrap();
        let queue = TaskQueue::new(QueueStore::new(db), QueueConfig::default(), CancellationToken::new());
        assert_eq!(queue.retry_delay(1), Duration::from_secs(5));
        assert_eq!(queue.retry_delay(2), Duration::from_secs(10));
        assert_eq!(queue.retry_delay(30), Duration::from_secs(MAX_RETRY_BACKOFF_SECS));
    }
}
