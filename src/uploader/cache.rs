// 进行中会话的内存缓存
//
// 生命周期：首次访问时从持久化存储加载（populate-on-miss），
// 会话完成或移交任务队列后移除（evict-on-complete）。进程重启后缓存为空，
// 以数据库为准按需重新加载。

use super::session::UploadSession;
use crate::error::{GatewayError, Result};
use crate::persistence::SessionStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// 会话句柄：每个会话一把锁，串行化位图更新与持久化
pub type SessionHandle = Arc<Mutex<UploadSession>>;

pub struct SessionCache {
    store: Arc<dyn SessionStore>,
    sessions: DashMap<i64, SessionHandle>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// 获取会话，缓存未命中时从存储加载
    pub fn get(&self, id: i64) -> Result<SessionHandle> {
        if let Some(handle) = self.sessions.get(&id) {
            return Ok(Arc::clone(handle.value()));
        }

        let session = self.store.get(id)?.ok_or(GatewayError::NoSuchSession(id))?;
        debug!("从存储加载会话: id={}", id);
        // 并发加载时以先插入者为准
        let handle = self
            .sessions
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(session)));
        Ok(Arc::clone(handle.value()))
    }

    pub fn evict(&self, id: i64) {
        if self.sessions.remove(&id).is_some() {
            debug!("会话移出缓存: id={}", id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
