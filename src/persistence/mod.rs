//! 持久化模块
//!
//! 单个 SQLite 文件保存两类状态：
//! - slice_uploads: 分片上传会话（位图、哈希清单、后端句柄）
//! - queue_items: 持久任务队列
//!
//! 连接由 r2d2 连接池管理，会话存储与任务队列共享同一个池。

mod queue_store;
mod session_store;

pub use queue_store::QueueStore;
pub use session_store::{SessionStore, SqliteSessionStore};

use crate::error::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use tracing::info;

/// 连接池大小
const POOL_SIZE: u32 = 8;

/// SQLite 数据库
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// 打开（或创建）数据库文件并执行迁移
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder().max_size(POOL_SIZE).build(manager)?;

        let db = Self { pool };
        db.migrate()?;
        info!("数据库已打开: {:?}", path);
        Ok(db)
    }

    /// 内存数据库（单连接，仅用于测试）
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool };
        db.migrate()?;
        Ok(db)
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS slice_uploads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_id TEXT NOT NULL,
                dst_path TEXT NOT NULL,
                dst_id TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL,
                size INTEGER NOT NULL,
                hash_md5 TEXT NOT NULL DEFAULT '',
                hash_md5_256kb TEXT NOT NULL DEFAULT '',
                hash_sha1 TEXT NOT NULL DEFAULT '',
                overwrite INTEGER NOT NULL DEFAULT 0,
                preup_id TEXT NOT NULL DEFAULT '',
                server TEXT,
                slice_size INTEGER NOT NULL,
                slice_count INTEGER NOT NULL,
                slice_bitmap BLOB NOT NULL,
                slice_hash TEXT NOT NULL DEFAULT '',
                temp_file TEXT,
                task_id TEXT,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        // Preup 幂等重入依赖该唯一约束
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_slice_uploads_key ON slice_uploads(storage_id, dst_path, name, size, hash_md5, hash_md5_256kb)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS queue_items (
                task_id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                run_after INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status, run_after)",
            [],
        )?;

        Ok(())
    }
}
