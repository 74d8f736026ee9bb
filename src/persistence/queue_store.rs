//! 持久任务队列存储

use super::Database;
use crate::error::{GatewayError, Result};
use crate::queue::{QueueItem, TaskStatus};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

const SELECT_COLUMNS: &str = "task_id, task_type, payload, status, message, attempts, max_attempts, \
     created_at, run_after, started_at, finished_at";

/// 任务队列表的读写
#[derive(Clone)]
pub struct QueueStore {
    db: Database,
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn read_item(row: &Row<'_>) -> rusqlite::Result<(QueueItem, String)> {
    let status: String = row.get(3)?;
    let started_at: Option<i64> = row.get(9)?;
    let finished_at: Option<i64> = row.get(10)?;
    let item = QueueItem {
        task_id: row.get(0)?,
        task_type: row.get(1)?,
        payload: row.get(2)?,
        status: TaskStatus::Waiting,
        message: row.get(4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        run_after: from_millis(row.get(8)?),
        started_at: started_at.map(from_millis),
        finished_at: finished_at.map(from_millis),
    };
    Ok((item, status))
}

fn with_status((mut item, status): (QueueItem, String)) -> Result<QueueItem> {
    item.status = TaskStatus::parse(&status).ok_or_else(|| {
        GatewayError::Other(anyhow::anyhow!("任务 {} 状态未知: {}", item.task_id, status))
    })?;
    Ok(item)
}

impl QueueStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, item: &QueueItem) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            r#"
            INSERT INTO queue_items (
                task_id, task_type, payload, status, message, attempts, max_attempts,
                created_at, run_after, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                item.task_id,
                item.task_type,
                item.payload,
                item.status.as_str(),
                item.message,
                item.attempts,
                item.max_attempts,
                millis(item.created_at),
                millis(item.run_after),
                item.started_at.map(millis),
                item.finished_at.map(millis),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Result<Option<QueueItem>> {
        let conn = self.db.conn()?;
        let sql = format!("SELECT {} FROM queue_items WHERE task_id = ?1", SELECT_COLUMNS);
        conn.query_row(&sql, params![task_id], read_item)
            .optional()?
            .map(with_status)
            .transpose()
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<QueueItem>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM queue_items WHERE status = ?1 ORDER BY created_at ASC",
            SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], read_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(with_status(row?)?);
        }
        Ok(items)
    }

    /// 领取一个到期的等待任务并标记为运行中
    ///
    /// 只领取已注册处理器的任务类型；尝试次数在领取时加一
    pub fn claim_next(&self, task_types: &[String], now: DateTime<Utc>) -> Result<Option<QueueItem>> {
        if task_types.is_empty() {
            return Ok(None);
        }

        let mut conn = self.db.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let placeholders = (0..task_types.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM queue_items WHERE status = ?1 AND run_after <= ?2 AND task_type IN ({}) \
             ORDER BY run_after ASC, created_at ASC LIMIT 1",
            SELECT_COLUMNS, placeholders
        );

        let waiting = TaskStatus::Waiting.as_str().to_string();
        let now_ms = millis(now);
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&waiting, &now_ms];
        for task_type in task_types {
            values.push(task_type);
        }

        let found = tx
            .query_row(&sql, values.as_slice(), read_item)
            .optional()?
            .map(with_status)
            .transpose()?;

        let Some(mut item) = found else {
            return Ok(None);
        };

        item.status = TaskStatus::Running;
        item.attempts += 1;
        item.started_at = Some(now);
        tx.execute(
            "UPDATE queue_items SET status = ?2, attempts = ?3, started_at = ?4 WHERE task_id = ?1",
            params![item.task_id, item.status.as_str(), item.attempts, millis(now)],
        )?;
        tx.commit()?;

        Ok(Some(item))
    }

    /// 写入终态
    pub fn finish(&self, task_id: &str, status: TaskStatus, message: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE queue_items SET status = ?2, message = ?3, finished_at = ?4 WHERE task_id = ?1",
            params![task_id, status.as_str(), message, millis(Utc::now())],
        )?;
        Ok(())
    }

    /// 放回等待队列，在 `run_after` 之后重试
    pub fn reschedule(&self, task_id: &str, message: &str, run_after: DateTime<Utc>) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE queue_items SET status = ?2, message = ?3, run_after = ?4 WHERE task_id = ?1",
            params![task_id, TaskStatus::Waiting.as_str(), message, millis(run_after)],
        )?;
        Ok(())
    }

    /// 取消等待中的任务，返回是否取消成功
    pub fn cancel(&self, task_id: &str) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE queue_items SET status = ?2, message = ?3, finished_at = ?4 WHERE task_id = ?1 AND status = ?5",
            params![
                task_id,
                TaskStatus::Cancelled.as_str(),
                "已取消",
                millis(Utc::now()),
                TaskStatus::Waiting.as_str()
            ],
        )?;
        Ok(changed > 0)
    }

    /// 进程重启后把运行中的任务放回等待队列
    pub fn recover_running(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let changed = conn.execute(
            "UPDATE queue_items SET status = ?1 WHERE status = ?2",
            params![TaskStatus::Waiting.as_str(), TaskStatus::Running.as_str()],
        )?;
        Ok(changed)
    }
}
