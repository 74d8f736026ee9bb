// 持久任务队列类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待执行（含等待重试）
    Waiting,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(TaskStatus::Waiting),
            "running" => Some(TaskStatus::Running),
            "success" => Some(TaskStatus::Success),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// 是否为终态
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 队列中的一个任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub task_id: String,
    pub task_type: String,
    /// 序列化后的任务内容（JSON）
    pub payload: String,
    pub status: TaskStatus,
    /// 最近一次失败原因
    pub message: String,
    /// 已尝试次数
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// 最早可执行时间（重试退避）
    pub run_after: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(task_type: impl Into<String>, payload: String, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            task_type: task_type.into(),
            payload,
            status: TaskStatus::Waiting,
            message: String::new(),
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            run_after: now,
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_str_roundtrip() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("paused"), None);
        assert!(!TaskStatus::Running.is_finished());
        assert!(TaskStatus::Cancelled.is_finished());
    }

    #[test]
    fn test_new_item_defaults() {
        let item = QueueItem::new("proxy_upload", "{}".into(), 0);
        assert_eq!(item.status, TaskStatus::Waiting);
        assert_eq!(item.max_attempts, 1);
        assert_eq!(item.task_id.len(), 36);
    }
}
