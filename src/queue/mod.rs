//! 持久任务队列
//!
//! 本地缓冲上传在完成后不会同步上传到后端，而是序列化会话写入队列，
//! 由有界并发的工作协程异步完成最终的一次性上传。

mod types;
mod worker;

pub use types::{QueueItem, TaskStatus};
pub use worker::{TaskHandler, TaskQueue};
