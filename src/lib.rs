// Netdisk Gateway Library
// 网盘上传网关核心库

// 请求客户端（限流、令牌刷新、重试）
pub mod client;

// 公共模块（时钟）
pub mod common;

// 配置管理模块
pub mod config;

// 存储驱动与能力分发
pub mod driver;

// 错误类型
pub mod error;

// 日志系统
pub mod logging;

// 持久化模块
pub mod persistence;

// 持久任务队列
pub mod queue;

// Web服务器模块
pub mod server;

// 上传编排模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use driver::{StorageDriver, StorageRegistry};
pub use error::{GatewayError, Result};
pub use queue::{TaskQueue, TaskStatus};
pub use server::AppState;
pub use uploader::{UploadOrchestrator, UploadSession};
