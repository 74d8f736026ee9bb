// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 请求客户端配置
    #[serde(default)]
    pub client: ClientConfig,
    /// 任务队列配置
    #[serde(default)]
    pub queue: QueueConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
    /// 挂载的存储
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5244
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 本地缓冲临时目录
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// 后端不提供预上传时使用的分片大小（字节，默认 10MB）
    #[serde(default = "default_slice_size")]
    pub default_slice_size: u64,
    /// 单个分片请求体的上限（字节，默认 64MB），后端分片大小超过该值时拒绝预上传
    #[serde(default = "default_max_slice_size")]
    pub max_slice_size: u64,
    /// 数据库文件路径
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("data/temp")
}

fn default_slice_size() -> u64 {
    10 * 1024 * 1024
}

fn default_max_slice_size() -> u64 {
    64 * 1024 * 1024
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/gateway.db")
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            default_slice_size: default_slice_size(),
            max_slice_size: default_max_slice_size(),
            database_path: default_database_path(),
        }
    }
}

/// 请求客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 单次逻辑请求的总尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 限流许可的冷却窗口（毫秒）
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
    /// 被限流后的退避基数（毫秒）
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    /// 后端暂时不可用时的重试间隔（毫秒）
    #[serde(default = "default_transient_retry_ms")]
    pub transient_retry_ms: u64,
    /// HTTP 超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 令牌提前过期量（秒）
    #[serde(default = "default_token_expiry_skew_secs")]
    pub token_expiry_skew_secs: i64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_rate_limit_window_ms() -> u64 {
    1000
}

fn default_rate_limit_backoff_ms() -> u64 {
    1000
}

fn default_transient_retry_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_token_expiry_skew_secs() -> i64 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            transient_retry_ms: default_transient_retry_ms(),
            timeout_secs: default_timeout_secs(),
            token_expiry_skew_secs: default_token_expiry_skew_secs(),
        }
    }
}

impl ClientConfig {
    pub fn rate_limit_window(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.rate_limit_window_ms)
    }
}

/// 任务队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 工作协程数
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,
    /// 单个任务最大尝试次数
    #[serde(default = "default_queue_max_attempts")]
    pub max_attempts: u32,
    /// 失败重试的退避基数（秒）
    #[serde(default = "default_queue_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// 空闲时轮询间隔（毫秒）
    #[serde(default = "default_queue_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_queue_concurrency() -> usize {
    10
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_queue_retry_backoff_secs() -> u64 {
    5
}

fn default_queue_poll_interval_ms() -> u64 {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_queue_concurrency(),
            max_attempts: default_queue_max_attempts(),
            retry_backoff_secs: default_queue_retry_backoff_secs(),
            poll_interval_ms: default_queue_poll_interval_ms(),
        }
    }
}

/// 百度网盘会员类型（决定分片大小）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VipType {
    #[default]
    Normal,
    Vip,
    Svip,
}

/// 存储挂载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum StorageConfig {
    Open123(Open123Config),
    BaiduNetdisk(BaiduNetdiskConfig),
    Local(LocalConfig),
}

impl StorageConfig {
    pub fn id(&self) -> &str {
        match self {
            StorageConfig::Open123(c) => &c.id,
            StorageConfig::BaiduNetdisk(c) => &c.id,
            StorageConfig::Local(c) => &c.id,
        }
    }
}

/// 123 云盘开放平台
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Open123Config {
    pub id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// 第三方授权应用的刷新令牌；为空时使用 client_id/client_secret 直接换取
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_open123_base_url")]
    pub base_url: String,
}

fn default_open123_base_url() -> String {
    "https://open-api.123pan.com".to_string()
}

/// 百度网盘开放平台
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaiduNetdiskConfig {
    pub id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub vip_type: VipType,
    #[serde(default = "default_baidu_api_base")]
    pub api_base: String,
    #[serde(default = "default_baidu_pcs_server")]
    pub pcs_server: String,
    #[serde(default = "default_baidu_oauth_base")]
    pub oauth_base: String,
}

fn default_baidu_api_base() -> String {
    "https://pan.baidu.com".to_string()
}

fn default_baidu_pcs_server() -> String {
    "https://d.pcs.baidu.com".to_string()
}

fn default_baidu_oauth_base() -> String {
    "https://openapi.baidu.com".to_string()
}

/// 本地目录存储
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub id: String,
    pub root: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upload: UploadConfig::default(),
            client: ClientConfig::default(),
            queue: QueueConfig::default(),
            log: LogConfig::default(),
            storages: Vec::new(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate()?;

        Ok(config)
    }

    /// 加载配置，失败时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("创建配置目录失败")?;
        }
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content).await.context("写入配置文件失败")?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.upload.default_slice_size == 0 {
            anyhow::bail!("upload.default_slice_size 必须大于 0");
        }
        if self.upload.max_slice_size < self.upload.default_slice_size {
            anyhow::bail!("upload.max_slice_size 不能小于 upload.default_slice_size");
        }
        if usize::try_from(self.upload.max_slice_size).is_err() {
            anyhow::bail!("upload.max_slice_size 过大: {}", self.upload.max_slice_size);
        }
        if self.queue.concurrency == 0 {
            anyhow::bail!("queue.concurrency 必须大于 0");
        }

        let mut ids = HashSet::new();
        for storage in &self.storages {
            if storage.id().is_empty() {
                anyhow::bail!("存储 id 不能为空");
            }
            if !ids.insert(storage.id()) {
                anyhow::bail!("存储 id 重复: {}", storage.id());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.default_slice_size, 10 * 1024 * 1024);
        assert_eq!(config.client.max_attempts, 3);
        assert_eq!(config.queue.concurrency, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_storages() {
        let content = r#"
            [upload]
            temp_dir = "/tmp/gw"

            [[storages]]
            driver = "open123"
            id = "pan123"
            client_id = "cid"
            client_secret = "secret"

            [[storages]]
            driver = "baidu_netdisk"
            id = "baidu"
            refresh_token = "rt"
            vip_type = "svip"

            [[storages]]
            driver = "local"
            id = "disk"
            root = "/srv/files"
        "#;
        let config: AppConfig = toml::from_str(content).unwrap();
        assert_eq!(config.upload.temp_dir, PathBuf::from("/tmp/gw"));
        assert_eq!(config.upload.default_slice_size, 10 * 1024 * 1024);
        assert_eq!(config.storages.len(), 3);

        match &config.storages[0] {
            StorageConfig::Open123(c) => {
                assert_eq!(c.base_url, "https://open-api.123pan.com");
                assert!(c.refresh_token.is_none());
            }
            other => panic!("unexpected storage: {:?}", other),
        }
        match &config.storages[1] {
            StorageConfig::BaiduNetdisk(c) => assert_eq!(c.vip_type, VipType::Svip),
            other => panic!("unexpected storage: {:?}", other),
        }
        assert_eq!(config.storages[2].id(), "disk");
    }

    #[test]
    fn test_duplicate_storage_id_rejected() {
        let mut config = AppConfig::default();
        for _ in 0..2 {
            config.storages.push(StorageConfig::Local(LocalConfig {
                id: "same".into(),
                root: PathBuf::from("/tmp"),
            }));
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_slice_size_must_cover_default() {
        let mut config = AppConfig::default();
        assert_eq!(config.upload.max_slice_size, 64 * 1024 * 1024);

        config.upload.max_slice_size = config.upload.default_slice_size - 1;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config/app.toml");

        let mut config = AppConfig::default();
        config.server.port = 18080;
        config.storages.push(StorageConfig::Local(LocalConfig {
            id: "disk".into(),
            root: dir.path().join("files"),
        }));
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.server.port, 18080);
        assert_eq!(loaded.storages.len(), 1);
    }

    #[tokio::test]
    async fn test_load_or_default_on_missing_file() {
        let config = AppConfig::load_or_default("/nonexistent/app.toml").await;
        assert_eq!(config.server.port, 5244);
    }
}
