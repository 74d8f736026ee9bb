use anyhow::Context;
use netdisk_gateway::{
    common::SystemClock,
    config::{AppConfig, DEFAULT_CONFIG_PATH},
    logging,
    persistence::{Database, QueueStore, SessionStore, SqliteSessionStore},
    server,
    uploader::{ProxyUploadHandler, TempBuffer, PROXY_UPLOAD_TASK},
    AppState, StorageRegistry, TaskQueue, UploadOrchestrator,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;

    // 必须保持 _log_guard 存活
    let _log_guard = logging::init_logging(&config.log);

    info!("Netdisk Gateway v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();

    let db = Database::open(&config.upload.database_path).context("打开数据库失败")?;
    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(db.clone()));

    let registry = Arc::new(
        StorageRegistry::from_config(&config.storages, &config.client, Arc::new(SystemClock::new()))
            .context("初始化存储失败")?,
    );
    info!("已挂载 {} 个存储", registry.ids().len());

    let queue = TaskQueue::new(QueueStore::new(db), config.queue.clone(), cancel.child_token());
    queue.register_handler(
        PROXY_UPLOAD_TASK,
        Arc::new(ProxyUploadHandler::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            TempBuffer::new(&config.upload.temp_dir),
        )),
    );
    queue.recover()?;
    queue.start();

    let orchestrator = Arc::new(UploadOrchestrator::new(
        Arc::clone(&registry),
        store,
        Arc::clone(&queue),
        &config.upload,
    ));
    let app = server::build_router(AppState::new(orchestrator, cancel.clone()));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听地址失败: {}", addr))?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
        shutdown.cancel();
    });

    let server_cancel = cancel.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
    {
        tracing::error!("服务器错误: {}", e);
    }

    info!("正在关闭任务队列...");
    queue.shutdown().await;
    info!("正在关闭存储驱动...");
    registry.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
