// Web服务器模块

pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// 构建完整的 API 路由
pub fn build_router(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 请求体上限与最大分片大小一致，配置加载时已校验可转换为 usize
    let body_limit = usize::try_from(state.orchestrator.max_slice_size()).unwrap_or(usize::MAX);

    let api_routes = Router::new()
        // 分片上传API
        .route("/fs/preup", post(handlers::preup))
        .route(
            "/fs/slice_upload",
            put(handlers::slice_upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/fs/slice_upload_complete", post(handlers::slice_upload_complete))
        .route("/fs/upload_info", get(handlers::upload_info))
        // 任务队列API
        .route("/queue/:task_id", get(handlers::get_task))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .route("/health", get(handlers::health_check))
        .layer(middleware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalConfig, QueueConfig, UploadConfig};
    use crate::driver::local::LocalStorage;
    use crate::driver::StorageRegistry;
    use crate::persistence::{Database, QueueStore, SessionStore, SqliteSessionStore};
    use crate::queue::TaskQueue;
    use crate::uploader::{slice_md5, ProxyUploadHandler, TempBuffer, UploadOrchestrator, PROXY_UPLOAD_TASK};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    async fn spawn_gateway(dir: &TempDir) -> (String, Arc<TaskQueue>) {
        let db = Database::open(&dir.path().join("gw.db")).unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(db.clone()));
        let cancel = CancellationToken::new();
        let queue = TaskQueue::new(
            QueueStore::new(db),
            QueueConfig {
                concurrency: 1,
                max_attempts: 2,
                retry_backoff_secs: 0,
                poll_interval_ms: 20,
            },
            cancel.clone(),
        );
        let registry = Arc::new(StorageRegistry::new());
        registry.insert(Arc::new(
            LocalStorage::new(&LocalConfig {
                id: "disk".into(),
                root: dir.path().join("root"),
            })
            .unwrap(),
        ));
        let upload = UploadConfig {
            temp_dir: dir.path().join("tmp"),
            default_slice_size: 4,
            max_slice_size: 8,
            database_path: dir.path().join("gw.db"),
        };
        queue.register_handler(
            PROXY_UPLOAD_TASK,
            Arc::new(ProxyUploadHandler::new(
                Arc::clone(&registry),
                Arc::clone(&store),
                TempBuffer::new(&upload.temp_dir),
            )),
        );
        queue.start();

        let orchestrator = Arc::new(UploadOrchestrator::new(registry, store, Arc::clone(&queue), &upload));
        let app = build_router(AppState::new(orchestrator, cancel));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), queue)
    }

    #[tokio::test]
    async fn test_upload_flow_over_http() {
        let dir = TempDir::new().unwrap();
        let (base, queue) = spawn_gateway(&dir).await;
        let http = reqwest::Client::new();
        let data = b"hello slices".to_vec();
        let slices: Vec<&[u8]> = data.chunks(4).collect();
        let hashes: Vec<String> = slices.iter().map(|s| slice_md5(s)).collect();

        let preup: Value = http
            .post(format!("{}/api/fs/preup", base))
            .json(&json!({
                "storage": "disk",
                "dst": {"path": "/inbox"},
                "name": "hello.txt",
                "size": data.len(),
                "hash": {"md5": slice_md5(&data)}
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(preup["code"], 0);
        assert_eq!(preup["data"]["slice_count"], 3);
        let upload_id = preup["data"]["upload_id"].as_i64().unwrap();

        // 第一个分片之前上传其他分片会被拒绝
        let early: Value = http
            .put(format!("{}/api/fs/slice_upload", base))
            .query(&[("upload_id", upload_id.to_string()), ("slice_num", "1".into()), ("slice_hash", hashes[1].clone())])
            .body(slices[1].to_vec())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(early["code"], 400);

        for (i, slice) in slices.iter().enumerate() {
            let hash = if i == 0 { hashes.join(",") } else { hashes[i].clone() };
            let resp: Value = http
                .put(format!("{}/api/fs/slice_upload", base))
                .query(&[("upload_id", upload_id.to_string()), ("slice_num", i.to_string()), ("slice_hash", hash)])
                .body(slice.to_vec())
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            assert_eq!(resp["code"], 0, "slice {}: {}", i, resp);
            assert_eq!(resp["data"]["outcome"], "uploaded");
        }

        let complete: Value = http
            .post(format!("{}/api/fs/slice_upload_complete", base))
            .json(&json!({"upload_id": upload_id}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(complete["code"], 0);
        assert_eq!(complete["data"]["complete"], true);
        let task_id = complete["data"]["task_id"].as_str().unwrap().to_string();

        let mut status = Value::Null;
        for _ in 0..300 {
            let task: Value = http
                .get(format!("{}/api/queue/{}", base, task_id))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            status = task["data"]["status"].clone();
            if status == "success" || status == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, "success");
        assert_eq!(std::fs::read(dir.path().join("root/inbox/hello.txt")).unwrap(), data);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let dir = TempDir::new().unwrap();
        let (base, queue) = spawn_gateway(&dir).await;
        let http = reqwest::Client::new();

        let info: Value = http
            .get(format!("{}/api/fs/upload_info?storage=disk", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["code"], 0);
        assert_eq!(info["data"]["capabilities"]["direct_put"], true);
        assert_eq!(info["data"]["slice_hash_need"], false);

        let missing: Value = http
            .get(format!("{}/api/fs/upload_info?storage=nope", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(missing["code"], 404);

        let task: Value = http
            .get(format!("{}/api/queue/unknown", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(task["code"], 404);

        let complete: Value = http
            .post(format!("{}/api/fs/slice_upload_complete", base))
            .json(&json!({"upload_id": 77}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(complete["code"], 404);

        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_slice_body_rejected() {
        let dir = TempDir::new().unwrap();
        let (base, queue) = spawn_gateway(&dir).await;
        let http = reqwest::Client::new();

        let resp = http
            .put(format!("{}/api/fs/slice_upload", base))
            .query(&[("upload_id", "1"), ("slice_num", "0"), ("slice_hash", "x")])
            .body(vec![0u8; 9])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::PAYLOAD_TOO_LARGE);

        // 上限以内的请求体正常进入处理器
        let ok: Value = http
            .put(format!("{}/api/fs/slice_upload", base))
            .query(&[("upload_id", "1"), ("slice_num", "0"), ("slice_hash", "x")])
            .body(vec![0u8; 8])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ok["code"], 404);

        let huge: Value = http
            .post(format!("{}/api/fs/preup", base))
            .json(&json!({
                "storage": "disk",
                "dst": {"path": "/inbox"},
                "name": "huge.bin",
                "size": u64::MAX,
                "hash": {"md5": "0cc175b9c0f1b6a831c399e269772661"}
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(huge["code"], 400);

        queue.shutdown().await;
    }
}
