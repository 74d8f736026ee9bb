//! 百度网盘开放平台驱动
//!
//! 百度没有独立的预上传接口：Preup 只按会员类型给出分片大小，
//! 第一个分片到达时才调用 precreate 取得 uploadid，并通过回执写回会话。
//! 文件以路径定位，批量重命名和删除走 filemanager 接口。

mod types;

pub use types::BaiduDialect;

use self::types::{
    file_size_limit, rtype, slice_size_for, CreateResponse, PrecreateResponse, UploadSliceResponse,
};
use super::{
    read_range, BatchRemove, BatchRename, DirectPut, LocalFile, ObjRef, PreupInfo, PreupRequest,
    Preupload, RenameObj, SliceComplete, SliceReceipt, SliceUpload, StorageDriver, UploadInfo,
};
use crate::client::{AccessToken, ApiClient, Endpoint, EndpointSet};
use crate::common::Clock;
use crate::config::{BaiduNetdiskConfig, ClientConfig, VipType};
use crate::error::{GatewayError, Result};
use crate::uploader::hash::{block_list, hash_file};
use crate::uploader::session::{slice_count, UploadSession};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const API_PRECREATE: &str = "precreate";
const API_SUPERFILE2: &str = "superfile2";
const API_CREATE: &str = "create";
const API_FILEMANAGER_RENAME: &str = "filemanager_rename";
const API_FILEMANAGER_DELETE: &str = "filemanager_delete";

pub struct BaiduNetdisk {
    id: String,
    vip_type: VipType,
    dialect: Arc<BaiduDialect>,
    client: ApiClient,
    apis: EndpointSet,
}

impl BaiduNetdisk {
    pub fn new(
        config: &BaiduNetdiskConfig,
        client_config: &ClientConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let window = client_config.rate_limit_window();
        let api_base = config.api_base.trim_end_matches('/');
        let pcs_server = config.pcs_server.trim_end_matches('/');
        let endpoint =
            |url: String, qps: usize| Endpoint::new(url, qps, window, clock.clone());

        let dialect = Arc::new(BaiduDialect {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_api: endpoint(
                format!("{}/oauth/2.0/token", config.oauth_base.trim_end_matches('/')),
                1,
            ),
        });

        let xpan = format!("{}/rest/2.0/xpan/file", api_base);
        let mut apis = EndpointSet::new();
        apis.insert(API_PRECREATE, endpoint(format!("{}?method=precreate", xpan), 0));
        apis.insert(
            API_SUPERFILE2,
            endpoint(
                format!("{}/rest/2.0/pcs/superfile2?method=upload&type=tmpfile", pcs_server),
                0,
            ),
        );
        apis.insert(API_CREATE, endpoint(format!("{}?method=create", xpan), 0));
        apis.insert(
            API_FILEMANAGER_RENAME,
            endpoint(format!("{}?method=filemanager&opera=rename", xpan), 1),
        );
        apis.insert(
            API_FILEMANAGER_DELETE,
            endpoint(format!("{}?method=filemanager&opera=delete", xpan), 1),
        );

        let token = AccessToken {
            access_token: config.access_token.clone().unwrap_or_default(),
            refresh_token: Some(config.refresh_token.clone()).filter(|t| !t.is_empty()),
            expires_at: None,
        };
        let client = ApiClient::new(dialect.clone(), token, client_config, clock)?;

        Ok(Self {
            id: config.id.clone(),
            vip_type: config.vip_type,
            dialect,
            client,
            apis,
        })
    }

    // =====================================================
    // xpan / pcs 接口
    // =====================================================

    /// 预创建文件
    ///
    /// # 参数
    /// * `remote_path` - 网盘目标路径
    /// * `blocks` - 所有分片的 MD5（按序号排列）
    /// * `content_md5` / `slice_md5` - 完整 MD5 与前 256KB 的 MD5，可为空
    #[allow(clippy::too_many_arguments)]
    async fn precreate(
        &self,
        remote_path: &str,
        size: u64,
        overwrite: bool,
        blocks: &[String],
        content_md5: &str,
        slice_md5: &str,
        cancel: &CancellationToken,
    ) -> Result<PrecreateResponse> {
        info!("预创建文件: path={}, size={}", remote_path, size);
        let block_list = serde_json::to_string(blocks)?;
        let size = size.to_string();
        let resp: PrecreateResponse = self
            .client
            .request_json(
                self.apis.get(API_PRECREATE)?,
                Method::POST,
                |r| {
                    r.form(&[
                        ("path", remote_path),
                        ("size", size.as_str()),
                        ("isdir", "0"),
                        ("autoinit", "1"),
                        ("rtype", rtype(overwrite)),
                        ("block_list", block_list.as_str()),
                        ("content-md5", content_md5),
                        ("slice-md5", slice_md5),
                    ])
                },
                cancel,
            )
            .await?;
        info!(
            "预创建成功: uploadid={}, return_type={}",
            resp.uploadid, resp.return_type
        );
        Ok(resp)
    }

    /// 上传分片到 PCS，返回分片 MD5
    async fn upload_part(
        &self,
        remote_path: &str,
        upload_id: &str,
        part_seq: usize,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let base = self.apis.get(API_SUPERFILE2)?;
        let endpoint = base.with_url(format!(
            "{}&path={}&uploadid={}&partseq={}",
            base.url(),
            urlencoding::encode(remote_path),
            urlencoding::encode(upload_id),
            part_seq
        ));
        let resp: UploadSliceResponse = self
            .client
            .request_json(
                &endpoint,
                Method::POST,
                |r| {
                    let part = Part::bytes(data.to_vec()).file_name("file");
                    r.multipart(Form::new().part("file", part))
                },
                cancel,
            )
            .await?;
        debug!("上传分片成功: part={}, md5={}", part_seq, resp.md5);
        Ok(resp.md5)
    }

    /// 合并分片，创建文件
    async fn create_file(
        &self,
        remote_path: &str,
        size: u64,
        overwrite: bool,
        upload_id: &str,
        blocks: &[String],
        cancel: &CancellationToken,
    ) -> Result<CreateResponse> {
        let block_list = serde_json::to_string(blocks)?;
        let size = size.to_string();
        let resp: CreateResponse = self
            .client
            .request_json(
                self.apis.get(API_CREATE)?,
                Method::POST,
                |r| {
                    r.form(&[
                        ("path", remote_path),
                        ("size", size.as_str()),
                        ("isdir", "0"),
                        ("rtype", rtype(overwrite)),
                        ("uploadid", upload_id),
                        ("block_list", block_list.as_str()),
                    ])
                },
                cancel,
            )
            .await?;
        info!("创建文件成功: path={}, fs_id={}", resp.path, resp.fs_id);
        Ok(resp)
    }

    /// filemanager 文件管理
    async fn manage(&self, api: &str, filelist: Value, cancel: &CancellationToken) -> Result<()> {
        let filelist = filelist.to_string();
        self.client
            .request(
                self.apis.get(api)?,
                Method::POST,
                |r| {
                    r.form(&[
                        ("async", "0"),
                        ("filelist", filelist.as_str()),
                        ("ondup", "fail"),
                    ])
                },
                cancel,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for BaiduNetdisk {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "baidu_netdisk"
    }

    fn upload_info(&self) -> UploadInfo {
        UploadInfo {
            slice_hash_need: true,
            hash_md5_need: true,
            hash_md5_256kb_need: true,
            hash_sha1_need: false,
        }
    }

    async fn rename(&self, obj: &ObjRef, new_name: &str, cancel: &CancellationToken) -> Result<()> {
        self.manage(
            API_FILEMANAGER_RENAME,
            json!([{ "path": obj.path, "newname": new_name }]),
            cancel,
        )
        .await
    }

    async fn remove(&self, obj: &ObjRef, cancel: &CancellationToken) -> Result<()> {
        self.manage(API_FILEMANAGER_DELETE, json!([obj.path]), cancel).await
    }

    fn as_preupload(&self) -> Option<&dyn Preupload> {
        Some(self)
    }

    fn as_slice_upload(&self) -> Option<&dyn SliceUpload> {
        Some(self)
    }

    fn as_slice_complete(&self) -> Option<&dyn SliceComplete> {
        Some(self)
    }

    fn as_batch_rename(&self) -> Option<&dyn BatchRename> {
        Some(self)
    }

    fn as_batch_remove(&self) -> Option<&dyn BatchRemove> {
        Some(self)
    }

    fn as_direct_put(&self) -> Option<&dyn DirectPut> {
        Some(self)
    }

    async fn shutdown(&self) {
        self.apis.close_all();
        self.dialect.token_api.limiter().close();
    }
}

#[async_trait]
impl Preupload for BaiduNetdisk {
    async fn preup(&self, req: &PreupRequest, _cancel: &CancellationToken) -> Result<PreupInfo> {
        let limit = file_size_limit(self.vip_type);
        if req.size > limit {
            return Err(GatewayError::BackendRejected {
                code: 31083,
                message: format!("文件大小 {} 超过上限 {}", req.size, limit),
            });
        }
        Ok(PreupInfo {
            slice_size: slice_size_for(self.vip_type),
            ..Default::default()
        })
    }
}

#[async_trait]
impl SliceUpload for BaiduNetdisk {
    async fn slice_upload(
        &self,
        session: &UploadSession,
        index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SliceReceipt> {
        let remote_path = session.remote_path();
        let mut receipt = SliceReceipt::default();

        // 第一个分片先预创建
        let upload_id = if index == 0 {
            let resp = self
                .precreate(
                    &remote_path,
                    session.size,
                    session.overwrite,
                    &session.slice_hashes,
                    session.hash.md5.as_deref().unwrap_or_default(),
                    session.hash.md5_256kb.as_deref().unwrap_or_default(),
                    cancel,
                )
                .await?;
            receipt.preup_id = Some(resp.uploadid.clone());
            resp.uploadid
        } else {
            session.preup_id.clone()
        };
        if upload_id.is_empty() {
            return Err(GatewayError::Other(anyhow::anyhow!(
                "缺少 uploadid: {}",
                remote_path
            )));
        }

        self.upload_part(&remote_path, &upload_id, index, &data, cancel)
            .await?;
        Ok(receipt)
    }
}

#[async_trait]
impl SliceComplete for BaiduNetdisk {
    async fn slice_complete(&self, session: &UploadSession, cancel: &CancellationToken) -> Result<()> {
        self.create_file(
            &session.remote_path(),
            session.size,
            session.overwrite,
            &session.preup_id,
            &session.slice_hashes,
            cancel,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BatchRename for BaiduNetdisk {
    async fn batch_rename(
        &self,
        dir: &ObjRef,
        items: &[RenameObj],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let filelist: Vec<Value> = items
            .iter()
            .map(|item| json!({ "path": dir.child_path(&item.src_name), "newname": item.new_name }))
            .collect();
        self.manage(API_FILEMANAGER_RENAME, Value::Array(filelist), cancel)
            .await
    }
}

#[async_trait]
impl BatchRemove for BaiduNetdisk {
    async fn batch_remove(&self, dir: &ObjRef, objs: &[ObjRef], cancel: &CancellationToken) -> Result<()> {
        let filelist: Vec<String> = objs.iter().map(|obj| dir.child_path(&obj.name)).collect();
        self.manage(API_FILEMANAGER_DELETE, json!(filelist), cancel)
            .await
    }
}

#[async_trait]
impl DirectPut for BaiduNetdisk {
    async fn put(
        &self,
        dir: &ObjRef,
        file: &LocalFile,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<ObjRef> {
        let remote_path = dir.child_path(&file.name);
        let slice_size = slice_size_for(self.vip_type);

        let mut hash = file.hash.clone();
        if hash.md5.is_none() || hash.md5_256kb.is_none() {
            hash = hash_file(&file.path).await?;
        }
        let blocks = block_list(&file.path, slice_size).await?;

        let pre = self
            .precreate(
                &remote_path,
                file.size,
                overwrite,
                &blocks,
                hash.md5.as_deref().unwrap_or_default(),
                hash.md5_256kb.as_deref().unwrap_or_default(),
                cancel,
            )
            .await?;

        if pre.return_type == 2 {
            info!("秒传成功: {}", remote_path);
        } else {
            // 后端只返回还需要上传的分片
            let pending: Vec<usize> = if pre.block_list.is_empty() {
                (0..slice_count(file.size, slice_size)?).collect()
            } else {
                pre.block_list.clone()
            };
            for part_seq in pending {
                if cancel.is_cancelled() {
                    return Err(GatewayError::Cancelled);
                }
                let offset = part_seq as u64 * slice_size;
                let len = slice_size.min(file.size.saturating_sub(offset));
                let data = read_range(&file.path, offset, len).await?;
                self.upload_part(&remote_path, &pre.uploadid, part_seq, &data, cancel)
                    .await?;
            }
        }

        let created = if pre.return_type == 2 {
            None
        } else {
            Some(
                self.create_file(&remote_path, file.size, overwrite, &pre.uploadid, &blocks, cancel)
                    .await?,
            )
        };

        Ok(ObjRef {
            id: created.map(|c| c.fs_id.to_string()).unwrap_or_default(),
            path: remote_path,
            name: file.name.clone(),
            is_dir: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ManualClock;
    use crate::uploader::hash::{slice_md5, HashInfo};
    use crate::uploader::session::{SessionStatus, SliceBitmap};
    use axum::body::Bytes;
    use axum::extract::{Query, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// (接口路径, query, 解码后的请求体)
    type Call = (String, HashMap<String, String>, String);

    #[derive(Default)]
    struct Backend {
        calls: Mutex<Vec<Call>>,
    }

    impl Backend {
        fn record(&self, path: &str, query: HashMap<String, String>, body: &[u8]) {
            let raw = String::from_utf8_lossy(body).into_owned();
            let decoded = urlencoding::decode(&raw)
                .map(|s| s.into_owned())
                .unwrap_or(raw);
            self.calls.lock().unwrap().push((path.to_string(), query, decoded));
        }

        fn calls_with(&self, method: &str) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.1.get("method").map(String::as_str) == Some(method))
                .cloned()
                .collect()
        }
    }

    async fn token(State(b): State<Arc<Backend>>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        b.record("/oauth/2.0/token", q, &[]);
        Json(json!({ "access_token": "tok", "refresh_token": "rt-2", "expires_in": 2592000 }))
    }

    async fn xpan(
        State(b): State<Arc<Backend>>,
        Query(q): Query<HashMap<String, String>>,
        body: Bytes,
    ) -> Json<Value> {
        let method = q.get("method").cloned().unwrap_or_default();
        b.record("/rest/2.0/xpan/file", q, &body);
        match method.as_str() {
            "precreate" => Json(json!({ "errno": 0, "return_type": 1, "uploadid": "up-1", "block_list": [] })),
            "create" => Json(json!({ "errno": 0, "fs_id": 888, "path": "/apps/a.bin" })),
            _ => Json(json!({ "errno": 0, "info": [] })),
        }
    }

    async fn superfile2(
        State(b): State<Arc<Backend>>,
        Query(q): Query<HashMap<String, String>>,
        body: Bytes,
    ) -> Json<Value> {
        b.record("/rest/2.0/pcs/superfile2", q, &body);
        Json(json!({ "md5": "ok", "request_id": 1 }))
    }

    async fn spawn_backend(vip_type: VipType) -> (Arc<Backend>, BaiduNetdisk) {
        let backend = Arc::new(Backend::default());
        let app = Router::new()
            .route("/oauth/2.0/token", get(token))
            .route("/rest/2.0/xpan/file", post(xpan))
            .route("/rest/2.0/pcs/superfile2", post(superfile2))
            .with_state(backend.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let driver = BaiduNetdisk::new(
            &BaiduNetdiskConfig {
                id: "bd".into(),
                client_id: "ak".into(),
                client_secret: "sk".into(),
                refresh_token: "rt-1".into(),
                access_token: None,
                vip_type,
                api_base: base.clone(),
                pcs_server: base.clone(),
                oauth_base: base,
            },
            &ClientConfig::default(),
            Arc::new(ManualClock::new()),
        )
        .unwrap();
        (backend, driver)
    }

    fn session(hashes: Vec<String>) -> UploadSession {
        let now = chrono::Utc::now();
        UploadSession {
            id: 1,
            storage_id: "bd".into(),
            dst_path: "/apps".into(),
            dst_id: String::new(),
            name: "a.bin".into(),
            size: 10_000_000,
            hash: HashInfo {
                md5: Some("full".into()),
                md5_256kb: Some("head".into()),
                sha1: None,
            },
            overwrite: true,
            preup_id: String::new(),
            server: None,
            slice_size: 4_194_304,
            slice_count: 3,
            bitmap: SliceBitmap::new(3),
            slice_hashes: hashes,
            temp_file: None,
            task_id: None,
            status: SessionStatus::Created,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_preup_returns_vip_slice_size() {
        let (backend, driver) = spawn_backend(VipType::Svip).await;
        let req = PreupRequest {
            storage: "bd".into(),
            dst: ObjRef::dir("", "/apps"),
            name: "a.bin".into(),
            size: 10,
            hash: HashInfo::default(),
            overwrite: false,
        };
        let info = driver.preup(&req, &CancellationToken::new()).await.unwrap();
        assert_eq!(info.slice_size, 32 * 1024 * 1024);
        assert!(info.preup_id.is_empty());
        assert!(!info.reuse);
        // 不访问后端
        assert!(backend.calls.lock().unwrap().is_empty());

        let too_big = PreupRequest {
            size: 21 * 1024 * 1024 * 1024,
            ..req
        };
        assert!(driver.preup(&too_big, &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_first_slice_precreates_and_reports_uploadid() {
        let (backend, driver) = spawn_backend(VipType::Normal).await;
        let cancel = CancellationToken::new();
        let mut session = session(vec!["m0".into(), "m1".into(), "m2".into()]);

        let receipt = driver
            .slice_upload(&session, 0, b"slice-zero".to_vec(), &cancel)
            .await
            .unwrap();
        assert_eq!(receipt.preup_id.as_deref(), Some("up-1"));

        // 令牌通过刷新令牌换取
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "/oauth/2.0/token");
        assert_eq!(calls[0].1["refresh_token"], "rt-1");

        let pre = &backend.calls_with("precreate")[0];
        assert_eq!(pre.1["access_token"], "tok");
        assert!(pre.2.contains(r#"block_list=["m0","m1","m2"]"#));
        assert!(pre.2.contains("path=/apps/a.bin"));
        assert!(pre.2.contains("rtype=3"));
        assert!(pre.2.contains("content-md5=full"));
        assert!(pre.2.contains("slice-md5=head"));

        let up = &backend.calls_with("upload")[0];
        assert_eq!(up.1["uploadid"], "up-1");
        assert_eq!(up.1["partseq"], "0");
        assert_eq!(up.1["type"], "tmpfile");
        assert_eq!(up.1["path"], "/apps/a.bin");

        // 后续分片沿用 uploadid，不再预创建
        session.preup_id = "up-1".into();
        let receipt = driver
            .slice_upload(&session, 2, b"slice-two".to_vec(), &cancel)
            .await
            .unwrap();
        assert!(receipt.preup_id.is_none());
        assert_eq!(backend.calls_with("precreate").len(), 1);
        assert_eq!(backend.calls_with("upload")[1].1["partseq"], "2");

        driver.slice_complete(&session, &cancel).await.unwrap();
        let create = &backend.calls_with("create")[0];
        assert!(create.2.contains("uploadid=up-1"));
        assert!(create.2.contains("size=10000000"));
    }

    #[tokio::test]
    async fn test_later_slice_without_uploadid_fails() {
        let (backend, driver) = spawn_backend(VipType::Normal).await;
        let session = session(vec![]);
        assert!(driver
            .slice_upload(&session, 1, b"x".to_vec(), &CancellationToken::new())
            .await
            .is_err());
        assert!(backend.calls_with("upload").is_empty());
    }

    #[tokio::test]
    async fn test_filemanager_operations_use_paths() {
        let (backend, driver) = spawn_backend(VipType::Normal).await;
        let cancel = CancellationToken::new();
        let dir = ObjRef::dir("", "/apps");

        driver
            .batch_rename(
                &dir,
                &[RenameObj {
                    id: String::new(),
                    src_name: "a".into(),
                    new_name: "b".into(),
                }],
                &cancel,
            )
            .await
            .unwrap();
        driver
            .batch_remove(
                &dir,
                &[ObjRef {
                    name: "c".into(),
                    ..Default::default()
                }],
                &cancel,
            )
            .await
            .unwrap();

        let ops = backend.calls_with("filemanager");
        assert_eq!(ops[0].1["opera"], "rename");
        assert!(ops[0].2.contains(r#"[{"newname":"b","path":"/apps/a"}]"#));
        assert_eq!(ops[1].1["opera"], "delete");
        assert!(ops[1].2.contains(r#"["/apps/c"]"#));
    }

    #[tokio::test]
    async fn test_direct_put_uploads_all_blocks() {
        let (backend, driver) = spawn_backend(VipType::Normal).await;
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("small.txt");
        std::fs::write(&path, b"hello baidu").unwrap();

        let obj = driver
            .put(
                &ObjRef::dir("", "/apps"),
                &LocalFile {
                    path,
                    name: "small.txt".into(),
                    size: 11,
                    hash: HashInfo::default(),
                },
                false,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(obj.id, "888");
        assert_eq!(obj.path, "/apps/small.txt");

        let pre = &backend.calls_with("precreate")[0];
        assert!(pre.2.contains(&slice_md5(b"hello baidu")));
        assert!(pre.2.contains("rtype=1"));
        assert_eq!(backend.calls_with("upload").len(), 1);
        assert_eq!(backend.calls_with("create").len(), 1);
    }
}
