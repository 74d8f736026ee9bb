//! 123 云盘开放平台驱动
//!
//! 原生支持 Preupload / SliceUpload / SliceComplete / BatchRename / BatchRemove /
//! DirectPut / PutURL。上传域名由创建文件接口动态下发，分片接口共享同一个限流器。

mod types;

pub use types::Open123Dialect;

use self::types::{
    duplicate_flag, parse_file_id, BaseResp, OfflineDownloadResp, UploadCompleteResp,
    UploadCreateReq, UploadCreateResp,
};
use super::{
    file_body, read_range, BatchRemove, BatchRename, DirectPut, LocalFile, ObjRef, PreupInfo,
    PreupRequest, Preupload, PutUrl, RenameObj, SliceComplete, SliceReceipt, SliceUpload,
    StorageDriver, UploadInfo,
};
use crate::client::{AccessToken, ApiClient, Endpoint, EndpointSet};
use crate::common::Clock;
use crate::config::{ClientConfig, Open123Config};
use crate::error::{GatewayError, Result};
use crate::uploader::hash::{hash_file, slice_md5};
use crate::uploader::session::{slice_count, UploadSession};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// 接口名
const API_UPLOAD_CREATE: &str = "upload_create";
const API_UPLOAD_SLICE: &str = "upload_slice";
const API_UPLOAD_COMPLETE: &str = "upload_complete";
const API_UPLOAD_DOMAIN: &str = "upload_domain";
const API_SINGLE_CREATE: &str = "single_create";
const API_RENAME: &str = "rename";
const API_BATCH_RENAME: &str = "batch_rename";
const API_TRASH: &str = "trash";
const API_OFFLINE_DOWNLOAD: &str = "offline_download";

/// 批量重命名每批最多 30 项
const RENAME_BATCH_SIZE: usize = 30;
/// 删除每批最多 100 项
const TRASH_BATCH_SIZE: usize = 100;
/// 单步上传的文件大小上限
const SINGLE_UPLOAD_LIMIT: u64 = 1024 * 1024 * 1024;
/// 合并结果轮询次数与间隔
const COMPLETE_POLL_TIMES: u32 = 60;
const COMPLETE_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Open123 {
    id: String,
    dialect: Arc<Open123Dialect>,
    client: ApiClient,
    apis: EndpointSet,
}

impl Open123 {
    pub fn new(config: &Open123Config, client_config: &ClientConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let base = config.base_url.trim_end_matches('/');
        let window = client_config.rate_limit_window();
        let endpoint = |path: &str, qps: usize| {
            Endpoint::new(format!("{}{}", base, path), qps, window, clock.clone())
        };

        let dialect = Arc::new(Open123Dialect {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            access_token_api: endpoint("/api/v1/access_token", 1),
            refresh_token_api: endpoint("/api/v1/oauth2/access_token", 0),
        });

        let mut apis = EndpointSet::new();
        apis.insert(API_UPLOAD_CREATE, endpoint("/upload/v2/file/create", 0));
        // 实际地址由创建接口返回的 servers 决定
        apis.insert(API_UPLOAD_SLICE, endpoint("/upload/v2/file/slice", 0));
        apis.insert(API_UPLOAD_COMPLETE, endpoint("/upload/v2/file/upload_complete", 0));
        apis.insert(API_UPLOAD_DOMAIN, endpoint("/upload/v2/file/domain", 0));
        apis.insert(API_SINGLE_CREATE, endpoint("/upload/v2/file/single/create", 0));
        apis.insert(API_RENAME, endpoint("/api/v1/file/name", 1));
        apis.insert(API_BATCH_RENAME, endpoint("/api/v1/file/rename", 1));
        apis.insert(API_TRASH, endpoint("/api/v1/file/trash", 1));
        apis.insert(API_OFFLINE_DOWNLOAD, endpoint("/api/v1/offline/download", 1));

        let token = AccessToken {
            access_token: config.access_token.clone().unwrap_or_default(),
            refresh_token: config.refresh_token.clone().filter(|t| !t.is_empty()),
            expires_at: None,
        };
        let client = ApiClient::new(dialect.clone(), token, client_config, clock)?;

        Ok(Self {
            id: config.id.clone(),
            dialect,
            client,
            apis,
        })
    }

    /// 创建文件（v2），返回秒传结果或上传句柄
    async fn create_file(
        &self,
        parent_id: u64,
        name: &str,
        etag: &str,
        size: u64,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<UploadCreateResp> {
        let body = UploadCreateReq {
            parent_file_id: parent_id,
            filename: name.to_string(),
            etag: etag.to_ascii_lowercase(),
            size,
            duplicate: duplicate_flag(overwrite),
            contain_dir: false,
        };
        let resp: BaseResp<UploadCreateResp> = self
            .client
            .request_json(
                self.apis.get(API_UPLOAD_CREATE)?,
                Method::POST,
                |r| r.json(&body),
                cancel,
            )
            .await?;
        resp.into_data()
    }

    /// 上传一个分片
    ///
    /// # 参数
    /// * `server` - 创建文件时分配的上传域名
    /// * `index` - 分片序号（从 0 开始，接口中从 1 开始）
    #[allow(clippy::too_many_arguments)]
    async fn put_slice(
        &self,
        server: &str,
        preup_id: &str,
        name: &str,
        index: usize,
        md5: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let endpoint = self.apis.get(API_UPLOAD_SLICE)?.with_url(format!(
            "{}/upload/v2/file/slice",
            server.trim_end_matches('/')
        ));
        let slice_no = (index + 1).to_string();
        self.client
            .request(
                &endpoint,
                Method::POST,
                |r| {
                    let part = Part::bytes(data.to_vec()).file_name(format!("{}.part{}", name, slice_no));
                    let form = Form::new()
                        .text("preuploadID", preup_id.to_string())
                        .text("sliceNo", slice_no.clone())
                        .text("sliceMD5", md5.to_string())
                        .part("slice", part);
                    r.multipart(form)
                },
                cancel,
            )
            .await?;
        debug!("分片上传成功: preup_id={}, slice_no={}", preup_id, slice_no);
        Ok(())
    }

    /// 通知合并并轮询结果，返回文件 ID
    async fn complete(&self, preup_id: &str, cancel: &CancellationToken) -> Result<u64> {
        let endpoint = self.apis.get(API_UPLOAD_COMPLETE)?;
        let body = json!({ "preuploadID": preup_id });
        for poll in 1..=COMPLETE_POLL_TIMES {
            let resp: BaseResp<UploadCompleteResp> = self
                .client
                .request_json(endpoint, Method::POST, |r| r.json(&body), cancel)
                .await?;
            let data = resp.into_data()?;
            if data.completed {
                info!("上传完成: preup_id={}, file_id={}", preup_id, data.file_id);
                return Ok(data.file_id);
            }
            debug!("等待合并结果 ({}/{}): preup_id={}", poll, COMPLETE_POLL_TIMES, preup_id);
            tokio::select! {
                _ = self.client.clock().sleep(COMPLETE_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
        }
        Err(GatewayError::MaxRetriesExceeded {
            api: endpoint.url().to_string(),
            attempts: COMPLETE_POLL_TIMES,
        })
    }

    /// 单步上传（≤ 1GB）
    async fn single_upload(
        &self,
        parent_id: u64,
        file: &LocalFile,
        etag: &str,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let domains: BaseResp<Vec<String>> = self
            .client
            .request_json(self.apis.get(API_UPLOAD_DOMAIN)?, Method::GET, |r| r, cancel)
            .await?;
        let domain = domains
            .into_data()?
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Other(anyhow::anyhow!("未获取到上传域名")))?;
        let endpoint = self.apis.get(API_SINGLE_CREATE)?.with_url(format!(
            "{}/upload/v2/file/single/create",
            domain.trim_end_matches('/')
        ));

        let resp: BaseResp<UploadCompleteResp> = self
            .client
            .request_json(
                &endpoint,
                Method::POST,
                |r| {
                    let part = Part::stream_with_length(file_body(&file.path), file.size)
                        .file_name(file.name.clone());
                    let form = Form::new()
                        .text("parentFileID", parent_id.to_string())
                        .text("filename", file.name.clone())
                        .text("etag", etag.to_string())
                        .text("size", file.size.to_string())
                        .text("duplicate", duplicate_flag(overwrite).to_string())
                        .part("file", part);
                    r.multipart(form)
                },
                cancel,
            )
            .await?;
        Ok(resp.into_data()?.file_id)
    }

    /// 从本地文件逐片上传（> 1GB）
    async fn sliced_upload(
        &self,
        parent_id: u64,
        file: &LocalFile,
        etag: &str,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let created = self
            .create_file(parent_id, &file.name, etag, file.size, overwrite, cancel)
            .await?;
        if created.reuse {
            info!("秒传成功: {}, file_id={}", file.name, created.file_id);
            return Ok(created.file_id);
        }
        let server = created
            .servers
            .first()
            .ok_or_else(|| GatewayError::Other(anyhow::anyhow!("未分配上传域名")))?;

        let count = slice_count(file.size, created.slice_size)?;
        for index in 0..count {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let offset = index as u64 * created.slice_size;
            let len = created.slice_size.min(file.size - offset);
            let data = read_range(&file.path, offset, len).await?;
            let md5 = slice_md5(&data);
            self.put_slice(server, &created.preupload_id, &file.name, index, &md5, &data, cancel)
                .await?;
        }
        self.complete(&created.preupload_id, cancel).await
    }
}

fn require_id(obj: &ObjRef) -> Result<u64> {
    if obj.id.is_empty() {
        return Err(GatewayError::Other(anyhow::anyhow!("缺少文件 ID: {}", obj.path)));
    }
    parse_file_id(&obj.id)
}

#[async_trait]
impl StorageDriver for Open123 {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        "open123"
    }

    fn upload_info(&self) -> UploadInfo {
        UploadInfo {
            slice_hash_need: true,
            hash_md5_need: true,
            ..Default::default()
        }
    }

    async fn rename(&self, obj: &ObjRef, new_name: &str, cancel: &CancellationToken) -> Result<()> {
        let body = json!({ "fileId": require_id(obj)?, "fileName": new_name });
        self.client
            .request(self.apis.get(API_RENAME)?, Method::PUT, |r| r.json(&body), cancel)
            .await?;
        Ok(())
    }

    async fn remove(&self, obj: &ObjRef, cancel: &CancellationToken) -> Result<()> {
        let body = json!({ "fileIDs": [require_id(obj)?] });
        self.client
            .request(self.apis.get(API_TRASH)?, Method::POST, |r| r.json(&body), cancel)
            .await?;
        Ok(())
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

    fn as_put_url(&self) -> Option<&dyn PutUrl> {
        Some(self)
    }

    async fn shutdown(&self) {
        self.apis.close_all();
        self.dialect.access_token_api.limiter().close();
        self.dialect.refresh_token_api.limiter().close();
    }
}

#[async_trait]
impl Preupload for Open123 {
    async fn preup(&self, req: &PreupRequest, cancel: &CancellationToken) -> Result<PreupInfo> {
        let etag = req.hash.require_md5()?;
        let created = self
            .create_file(
                parse_file_id(&req.dst.id)?,
                &req.name,
                etag,
                req.size,
                req.overwrite,
                cancel,
            )
            .await?;

        if created.reuse {
            info!("秒传成功: {}, file_id={}", req.name, created.file_id);
            return Ok(PreupInfo {
                reuse: true,
                slice_size: created.slice_size,
                ..Default::default()
            });
        }

        let server = created.servers.into_iter().next();
        if server.is_none() {
            warn!("创建文件未返回上传域名: {}", req.name);
        }
        Ok(PreupInfo {
            preup_id: created.preupload_id,
            slice_size: created.slice_size,
            reuse: false,
            server,
        })
    }
}

#[async_trait]
impl SliceUpload for Open123 {
    async fn slice_upload(
        &self,
        session: &UploadSession,
        index: usize,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<SliceReceipt> {
        let server = session
            .server
            .as_deref()
            .ok_or_else(|| GatewayError::Other(anyhow::anyhow!("会话缺少上传域名")))?;
        let md5 = match session.slice_hashes.get(index) {
            Some(md5) => md5.clone(),
            None => slice_md5(&data),
        };
        self.put_slice(server, &session.preup_id, &session.name, index, &md5, &data, cancel)
            .await?;
        Ok(SliceReceipt::default())
    }
}

#[async_trait]
impl SliceComplete for Open123 {
    async fn slice_complete(&self, session: &UploadSession, cancel: &CancellationToken) -> Result<()> {
        self.complete(&session.preup_id, cancel).await?;
        Ok(())
    }
}

#[async_trait]
impl BatchRename for Open123 {
    async fn batch_rename(
        &self,
        _dir: &ObjRef,
        items: &[RenameObj],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let endpoint = self.apis.get(API_BATCH_RENAME)?;
        for chunk in items.chunks(RENAME_BATCH_SIZE) {
            let mut rename_list = Vec::with_capacity(chunk.len());
            for item in chunk {
                if item.id.is_empty() {
                    return Err(GatewayError::Other(anyhow::anyhow!(
                        "缺少文件 ID: {}",
                        item.src_name
                    )));
                }
                rename_list.push(format!("{}|{}", item.id, item.new_name));
            }
            let body = json!({ "renameList": rename_list });
            self.client
                .request(endpoint, Method::POST, |r| r.json(&body), cancel)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchRemove for Open123 {
    async fn batch_remove(&self, _dir: &ObjRef, objs: &[ObjRef], cancel: &CancellationToken) -> Result<()> {
        let endpoint = self.apis.get(API_TRASH)?;
        for chunk in objs.chunks(TRASH_BATCH_SIZE) {
            let ids = chunk.iter().map(require_id).collect::<Result<Vec<_>>>()?;
            let body = json!({ "fileIDs": ids });
            self.client
                .request(endpoint, Method::POST, |r| r.json(&body), cancel)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DirectPut for Open123 {
    async fn put(
        &self,
        dir: &ObjRef,
        file: &LocalFile,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<ObjRef> {
        let etag = match file.hash.md5.as_deref().filter(|m| !m.is_empty()) {
            Some(md5) => md5.to_ascii_lowercase(),
            None => hash_file(&file.path).await?.require_md5()?.to_string(),
        };
        let parent_id = parse_file_id(&dir.id)?;

        let file_id = if file.size <= SINGLE_UPLOAD_LIMIT {
            self.single_upload(parent_id, file, &etag, overwrite, cancel).await?
        } else {
            self.sliced_upload(parent_id, file, &etag, overwrite, cancel).await?
        };

        Ok(ObjRef {
            id: file_id.to_string(),
            path: dir.child_path(&file.name),
            name: file.name.clone(),
            is_dir: false,
        })
    }
}

#[async_trait]
impl PutUrl for Open123 {
    async fn put_url(
        &self,
        dir: &ObjRef,
        name: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let body = json!({
            "url": url,
            "fileName": name,
            "dirID": parse_file_id(&dir.id)?,
        });
        let resp: BaseResp<OfflineDownloadResp> = self
            .client
            .request_json(
                self.apis.get(API_OFFLINE_DOWNLOAD)?,
                Method::POST,
                |r| r.json(&body),
                cancel,
            )
            .await?;
        Ok(resp.into_data()?.task_id.to_string())
    }
}
