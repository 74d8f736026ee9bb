// 123 云盘开放平台接口类型

use crate::client::{AccessToken, ApiDialect, ApiOutcome, Endpoint};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};

/// 文件正在校验中，稍后重试
pub const CODE_VALIDATING: i64 = 20103;

/// 通用响应
#[derive(Debug, Deserialize)]
pub struct BaseResp<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "x-traceID")]
    pub trace_id: String,
    pub data: Option<T>,
}

impl<T> BaseResp<T> {
    /// 取出 data，缺失时报错
    pub fn into_data(self) -> Result<T> {
        self.data.ok_or_else(|| GatewayError::BackendRejected {
            code: self.code,
            message: format!("响应缺少 data 字段: trace_id={}", self.trace_id),
        })
    }
}

/// 个人开发者换取的令牌
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenInfo {
    pub access_token: String,
    /// 例如 2025-03-23T15:48:37+08:00
    pub expired_at: DateTime<chrono::FixedOffset>,
}

/// 第三方授权应用刷新得到的令牌
#[derive(Debug, Deserialize)]
pub struct RefreshTokenInfo {
    pub access_token: String,
    /// 有效期（秒）
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
}

/// 创建文件请求（v2）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCreateReq {
    pub parent_file_id: u64,
    pub filename: String,
    pub etag: String,
    pub size: u64,
    /// 1 保留两者，2 覆盖
    pub duplicate: u8,
    pub contain_dir: bool,
}

#[derive(Debug, Deserialize)]
pub struct UploadCreateResp {
    #[serde(default, rename = "fileID")]
    pub file_id: u64,
    #[serde(default, rename = "preuploadID")]
    pub preupload_id: String,
    #[serde(default)]
    pub reuse: bool,
    #[serde(default, rename = "sliceSize")]
    pub slice_size: u64,
    #[serde(default)]
    pub servers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadCompleteResp {
    #[serde(default)]
    pub completed: bool,
    #[serde(default, rename = "fileID")]
    pub file_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct OfflineDownloadResp {
    #[serde(rename = "taskID")]
    pub task_id: u64,
}

/// `duplicate` 参数
pub fn duplicate_flag(overwrite: bool) -> u8 {
    if overwrite {
        2
    } else {
        1
    }
}

/// 解析目录 ID，根目录为 0
pub fn parse_file_id(id: &str) -> Result<u64> {
    if id.is_empty() {
        return Ok(0);
    }
    id.parse()
        .map_err(|_| GatewayError::Other(anyhow::anyhow!("非法的文件 ID: {}", id)))
}

/// 123 云盘接口方言
pub struct Open123Dialect {
    pub client_id: String,
    pub client_secret: String,
    /// POST /api/v1/access_token
    pub access_token_api: Endpoint,
    /// POST /api/v1/oauth2/access_token
    pub refresh_token_api: Endpoint,
}

#[derive(Deserialize)]
struct CodeOnly {
    code: i64,
    #[serde(default)]
    message: String,
}

impl Open123Dialect {
    async fn post_token<T: serde::de::DeserializeOwned>(
        &self,
        http: &reqwest::Client,
        endpoint: &Endpoint,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let _permit = endpoint.limiter().acquire().await?;
        let response = http
            .post(endpoint.url())
            .header("Platform", "open_platform")
            .query(query)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(GatewayError::HttpStatus {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let resp: BaseResp<T> = serde_json::from_slice(&body)?;
        if resp.code != 0 {
            return Err(GatewayError::AuthExpired(format!(
                "获取访问令牌失败: code={}, message={}",
                resp.code, resp.message
            )));
        }
        resp.into_data()
    }
}

#[async_trait]
impl ApiDialect for Open123Dialect {
    fn name(&self) -> &str {
        "open123"
    }

    fn authorize(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        request
            .bearer_auth(access_token)
            .header("Platform", "open_platform")
    }

    fn classify(&self, body: &[u8]) -> Result<ApiOutcome> {
        let resp: CodeOnly = serde_json::from_slice(body)?;
        Ok(match resp.code {
            0 => ApiOutcome::Success,
            401 => ApiOutcome::AuthExpired(resp.message),
            429 => ApiOutcome::RateLimited(resp.message),
            CODE_VALIDATING => ApiOutcome::Transient(resp.message),
            code => ApiOutcome::Rejected {
                code,
                message: resp.message,
            },
        })
    }

    async fn refresh_token(
        &self,
        http: &reqwest::Client,
        current: &AccessToken,
    ) -> Result<AccessToken> {
        // 第三方授权应用使用刷新令牌
        if let Some(refresh_token) = current.refresh_token.as_deref().filter(|t| !t.is_empty()) {
            let info: RefreshTokenInfo = self
                .post_token(
                    http,
                    &self.refresh_token_api,
                    &[
                        ("grant_type", "refresh_token"),
                        ("client_id", &self.client_id),
                        ("client_secret", &self.client_secret),
                        ("refresh_token", refresh_token),
                    ],
                )
                .await?;
            return Ok(AccessToken {
                access_token: info.access_token,
                refresh_token: Some(info.refresh_token).filter(|t| !t.is_empty()),
                expires_at: Some(Utc::now() + chrono::Duration::seconds(info.expires_in)),
            });
        }

        // 个人开发者使用 client_id / client_secret 换取
        let info: AccessTokenInfo = self
            .post_token(
                http,
                &self.access_token_api,
                &[
                    ("client_id", &self.client_id),
                    ("client_secret", &self.client_secret),
                ],
            )
            .await?;
        Ok(AccessToken::new(
            info.access_token,
            Some(info.expired_at.with_timezone(&Utc)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::SystemClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn dialect() -> Open123Dialect {
        let clock = Arc::new(SystemClock::new());
        Open123Dialect {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            access_token_api: Endpoint::new("http://127.0.0.1:1/a", 1, Duration::from_secs(1), clock.clone()),
            refresh_token_api: Endpoint::new("http://127.0.0.1:1/r", 0, Duration::from_secs(1), clock),
        }
    }

    #[test]
    fn test_classify_codes() {
        let d = dialect();
        assert_eq!(d.classify(br#"{"code":0,"data":{}}"#).unwrap(), ApiOutcome::Success);
        assert!(matches!(
            d.classify(br#"{"code":401,"message":"token expired"}"#).unwrap(),
            ApiOutcome::AuthExpired(_)
        ));
        assert!(matches!(
            d.classify(br#"{"code":429,"message":"slow down"}"#).unwrap(),
            ApiOutcome::RateLimited(_)
        ));
        assert!(matches!(
            d.classify(r#"{"code":20103,"message":"校验中"}"#.as_bytes()).unwrap(),
            ApiOutcome::Transient(_)
        ));
        assert_eq!(
            d.classify(r#"{"code":5066,"message":"文件不存在"}"#.as_bytes()).unwrap(),
            ApiOutcome::Rejected {
                code: 5066,
                message: "文件不存在".into()
            }
        );
        assert!(d.classify(b"not json").is_err());
    }

    #[test]
    fn test_parse_token_info() {
        let resp: BaseResp<AccessTokenInfo> = serde_json::from_str(
            r#"{"code":0,"message":"ok","data":{"accessToken":"tok","expiredAt":"2025-03-23T15:48:37+08:00"}}"#,
        )
        .unwrap();
        let info = resp.into_data().unwrap();
        assert_eq!(info.access_token, "tok");
        assert_eq!(
            info.expired_at.with_timezone(&Utc).to_rfc3339(),
            "2025-03-23T07:48:37+00:00"
        );
    }

    #[test]
    fn test_helpers() {
        assert_eq!(duplicate_flag(true), 2);
        assert_eq!(duplicate_flag(false), 1);
        assert_eq!(parse_file_id("").unwrap(), 0);
        assert_eq!(parse_file_id("123").unwrap(), 123);
        assert!(parse_file_id("abc").is_err());
    }
}
