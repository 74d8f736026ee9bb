// 百度网盘开放平台接口类型

use crate::client::{AccessToken, ApiDialect, ApiOutcome, Endpoint};
use crate::config::VipType;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::Value;

/// 普通用户分片大小: 4MB
pub const NORMAL_SLICE_SIZE: u64 = 4 * 1024 * 1024;
/// 普通会员分片大小: 16MB
pub const VIP_SLICE_SIZE: u64 = 16 * 1024 * 1024;
/// 超级会员分片大小: 32MB
pub const SVIP_SLICE_SIZE: u64 = 32 * 1024 * 1024;

/// 按会员类型的分片大小
pub fn slice_size_for(vip_type: VipType) -> u64 {
    match vip_type {
        VipType::Normal => NORMAL_SLICE_SIZE,
        VipType::Vip => VIP_SLICE_SIZE,
        VipType::Svip => SVIP_SLICE_SIZE,
    }
}

/// 按会员类型的单文件大小上限
pub fn file_size_limit(vip_type: VipType) -> u64 {
    const GB: u64 = 1024 * 1024 * 1024;
    match vip_type {
        VipType::Normal => 4 * GB,
        VipType::Vip => 10 * GB,
        VipType::Svip => 20 * GB,
    }
}

/// 文件命名策略: 1 冲突时重命名，3 覆盖
pub fn rtype(overwrite: bool) -> &'static str {
    if overwrite {
        "3"
    } else {
        "1"
    }
}

/// 预创建响应
#[derive(Debug, Deserialize)]
pub struct PrecreateResponse {
    /// 1 需要上传分片，2 秒传成功
    #[serde(default)]
    pub return_type: i32,
    #[serde(default)]
    pub uploadid: String,
    /// 需要上传的分片序号
    #[serde(default)]
    pub block_list: Vec<usize>,
}

/// superfile2 分片上传响应
#[derive(Debug, Deserialize)]
pub struct UploadSliceResponse {
    #[serde(default)]
    pub md5: String,
}

/// 创建文件响应
#[derive(Debug, Deserialize)]
pub struct CreateResponse {
    #[serde(default)]
    pub fs_id: u64,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// 百度网盘接口方言
///
/// 访问令牌放在 query 的 `access_token` 中；错误码位于 `errno`（xpan 接口）
/// 或 `error_code`（pcs 接口）。
pub struct BaiduDialect {
    pub client_id: String,
    pub client_secret: String,
    /// GET /oauth/2.0/token
    pub token_api: Endpoint,
}

/// 从响应中取出错误码与错误信息，缺失时视为成功
pub fn response_code(body: &Value) -> (i64, String) {
    let code = body
        .get("errno")
        .or_else(|| body.get("error_code"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let message = body
        .get("errmsg")
        .or_else(|| body.get("error_msg"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    (code, message)
}

#[async_trait]
impl ApiDialect for BaiduDialect {
    fn name(&self) -> &str {
        "baidu_netdisk"
    }

    fn authorize(&self, request: RequestBuilder, access_token: &str) -> RequestBuilder {
        request.query(&[("access_token", access_token)])
    }

    fn classify(&self, body: &[u8]) -> Result<ApiOutcome> {
        let value: Value = serde_json::from_slice(body)?;
        let (code, message) = response_code(&value);
        Ok(match code {
            0 => ApiOutcome::Success,
            -6 | 110 | 111 => ApiOutcome::AuthExpired(message),
            31023 | 31024 | 31034 => ApiOutcome::RateLimited(message),
            -1 | -3 | -7 | -8 | -9 | -10 | -11 | -21 | 2 => ApiOutcome::Transient(message),
            code => ApiOutcome::Rejected { code, message },
        })
    }

    async fn refresh_token(
        &self,
        http: &reqwest::Client,
        current: &AccessToken,
    ) -> Result<AccessToken> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::AuthExpired("未配置刷新令牌".to_string()))?;

        let _permit = self.token_api.limiter().acquire().await?;
        let response = http
            .get(self.token_api.url())
            .query(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
            ])
            .send()
            .await?;
        let body = response.bytes().await?;

        if let Ok(err) = serde_json::from_slice::<TokenErrResponse>(&body) {
            if !err.error.is_empty() {
                return Err(GatewayError::AuthExpired(format!(
                    "{}: {}",
                    err.error, err.error_description
                )));
            }
        }
        let token: TokenResponse = serde_json::from_slice(&body)?;
        Ok(AccessToken {
            access_token: token.access_token,
            refresh_token: Some(token.refresh_token).filter(|t| !t.is_empty()),
            expires_at: Some(Utc::now() + chrono::Duration::seconds(token.expires_in)),
        })
    }
}
