//! HTTP 推送网关客户端 / HTTP push gateway client
//!
//! 以服务端密钥向厂商端点 POST JSON；2xx 为接受，400/404/410 表示该
//! token 作废，其余状态与发送错误都按暂时故障处理。
//! POSTs JSON to the vendor endpoint under a server key; 2xx means
//! accepted, 400/404/410 mean the token is dead, everything else and any
//! send error counts as a transient failure.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

use super::{PushError, PushPayload, PushTransport};
use crate::error::{DispatchError, DispatchResult};

pub struct HttpPushTransport {
    client: reqwest::Client,
    endpoint: String,
    server_key: String,
}

impl HttpPushTransport {
    pub fn new(endpoint: &str, server_key: &str, timeout: Duration) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::fatal(format!("无法构建 HTTP 客户端 / failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            server_key: server_key.to_string(),
        })
    }
}

fn classify_status(status: StatusCode, body: String) -> Result<(), PushError> {
    if status.is_success() {
        Ok(())
    } else if matches!(
        status,
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND | StatusCode::GONE
    ) {
        Err(PushError::TokenRejected(format!("{}: {}", status, body)))
    } else {
        Err(PushError::Transport(format!("{}: {}", status, body)))
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, token: &str, payload: &PushPayload) -> Result<(), PushError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(payload)
            .send()
            .await
            .map_err(|e| PushError::Transport(format!("推送请求失败 / push request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!("📨 推送响应 / Push response: {} for token {}", status, token);
        classify_status(status, body)
    }
}
