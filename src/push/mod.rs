//! 外部推送通道 / External push channel
//!
//! 离线用户走厂商推送网关。网关是外部协作方，这里只抽象一次单 token
//! 发送；多 token 并发与成败归并在 `send_to_tokens` 完成。
//! Offline users go through the vendor push gateway. The gateway is an
//! external collaborator; the abstraction here is one send per token, with
//! multi-token concurrency and outcome folding done by `send_to_tokens`.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::{DispatchError, DispatchResult};
use crate::store::StoredNotification;

mod http;

pub use http::HttpPushTransport;

/// 推送默认存活时间（秒）/ Default push time-to-live in seconds
pub const PUSH_TTL_SECONDS: u32 = 3600;

/// 单 token 推送错误 / Per-token push error
#[derive(Debug, Error)]
pub enum PushError {
    /// 设备 token 被网关拒绝，对该 token 不可重试
    /// Token rejected by the gateway, non-retriable for this token
    #[error("推送 token 被拒绝 / push token rejected: {0}")]
    TokenRejected(String),

    /// 网关暂时不可用（超时、5xx）/ Gateway transient failure (timeout, 5xx)
    #[error("推送网关传输失败 / push gateway transport failure: {0}")]
    Transport(String),
}

/// 推送传输 / Push transport
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, token: &str, payload: &PushPayload) -> Result<(), PushError>;
}

/// 厂商侧负载 / Vendor-side payload
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PushPayload {
    pub to: String,
    pub notification: PushNotification,
    pub data: serde_json::Value,
    /// "normal" 或 "high" / "normal" or "high"
    pub priority: String,
    pub ttl: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub badge: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

impl PushPayload {
    /// 从通知记录构建；`to` 留空，由多 token 发送逐个填入
    /// Built from the stored record; `to` stays empty and is filled per token
    pub fn from_record(record: &StoredNotification, icon_url: Option<String>) -> Self {
        let mut data = match &record.data {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        data.insert("notificationId".to_string(), record.id.clone().into());
        data.insert("type".to_string(), record.kind.clone().into());
        if let Some(url) = &record.action_url {
            data.insert("actionUrl".to_string(), url.clone().into());
        }
        Self {
            to: String::new(),
            notification: PushNotification {
                title: record.title.clone(),
                body: record.message.clone(),
                icon: icon_url,
                badge: None,
                sound: Some("default".to_string()),
            },
            data: serde_json::Value::Object(data),
            priority: record.priority.push_priority().to_string(),
            ttl: PUSH_TTL_SECONDS,
        }
    }

    fn for_token(&self, token: &str) -> Self {
        let mut payload = self.clone();
        payload.to = token.to_string();
        payload
    }
}

/// 并发发往所有 token，返回接受数
/// Send to every token concurrently, returning the accepted count
///
/// 成败归并：≥1 接受即成功；全败且含传输错误可重试；全被拒绝不可重试。
/// Outcome folding: ≥1 accepted is success; all failed with a transport
/// error in the mix is retriable; all rejected is not.
pub async fn send_to_tokens(
    transport: &dyn PushTransport,
    tokens: &[String],
    payload: &PushPayload,
) -> DispatchResult<usize> {
    if tokens.is_empty() {
        return Err(DispatchError::validation("推送目标为空 / no push tokens to send to"));
    }

    let attempts = tokens.iter().map(|token| async move {
        let result = transport.send(token, &payload.for_token(token)).await;
        (token, result)
    });

    let mut accepted = 0usize;
    let mut transient = 0usize;
    let mut last_error = String::new();
    for (token, result) in join_all(attempts).await {
        match result {
            Ok(()) => accepted += 1,
            Err(PushError::TokenRejected(reason)) => {
                warn!("⚠️  token 被拒绝 / Token rejected: {} ({})", token, reason);
                last_error = reason;
            }
            Err(PushError::Transport(reason)) => {
                transient += 1;
                last_error = reason;
            }
        }
    }

    if accepted > 0 {
        Ok(accepted)
    } else if transient > 0 {
        Err(DispatchError::transport(format!(
            "推送全部失败 / every push attempt failed ({} tokens): {}",
            tokens.len(),
            last_error
        )))
    } else {
        Err(DispatchError::authorization(format!(
            "所有 token 均被拒绝 / all {} tokens rejected: {}",
            tokens.len(),
            last_error
        )))
    }
}
