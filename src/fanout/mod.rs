//! 在线状态与 socket 扇出 / Presence and socket fanout
//!
//! 实时 socket 织物是外部协作方，这里只定义它的两个能力：在线判定与
//! 投递。`LocalSocketFanout` 是进程内实现，供测试与单机部署使用。
//! The real-time socket fabric is an external collaborator; only its two
//! capabilities are defined here: presence lookup and delivery.
//! `LocalSocketFanout` is the in-process implementation used by tests and
//! single-node runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::store::StoredNotification;

/// socket 出站信封 / Outbound socket envelope
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SocketEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub notification: SocketNotification,
    #[serde(rename = "unreadCount")]
    pub unread_count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SocketNotification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl SocketEnvelope {
    /// 从通知记录构建，未读数在投递时刻计算
    /// Built from the stored record; unread count is computed at delivery time
    pub fn new_notification(record: &StoredNotification, unread_count: u64) -> Self {
        Self {
            kind: "new_notification".to_string(),
            notification: SocketNotification {
                id: record.id.clone(),
                kind: record.kind.clone(),
                title: record.title.clone(),
                message: record.message.clone(),
                data: record.data.clone(),
                action_url: record.action_url.clone(),
                created_at: record.created_at,
            },
            unread_count,
        }
    }
}

/// 在线判定，尽力而为 / Best-effort presence lookup
#[async_trait]
pub trait PresenceService: Send + Sync {
    async fn is_online(&self, user_id: &str) -> bool;
}

/// socket 投递 / Socket delivery
#[async_trait]
pub trait SocketFanout: Send + Sync {
    /// 推送到用户的所有活跃会话，一个都送不出去视为传输失败
    /// Push to every live session; reaching none counts as a transport failure
    async fn deliver(&self, user_id: &str, envelope: SocketEnvelope) -> DispatchResult<()>;
}

/// 进程内会话注册表 / In-process session registry
#[derive(Default)]
pub struct LocalSocketFanout {
    sessions: DashMap<String, DashMap<String, mpsc::UnboundedSender<SocketEnvelope>>>,
}

impl LocalSocketFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个会话，返回它的接收端 / Register a session, returning its receiver
    pub fn register(&self, user_id: &str, session_id: &str) -> mpsc::UnboundedReceiver<SocketEnvelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string(), tx);
        debug!("🔌 会话注册 / Session registered: {} ({})", user_id, session_id);
        rx
    }

    pub fn unregister(&self, user_id: &str, session_id: &str) {
        if let Some(user_sessions) = self.sessions.get(user_id) {
            user_sessions.remove(session_id);
        }
        self.sessions.remove_if(user_id, |_, s| s.is_empty());
    }
}

#[async_trait]
impl PresenceService for LocalSocketFanout {
    async fn is_online(&self, user_id: &str) -> bool {
        self.sessions.get(user_id).map(|s| !s.is_empty()).unwrap_or(false)
    }
}

#[async_trait]
impl SocketFanout for LocalSocketFanout {
    async fn deliver(&self, user_id: &str, envelope: SocketEnvelope) -> DispatchResult<()> {
        let Some(user_sessions) = self.sessions.get(user_id) else {
            return Err(DispatchError::transport(format!(
                "用户无活跃会话 / no live session for user {}",
                user_id
            )));
        };

        let mut delivered = 0usize;
        let mut dead = Vec::new();
        for entry in user_sessions.iter() {
            if entry.value().send(envelope.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }
        for session_id in &dead {
            user_sessions.remove(session_id);
        }
        drop(user_sessions);
        if !dead.is_empty() {
            warn!("⚠️  清理失效会话 / Pruned dead sessions: {} for {}", dead.len(), user_id);
            self.sessions.remove_if(user_id, |_, s| s.is_empty());
        }

        if delivered > 0 {
            debug!("📤 socket 投递 / Socket delivery: {} session(s) of {}", delivered, user_id);
            Ok(())
        } else {
            Err(DispatchError::transport(format!(
                "所有会话均不可达 / every session unreachable for user {}",
                user_id
            )))
        }
    }
}
