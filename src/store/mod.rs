//! 存储抽象 / Storage abstraction
//!
//! worker 只依赖这里的 trait；内存实现随包提供，数据库部署方在外部实现
//! 同一组 trait。所有调用由 worker 侧包一层 2 秒超时，超时视为可重试的
//! 传输失败。
//! Workers depend only on the traits here; the in-memory implementations
//! ship in-tree, database deployments implement the same traits externally.
//! Every call is wrapped in a 2 second timeout on the worker side, and a
//! timeout counts as a retriable transport failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::{MessageStatus, NotificationPrefs, Priority};
use crate::error::DispatchResult;

mod memory;

pub use memory::{MemoryMessageStore, MemoryNotificationStore, MemoryUserStore};

/// 新消息写入参数 / New message write parameters
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub message_type: String,
    pub media_urls: Vec<String>,
    pub reply_to: Option<String>,
}

/// 已落库的消息 / A persisted message
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    pub message_type: String,
    pub media_urls: Vec<String>,
    pub reply_to: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    /// 每收件人送达时间 / Per-recipient delivery times
    pub delivered_to: HashMap<String, DateTime<Utc>>,
    /// 每收件人已读时间 / Per-recipient read times
    pub read_by: HashMap<String, DateTime<Utc>>,
}

/// 新通知写入参数 / New notification write parameters
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub action_url: Option<String>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 通知记录状态 / Notification record state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationState {
    Pending,
    Suppressed,
    Processed,
    Failed,
}

/// 实际触达通道 / Channel the notification actually went out on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveredVia {
    Socket,
    Push,
    /// 未触达任何实时通道，仅保留站内记录 / No live channel, in-app record only
    InApp,
}

impl DeliveredVia {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveredVia::Socket => "socket",
            DeliveredVia::Push => "push",
            DeliveredVia::InApp => "in_app",
        }
    }
}

/// 已落库的通知 / A persisted notification
#[derive(Debug, Clone)]
pub struct StoredNotification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub action_url: Option<String>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub read: bool,
    pub state: NotificationState,
    pub delivered_via: Option<DeliveredVia>,
    pub error: Option<String>,
}

/// 消息存储 / Message store
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 幂等创建，已存在时返回 false / Idempotent create, false when the id exists
    async fn create(&self, message: NewMessage) -> DispatchResult<bool>;

    /// 单调推进状态，返回写后的状态；消息不存在返回 None
    /// Monotone status advance returning the resulting status; None when missing
    async fn set_status(&self, id: &str, status: MessageStatus) -> DispatchResult<Option<MessageStatus>>;

    /// 记录某收件人已送达，(id, user) 上幂等
    /// Record delivery for one recipient, idempotent on (id, user)
    async fn mark_delivered(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> DispatchResult<()>;

    /// 记录某收件人已读 / Record a read for one recipient
    async fn mark_read(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> DispatchResult<()>;

    /// 会话成员去掉发送者 / Chat members minus the sender
    async fn recipients(&self, chat_id: &str, sender_id: &str) -> DispatchResult<Vec<String>>;

    async fn get(&self, id: &str) -> DispatchResult<Option<StoredMessage>>;

    /// 按 id 删除，返回删除条数 / Delete by id, returns removed count
    async fn delete(&self, ids: &[String]) -> DispatchResult<usize>;

    /// 删除早于 cutoff 的消息 / Delete messages older than the cutoff
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> DispatchResult<usize>;
}

/// 通知存储 / Notification store
///
/// 记录先于任何外发通道落库（先审计后投递）。
/// The record persists before any outbound channel runs.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// 幂等创建，已存在时返回 false / Idempotent create, false when the id exists
    async fn create(&self, notification: NewNotification) -> DispatchResult<bool>;

    /// 偏好过滤拦下，终态 / Held back by the preference filter, terminal
    async fn mark_suppressed(&self, id: &str) -> DispatchResult<()>;

    /// 处理完成并记录触达通道 / Done, recording the channel used
    async fn mark_processed(&self, id: &str, via: DeliveredVia) -> DispatchResult<()>;

    /// 重试预算耗尽后的终态 / Terminal state after the retry budget runs out
    async fn mark_failed(&self, id: &str, error: &str) -> DispatchResult<()>;

    async fn get(&self, id: &str) -> DispatchResult<Option<StoredNotification>>;

    /// 未读数（不含被拦下的）/ Unread count, suppressed records excluded
    async fn unread_count(&self, user_id: &str) -> DispatchResult<u64>;
}

/// 用户存储 / User store
#[async_trait]
pub trait UserStore: Send + Sync {
    /// 无记录时返回默认偏好（全部开启）
    /// Defaults apply when the user has no record (everything enabled)
    async fn preferences(&self, user_id: &str) -> DispatchResult<NotificationPrefs>;

    /// 用户注册的推送 token / Push tokens registered by the user
    async fn push_tokens(&self, user_id: &str) -> DispatchResult<Vec<String>>;
}
