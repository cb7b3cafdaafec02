use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::status::MessageStatus;

/// 队列信封 - 管道中流转的工作单元
/// Queue envelope - the unit of work flowing through the pipeline
///
/// 线格式为 UTF-8 JSON，未知字段读取时忽略
/// Wire format is UTF-8 JSON; unknown fields are ignored on read
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: EnvelopePayload,
    /// 已重试次数，首次入队为 0 / Retry count, 0 on first enqueue
    #[serde(rename = "retryCount", default)]
    pub retry_count: u32,
    /// 入队时间，推送时由入队方写入 / Enqueue time, stamped by the enqueue path
    #[serde(
        rename = "enqueuedAt",
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub enqueued_at: Option<DateTime<Utc>>,
    /// 仅通知队列使用 / Notification lanes only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl Envelope {
    /// 构建首个信封 / Build a fresh envelope
    pub fn new(payload: EnvelopePayload) -> Self {
        Self {
            payload,
            retry_count: 0,
            enqueued_at: None,
            priority: None,
        }
    }

    /// 设置优先级 / Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// 生效优先级（缺省为 normal）/ Effective priority (defaults to normal)
    pub fn effective_priority(&self) -> Priority {
        self.priority
            .or_else(|| match &self.payload {
                EnvelopePayload::Notification(n) => Some(n.priority),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// 序列化为线格式 / Serialize to the wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// 从线格式解析 / Parse from the wire format
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// 按 kind 区分的负载 / Kind-discriminated payload
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EnvelopePayload {
    SendMessage(SendMessagePayload),
    UpdateStatus(UpdateStatusPayload),
    DeliveryReceipt(DeliveryReceiptPayload),
    ReadReceipt(ReadReceiptPayload),
    Notification(NotificationPayload),
    Cleanup(CleanupPayload),
}

impl EnvelopePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopePayload::SendMessage(_) => "send_message",
            EnvelopePayload::UpdateStatus(_) => "update_status",
            EnvelopePayload::DeliveryReceipt(_) => "delivery_receipt",
            EnvelopePayload::ReadReceipt(_) => "read_receipt",
            EnvelopePayload::Notification(_) => "notification",
            EnvelopePayload::Cleanup(_) => "cleanup",
        }
    }
}

/// 投递优先级 / Delivery priority
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// high/urgent 走优先通道 / high and urgent take the priority lane
    pub fn takes_priority_lane(&self) -> bool {
        matches!(self, Priority::High | Priority::Urgent)
    }

    /// 推送网关侧的优先级字符串 / Priority string on the push gateway side
    pub fn push_priority(&self) -> &'static str {
        if self.takes_priority_lane() {
            "high"
        } else {
            "normal"
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl SendMessagePayload {
    /// 是否有可通知内容（文本或媒体）/ Whether there is notifiable content
    pub fn has_notifiable_content(&self) -> bool {
        self.content.as_deref().is_some_and(|c| !c.is_empty()) || !self.media_urls.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusPayload {
    pub message_id: String,
    pub status: MessageStatus,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceiptPayload {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub recipient_ids: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub message_id: String,
    pub user_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub read_at: DateTime<Utc>,
}

/// 通知负载 / Notification payload
///
/// 消息 worker 产出的扇出前信封 user_id 为空、data 携带会话上下文；
/// 通知 worker 只接受扇出后的单收件人信封。
/// Pre-fanout envelopes from the message worker leave user_id empty and put
/// chat context into data; the notification worker only accepts
/// single-recipient envelopes.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CleanupPayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_ids: Vec<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub older_than: DateTime<Utc>,
}
