use serde::{Deserialize, Serialize};

/// 消息状态 - 只允许单向推进的全序
/// Message status - a total order that only advances
///
/// pending < sent < delivered < read
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    /// 单调推进：较晚的状态不会被较早的覆盖
    /// Monotone advance: a later status is never overwritten by an earlier one
    pub fn advance_to(&mut self, next: MessageStatus) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}
