//! 内存存储实现 / In-memory store implementations
//!
//! DashMap 支撑的实现，测试与单机部署直接可用。
//! DashMap-backed implementations used as-is by tests and single-node runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;

use super::{
    DeliveredVia, MessageStore, NewMessage, NewNotification, NotificationState, NotificationStore,
    StoredMessage, StoredNotification, UserStore,
};
use crate::domain::{MessageStatus, NotificationPrefs};
use crate::error::DispatchResult;

/// 内存消息存储 / In-memory message store
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: DashMap<String, StoredMessage>,
    chat_members: DashMap<String, Vec<String>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置会话成员（扇出的收件人来源）/ Seed chat membership (fan-out source)
    pub fn set_chat_members(&self, chat_id: &str, members: Vec<String>) {
        self.chat_members.insert(chat_id.to_string(), members);
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(&self, message: NewMessage) -> DispatchResult<bool> {
        match self.messages.entry(message.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(StoredMessage {
                    id: message.id,
                    chat_id: message.chat_id,
                    sender_id: message.sender_id,
                    content: message.content,
                    message_type: message.message_type,
                    media_urls: message.media_urls,
                    reply_to: message.reply_to,
                    status: MessageStatus::Pending,
                    created_at: Utc::now(),
                    delivered_to: HashMap::new(),
                    read_by: HashMap::new(),
                });
                Ok(true)
            }
        }
    }

    async fn set_status(&self, id: &str, status: MessageStatus) -> DispatchResult<Option<MessageStatus>> {
        Ok(self.messages.get_mut(id).map(|mut m| {
            m.status.advance_to(status);
            m.status
        }))
    }

    async fn mark_delivered(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> DispatchResult<()> {
        if let Some(mut m) = self.messages.get_mut(id) {
            m.delivered_to.entry(user_id.to_string()).or_insert(at);
            m.status.advance_to(MessageStatus::Delivered);
        }
        Ok(())
    }

    async fn mark_read(&self, id: &str, user_id: &str, at: DateTime<Utc>) -> DispatchResult<()> {
        if let Some(mut m) = self.messages.get_mut(id) {
            m.delivered_to.entry(user_id.to_string()).or_insert(at);
            m.read_by.entry(user_id.to_string()).or_insert(at);
            m.status.advance_to(MessageStatus::Read);
        }
        Ok(())
    }

    async fn recipients(&self, chat_id: &str, sender_id: &str) -> DispatchResult<Vec<String>> {
        Ok(self
            .chat_members
            .get(chat_id)
            .map(|members| members.iter().filter(|m| *m != sender_id).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<StoredMessage>> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn delete(&self, ids: &[String]) -> DispatchResult<usize> {
        let mut removed = 0;
        for id in ids {
            if self.messages.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> DispatchResult<usize> {
        let before = self.messages.len();
        self.messages.retain(|_, m| m.created_at >= cutoff);
        Ok(before - self.messages.len())
    }
}

/// 内存通知存储 / In-memory notification store
#[derive(Default)]
pub struct MemoryNotificationStore {
    notifications: DashMap<String, StoredNotification>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, notification: NewNotification) -> DispatchResult<bool> {
        match self.notifications.entry(notification.id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(StoredNotification {
                    id: notification.id,
                    user_id: notification.user_id,
                    kind: notification.kind,
                    title: notification.title,
                    message: notification.message,
                    data: notification.data,
                    action_url: notification.action_url,
                    priority: notification.priority,
                    created_at: notification.created_at,
                    expires_at: notification.expires_at,
                    read: false,
                    state: NotificationState::Pending,
                    delivered_via: None,
                    error: None,
                });
                Ok(true)
            }
        }
    }

    async fn mark_suppressed(&self, id: &str) -> DispatchResult<()> {
        if let Some(mut n) = self.notifications.get_mut(id) {
            n.state = NotificationState::Suppressed;
        }
        Ok(())
    }

    async fn mark_processed(&self, id: &str, via: DeliveredVia) -> DispatchResult<()> {
        if let Some(mut n) = self.notifications.get_mut(id) {
            n.state = NotificationState::Processed;
            n.delivered_via = Some(via);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> DispatchResult<()> {
        if let Some(mut n) = self.notifications.get_mut(id) {
            n.state = NotificationState::Failed;
            n.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> DispatchResult<Option<StoredNotification>> {
        Ok(self.notifications.get(id).map(|n| n.clone()))
    }

    async fn unread_count(&self, user_id: &str) -> DispatchResult<u64> {
        Ok(self
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.read && n.state != NotificationState::Suppressed)
            .count() as u64)
    }
}

/// 内存用户存储 / In-memory user store
#[derive(Default)]
pub struct MemoryUserStore {
    prefs: DashMap<String, NotificationPrefs>,
    tokens: DashMap<String, Vec<String>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preferences(&self, user_id: &str, prefs: NotificationPrefs) {
        self.prefs.insert(user_id.to_string(), prefs);
    }

    pub fn add_push_token(&self, user_id: &str, token: &str) {
        self.tokens
            .entry(user_id.to_string())
            .or_default()
            .push(token.to_string());
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn preferences(&self, user_id: &str) -> DispatchResult<NotificationPrefs> {
        Ok(self
            .prefs
            .get(user_id)
            .map(|p| p.clone())
            .unwrap_or_default())
    }

    async fn push_tokens(&self, user_id: &str) -> DispatchResult<Vec<String>> {
        Ok(self.tokens.get(user_id).map(|t| t.clone()).unwrap_or_default())
    }
}
