//! 消息 worker / Message worker
//!
//! 消费 `message_queue`，驱动消息状态机：落库、回执、已读、清理，并把
//! 会话通知扇出为单收件人信封投入通知队列。
//! Consumes `message_queue` and drives the message state machine: persist,
//! receipts, reads, cleanup, plus fanning chat notifications out into
//! single-recipient envelopes on the notification lanes.

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    dead_letter_raw, delay_or_shutdown, handle_failure, timed, WorkerState,
};
use crate::broker::{Delivery, QueueBroker, MESSAGE_DLQ, MESSAGE_QUEUE, NOTIFICATION_PRIORITY_QUEUE, NOTIFICATION_QUEUE};
use crate::config::WorkerConfig;
use crate::domain::{
    CleanupPayload, DeliveryReceiptPayload, Envelope, EnvelopePayload, MessageStatus,
    NotificationPayload, Priority, ReadReceiptPayload, SendMessagePayload, UpdateStatusPayload,
};
use crate::error::{DispatchError, DispatchResult};
use crate::fanout::PresenceService;
use crate::store::{MessageStore, NewMessage, NewNotification, NotificationStore};

/// 通知正文的最大预览长度 / Maximum preview length for notification bodies
const PREVIEW_CHARS: usize = 100;

#[derive(Clone)]
pub struct MessageWorker {
    state: Arc<WorkerState>,
    broker: Arc<dyn QueueBroker>,
    messages: Arc<dyn MessageStore>,
    notifications: Arc<dyn NotificationStore>,
    presence: Arc<dyn PresenceService>,
    cfg: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl MessageWorker {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        messages: Arc<dyn MessageStore>,
        notifications: Arc<dyn NotificationStore>,
        presence: Arc<dyn PresenceService>,
        cfg: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            state: Arc::new(WorkerState::new("message-worker")),
            broker,
            messages,
            notifications,
            presence,
            cfg,
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    /// 主循环：弹出、分发、确认 / Main loop: pop, dispatch, ack
    ///
    /// 只有致命错误会让循环以 Err 退出，交由 supervisor 重启。
    /// Only fatal errors end the loop with Err, handing off to the supervisor.
    pub async fn run(self) -> DispatchResult<()> {
        info!("🚀 消息 worker 启动 / Message worker started: {}", self.state.worker_id);
        self.state.resume();
        let mut shutdown = self.shutdown.clone();
        let pop_timeout = Duration::from_millis(self.cfg.pop_timeout_ms);

        while self.state.is_processing() {
            match self.broker.pop_blocking(MESSAGE_QUEUE, pop_timeout).await {
                Ok(Some(delivery)) => self.process_delivery(delivery).await?,
                Ok(None) => {
                    if !delay_or_shutdown(Duration::from_millis(self.cfg.idle_sleep_ms), &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("❌ 消息队列弹出失败 / Message queue pop failed: {}", e);
                    if !delay_or_shutdown(Duration::from_millis(self.cfg.error_sleep_ms), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(
            "🛑 消息 worker 退出 / Message worker exited: {} {:?}",
            self.state.worker_id,
            self.state.counters.snapshot()
        );
        Ok(())
    }

    async fn process_delivery(&self, delivery: Delivery) -> DispatchResult<()> {
        let envelope = match Envelope::from_bytes(&delivery.bytes) {
            Ok(env) => env,
            Err(e) => {
                return dead_letter_raw(
                    &self.broker,
                    &self.state,
                    MESSAGE_QUEUE,
                    MESSAGE_DLQ,
                    &delivery.bytes,
                    delivery.token,
                    &format!("信封解码失败 / envelope decode failed: {}", e),
                )
                .await;
            }
        };
        debug!("📥 处理信封 / Processing envelope: kind={} retries={}", envelope.kind(), envelope.retry_count);

        match self.dispatch(&envelope).await {
            Ok(()) => {
                if let Err(e) = self.broker.ack(MESSAGE_QUEUE, delivery.token).await {
                    warn!("⚠️  确认失败，条目将由启动恢复重投 / Ack failed, startup recovery will redeliver: {}", e);
                }
                self.state.counters.processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("🔥 消息 worker 致命错误 / Fatal error in message worker: {}", e);
                Err(e)
            }
            Err(e) => {
                match handle_failure(
                    &self.broker,
                    &self.state,
                    self.cfg.max_retries,
                    MESSAGE_QUEUE,
                    MESSAGE_DLQ,
                    envelope,
                    delivery.token,
                    &e,
                    &self.shutdown,
                )
                .await
                {
                    Ok(_) => Ok(()),
                    Err(fe) if fe.is_fatal() => Err(fe),
                    Err(fe) => {
                        // 条目留在在途列表里，由启动恢复兜底
                        // The entry stays in flight, startup recovery covers it
                        warn!("⚠️  失败处理未完成 / Failure handling incomplete: {}", fe);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn dispatch(&self, envelope: &Envelope) -> DispatchResult<()> {
        match &envelope.payload {
            EnvelopePayload::SendMessage(p) => self.handle_send_message(p).await,
            EnvelopePayload::UpdateStatus(p) => self.handle_update_status(p).await,
            EnvelopePayload::DeliveryReceipt(p) => self.handle_delivery_receipt(p).await,
            EnvelopePayload::ReadReceipt(p) => self.handle_read_receipt(p).await,
            EnvelopePayload::Notification(p) => self.handle_notification(p, envelope.effective_priority()).await,
            EnvelopePayload::Cleanup(p) => self.handle_cleanup(p).await,
        }
    }

    async fn handle_send_message(&self, p: &SendMessagePayload) -> DispatchResult<()> {
        if p.id.is_empty() || p.chat_id.is_empty() || p.sender_id.is_empty() {
            return Err(DispatchError::validation(
                "send_message 缺少必填字段 / send_message missing required fields",
            ));
        }
        let t = self.cfg.store_timeout_ms;

        let created = timed(
            t,
            self.messages.create(NewMessage {
                id: p.id.clone(),
                chat_id: p.chat_id.clone(),
                sender_id: p.sender_id.clone(),
                content: p.content.clone(),
                message_type: p.message_type.clone(),
                media_urls: p.media_urls.clone(),
                reply_to: p.reply_to.clone(),
            }),
        )
        .await?;
        if !created {
            debug!("消息已存在，按重投继续 / Message already exists, treating as redelivery: {}", p.id);
        }
        timed(t, self.messages.set_status(&p.id, MessageStatus::Sent)).await?;

        let recipients = timed(t, self.messages.recipients(&p.chat_id, &p.sender_id)).await?;

        // 回执延后片刻入队，聚合刚上线的送达
        // The receipt enqueues after a short bias to batch fresh deliveries
        let receipt = Envelope::new(EnvelopePayload::DeliveryReceipt(DeliveryReceiptPayload {
            message_id: p.id.clone(),
            chat_id: p.chat_id.clone(),
            sender_id: p.sender_id.clone(),
            recipient_ids: recipients,
        }));
        let receipt_bytes = encode(&receipt)?;
        let broker = Arc::clone(&self.broker);
        let mut shutdown = self.shutdown.clone();
        let bias = Duration::from_millis(self.cfg.delivery_bias_ms);
        tokio::spawn(async move {
            delay_or_shutdown(bias, &mut shutdown).await;
            if let Err(e) = broker.push(MESSAGE_QUEUE, &receipt_bytes).await {
                error!("❌ 回执入队失败 / Failed to enqueue delivery receipt: {}", e);
            }
        });

        if p.has_notifiable_content() {
            let note = Envelope::new(EnvelopePayload::Notification(NotificationPayload {
                id: p.id.clone(),
                user_id: None,
                kind: "new_message".to_string(),
                title: "New Message".to_string(),
                message: preview(p),
                data: serde_json::json!({
                    "chatId": p.chat_id,
                    "messageId": p.id,
                    "senderId": p.sender_id,
                }),
                action_url: Some(format!("/chats/{}", p.chat_id)),
                priority: Priority::Normal,
                expires_at: None,
                created_at: Some(Utc::now()),
            }));
            self.broker.push(MESSAGE_QUEUE, &encode(&note)?).await?;
        }
        Ok(())
    }

    async fn handle_update_status(&self, p: &UpdateStatusPayload) -> DispatchResult<()> {
        let t = self.cfg.store_timeout_ms;
        let Some(status) = timed(t, self.messages.set_status(&p.message_id, p.status)).await? else {
            warn!("⚠️  状态更新指向未知消息 / Status update for unknown message: {}", p.message_id);
            return Ok(());
        };
        debug!("状态推进 / Status advanced: {} -> {}", p.message_id, status.as_str());

        if p.status == MessageStatus::Read {
            timed(t, self.messages.mark_read(&p.message_id, &p.user_id, p.timestamp)).await?;
            let receipt = Envelope::new(EnvelopePayload::ReadReceipt(ReadReceiptPayload {
                message_id: p.message_id.clone(),
                user_id: p.user_id.clone(),
                read_at: p.timestamp,
            }));
            self.broker.push(MESSAGE_QUEUE, &encode(&receipt)?).await?;
        }
        Ok(())
    }

    async fn handle_delivery_receipt(&self, p: &DeliveryReceiptPayload) -> DispatchResult<()> {
        // 空收件人列表是合法的 no-op / An empty recipient list is a valid no-op
        if p.recipient_ids.is_empty() {
            return Ok(());
        }
        let t = self.cfg.store_timeout_ms;
        let now = Utc::now();
        let mut delivered = 0usize;
        for user_id in &p.recipient_ids {
            // 此刻离线的收件人保持 sent,重连路径不在这里
            // Recipients offline right now stay sent; the reconnect path lives elsewhere
            if self.presence.is_online(user_id).await {
                timed(t, self.messages.mark_delivered(&p.message_id, user_id, now)).await?;
                delivered += 1;
            }
        }
        debug!(
            "📬 送达标记 / Delivery marked: {}/{} recipient(s) of {}",
            delivered,
            p.recipient_ids.len(),
            p.message_id
        );
        Ok(())
    }

    async fn handle_read_receipt(&self, p: &ReadReceiptPayload) -> DispatchResult<()> {
        timed(
            self.cfg.store_timeout_ms,
            self.messages.mark_read(&p.message_id, &p.user_id, p.read_at),
        )
        .await
    }

    /// 扇出边界：会话通知在这里拆成单收件人信封
    /// Fan-out boundary: chat notifications split into per-recipient envelopes here
    async fn handle_notification(&self, p: &NotificationPayload, priority: Priority) -> DispatchResult<()> {
        if p.id.is_empty() {
            return Err(DispatchError::validation("通知缺少 id / notification missing id"));
        }
        let t = self.cfg.store_timeout_ms;

        let explicit_recipient = p.user_id.as_deref().is_some_and(|uid| !uid.is_empty());
        let recipients: Vec<String> = if explicit_recipient {
            vec![p.user_id.clone().unwrap_or_default()]
        } else {
            let chat_id = p.data.get("chatId").and_then(|v| v.as_str());
            let sender = p.data.get("senderId").and_then(|v| v.as_str()).unwrap_or_default();
            match chat_id {
                Some(chat_id) => timed(t, self.messages.recipients(chat_id, sender)).await?,
                None => {
                    return Err(DispatchError::validation(
                        "通知无法确定收件人 / notification has no recipient: neither userId nor data.chatId",
                    ));
                }
            }
        };
        if recipients.is_empty() {
            debug!("通知无收件人可扇出 / Notification has nobody to fan out to: {}", p.id);
            return Ok(());
        }

        let now = Utc::now();
        let created_at = p.created_at.unwrap_or(now);
        let queue = if priority.takes_priority_lane() {
            NOTIFICATION_PRIORITY_QUEUE
        } else {
            NOTIFICATION_QUEUE
        };

        let mut entries = Vec::with_capacity(recipients.len());
        for user_id in recipients {
            // 每收件人 id 确定化，重投时 create 去重
            // Deterministic per-recipient ids let create dedup on redelivery
            let per_recipient_id = if explicit_recipient {
                p.id.clone()
            } else {
                format!("{}:{}", p.id, user_id)
            };
            timed(
                t,
                self.notifications.create(NewNotification {
                    id: per_recipient_id.clone(),
                    user_id: user_id.clone(),
                    kind: p.kind.clone(),
                    title: p.title.clone(),
                    message: p.message.clone(),
                    data: p.data.clone(),
                    action_url: p.action_url.clone(),
                    priority,
                    created_at,
                    expires_at: p.expires_at,
                }),
            )
            .await?;

            let mut fanned = p.clone();
            fanned.id = per_recipient_id;
            fanned.user_id = Some(user_id);
            fanned.created_at = Some(created_at);
            fanned.priority = priority;
            let mut env = Envelope::new(EnvelopePayload::Notification(fanned)).with_priority(priority);
            env.enqueued_at = Some(now);
            entries.push((queue.to_string(), encode(&env)?));
        }

        let count = self.broker.push_bulk(entries).await?;
        info!("📨 通知扇出 / Notification fanned out: {} recipient(s) via {}", count, queue);
        Ok(())
    }

    async fn handle_cleanup(&self, p: &CleanupPayload) -> DispatchResult<()> {
        let t = self.cfg.store_timeout_ms;
        let mut removed = 0usize;
        if !p.message_ids.is_empty() {
            removed += timed(t, self.messages.delete(&p.message_ids)).await?;
        }
        removed += timed(t, self.messages.delete_older_than(p.older_than)).await?;
        info!("🧹 清理完成 / Cleanup done: {} message(s) removed", removed);
        Ok(())
    }
}

fn encode(envelope: &Envelope) -> DispatchResult<Vec<u8>> {
    envelope
        .to_bytes()
        .map_err(|e| DispatchError::fatal(format!("信封序列化失败 / envelope serialization failed: {}", e)))
}

fn preview(p: &SendMessagePayload) -> String {
    match p.content.as_deref().filter(|c| !c.is_empty()) {
        Some(content) => content.chars().take(PREVIEW_CHARS).collect(),
        None => "Sent an attachment".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::fanout::LocalSocketFanout;
    use crate::store::{MemoryMessageStore, MemoryNotificationStore};
    use chrono::TimeZone;

    struct Fixture {
        worker: MessageWorker,
        broker: Arc<MemoryBroker>,
        messages: Arc<MemoryMessageStore>,
        notifications: Arc<MemoryNotificationStore>,
        fanout: Arc<LocalSocketFanout>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let messages = Arc::new(MemoryMessageStore::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let fanout = Arc::new(LocalSocketFanout::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cfg = WorkerConfig {
            delivery_bias_ms: 50,
            ..WorkerConfig::default()
        };
        let worker = MessageWorker::new(
            broker.clone() as Arc<dyn QueueBroker>,
            messages.clone() as Arc<dyn MessageStore>,
            notifications.clone() as Arc<dyn NotificationStore>,
            fanout.clone() as Arc<dyn PresenceService>,
            cfg,
            shutdown_rx,
        );
        Fixture {
            worker,
            broker,
            messages,
            notifications,
            fanout,
            shutdown_tx,
        }
    }

    fn send_message_envelope(id: &str, content: Option<&str>) -> Envelope {
        Envelope::new(EnvelopePayload::SendMessage(SendMessagePayload {
            id: id.to_string(),
            chat_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            content: content.map(|c| c.to_string()),
            message_type: "text".to_string(),
            media_urls: vec![],
            reply_to: None,
        }))
    }

    async fn drain(broker: &MemoryBroker, queue: &str) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(d) = broker.pop_blocking(queue, Duration::from_millis(10)).await.unwrap() {
            broker.ack(queue, d.token).await.unwrap();
            out.push(Envelope::from_bytes(&d.bytes).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_send_message_persists_and_emits() {
        let fx = fixture();
        fx.messages.set_chat_members("c1", vec!["u1".to_string(), "u2".to_string()]);

        fx.worker.dispatch(&send_message_envelope("m1", Some("hi"))).await.unwrap();
        assert_eq!(
            fx.messages.get("m1").await.unwrap().unwrap().status,
            MessageStatus::Sent
        );

        // 等回执偏置到期 / Wait out the receipt bias
        tokio::time::sleep(Duration::from_millis(200)).await;
        let emitted = drain(&fx.broker, MESSAGE_QUEUE).await;
        assert_eq!(emitted.len(), 2);

        let note = emitted.iter().find_map(|e| match &e.payload {
            EnvelopePayload::Notification(n) => Some(n),
            _ => None,
        });
        let note = note.unwrap();
        assert_eq!(note.kind, "new_message");
        assert_eq!(note.title, "New Message");
        assert_eq!(note.message, "hi");
        assert!(note.user_id.is_none());
        assert_eq!(note.data["chatId"], "c1");

        let receipt = emitted.iter().find_map(|e| match &e.payload {
            EnvelopePayload::DeliveryReceipt(r) => Some(r),
            _ => None,
        });
        assert_eq!(receipt.unwrap().recipient_ids, vec!["u2".to_string()]);
    }

    #[tokio::test]
    async fn test_media_only_message_gets_attachment_body() {
        let fx = fixture();
        fx.messages.set_chat_members("c1", vec!["u1".to_string(), "u2".to_string()]);
        let mut payload = SendMessagePayload {
            id: "m2".to_string(),
            chat_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            content: None,
            message_type: "image".to_string(),
            media_urls: vec!["https://cdn/img.png".to_string()],
            reply_to: None,
        };
        fx.worker.handle_send_message(&payload).await.unwrap();
        let emitted = drain(&fx.broker, MESSAGE_QUEUE).await;
        let note = emitted
            .iter()
            .find_map(|e| match &e.payload {
                EnvelopePayload::Notification(n) => Some(n.message.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(note, "Sent an attachment");

        // 超长正文裁剪到 100 字符 / Long bodies trim to 100 chars
        payload.id = "m3".to_string();
        payload.content = Some("x".repeat(250));
        fx.worker.handle_send_message(&payload).await.unwrap();
        let emitted = drain(&fx.broker, MESSAGE_QUEUE).await;
        let note = emitted
            .iter()
            .find_map(|e| match &e.payload {
                EnvelopePayload::Notification(n) => Some(n.message.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(note.chars().count(), 100);
    }

    #[tokio::test]
    async fn test_delivery_receipt_marks_online_only() {
        let fx = fixture();
        fx.messages.set_chat_members("c1", vec!["u1".to_string(), "u2".to_string(), "u3".to_string()]);
        fx.worker.dispatch(&send_message_envelope("m1", Some("hey"))).await.unwrap();

        let _session = fx.fanout.register("u2", "s1");
        fx.worker
            .handle_delivery_receipt(&DeliveryReceiptPayload {
                message_id: "m1".to_string(),
                chat_id: "c1".to_string(),
                sender_id: "u1".to_string(),
                recipient_ids: vec!["u2".to_string(), "u3".to_string()],
            })
            .await
            .unwrap();

        let m = fx.messages.get("m1").await.unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Delivered);
        assert!(m.delivered_to.contains_key("u2"));
        assert!(!m.delivered_to.contains_key("u3"));

        // 空收件人列表成功返回 / Empty recipient list succeeds
        fx.worker
            .handle_delivery_receipt(&DeliveryReceiptPayload {
                message_id: "m1".to_string(),
                chat_id: "c1".to_string(),
                sender_id: "u1".to_string(),
                recipient_ids: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_status_read_emits_receipt() {
        let fx = fixture();
        fx.messages.set_chat_members("c1", vec!["u1".to_string(), "u2".to_string()]);
        fx.worker.dispatch(&send_message_envelope("m1", Some("yo"))).await.unwrap();
        drain(&fx.broker, MESSAGE_QUEUE).await;

        let ts = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        fx.worker
            .handle_update_status(&UpdateStatusPayload {
                message_id: "m1".to_string(),
                status: MessageStatus::Read,
                user_id: "u2".to_string(),
                timestamp: ts,
            })
            .await
            .unwrap();

        let emitted = drain(&fx.broker, MESSAGE_QUEUE).await;
        let receipt = emitted
            .iter()
            .find_map(|e| match &e.payload {
                EnvelopePayload::ReadReceipt(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(receipt.user_id, "u2");
        assert_eq!(receipt.read_at, ts);

        // 回执处理幂等 / Receipt handling is idempotent
        fx.worker.handle_read_receipt(&receipt).await.unwrap();
        let m = fx.messages.get("m1").await.unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Read);
        assert_eq!(m.read_by.len(), 1);

        // 未知消息的状态更新是警告性 no-op / Unknown-message updates warn and succeed
        fx.worker
            .handle_update_status(&UpdateStatusPayload {
                message_id: "missing".to_string(),
                status: MessageStatus::Sent,
                user_id: "u2".to_string(),
                timestamp: ts,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_notification_fanout_chooses_lane() {
        let fx = fixture();
        fx.messages
            .set_chat_members("c1", vec!["u1".to_string(), "u2".to_string(), "u3".to_string()]);

        let urgent = Envelope::new(EnvelopePayload::Notification(NotificationPayload {
            id: "n1".to_string(),
            user_id: None,
            kind: "new_message".to_string(),
            title: "New Message".to_string(),
            message: "ping".to_string(),
            data: serde_json::json!({"chatId": "c1", "senderId": "u1"}),
            action_url: None,
            priority: Priority::Urgent,
            expires_at: None,
            created_at: None,
        }));
        fx.worker.dispatch(&urgent).await.unwrap();

        let fanned = drain(&fx.broker, NOTIFICATION_PRIORITY_QUEUE).await;
        assert_eq!(fanned.len(), 2);
        for env in &fanned {
            let EnvelopePayload::Notification(n) = &env.payload else {
                panic!("expected notification");
            };
            let uid = n.user_id.as_deref().unwrap();
            assert_eq!(n.id, format!("n1:{}", uid));
            assert!(n.created_at.is_some());
            assert!(fx.notifications.get(&n.id).await.unwrap().is_some());
        }

        // 已指明收件人的信封原样转发，id 不变
        // Single-recipient envelopes forward as-is, id untouched
        let direct = Envelope::new(EnvelopePayload::Notification(NotificationPayload {
            id: "n2".to_string(),
            user_id: Some("u9".to_string()),
            kind: "friend_request".to_string(),
            title: "Friend Request".to_string(),
            message: "u1 wants to connect".to_string(),
            data: serde_json::Value::Null,
            action_url: None,
            priority: Priority::Normal,
            expires_at: None,
            created_at: None,
        }));
        fx.worker.dispatch(&direct).await.unwrap();
        let fanned = drain(&fx.broker, NOTIFICATION_QUEUE).await;
        assert_eq!(fanned.len(), 1);
        let EnvelopePayload::Notification(n) = &fanned[0].payload else {
            panic!("expected notification");
        };
        assert_eq!(n.id, "n2");
    }

    #[tokio::test]
    async fn test_notification_without_recipient_is_validation_error() {
        let fx = fixture();
        let bad = Envelope::new(EnvelopePayload::Notification(NotificationPayload {
            id: "n1".to_string(),
            user_id: None,
            kind: "system".to_string(),
            title: "t".to_string(),
            message: "m".to_string(),
            data: serde_json::Value::Null,
            action_url: None,
            priority: Priority::Normal,
            expires_at: None,
            created_at: None,
        }));
        let err = fx.worker.dispatch(&bad).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_cleanup_removes_messages() {
        let fx = fixture();
        fx.messages.set_chat_members("c1", vec!["u1".to_string(), "u2".to_string()]);
        fx.worker.dispatch(&send_message_envelope("m1", Some("a"))).await.unwrap();
        fx.worker.dispatch(&send_message_envelope("m2", Some("b"))).await.unwrap();

        fx.worker
            .handle_cleanup(&CleanupPayload {
                message_ids: vec!["m1".to_string()],
                older_than: Utc.timestamp_millis_opt(0).unwrap(),
            })
            .await
            .unwrap();
        assert!(fx.messages.get("m1").await.unwrap().is_none());
        assert!(fx.messages.get("m2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_undecodable_envelope_goes_to_dlq() {
        let fx = fixture();
        fx.broker.push(MESSAGE_QUEUE, b"{broken json").await.unwrap();
        let delivery = fx
            .broker
            .pop_blocking(MESSAGE_QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        fx.worker.process_delivery(delivery).await.unwrap();

        assert_eq!(fx.broker.queue_len(MESSAGE_DLQ).await.unwrap(), 1);
        // 原条目已确认，恢复不会重投 / Original acked, recovery finds nothing
        assert_eq!(fx.broker.requeue_inflight(MESSAGE_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_loop_processes_until_stopped() {
        let fx = fixture();
        fx.messages.set_chat_members("c1", vec!["u1".to_string(), "u2".to_string()]);
        let state = fx.worker.state();
        let handle = tokio::spawn(fx.worker.clone().run());

        fx.broker
            .push(MESSAGE_QUEUE, &send_message_envelope("m1", Some("hi")).to_bytes().unwrap())
            .await
            .unwrap();

        let mut waited = 0;
        while state.counters.snapshot().processed == 0 && waited < 40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += 1;
        }
        assert!(state.counters.snapshot().processed >= 1);

        state.stop();
        fx.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
