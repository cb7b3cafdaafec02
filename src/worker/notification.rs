//! 通知 worker / Notification worker
//!
//! 双队列严格优先：每轮先试 `notification_queue_priority`（1 秒阻塞），
//! 命中则处理后继续；否则试 `notification_queue`；都空则小睡。优先通道
//! 非空时普通通道不会被消费。
//! Two lanes under strict priority: each round tries
//! `notification_queue_priority` first with a one second block, processes
//! and continues on a hit; otherwise tries `notification_queue`; sleeps
//! briefly when both are quiet. The normal lane is not drained while the
//! priority lane has entries.

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    dead_letter_raw, delay_or_shutdown, handle_failure, timed, FailureOutcome, WorkerState,
};
use crate::broker::{
    Delivery, QueueBroker, NOTIFICATION_DLQ, NOTIFICATION_PRIORITY_QUEUE, NOTIFICATION_QUEUE,
};
use crate::config::{PushConfig, WorkerConfig};
use crate::domain::{Envelope, EnvelopePayload, NotificationPayload, NotificationPrefs};
use crate::error::{DispatchError, DispatchResult};
use crate::fanout::{PresenceService, SocketEnvelope, SocketFanout};
use crate::filter::should_deliver;
use crate::push::{send_to_tokens, PushPayload, PushTransport};
use crate::store::{DeliveredVia, NewNotification, NotificationStore, UserStore};

/// 偏好缓存上限，超出整体清空 / Preference cache cap, cleared wholesale beyond it
const PREFS_CACHE_CAP: usize = 4096;

/// 每 worker 偏好缓存，TTL 有界 / Per-worker preference cache with a bounded TTL
struct PrefsCache {
    entries: DashMap<String, (NotificationPrefs, Instant)>,
    ttl: Duration,
}

impl PrefsCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, user_id: &str) -> Option<NotificationPrefs> {
        let hit = self.entries.get(user_id)?;
        if hit.1.elapsed() < self.ttl {
            Some(hit.0.clone())
        } else {
            drop(hit);
            self.entries.remove(user_id);
            None
        }
    }

    fn put(&self, user_id: &str, prefs: NotificationPrefs) {
        if self.entries.len() >= PREFS_CACHE_CAP {
            self.entries.clear();
        }
        self.entries.insert(user_id.to_string(), (prefs, Instant::now()));
    }
}

#[derive(Clone)]
pub struct NotificationWorker {
    state: Arc<WorkerState>,
    broker: Arc<dyn QueueBroker>,
    notifications: Arc<dyn NotificationStore>,
    users: Arc<dyn UserStore>,
    presence: Arc<dyn PresenceService>,
    fanout: Option<Arc<dyn SocketFanout>>,
    push: Option<Arc<dyn PushTransport>>,
    cfg: WorkerConfig,
    push_cfg: PushConfig,
    prefs_cache: Arc<PrefsCache>,
    shutdown: watch::Receiver<bool>,
}

impl NotificationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        notifications: Arc<dyn NotificationStore>,
        users: Arc<dyn UserStore>,
        presence: Arc<dyn PresenceService>,
        fanout: Option<Arc<dyn SocketFanout>>,
        push: Option<Arc<dyn PushTransport>>,
        cfg: WorkerConfig,
        push_cfg: PushConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let prefs_cache = Arc::new(PrefsCache::new(Duration::from_secs(cfg.prefs_cache_ttl_secs)));
        Self {
            state: Arc::new(WorkerState::new("notification-worker")),
            broker,
            notifications,
            users,
            presence,
            fanout,
            push,
            cfg,
            push_cfg,
            prefs_cache,
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.state)
    }

    pub async fn run(self) -> DispatchResult<()> {
        info!("🚀 通知 worker 启动 / Notification worker started: {}", self.state.worker_id);
        self.state.resume();
        let mut shutdown = self.shutdown.clone();
        let pop_timeout = Duration::from_millis(self.cfg.pop_timeout_ms);

        while self.state.is_processing() {
            // 优先通道命中就继续下一轮，普通通道保持饥饿
            // A priority hit restarts the round, starving the normal lane
            match self.broker.pop_blocking(NOTIFICATION_PRIORITY_QUEUE, pop_timeout).await {
                Ok(Some(delivery)) => {
                    self.process_delivery(delivery, NOTIFICATION_PRIORITY_QUEUE).await?;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("❌ 优先队列弹出失败 / Priority queue pop failed: {}", e);
                    if !delay_or_shutdown(Duration::from_millis(self.cfg.error_sleep_ms), &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            match self.broker.pop_blocking(NOTIFICATION_QUEUE, pop_timeout).await {
                Ok(Some(delivery)) => self.process_delivery(delivery, NOTIFICATION_QUEUE).await?,
                Ok(None) => {
                    if !delay_or_shutdown(Duration::from_millis(self.cfg.idle_sleep_ms), &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!("❌ 通知队列弹出失败 / Notification queue pop failed: {}", e);
                    if !delay_or_shutdown(Duration::from_millis(self.cfg.error_sleep_ms), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!(
            "🛑 通知 worker 退出 / Notification worker exited: {} {:?}",
            self.state.worker_id,
            self.state.counters.snapshot()
        );
        Ok(())
    }

    async fn process_delivery(&self, delivery: Delivery, origin: &'static str) -> DispatchResult<()> {
        let envelope = match Envelope::from_bytes(&delivery.bytes) {
            Ok(env) => env,
            Err(e) => {
                return dead_letter_raw(
                    &self.broker,
                    &self.state,
                    origin,
                    NOTIFICATION_DLQ,
                    &delivery.bytes,
                    delivery.token,
                    &format!("信封解码失败 / envelope decode failed: {}", e),
                )
                .await;
            }
        };
        debug!("📥 处理通知信封 / Processing notification envelope: retries={}", envelope.retry_count);

        let result = match &envelope.payload {
            EnvelopePayload::Notification(p) => self.process_notification(p).await,
            other => Err(DispatchError::validation(format!(
                "通知队列不接受 {} 信封 / notification lanes do not accept {} envelopes",
                other.kind(),
                other.kind()
            ))),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.broker.ack(origin, delivery.token).await {
                    warn!("⚠️  确认失败，条目将由启动恢复重投 / Ack failed, startup recovery will redeliver: {}", e);
                }
                self.state.counters.processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!("🔥 通知 worker 致命错误 / Fatal error in notification worker: {}", e);
                Err(e)
            }
            Err(e) => {
                let notification_id = match &envelope.payload {
                    EnvelopePayload::Notification(p) => Some(p.id.clone()),
                    _ => None,
                };
                match handle_failure(
                    &self.broker,
                    &self.state,
                    self.cfg.max_retries,
                    origin,
                    NOTIFICATION_DLQ,
                    envelope,
                    delivery.token,
                    &e,
                    &self.shutdown,
                )
                .await
                {
                    Ok(FailureOutcome::DeadLettered) => {
                        // 预算耗尽的记录带上最后一次错误 / Exhausted records carry the last error
                        if let Some(id) = notification_id {
                            let marked = timed(
                                self.cfg.store_timeout_ms,
                                self.notifications.mark_failed(&id, &e.to_string()),
                            )
                            .await;
                            if let Err(me) = marked {
                                warn!("⚠️  记录标记 failed 未成功 / Could not mark record failed: {}", me);
                            }
                        }
                        Ok(())
                    }
                    Ok(FailureOutcome::Retried) => Ok(()),
                    Err(fe) if fe.is_fatal() => Err(fe),
                    Err(fe) => {
                        warn!("⚠️  失败处理未完成 / Failure handling incomplete: {}", fe);
                        Ok(())
                    }
                }
            }
        }
    }

    /// 处理管道：校验、落库、过滤、选通道、标记
    /// The pipeline: validate, persist, filter, pick a channel, mark
    async fn process_notification(&self, p: &NotificationPayload) -> DispatchResult<()> {
        let user_id = p
            .user_id
            .as_deref()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DispatchError::validation("通知缺少 userId / notification missing userId"))?;
        if p.id.is_empty() || p.kind.is_empty() || p.title.is_empty() || p.message.is_empty() {
            return Err(DispatchError::validation(
                "通知缺少必填字段 / notification missing required fields: id, type, title, message",
            ));
        }
        let now = Utc::now();
        if let Some(expires_at) = p.expires_at {
            if expires_at <= now {
                return Err(DispatchError::validation(format!(
                    "通知已过期 / notification expired at {}",
                    expires_at
                )));
            }
        }
        let t = self.cfg.store_timeout_ms;

        // 记录先于任何外发落库 / The record persists before anything goes out
        timed(
            t,
            self.notifications.create(NewNotification {
                id: p.id.clone(),
                user_id: user_id.to_string(),
                kind: p.kind.clone(),
                title: p.title.clone(),
                message: p.message.clone(),
                data: p.data.clone(),
                action_url: p.action_url.clone(),
                priority: p.priority,
                created_at: p.created_at.unwrap_or(now),
                expires_at: p.expires_at,
            }),
        )
        .await?;

        let prefs = match self.prefs_cache.get(user_id) {
            Some(prefs) => prefs,
            None => {
                let prefs = timed(t, self.users.preferences(user_id)).await?;
                self.prefs_cache.put(user_id, prefs.clone());
                prefs
            }
        };

        if !should_deliver(p, &prefs) {
            timed(t, self.notifications.mark_suppressed(&p.id)).await?;
            self.state.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            debug!("🔕 通知被偏好拦下 / Suppressed by preferences: {} for {}", p.id, user_id);
            return Ok(());
        }

        let via = self.deliver(p, user_id, &prefs).await?;
        timed(t, self.notifications.mark_processed(&p.id, via)).await?;
        debug!("✅ 通知处理完成 / Notification processed: {} via {}", p.id, via.as_str());
        Ok(())
    }

    /// 通道选择：在线走 socket，离线且开推送走网关，否则仅站内
    /// Channel selection: socket when online, gateway when offline with push
    /// on, in-app record otherwise
    async fn deliver(
        &self,
        p: &NotificationPayload,
        user_id: &str,
        prefs: &NotificationPrefs,
    ) -> DispatchResult<DeliveredVia> {
        let t = self.cfg.store_timeout_ms;

        if let Some(fanout) = &self.fanout {
            if self.presence.is_online(user_id).await {
                let record = timed(t, self.notifications.get(&p.id))
                    .await?
                    .ok_or_else(|| DispatchError::transport("通知记录缺失 / notification record missing"))?;
                let unread = timed(t, self.notifications.unread_count(user_id)).await?;
                fanout
                    .deliver(user_id, SocketEnvelope::new_notification(&record, unread))
                    .await?;
                info!("📡 socket 投递 / Socket delivery: {} to {} (unread {})", p.id, user_id, unread);
                return Ok(DeliveredVia::Socket);
            }
        }

        if self.push_cfg.enabled && prefs.push_notifications {
            if let Some(push) = &self.push {
                let tokens = timed(t, self.users.push_tokens(user_id)).await?;
                if !tokens.is_empty() {
                    let record = timed(t, self.notifications.get(&p.id))
                        .await?
                        .ok_or_else(|| DispatchError::transport("通知记录缺失 / notification record missing"))?;
                    let payload = PushPayload::from_record(&record, self.push_cfg.icon_url.clone());
                    let accepted = send_to_tokens(push.as_ref(), &tokens, &payload).await?;
                    info!(
                        "📲 推送投递 / Push delivery: {} to {} ({}/{} tokens)",
                        p.id,
                        user_id,
                        accepted,
                        tokens.len()
                    );
                    return Ok(DeliveredVia::Push);
                }
            }
        }

        debug!("💾 仅站内记录 / In-app record only: {} for {}", p.id, user_id);
        Ok(DeliveredVia::InApp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::domain::{Priority, QuietHours, SendMessagePayload};
    use crate::fanout::LocalSocketFanout;
    use crate::push::PushError;
    use crate::store::{MemoryNotificationStore, MemoryUserStore, NotificationState};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    /// 记录调用并可按次失败的推送桩 / Push stub that records calls and can fail N times
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<PushPayload>>,
        fail_times: AtomicU32,
        reject: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn send(&self, _token: &str, payload: &PushPayload) -> Result<(), PushError> {
            self.calls.lock().push(payload.clone());
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                if self.reject.load(Ordering::SeqCst) {
                    return Err(PushError::TokenRejected("gone".to_string()));
                }
                return Err(PushError::Transport("503 from gateway".to_string()));
            }
            Ok(())
        }
    }

    struct Fixture {
        worker: NotificationWorker,
        broker: Arc<MemoryBroker>,
        notifications: Arc<MemoryNotificationStore>,
        users: Arc<MemoryUserStore>,
        fanout: Arc<LocalSocketFanout>,
        push: Arc<RecordingTransport>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn fixture(push_enabled: bool) -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let users = Arc::new(MemoryUserStore::new());
        let fanout = Arc::new(LocalSocketFanout::new());
        let push = Arc::new(RecordingTransport::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = NotificationWorker::new(
            broker.clone() as Arc<dyn QueueBroker>,
            notifications.clone() as Arc<dyn NotificationStore>,
            users.clone() as Arc<dyn UserStore>,
            fanout.clone() as Arc<dyn PresenceService>,
            Some(fanout.clone() as Arc<dyn SocketFanout>),
            Some(push.clone() as Arc<dyn PushTransport>),
            WorkerConfig::default(),
            PushConfig {
                enabled: push_enabled,
                endpoint: "http://push.local/send".to_string(),
                server_key: "k".to_string(),
                icon_url: Some("https://app/icon.png".to_string()),
                timeout_ms: 5000,
            },
            shutdown_rx,
        );
        Fixture {
            worker,
            broker,
            notifications,
            users,
            fanout,
            push,
            shutdown_tx,
        }
    }

    fn notification_envelope(id: &str, user: &str, kind: &str) -> Envelope {
        Envelope::new(EnvelopePayload::Notification(NotificationPayload {
            id: id.to_string(),
            user_id: Some(user.to_string()),
            kind: kind.to_string(),
            title: "New Message".to_string(),
            message: "hi there".to_string(),
            data: serde_json::json!({"chatId": "c1"}),
            action_url: Some("/chats/c1".to_string()),
            priority: Priority::Normal,
            expires_at: None,
            created_at: None,
        }))
    }

    async fn push_and_take(fx: &Fixture, queue: &'static str, env: &Envelope) -> Delivery {
        fx.broker.push(queue, &env.to_bytes().unwrap()).await.unwrap();
        fx.broker
            .pop_blocking(queue, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_online_user_gets_socket_delivery() {
        let fx = fixture(true);
        let mut session = fx.fanout.register("u2", "s1");

        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &notification_envelope("n1", "u2", "new_message")).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        let received = session.recv().await.unwrap();
        assert_eq!(received.notification.id, "n1");
        assert_eq!(received.notification.message, "hi there");
        assert_eq!(received.unread_count, 1);

        let record = fx.notifications.get("n1").await.unwrap().unwrap();
        assert_eq!(record.state, NotificationState::Processed);
        assert_eq!(record.delivered_via, Some(DeliveredVia::Socket));
        assert!(fx.push.calls.lock().is_empty());
        assert_eq!(fx.broker.requeue_inflight(NOTIFICATION_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_user_gets_push() {
        let fx = fixture(true);
        fx.users.add_push_token("u2", "tok-A");

        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &notification_envelope("n1", "u2", "new_message")).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        let calls = fx.push.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].to, "tok-A");
        assert_eq!(calls[0].priority, "normal");
        assert_eq!(calls[0].notification.title, "New Message");
        assert!(calls[0].notification.body.starts_with("hi"));
        drop(calls);

        let record = fx.notifications.get("n1").await.unwrap().unwrap();
        assert_eq!(record.delivered_via, Some(DeliveredVia::Push));
    }

    #[tokio::test]
    async fn test_muted_type_is_suppressed_not_dead_lettered() {
        let fx = fixture(true);
        let mut prefs = NotificationPrefs::default();
        prefs.muted_types.insert("mood_shared".to_string());
        fx.users.set_preferences("u2", prefs);
        fx.users.add_push_token("u2", "tok-A");

        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &notification_envelope("n1", "u2", "mood_shared")).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        assert!(fx.push.calls.lock().is_empty());
        let record = fx.notifications.get("n1").await.unwrap().unwrap();
        assert_eq!(record.state, NotificationState::Suppressed);
        assert_eq!(fx.broker.queue_len(NOTIFICATION_DLQ).await.unwrap(), 0);
        assert_eq!(fx.worker.state.counters.snapshot().suppressed, 1);
        // 信封已确认 / Envelope acked
        assert_eq!(fx.broker.requeue_inflight(NOTIFICATION_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_push_disabled_leaves_in_app_record() {
        let fx = fixture(false);
        fx.users.add_push_token("u2", "tok-A");

        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &notification_envelope("n1", "u2", "new_message")).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        assert!(fx.push.calls.lock().is_empty());
        let record = fx.notifications.get("n1").await.unwrap().unwrap();
        assert_eq!(record.state, NotificationState::Processed);
        assert_eq!(record.delivered_via, Some(DeliveredVia::InApp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_succeed() {
        let fx = fixture(true);
        fx.users.add_push_token("u2", "tok-A");
        fx.push.fail_times.store(2, Ordering::SeqCst);

        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &notification_envelope("n1", "u2", "new_message")).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();
        assert_eq!(fx.worker.state.counters.snapshot().retried, 1);

        // 第一次退避约 1 秒 / First backoff is about one second
        let delivery = fx
            .broker
            .pop_blocking(NOTIFICATION_QUEUE, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        let env = Envelope::from_bytes(&delivery.bytes).unwrap();
        assert_eq!(env.retry_count, 1);
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        // 第二次退避约 2 秒 / Second backoff is about two seconds
        let delivery = fx
            .broker
            .pop_blocking(NOTIFICATION_QUEUE, Duration::from_secs(3))
            .await
            .unwrap()
            .unwrap();
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        assert_eq!(fx.push.calls.lock().len(), 3);
        assert_eq!(fx.broker.queue_len(NOTIFICATION_DLQ).await.unwrap(), 0);
        let record = fx.notifications.get("n1").await.unwrap().unwrap();
        assert_eq!(record.state, NotificationState::Processed);
        assert_eq!(record.delivered_via, Some(DeliveredVia::Push));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_marks_failed() {
        let fx = fixture(true);
        fx.users.add_push_token("u2", "tok-A");
        fx.push.fail_times.store(u32::MAX, Ordering::SeqCst);

        let mut delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &notification_envelope("n1", "u2", "new_message")).await;
        // 首次 + 三次重试共四次尝试 / Four attempts: the first plus three retries
        for _ in 0..3 {
            fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();
            delivery = fx
                .broker
                .pop_blocking(NOTIFICATION_QUEUE, Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();
        }
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        assert_eq!(fx.push.calls.lock().len(), 4);
        assert_eq!(fx.broker.queue_len(NOTIFICATION_DLQ).await.unwrap(), 1);
        assert!(fx
            .broker
            .pop_blocking(NOTIFICATION_QUEUE, Duration::from_millis(100))
            .await
            .unwrap()
            .is_none());

        let record = fx.notifications.get("n1").await.unwrap().unwrap();
        assert_eq!(record.state, NotificationState::Failed);
        assert!(record.error.unwrap().contains("503 from gateway"));
    }

    #[tokio::test]
    async fn test_expired_notification_straight_to_dlq() {
        let fx = fixture(true);
        fx.users.add_push_token("u2", "tok-A");

        let mut env = notification_envelope("n1", "u2", "new_message");
        if let EnvelopePayload::Notification(p) = &mut env.payload {
            p.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
        }
        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &env).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        assert!(fx.push.calls.lock().is_empty());
        assert_eq!(fx.broker.queue_len(NOTIFICATION_DLQ).await.unwrap(), 1);
        assert_eq!(fx.worker.state.counters.snapshot().retried, 0);
    }

    #[tokio::test]
    async fn test_missing_user_id_is_validation_error() {
        let fx = fixture(true);
        let mut env = notification_envelope("n1", "u2", "new_message");
        if let EnvelopePayload::Notification(p) = &mut env.payload {
            p.user_id = None;
        }
        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &env).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();
        assert_eq!(fx.broker.queue_len(NOTIFICATION_DLQ).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_kind_envelope_dead_letters() {
        let fx = fixture(true);
        let env = Envelope::new(EnvelopePayload::SendMessage(SendMessagePayload {
            id: "m1".to_string(),
            chat_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            content: Some("hi".to_string()),
            message_type: "text".to_string(),
            media_urls: vec![],
            reply_to: None,
        }));
        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &env).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();
        assert_eq!(fx.broker.queue_len(NOTIFICATION_DLQ).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_failure_retries_then_falls_back_to_push() {
        let fx = fixture(true);
        fx.users.add_push_token("u2", "tok-A");
        // 会话已注册但接收端已丢弃：第一次投递在 socket 上失败
        // A registered session with a dropped receiver: the first try fails on socket
        let session = fx.fanout.register("u2", "s1");
        drop(session);

        let delivery = push_and_take(&fx, NOTIFICATION_QUEUE, &notification_envelope("n1", "u2", "new_message")).await;
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();
        assert_eq!(fx.worker.state.counters.snapshot().retried, 1);

        let delivery = fx
            .broker
            .pop_blocking(NOTIFICATION_QUEUE, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        fx.worker.process_delivery(delivery, NOTIFICATION_QUEUE).await.unwrap();

        let record = fx.notifications.get("n1").await.unwrap().unwrap();
        assert_eq!(record.delivered_via, Some(DeliveredVia::Push));
        assert_eq!(fx.push.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_lane_drains_before_normal() {
        let fx = fixture(true);
        let mut session = fx.fanout.register("u2", "s1");

        fx.broker
            .push(NOTIFICATION_QUEUE, &notification_envelope("slow", "u2", "new_message").to_bytes().unwrap())
            .await
            .unwrap();
        for id in ["urgent-1", "urgent-2"] {
            let env = notification_envelope(id, "u2", "new_message").with_priority(Priority::Urgent);
            fx.broker
                .push(NOTIFICATION_PRIORITY_QUEUE, &env.to_bytes().unwrap())
                .await
                .unwrap();
        }

        let handle = tokio::spawn(fx.worker.clone().run());
        let mut order = Vec::new();
        for _ in 0..3 {
            let received = tokio::time::timeout(Duration::from_secs(30), session.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(received.notification.id);
        }
        assert_eq!(order, vec!["urgent-1", "urgent-2", "slow"]);

        fx.worker.state.stop();
        fx.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefs_cache_expires() {
        let cache = PrefsCache::new(Duration::from_secs(30));
        let mut prefs = NotificationPrefs::default();
        prefs.quiet_hours = QuietHours {
            enabled: true,
            start: "08:00".to_string(),
            end: "09:00".to_string(),
        };
        cache.put("u2", prefs);
        assert!(cache.get("u2").is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("u2").is_none());
    }
}
