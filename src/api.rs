//! 进程内生产者 API / In-process producer API
//!
//! 与 worker 共享 broker 和状态的轻量句柄：入队、批量入队、队列统计、
//! 死信巡检。入队在写入时盖上 enqueuedAt，新信封的 retryCount 恒为 0。
//! Thin handles sharing the broker and worker state: enqueue, bulk enqueue,
//! queue stats, dead-letter inspection. Enqueue stamps enqueuedAt on write;
//! fresh envelopes always carry retryCount 0.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broker::{
    QueueBroker, MESSAGE_DLQ, MESSAGE_QUEUE, NOTIFICATION_DLQ, NOTIFICATION_PRIORITY_QUEUE,
    NOTIFICATION_QUEUE,
};
use crate::domain::{Envelope, EnvelopePayload, NotificationPayload};
use crate::error::{DispatchError, DispatchResult};
use crate::worker::{CounterSnapshot, DeadLetter, WorkerState};

/// 队列统计 / Queue statistics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_queue_length: Option<usize>,
    pub dead_letter_queue_length: usize,
    pub worker_id: String,
    pub processing: bool,
    pub counters: CounterSnapshot,
}

/// 消息队列句柄 / Message queue handle
#[derive(Clone)]
pub struct MessageQueueApi {
    broker: Arc<dyn QueueBroker>,
    state: Arc<WorkerState>,
}

impl MessageQueueApi {
    pub fn new(broker: Arc<dyn QueueBroker>, state: Arc<WorkerState>) -> Self {
        Self { broker, state }
    }

    /// 入队一个工作单元，任意 kind / Enqueue one unit of work, any kind
    pub async fn enqueue(&self, payload: EnvelopePayload) -> DispatchResult<()> {
        let env = stamped(payload);
        debug!("📤 消息入队 / Message enqueued: kind={}", env.kind());
        self.broker.push(MESSAGE_QUEUE, &encode(&env)?).await
    }

    pub async fn enqueue_bulk(&self, payloads: Vec<EnvelopePayload>) -> DispatchResult<usize> {
        let mut entries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            entries.push((MESSAGE_QUEUE.to_string(), encode(&stamped(payload))?));
        }
        self.broker.push_bulk(entries).await
    }

    pub async fn stats(&self) -> DispatchResult<QueueStats> {
        Ok(QueueStats {
            queue_length: self.broker.queue_len(MESSAGE_QUEUE).await?,
            priority_queue_length: None,
            dead_letter_queue_length: self.broker.queue_len(MESSAGE_DLQ).await?,
            worker_id: self.state.worker_id.clone(),
            processing: self.state.is_processing(),
            counters: self.state.counters.snapshot(),
        })
    }

    /// 只读窥视死信 / Non-destructive dead-letter peek
    pub async fn dead_letters(&self, limit: usize) -> DispatchResult<Vec<DeadLetter>> {
        peek_dead_letters(&self.broker, MESSAGE_DLQ, limit).await
    }
}

/// 通知队列句柄 / Notification queue handle
///
/// 只接受通知负载；通道按负载优先级选择，high/urgent 走优先通道。
/// Accepts notification payloads only; the lane follows the payload priority,
/// with high/urgent taking the priority lane.
#[derive(Clone)]
pub struct NotificationQueueApi {
    broker: Arc<dyn QueueBroker>,
    state: Arc<WorkerState>,
}

impl NotificationQueueApi {
    pub fn new(broker: Arc<dyn QueueBroker>, state: Arc<WorkerState>) -> Self {
        Self { broker, state }
    }

    pub async fn enqueue(&self, payload: NotificationPayload) -> DispatchResult<()> {
        let env = stamped(EnvelopePayload::Notification(payload));
        let queue = lane_for(&env);
        debug!("📤 通知入队 / Notification enqueued via {}", queue);
        self.broker.push(queue, &encode(&env)?).await
    }

    pub async fn enqueue_bulk(&self, payloads: Vec<NotificationPayload>) -> DispatchResult<usize> {
        let mut entries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let env = stamped(EnvelopePayload::Notification(payload));
            entries.push((lane_for(&env).to_string(), encode(&env)?));
        }
        self.broker.push_bulk(entries).await
    }

    pub async fn stats(&self) -> DispatchResult<QueueStats> {
        Ok(QueueStats {
            queue_length: self.broker.queue_len(NOTIFICATION_QUEUE).await?,
            priority_queue_length: Some(self.broker.queue_len(NOTIFICATION_PRIORITY_QUEUE).await?),
            dead_letter_queue_length: self.broker.queue_len(NOTIFICATION_DLQ).await?,
            worker_id: self.state.worker_id.clone(),
            processing: self.state.is_processing(),
            counters: self.state.counters.snapshot(),
        })
    }

    pub async fn dead_letters(&self, limit: usize) -> DispatchResult<Vec<DeadLetter>> {
        peek_dead_letters(&self.broker, NOTIFICATION_DLQ, limit).await
    }
}

fn stamped(payload: EnvelopePayload) -> Envelope {
    let mut env = Envelope::new(payload);
    env.enqueued_at = Some(Utc::now());
    env
}

fn lane_for(env: &Envelope) -> &'static str {
    if env.effective_priority().takes_priority_lane() {
        NOTIFICATION_PRIORITY_QUEUE
    } else {
        NOTIFICATION_QUEUE
    }
}

fn encode(envelope: &Envelope) -> DispatchResult<Vec<u8>> {
    envelope
        .to_bytes()
        .map_err(|e| DispatchError::fatal(format!("信封序列化失败 / envelope serialization failed: {}", e)))
}

async fn peek_dead_letters(
    broker: &Arc<dyn QueueBroker>,
    dlq: &str,
    limit: usize,
) -> DispatchResult<Vec<DeadLetter>> {
    let mut out = Vec::new();
    for bytes in broker.peek(dlq, limit).await? {
        match serde_json::from_slice::<DeadLetter>(&bytes) {
            Ok(dead) => out.push(dead),
            Err(e) => warn!("⚠️  死信条目无法解析 / Unparseable dead-letter entry on {}: {}", dlq, e),
        }
    }
    Ok(out)
}
