//! worker 公共机制 / Shared worker machinery
//!
//! 两个 worker 共用的部分：状态与计数器、指数退避重试、死信投递、
//! 可被关停信号打断的延迟。重试采取延迟后重新入队，弹出循环永不被
//! 重试占住。
//! What both workers share: state and counters, exponential-backoff retry,
//! dead-letter parking, and shutdown-interruptible delays. Retries re-enqueue
//! after the delay elapses, so the pop loop is never held by a retry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, warn};
use uuid::Uuid;

use crate::broker::QueueBroker;
use crate::error::{DispatchError, DispatchResult};

pub mod message;
pub mod notification;

pub use message::MessageWorker;
pub use notification::NotificationWorker;

/// worker 运行计数 / Worker run counters
#[derive(Default)]
pub struct WorkerCounters {
    pub processed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub suppressed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterSnapshot {
    pub processed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub suppressed: u64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

/// worker 共享状态 / Shared worker state
pub struct WorkerState {
    pub worker_id: String,
    processing: AtomicBool,
    pub counters: WorkerCounters,
}

impl WorkerState {
    pub fn new(role: &str) -> Self {
        Self {
            worker_id: format!("{}-{}", role, Uuid::new_v4()),
            processing: AtomicBool::new(true),
            counters: WorkerCounters::default(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// 停止接收新信封，在途的处理完为止 / Stop taking new envelopes, in-flight ones finish
    pub fn stop(&self) {
        self.processing.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.processing.store(true, Ordering::SeqCst);
    }
}

/// 死信记录 / Dead-letter record
///
/// 原信封加失败上下文，整体作为 DLQ 条目落盘。
/// The original envelope plus failure context, parked as one DLQ entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub envelope: serde_json::Value,
    pub error: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub failed_at: DateTime<Utc>,
    pub worker_id: String,
}

/// 第 n 次失败后的退避时长：2^n 秒
/// Backoff after the nth failure: 2^n seconds
pub fn backoff_delay(retry_count: u32) -> Duration {
    Duration::from_secs(1u64 << retry_count.min(16))
}

/// 可中断延迟；true 表示睡满，false 表示关停信号先到
/// Interruptible delay; true means the full sleep ran, false means shutdown won
pub async fn delay_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) => !*shutdown.borrow_and_update(),
            // 发送端没了按关停处理 / A dropped sender counts as shutdown
            Err(_) => false,
        },
    }
}

/// 存储调用统一超时，超时按可重试的传输失败处理
/// Uniform store-call timeout; elapsing counts as a retriable transport failure
pub(crate) async fn timed<T>(
    limit_ms: u64,
    fut: impl Future<Output = DispatchResult<T>>,
) -> DispatchResult<T> {
    tokio::time::timeout(Duration::from_millis(limit_ms), fut).await?
}

/// 失败处理结果 / Failure handling outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    /// 已安排延迟重投 / A delayed re-injection has been scheduled
    Retried,
    /// 已进死信队列 / Parked in the dead-letter queue
    DeadLettered,
}

/// 公共失败路径 / Common failure path
///
/// 可重试且预算未用尽：延迟后把 retryCount+1 的副本重新入队，入队成功后
/// 才确认原条目，中途崩溃由启动恢复兜底。其余情况直接进死信队列。
/// Retriable with budget left: a copy with retryCount+1 re-enqueues after the
/// delay, and the original is acknowledged only once the copy is in; a crash
/// in between is covered by startup recovery. Everything else goes straight
/// to the dead-letter queue.
pub(crate) async fn handle_failure(
    broker: &Arc<dyn QueueBroker>,
    state: &Arc<WorkerState>,
    max_retries: u32,
    origin_queue: &str,
    dlq: &str,
    envelope: crate::domain::Envelope,
    token: u64,
    error: &DispatchError,
    shutdown: &watch::Receiver<bool>,
) -> DispatchResult<FailureOutcome> {
    if error.is_retriable() && envelope.retry_count < max_retries {
        let delay = backoff_delay(envelope.retry_count);
        let mut retry = envelope;
        retry.retry_count += 1;
        let bytes = retry
            .to_bytes()
            .map_err(|e| DispatchError::fatal(format!("重试信封序列化失败 / retry envelope serialization failed: {}", e)))?;

        warn!(
            "⏳ 处理失败，{}s 后第 {} 次重试 / Handler failed, retry {} in {}s: kind={} error={}",
            delay.as_secs(),
            retry.retry_count,
            retry.retry_count,
            delay.as_secs(),
            retry.kind(),
            error
        );
        state.counters.retried.fetch_add(1, Ordering::Relaxed);

        let broker = Arc::clone(broker);
        let origin = origin_queue.to_string();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            // 关停时立即冲刷，信封不跨停机丢失
            // Shutdown flushes immediately so the envelope survives the stop
            delay_or_shutdown(delay, &mut shutdown).await;
            if let Err(e) = broker.push(&origin, &bytes).await {
                error!("❌ 重试信封入队失败 / Failed to enqueue retry envelope: {}", e);
                return;
            }
            if let Err(e) = broker.ack(&origin, token).await {
                warn!("⚠️  原条目确认失败 / Failed to ack the retried entry: {}", e);
            }
        });
        Ok(FailureOutcome::Retried)
    } else {
        let dead = DeadLetter {
            envelope: serde_json::to_value(&envelope)
                .map_err(|e| DispatchError::fatal(format!("死信序列化失败 / dead letter serialization failed: {}", e)))?,
            error: error.to_string(),
            failed_at: Utc::now(),
            worker_id: state.worker_id.clone(),
        };
        let bytes = serde_json::to_vec(&dead)
            .map_err(|e| DispatchError::fatal(format!("死信序列化失败 / dead letter serialization failed: {}", e)))?;
        broker.push(dlq, &bytes).await?;
        broker.ack(origin_queue, token).await?;
        state.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        error!(
            "💀 信封进入死信队列 / Envelope dead-lettered: kind={} retries={} error={}",
            dead.envelope.get("kind").and_then(|k| k.as_str()).unwrap_or("?"),
            envelope_retry_count(&dead.envelope),
            error
        );
        Ok(FailureOutcome::DeadLettered)
    }
}

fn envelope_retry_count(envelope: &serde_json::Value) -> u64 {
    envelope.get("retryCount").and_then(|c| c.as_u64()).unwrap_or(0)
}

/// 无法解码的原始负载直接进死信队列 / Undecodable raw payloads park straight in the DLQ
pub(crate) async fn dead_letter_raw(
    broker: &Arc<dyn QueueBroker>,
    state: &Arc<WorkerState>,
    origin_queue: &str,
    dlq: &str,
    raw: &[u8],
    token: u64,
    error: &str,
) -> DispatchResult<()> {
    let dead = DeadLetter {
        envelope: serde_json::json!({ "raw": String::from_utf8_lossy(raw) }),
        error: error.to_string(),
        failed_at: Utc::now(),
        worker_id: state.worker_id.clone(),
    };
    let bytes = serde_json::to_vec(&dead)
        .map_err(|e| DispatchError::fatal(format!("死信序列化失败 / dead letter serialization failed: {}", e)))?;
    broker.push(dlq, &bytes).await?;
    broker.ack(origin_queue, token).await?;
    state.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    error!("💀 无法解码的信封 / Undecodable envelope dead-lettered: {}", error);
    Ok(())
}
