//! 队列代理 - 持久化 FIFO 队列抽象
//! Queue broker - durable FIFO queue abstraction
//!
//! 提供 at-least-once 语义：pop 将条目移入在途列表，处理成功后 ack 删除；
//! worker 崩溃后遗留的在途条目在下次启动时回队。
//! At-least-once semantics: pop moves an entry onto the in-flight list and a
//! successful handler acks it away; entries left in flight by a crashed
//! worker are requeued on the next startup.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::DispatchResult;

mod memory;
mod sled_backend;

pub use memory::MemoryBroker;
pub use sled_backend::SledBroker;

/// 稳定的队列标识 / Stable queue identifiers
pub const MESSAGE_QUEUE: &str = "message_queue";
pub const MESSAGE_DLQ: &str = "message_queue_dlq";
pub const NOTIFICATION_QUEUE: &str = "notification_queue";
pub const NOTIFICATION_PRIORITY_QUEUE: &str = "notification_queue_priority";
pub const NOTIFICATION_DLQ: &str = "notification_queue_dlq";

/// 一次出队交付：ack 前条目停留在在途列表
/// A single delivery: the entry stays in flight until acked
#[derive(Debug, Clone)]
pub struct Delivery {
    pub bytes: Vec<u8>,
    pub token: u64,
}

/// 队列代理接口，便于测试替换 / Broker interface, swappable for tests
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// 尾部追加，返回时已持久化 / Append at tail, persisted before return
    async fn push(&self, queue: &str, payload: &[u8]) -> DispatchResult<()>;

    /// 批量追加（流水线化）/ Pipelined bulk append
    async fn push_bulk(&self, entries: Vec<(String, Vec<u8>)>) -> DispatchResult<usize>;

    /// 头部阻塞弹出，超时返回 None；弹出的条目进入在途列表
    /// Blocking head pop, None on timeout; the entry moves to the in-flight list
    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> DispatchResult<Option<Delivery>>;

    /// 确认交付，从在途列表删除 / Acknowledge, drop from the in-flight list
    async fn ack(&self, queue: &str, token: u64) -> DispatchResult<()>;

    /// 启动恢复：把上次运行遗留的在途条目移回队列头部区域
    /// Startup recovery: move entries left in flight back to the head region
    async fn requeue_inflight(&self, queue: &str) -> DispatchResult<usize>;

    /// 近似长度 / Approximate length
    async fn queue_len(&self, queue: &str) -> DispatchResult<usize>;

    /// 只读窥视队首条目（死信巡检用）/ Non-destructive peek (DLQ inspection)
    async fn peek(&self, queue: &str, limit: usize) -> DispatchResult<Vec<Vec<u8>>>;

    /// 刷盘并释放后端连接 / Flush and release the backend connection
    async fn close(&self) -> DispatchResult<()>;
}
