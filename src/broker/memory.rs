use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, QueueBroker};
use crate::error::{DispatchError, DispatchResult};

/// 内存队列代理 - 测试与单机开发用
/// In-memory queue broker - for tests and single-node development
///
/// 与持久化后端保持完全相同的 FIFO/在途语义
/// Keeps exactly the FIFO/in-flight semantics of the durable backend
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    wakeups: DashMap<String, Arc<Notify>>,
    next_token: AtomicU64,
    closed: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Vec<u8>)>,
    inflight: BTreeMap<u64, Vec<u8>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                wakeups: DashMap::new(),
                next_token: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn wakeup(&self, queue: &str) -> Arc<Notify> {
        self.inner
            .wakeups
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn ensure_open(&self) -> DispatchResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::transport("broker closed"));
        }
        Ok(())
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn push(&self, queue: &str, payload: &[u8]) -> DispatchResult<()> {
        self.ensure_open()?;
        let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
        {
            let mut queues = self.inner.queues.lock();
            queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back((token, payload.to_vec()));
        }
        self.wakeup(queue).notify_one();
        Ok(())
    }

    async fn push_bulk(&self, entries: Vec<(String, Vec<u8>)>) -> DispatchResult<usize> {
        self.ensure_open()?;
        let count = entries.len();
        let mut touched: Vec<String> = Vec::new();
        {
            let mut queues = self.inner.queues.lock();
            for (queue, payload) in entries {
                let token = self.inner.next_token.fetch_add(1, Ordering::SeqCst);
                queues
                    .entry(queue.clone())
                    .or_default()
                    .ready
                    .push_back((token, payload));
                if !touched.contains(&queue) {
                    touched.push(queue);
                }
            }
        }
        for queue in touched {
            self.wakeup(&queue).notify_one();
        }
        Ok(count)
    }

    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> DispatchResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let notify = self.wakeup(queue);
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            {
                let mut queues = self.inner.queues.lock();
                if let Some(state) = queues.get_mut(queue) {
                    if let Some((token, bytes)) = state.ready.pop_front() {
                        state.inflight.insert(token, bytes.clone());
                        return Ok(Some(Delivery { bytes, token }));
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // notify_one 在无等待者时会留下一个许可，不会丢失唤醒
            // notify_one leaves a permit when nobody waits, so no wakeup is lost
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    async fn ack(&self, queue: &str, token: u64) -> DispatchResult<()> {
        let mut queues = self.inner.queues.lock();
        if let Some(state) = queues.get_mut(queue) {
            state.inflight.remove(&token);
        }
        Ok(())
    }

    async fn requeue_inflight(&self, queue: &str) -> DispatchResult<usize> {
        let moved = {
            let mut queues = self.inner.queues.lock();
            match queues.get_mut(queue) {
                Some(state) => {
                    let inflight = std::mem::take(&mut state.inflight);
                    let moved = inflight.len();
                    // 令牌单调递增，逆序插到队首可保持原始顺序
                    // Tokens increase monotonically; reverse push_front keeps order
                    for (token, bytes) in inflight.into_iter().rev() {
                        state.ready.push_front((token, bytes));
                    }
                    moved
                }
                None => 0,
            }
        };
        if moved > 0 {
            self.wakeup(queue).notify_one();
        }
        Ok(moved)
    }

    async fn queue_len(&self, queue: &str) -> DispatchResult<usize> {
        let queues = self.inner.queues.lock();
        Ok(queues.get(queue).map(|s| s.ready.len()).unwrap_or(0))
    }

    async fn peek(&self, queue: &str, limit: usize) -> DispatchResult<Vec<Vec<u8>>> {
        let queues = self.inner.queues.lock();
        Ok(queues
            .get(queue)
            .map(|s| s.ready.iter().take(limit).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> DispatchResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        for entry in self.inner.wakeups.iter() {
            entry.value().notify_waiters();
        }
        Ok(())
    }
}
