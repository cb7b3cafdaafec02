//! Sled 队列后端 / Sled queue backend
//!
//! 每个队列两棵树：`<queue>` 为就绪条目，`<queue>_inflight` 为在途条目。
//! 键为单调递增的 8 字节大端序列号，键序即 FIFO 顺序；恢复时在途条目带着
//! 原始键移回就绪树，天然排在新条目之前。
//! Two trees per queue: `<queue>` holds ready entries, `<queue>_inflight` the
//! in-flight ones. Keys are monotonically increasing 8-byte big-endian
//! sequence numbers, so key order is FIFO order; recovery moves in-flight
//! entries back with their original keys, which naturally sort before newer
//! entries.

use async_trait::async_trait;
use dashmap::DashMap;
use sled::transaction::TransactionError;
use sled::Transactional;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use super::{Delivery, QueueBroker};
use crate::error::{DispatchError, DispatchResult};

/// 持久化队列代理 / Durable queue broker
#[derive(Clone)]
pub struct SledBroker {
    db: sled::Db,
    trees: Arc<DashMap<String, QueueTrees>>,
    wakeups: Arc<DashMap<String, Arc<Notify>>>,
}

#[derive(Clone)]
struct QueueTrees {
    ready: sled::Tree,
    inflight: sled::Tree,
}

impl SledBroker {
    /// 打开指定路径的队列数据库 / Open the queue database at the given path
    pub fn open(path: &str) -> DispatchResult<Self> {
        let db = sled::open(path)
            .map_err(|e| DispatchError::transport(format!("无法打开队列数据库 / failed to open queue db: {}", e)))?;
        info!("🗄️  队列数据库已打开 / Queue database opened: {}", path);
        Ok(Self {
            db,
            trees: Arc::new(DashMap::new()),
            wakeups: Arc::new(DashMap::new()),
        })
    }

    /// 打开临时数据库（测试用）/ Open a temporary database (tests)
    pub fn open_temporary() -> DispatchResult<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| DispatchError::transport(format!("failed to open temporary queue db: {}", e)))?;
        Ok(Self {
            db,
            trees: Arc::new(DashMap::new()),
            wakeups: Arc::new(DashMap::new()),
        })
    }

    fn trees(&self, queue: &str) -> DispatchResult<QueueTrees> {
        if let Some(found) = self.trees.get(queue) {
            return Ok(found.clone());
        }
        let ready = self.db.open_tree(queue)?;
        let inflight = self.db.open_tree(format!("{}_inflight", queue))?;
        let trees = QueueTrees { ready, inflight };
        self.trees.insert(queue.to_string(), trees.clone());
        Ok(trees)
    }

    fn wakeup(&self, queue: &str) -> Arc<Notify> {
        self.wakeups
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn next_key(&self) -> DispatchResult<[u8; 8]> {
        // generate_id 跨重启单调递增 / generate_id stays monotonic across restarts
        Ok(self.db.generate_id()?.to_be_bytes())
    }

    /// 原子地把队首条目移入在途树 / Atomically move the head entry in flight
    fn try_take_head(&self, trees: &QueueTrees) -> DispatchResult<Option<Delivery>> {
        loop {
            let (key, value) = match trees.ready.first()? {
                Some(head) => head,
                None => return Ok(None),
            };
            let moved: Result<bool, TransactionError<()>> = (&trees.ready, &trees.inflight)
                .transaction(|(ready, inflight)| {
                    match ready.remove(&key)? {
                        Some(val) => {
                            inflight.insert(&key, val)?;
                            Ok(true)
                        }
                        // 另一个消费者抢先取走，重试外层循环
                        // Another consumer won the race, retry the outer loop
                        None => Ok(false),
                    }
                });
            let moved = moved.map_err(|e| DispatchError::transport(format!("sled txn: {:?}", e)))?;
            if moved {
                let mut token_bytes = [0u8; 8];
                token_bytes.copy_from_slice(&key);
                // 此处不刷盘：丢失这次移动只会导致重投，属于设计内行为
                // No flush here: losing the move only causes a redelivery
                return Ok(Some(Delivery {
                    bytes: value.to_vec(),
                    token: u64::from_be_bytes(token_bytes),
                }));
            }
        }
    }
}

#[async_trait]
impl QueueBroker for SledBroker {
    async fn push(&self, queue: &str, payload: &[u8]) -> DispatchResult<()> {
        let trees = self.trees(queue)?;
        let key = self.next_key()?;
        trees.ready.insert(key, payload)?;
        trees.ready.flush()?;
        self.wakeup(queue).notify_one();
        Ok(())
    }

    async fn push_bulk(&self, entries: Vec<(String, Vec<u8>)>) -> DispatchResult<usize> {
        let count = entries.len();
        let mut batches: Vec<(String, sled::Batch)> = Vec::new();
        for (queue, payload) in entries {
            let key = self.next_key()?;
            match batches.iter_mut().find(|(q, _)| *q == queue) {
                Some((_, batch)) => batch.insert(&key, payload),
                None => {
                    let mut batch = sled::Batch::default();
                    batch.insert(&key, payload);
                    batches.push((queue, batch));
                }
            }
        }
        for (queue, batch) in batches {
            let trees = self.trees(&queue)?;
            trees.ready.apply_batch(batch)?;
            trees.ready.flush()?;
            self.wakeup(&queue).notify_one();
        }
        Ok(count)
    }

    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> DispatchResult<Option<Delivery>> {
        let trees = self.trees(queue)?;
        let notify = self.wakeup(queue);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.try_take_head(&trees)? {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    async fn ack(&self, queue: &str, token: u64) -> DispatchResult<()> {
        let trees = self.trees(queue)?;
        trees.inflight.remove(token.to_be_bytes())?;
        trees.inflight.flush()?;
        Ok(())
    }

    async fn requeue_inflight(&self, queue: &str) -> DispatchResult<usize> {
        let trees = self.trees(queue)?;
        let mut moved = 0usize;
        for item in trees.inflight.iter() {
            let (key, value) = item?;
            trees.ready.insert(&key, value)?;
            trees.inflight.remove(&key)?;
            moved += 1;
        }
        if moved > 0 {
            trees.ready.flush()?;
            trees.inflight.flush()?;
            self.wakeup(queue).notify_one();
            info!("♻️  恢复在途条目 / Recovered in-flight entries: {} from {}", moved, queue);
        }
        Ok(moved)
    }

    async fn queue_len(&self, queue: &str) -> DispatchResult<usize> {
        Ok(self.trees(queue)?.ready.len())
    }

    async fn peek(&self, queue: &str, limit: usize) -> DispatchResult<Vec<Vec<u8>>> {
        let trees = self.trees(queue)?;
        let mut out = Vec::new();
        for item in trees.ready.iter().take(limit) {
            let (_, value) = item?;
            out.push(value.to_vec());
        }
        Ok(out)
    }

    async fn close(&self) -> DispatchResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let broker = SledBroker::open_temporary().unwrap();
        broker.push("q", b"one").await.unwrap();
        broker.push("q", b"two").await.unwrap();
        let d1 = broker.pop_blocking("q", Duration::from_millis(10)).await.unwrap().unwrap();
        let d2 = broker.pop_blocking("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(d1.bytes, b"one");
        assert_eq!(d2.bytes, b"two");
    }

    #[tokio::test]
    async fn test_ack_then_recovery_finds_nothing() {
        let broker = SledBroker::open_temporary().unwrap();
        broker.push("q", b"job").await.unwrap();
        let d = broker.pop_blocking("q", Duration::from_millis(10)).await.unwrap().unwrap();
        broker.ack("q", d.token).await.unwrap();
        assert_eq!(broker.requeue_inflight("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inflight_recovery_preserves_head_position() {
        let broker = SledBroker::open_temporary().unwrap();
        broker.push("q", b"first").await.unwrap();
        broker.push("q", b"second").await.unwrap();
        let d = broker.pop_blocking("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(d.bytes, b"first");
        // 不 ack，模拟 worker 崩溃 / No ack, simulating a worker crash
        assert_eq!(broker.requeue_inflight("q").await.unwrap(), 1);
        let again = broker.pop_blocking("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.bytes, b"first");
    }

    #[tokio::test]
    async fn test_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker").to_string_lossy().to_string();
        {
            let broker = SledBroker::open(&path).unwrap();
            broker.push("q", b"persisted").await.unwrap();
            broker.close().await.unwrap();
        }
        let broker = SledBroker::open(&path).unwrap();
        assert_eq!(broker.queue_len("q").await.unwrap(), 1);
        let d = broker.pop_blocking("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(d.bytes, b"persisted");
    }

    #[tokio::test]
    async fn test_bulk_push_is_ordered() {
        let broker = SledBroker::open_temporary().unwrap();
        broker
            .push_bulk(vec![
                ("q".to_string(), b"1".to_vec()),
                ("q".to_string(), b"2".to_vec()),
                ("q".to_string(), b"3".to_vec()),
            ])
            .await
            .unwrap();
        assert_eq!(broker.queue_len("q").await.unwrap(), 3);
        let d = broker.pop_blocking("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(d.bytes, b"1");
    }
}
