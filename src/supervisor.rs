//! Supervisor - worker 的属主 / Supervisor - owner of the workers
//!
//! 启动时回收上次运行遗留的在途信封，拉起两个 worker 循环并在致命错误后
//! 重启它们，把 SIGINT/SIGTERM 接到关停通道，按各自的宽限期等待在途
//! 处理收尾，最后关闭 broker。
//! Recovers in-flight envelopes left by the previous run, spawns both worker
//! loops and restarts them after fatal errors, wires SIGINT/SIGTERM to the
//! shutdown channel, waits each worker's grace window for in-flight handlers,
//! then closes the broker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::{
    QueueBroker, MESSAGE_DLQ, MESSAGE_QUEUE, NOTIFICATION_DLQ, NOTIFICATION_PRIORITY_QUEUE,
    NOTIFICATION_QUEUE,
};
use crate::config::{PushConfig, WorkerConfig};
use crate::error::DispatchResult;
use crate::fanout::{PresenceService, SocketFanout};
use crate::push::PushTransport;
use crate::store::{MessageStore, NotificationStore, UserStore};
use crate::worker::{delay_or_shutdown, MessageWorker, NotificationWorker, WorkerState};

/// 致命退出后的重启间隔 / Delay before restarting a fatally exited worker
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// 关停宽限期 / Shutdown grace windows
const MESSAGE_GRACE: Duration = Duration::from_secs(1);
const NOTIFICATION_GRACE: Duration = Duration::from_secs(2);

const ALL_QUEUES: [&str; 5] = [
    MESSAGE_QUEUE,
    MESSAGE_DLQ,
    NOTIFICATION_QUEUE,
    NOTIFICATION_PRIORITY_QUEUE,
    NOTIFICATION_DLQ,
];

/// 程序内关停控制柄 / In-process shutdown handle
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub struct DispatchSupervisor {
    broker: Arc<dyn QueueBroker>,
    message_worker: MessageWorker,
    notification_worker: NotificationWorker,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DispatchSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        messages: Arc<dyn MessageStore>,
        notifications: Arc<dyn NotificationStore>,
        users: Arc<dyn UserStore>,
        presence: Arc<dyn PresenceService>,
        fanout: Option<Arc<dyn SocketFanout>>,
        push: Option<Arc<dyn PushTransport>>,
        worker_cfg: WorkerConfig,
        push_cfg: PushConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let message_worker = MessageWorker::new(
            Arc::clone(&broker),
            messages,
            Arc::clone(&notifications),
            Arc::clone(&presence),
            worker_cfg.clone(),
            shutdown_rx.clone(),
        );
        let notification_worker = NotificationWorker::new(
            Arc::clone(&broker),
            notifications,
            users,
            presence,
            fanout,
            push,
            worker_cfg,
            push_cfg,
            shutdown_rx.clone(),
        );
        Self {
            broker,
            message_worker,
            notification_worker,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn message_state(&self) -> Arc<WorkerState> {
        self.message_worker.state()
    }

    pub fn notification_state(&self) -> Arc<WorkerState> {
        self.notification_worker.state()
    }

    /// 运行到收到关停信号为止 / Runs until a shutdown signal arrives
    pub async fn run(self) -> DispatchResult<()> {
        info!(
            "🚀 调度 supervisor 启动 / Dispatch supervisor starting: mw={} nw={}",
            self.message_worker.state().worker_id,
            self.notification_worker.state().worker_id
        );
        self.recover_inflight().await?;

        let message_handle = spawn_supervised(
            "message-worker",
            self.message_worker.clone(),
            |w: MessageWorker| w.run(),
            Arc::clone(&self.broker),
            &[MESSAGE_QUEUE],
            self.shutdown_rx.clone(),
        );
        let notification_handle = spawn_supervised(
            "notification-worker",
            self.notification_worker.clone(),
            |w: NotificationWorker| w.run(),
            Arc::clone(&self.broker),
            &[NOTIFICATION_PRIORITY_QUEUE, NOTIFICATION_QUEUE],
            self.shutdown_rx.clone(),
        );

        self.wait_for_shutdown().await;

        info!("🛑 开始优雅关停 / Graceful shutdown begins");
        self.message_worker.state().stop();
        self.notification_worker.state().stop();
        let _ = self.shutdown_tx.send(true);

        graceful_join("message-worker", message_handle, MESSAGE_GRACE).await;
        graceful_join("notification-worker", notification_handle, NOTIFICATION_GRACE).await;

        self.broker.close().await?;
        info!(
            "✅ 干净退出 / Clean shutdown: message {:?} notification {:?}",
            self.message_worker.state().counters.snapshot(),
            self.notification_worker.state().counters.snapshot()
        );
        Ok(())
    }

    /// 上次运行崩溃时留在在途列表的信封回到队头
    /// Envelopes stranded in flight by a crashed run go back to the head
    async fn recover_inflight(&self) -> DispatchResult<()> {
        for queue in ALL_QUEUES {
            let recovered = self.broker.requeue_inflight(queue).await?;
            if recovered > 0 {
                info!("🧹 启动恢复 / Startup recovery: {} in-flight entries requeued on {}", recovered, queue);
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    async fn wait_for_shutdown(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut rx = self.shutdown_rx.clone();
        if *rx.borrow() {
            return;
        }
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("⌨️  收到 SIGINT / SIGINT received"),
                    _ = sigterm.recv() => info!("📨 收到 SIGTERM / SIGTERM received"),
                    _ = rx.changed() => info!("📨 收到程序内关停请求 / In-process shutdown requested"),
                }
            }
            Err(e) => {
                warn!("⚠️  SIGTERM 监听注册失败 / Could not register SIGTERM handler: {}", e);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("⌨️  收到 SIGINT / SIGINT received"),
                    _ = rx.changed() => info!("📨 收到程序内关停请求 / In-process shutdown requested"),
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_rx.clone();
        if *rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("⌨️  收到 SIGINT / SIGINT received"),
            _ = rx.changed() => info!("📨 收到程序内关停请求 / In-process shutdown requested"),
        }
    }
}

/// 带重启的 worker 任务 / Worker task with restart supervision
///
/// 循环以 Ok 结束表示正常关停；以 Err 结束表示致命错误，等待重启间隔后
/// 先回收该 worker 队列的在途信封再重跑。
/// An Ok exit is a normal shutdown; an Err exit is fatal, and after the
/// restart delay the worker's in-flight envelopes are requeued before rerun.
fn spawn_supervised<W, F, Fut>(
    name: &'static str,
    worker: W,
    run: F,
    broker: Arc<dyn QueueBroker>,
    queues: &'static [&'static str],
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    W: Clone + Send + 'static,
    F: Fn(W) -> Fut + Send + 'static,
    Fut: Future<Output = DispatchResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match run(worker.clone()).await {
                Ok(()) => break,
                Err(e) => {
                    error!("🔥 {} 因致命错误退出 / {} exited on a fatal error: {}", name, name, e);
                    if !delay_or_shutdown(RESTART_DELAY, &mut shutdown).await {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    for queue in queues {
                        match broker.requeue_inflight(queue).await {
                            Ok(n) if n > 0 => {
                                info!("🧹 重启回收 / Restart recovery: {} entries requeued on {}", n, queue);
                            }
                            Ok(_) => {}
                            Err(re) => warn!("⚠️  重启回收失败 / Requeue on restart failed: {}", re),
                        }
                    }
                    info!("🔁 重启 {} / Restarting {}", name, name);
                }
            }
        }
    })
}

/// 宽限期内等 worker 任务收尾，超时则强制中止
/// Waits the grace window for the worker task, aborting past it
async fn graceful_join(name: &'static str, mut handle: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(())) => info!("✅ {} 已退出 / {} exited", name, name),
        Ok(Err(e)) => error!("❌ {} 任务异常结束 / {} join error: {}", name, name, e),
        Err(_) => {
            warn!("⚠️  {} 未在宽限期内退出，强制中止 / {} missed the grace window, aborting", name, name);
            handle.abort();
        }
    }
}
