use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use v_connect_dispatch::broker::{MemoryBroker, QueueBroker, SledBroker};
use v_connect_dispatch::fanout::{LocalSocketFanout, PresenceService, SocketFanout};
use v_connect_dispatch::push::{HttpPushTransport, PushTransport};
use v_connect_dispatch::store::{
    MemoryMessageStore, MemoryNotificationStore, MemoryUserStore, MessageStore, NotificationStore,
    UserStore,
};
use v_connect_dispatch::{config, init_global_config, init_tracing, DispatchSupervisor};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-connect-dispatch async delivery pipeline", long_about = None)]
struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML 自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

/// 干净关停以 0 退出，启动失败由 anyhow 带着错误链以 1 退出
/// A clean shutdown exits 0; startup failures exit 1 with the anyhow chain
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 配置先于日志，日志级别取自 logging.level
    // Config before logging; the level comes from logging.level
    init_global_config(args.config.as_deref())?;
    init_tracing()?;

    info!("🎯 v-connect-dispatch 启动 / Starting v-connect-dispatch...");
    if let Some(path) = &args.config {
        info!("🔧 加载配置文件 / Loaded config file: {}", path);
    }

    let cfg = config::load()?;
    let broker: Arc<dyn QueueBroker> = match cfg.broker.backend.as_str() {
        "memory" => {
            info!("🗄️  队列后端 / Queue backend: memory (non-durable)");
            Arc::new(MemoryBroker::new())
        }
        _ => {
            info!("🗄️  队列后端 / Queue backend: sled ({})", cfg.broker.path);
            Arc::new(SledBroker::open(&cfg.broker.path)?)
        }
    };

    let fanout = Arc::new(LocalSocketFanout::new());
    let push: Option<Arc<dyn PushTransport>> = if cfg.push.enabled {
        info!("📲 推送网关 / Push gateway: {}", cfg.push.endpoint);
        Some(Arc::new(HttpPushTransport::new(
            &cfg.push.endpoint,
            &cfg.push.server_key,
            Duration::from_millis(cfg.push.timeout_ms),
        )?))
    } else {
        info!("📲 推送通道未启用 / Push channel disabled");
        None
    };

    let supervisor = DispatchSupervisor::new(
        broker,
        Arc::new(MemoryMessageStore::new()) as Arc<dyn MessageStore>,
        Arc::new(MemoryNotificationStore::new()) as Arc<dyn NotificationStore>,
        Arc::new(MemoryUserStore::new()) as Arc<dyn UserStore>,
        fanout.clone() as Arc<dyn PresenceService>,
        Some(fanout as Arc<dyn SocketFanout>),
        push,
        cfg.worker,
        cfg.push,
    );
    supervisor.run().await?;
    Ok(())
}
