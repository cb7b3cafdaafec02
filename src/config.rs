//! 运行配置 / Runtime configuration
//!
//! 从全局配置管理器读取类型化配置，所有键都有默认值，default.toml 给出
//! 同一组值的文件形式。
//! Typed configuration read from the global manager; every key has a
//! default, and default.toml ships the same values in file form.

use anyhow::Result;

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub push: PushConfig,
}

/// 队列后端 / Queue backend
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// "sled" 或 "memory" / "sled" or "memory"
    pub backend: String,
    pub path: String,
}

/// worker 节奏与重试预算 / Worker pacing and retry budget
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub max_retries: u32,
    pub pop_timeout_ms: u64,
    pub idle_sleep_ms: u64,
    pub error_sleep_ms: u64,
    /// 回执信封入队前的延迟，用于聚合送达 / Bias before the receipt envelope, batching deliveries
    pub delivery_bias_ms: u64,
    pub store_timeout_ms: u64,
    pub prefs_cache_ttl_secs: u64,
}

/// 推送网关 / Push gateway
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub server_key: String,
    pub icon_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            pop_timeout_ms: 1000,
            idle_sleep_ms: 100,
            error_sleep_ms: 1000,
            delivery_bias_ms: 200,
            store_timeout_ms: 2000,
            prefs_cache_ttl_secs: 30,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            server_key: String::new(),
            icon_url: None,
            timeout_ms: 5000,
        }
    }
}

pub fn load() -> Result<DispatchConfig> {
    let cm = crate::comm::get_global_config_manager()?;
    Ok(DispatchConfig {
        broker: BrokerConfig {
            backend: cm.get_or("broker.backend", "sled".to_string()),
            path: cm.get_or("broker.path", "data/dispatch".to_string()),
        },
        worker: WorkerConfig {
            max_retries: cm.get_or("worker.max_retries", 3_i64) as u32,
            pop_timeout_ms: cm.get_or("worker.pop_timeout_ms", 1000_i64) as u64,
            idle_sleep_ms: cm.get_or("worker.idle_sleep_ms", 100_i64) as u64,
            error_sleep_ms: cm.get_or("worker.error_sleep_ms", 1000_i64) as u64,
            delivery_bias_ms: cm.get_or("worker.delivery_bias_ms", 200_i64) as u64,
            store_timeout_ms: cm.get_or("worker.store_timeout_ms", 2000_i64) as u64,
            prefs_cache_ttl_secs: cm.get_or("worker.prefs_cache_ttl_secs", 30_i64) as u64,
        },
        push: PushConfig {
            enabled: cm.get_or("push.enabled", false),
            endpoint: cm.get_or("push.endpoint", String::new()),
            server_key: cm.get_or("push.server_key", String::new()),
            icon_url: cm.get::<String>("push.icon_url").ok(),
            timeout_ms: cm.get_or("push.timeout_ms", 5000_i64) as u64,
        },
    })
}
