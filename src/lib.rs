// v-connect-dispatch 库主入口，按需导出模块
// Library entry of v-connect-dispatch, exporting modules as needed

pub mod comm;
pub use crate::comm::config::{get_global_config_manager, init_global_config, ConfigManager};
pub use crate::comm::tracing::init_tracing;

pub mod api;
pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod push;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use crate::api::{MessageQueueApi, NotificationQueueApi, QueueStats};
pub use crate::broker::{MemoryBroker, QueueBroker, SledBroker};
pub use crate::config::DispatchConfig;
pub use crate::domain::{Envelope, EnvelopePayload, NotificationPayload, Priority};
pub use crate::error::{DispatchError, DispatchResult};
pub use crate::supervisor::{DispatchSupervisor, ShutdownHandle};

// 重新导出 tracing 宏，方便嵌入方使用
// Re-export tracing macros for embedders' convenience
pub use tracing::{debug, error, info, trace, warn};
