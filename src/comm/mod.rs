/// 通用基础模块
/// Common foundation module

pub mod config;
pub mod tracing;

pub use config::{get_global_config_manager, init_global_config, ConfigManager};
pub use tracing::init_tracing;
