use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
#[allow(dead_code)]
pub enum ConfigError {
    #[error("配置文件不存在: {path}")]
    FileNotFound { path: String },
    #[error("配置项 '{key}' 不存在")]
    KeyNotFound { key: String },
    #[error("配置项 '{key}' 类型转换失败: {message}")]
    TypeConversionError { key: String, message: String },
    #[error("配置初始化失败: {message}")]
    InitializationError { message: String },
}

/// 配置管理器
///
/// 配置源按优先级从低到高分层加载，后添加者优先生效：
/// development.toml -> default.toml -> production.toml -> 显式指定文件 -> 环境变量
pub struct ConfigManager {
    config: Config,
}

impl ConfigManager {
    /// 创建配置管理器（仅默认配置源）
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 使用附加配置源创建配置管理器
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();

        let default_sources = vec![
            ConfigSource::File {
                path: "config/development.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: "config/default.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: "config/production.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
        ];

        for source in default_sources.into_iter().chain(sources) {
            // 可选文件不存在时跳过，必需文件不存在时报错
            if let ConfigSource::File { path, required, .. } = &source {
                let exists = std::path::Path::new(path).exists();
                if !exists && !required {
                    continue;
                }
                if !exists && *required {
                    return Err(anyhow!("必需的配置文件不存在: {}", path));
                }
            }
            builder = source.add_to_builder(builder)?;
        }

        // 环境变量始终拥有最高优先级，如 VDISPATCH_BROKER_PATH
        builder = builder.add_source(
            Environment::with_prefix("VDISPATCH")
                .separator("_")
                .prefix_separator("_")
                .ignore_empty(true),
        );

        let config = builder
            .build()
            .map_err(|e| anyhow!("构建配置失败: {}", e))?;
        Ok(Self { config })
    }

    /// 获取指定 key 的配置值
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("获取配置 '{}' 失败: {}", key, e))
    }

    /// 获取指定 key 的配置值，如果不存在返回默认值
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 检查配置项是否存在
    #[allow(dead_code)]
    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<serde_json::Value>(key).is_ok()
    }
}

/// 配置源类型
pub enum ConfigSource {
    /// 文件配置源
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    /// 字符串配置源（测试用）
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File { path, format, required } => {
                let file_source = if let Some(format) = format {
                    File::with_name(&path).format(format)
                } else {
                    File::with_name(&path)
                };
                Ok(builder.add_source(file_source.required(required)))
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

/// 使用显式配置文件初始化全局配置管理器（启动时调用一次）
pub fn init_global_config(config_path: Option<&str>) -> Result<Arc<ConfigManager>> {
    let sources = match config_path {
        Some(path) => vec![ConfigSource::File {
            path: path.to_string(),
            format: None,
            required: true,
        }],
        None => vec![],
    };
    let manager = Arc::new(ConfigManager::with_sources(sources)?);
    let mut global = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败: {}", e))?;
    *global = Some(Arc::clone(&manager));
    Ok(manager)
}

/// 获取全局配置管理器实例（单例模式，未初始化时按默认配置源创建）
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    {
        let manager = GLOBAL_CONFIG_MANAGER
            .read()
            .map_err(|e| anyhow!("读取全局配置管理器锁失败: {}", e))?;
        if let Some(ref config_manager) = *manager {
            return Ok(Arc::clone(config_manager));
        }
    }
    let mut global = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败: {}", e))?;
    if global.is_none() {
        let config_manager = Arc::new(
            ConfigManager::new().map_err(|e| anyhow!("创建配置管理器失败: {}", e))?,
        );
        *global = Some(Arc::clone(&config_manager));
        Ok(config_manager)
    } else {
        Ok(Arc::clone(global.as_ref().unwrap()))
    }
}
