use thiserror::Error;

/// 管道结果类型 / Pipeline result type
pub type DispatchResult<T> = Result<T, DispatchError>;

/// 统一的投递管道错误类型
/// Unified delivery pipeline error type
///
/// 错误分类决定信封的最终去向 / The taxonomy decides where an envelope ends up:
/// - Validation: 不可重试，直接进入死信队列 / non-retriable, straight to the DLQ
/// - Transport: 可重试（broker、store、推送网关的瞬时故障）/ retriable transients
/// - Authorization: 单个推送 token 被拒，不影响其他 token / per-token rejection
/// - Fatal: 程序性错误，由 Supervisor 重启 worker / programmer error, worker restart
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("验证错误: {message}")]
    Validation { message: String },

    #[error("传输错误: {message}")]
    Transport { message: String },

    #[error("推送授权错误: {message}")]
    Authorization { message: String },

    #[error("致命错误: {message}")]
    Fatal { message: String },
}

impl DispatchError {
    /// 创建验证错误
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// 创建传输错误
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// 创建授权错误
    pub fn authorization<T: Into<String>>(message: T) -> Self {
        Self::Authorization {
            message: message.into(),
        }
    }

    /// 创建致命错误
    pub fn fatal<T: Into<String>>(message: T) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// 稍后重试是否可能成功 / Whether a later retry could plausibly succeed
    pub fn is_retriable(&self) -> bool {
        matches!(self, DispatchError::Transport { .. })
    }

    /// 是否为致命错误（需要重启 worker）
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Fatal { .. })
    }
}

impl From<sled::Error> for DispatchError {
    fn from(e: sled::Error) -> Self {
        DispatchError::transport(format!("sled: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for DispatchError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DispatchError::transport("operation timed out")
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        DispatchError::transport(format!("http: {}", e))
    }
}
