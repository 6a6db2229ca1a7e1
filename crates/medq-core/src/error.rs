//! 错误定义模块

use thiserror::Error;
use uuid::Uuid;

/// 排队引擎统一错误类型
#[derive(Error, Debug)]
pub enum MedqError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("权限错误: {0}")]
    Permission(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 叫号顺序冲突，`next` 为当前应当接诊的条目
    #[error("叫号顺序错误: 条目 {requested} 不是下一位, 下一位为 {next}")]
    OutOfOrder { requested: Uuid, next: Uuid },

    #[error("并发冲突: {0}")]
    Conflict(String),

    #[error("无效状态转换: 从 {from} 经 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("队列 {queue} 正在服务条目 {current}")]
    QueueOccupied { queue: String, current: Uuid },

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// 错误分类，供边界层映射响应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    OutOfOrder,
    Conflict,
    State,
    Permission,
    Infrastructure,
}

impl MedqError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MedqError::Validation(_) => ErrorKind::Validation,
            MedqError::NotFound(_) => ErrorKind::NotFound,
            MedqError::OutOfOrder { .. } => ErrorKind::OutOfOrder,
            MedqError::Conflict(_) => ErrorKind::Conflict,
            MedqError::InvalidStateTransition { .. } | MedqError::QueueOccupied { .. } => {
                ErrorKind::State
            }
            MedqError::Permission(_) => ErrorKind::Permission,
            MedqError::Config(_)
            | MedqError::Database(_)
            | MedqError::Serialization(_)
            | MedqError::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// 只有瞬时的并发冲突可以在内部重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, MedqError::Conflict(_))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for MedqError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                MedqError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => MedqError::NotFound(err.to_string()),
            _ => MedqError::Database(err.to_string()),
        }
    }
}

/// 排队引擎统一结果类型
pub type Result<T> = std::result::Result<T, MedqError>;
