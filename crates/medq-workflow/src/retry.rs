//! 乐观并发冲突的有限重试

use medq_core::MedqError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// 重试策略：只重试 [`MedqError::Conflict`]
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第 `attempt` 次尝试（从1开始）失败后是否应当再试一次
    pub fn should_retry(&self, operation: &str, attempt: u32, err: &MedqError) -> bool {
        if !err.is_retryable() {
            return false;
        }
        if attempt >= self.max_attempts {
            tracing::warn!(operation, attempt, error = %err, "Retry budget exhausted");
            return false;
        }
        tracing::warn!(operation, attempt, error = %err, "Concurrent update detected, retrying");
        true
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
