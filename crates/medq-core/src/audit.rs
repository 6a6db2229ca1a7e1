//! 审计日志协作接口

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// 审计动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    EmergencyEscalation,
    PriorityOverride,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::EmergencyEscalation => "EMERGENCY_ESCALATION",
            AuditAction::PriorityOverride => "PRIORITY_OVERRIDE",
        }
    }
}

/// 审计记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: AuditAction,
    pub actor_id: Uuid,
    pub visit_id: Uuid,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, actor_id: Uuid, visit_id: Uuid, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            actor_id,
            visit_id,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// 审计日志接收端
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// 写入一条审计记录
    async fn record(&self, record: AuditRecord) -> Result<()>;

    /// 最近的审计记录，按时间倒序
    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>>;
}
