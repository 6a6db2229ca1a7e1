//! 调用方身份与权限
//!
//! 认证由外部完成，这里只根据角色判定调用方能否执行某个操作。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MedqError, Result};

/// 用户角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Doctor,
    Receptionist,
    LabTech,
}

/// 已认证的调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }
}

/// 需要授权的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    RegisterVisit,
    StartConsultation,
    CompleteConsultation,
    StartDiagnostic,
    CompleteDiagnostic,
    ViewDiagnosticQueue,
    MarkNotAvailable,
    Reactivate,
    MarkEmergency,
    OverridePriority,
    SetWorkStatus,
    UpdateDelayReason,
    EnrollDoctor,
    ViewAdminOverview,
}

/// 授权策略
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, actor: &Actor, operation: Operation) -> Result<()>;
}

/// 基于角色矩阵的默认策略
#[derive(Debug, Default, Clone)]
pub struct RolePolicy;

impl RolePolicy {
    pub fn allowed_roles(operation: Operation) -> &'static [Role] {
        use Role::*;
        match operation {
            Operation::RegisterVisit => &[Receptionist, Admin],
            Operation::StartConsultation | Operation::CompleteConsultation => &[Doctor],
            Operation::StartDiagnostic
            | Operation::CompleteDiagnostic
            | Operation::ViewDiagnosticQueue => &[LabTech, Admin],
            Operation::MarkNotAvailable | Operation::Reactivate => &[Doctor, Receptionist, LabTech],
            Operation::MarkEmergency => &[Doctor, Receptionist],
            Operation::OverridePriority | Operation::EnrollDoctor | Operation::ViewAdminOverview => {
                &[Admin]
            }
            Operation::SetWorkStatus | Operation::UpdateDelayReason => &[Doctor, Admin],
        }
    }
}

impl AccessPolicy for RolePolicy {
    fn authorize(&self, actor: &Actor, operation: Operation) -> Result<()> {
        if Self::allowed_roles(operation).contains(&actor.role) {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %actor.user_id,
                role = ?actor.role,
                ?operation,
                "Operation denied"
            );
            Err(MedqError::Permission(format!(
                "role {:?} may not perform {:?}",
                actor.role, operation
            )))
        }
    }
}

/// 受保护就诊的身份核验（例如核对出生日期），由患者档案系统提供
#[async_trait]
pub trait PatientVerifier: Send + Sync {
    async fn verify(&self, patient_id: Uuid, secret: &str) -> Result<bool>;
}
