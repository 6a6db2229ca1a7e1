//! 数据库模型

use chrono::{DateTime, NaiveDate, Utc};
use medq_core::models::*;
use medq_core::{AuditAction, AuditRecord, MedqError, Result};
use sqlx::FromRow;
use uuid::Uuid;

// 数据库表模型 - 使用FromRow trait用于SQL查询

fn priority_from_db(value: i16) -> Result<Priority> {
    u8::try_from(value)
        .ok()
        .and_then(|v| Priority::try_from(v).ok())
        .ok_or_else(|| MedqError::Database(format!("invalid priority {} in storage", value)))
}

pub(crate) fn priority_to_db(priority: Priority) -> i16 {
    i16::from(u8::from(priority))
}

/// 数据库医生表
#[derive(Debug, FromRow)]
pub struct DbDoctor {
    pub id: Uuid,
    pub name: String,
    pub department: String,
    pub opd_room: String,
    pub work_status: String, // 存储为字符串，转换为WorkStatus枚举
    pub delay_reason: Option<String>,
    pub last_action_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbDoctor> for Doctor {
    type Error = MedqError;

    fn try_from(row: DbDoctor) -> Result<Self> {
        Ok(Doctor {
            id: row.id,
            name: row.name,
            department: row.department,
            opd_room: row.opd_room,
            work_status: row.work_status.parse()?,
            delay_reason: row.delay_reason,
            last_action_at: row.last_action_at,
            created_at: row.created_at,
        })
    }
}

/// 数据库就诊表
#[derive(Debug, FromRow)]
pub struct DbVisit {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub token: i32,
    pub service_date: NaiveDate,
    pub external_reference: String,
    pub is_emergency: bool,
    pub emergency_reason: Option<String>,
    pub is_protected: bool,
    pub status: String,
    pub diagnosis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbVisit> for Visit {
    type Error = MedqError;

    fn try_from(row: DbVisit) -> Result<Self> {
        Ok(Visit {
            id: row.id,
            patient_id: row.patient_id,
            doctor_id: row.doctor_id,
            token: row.token,
            service_date: row.service_date,
            external_reference: row.external_reference,
            is_emergency: row.is_emergency,
            emergency_reason: row.emergency_reason,
            is_protected: row.is_protected,
            status: row.status.parse()?,
            diagnosis: row.diagnosis,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

/// 数据库门诊队列表
#[derive(Debug, FromRow)]
pub struct DbOpdEntry {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub doctor_id: Uuid,
    pub token: i32,
    pub service_date: NaiveDate,
    pub status: String,
    pub priority: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbOpdEntry> for OpdEntry {
    type Error = MedqError;

    fn try_from(row: DbOpdEntry) -> Result<Self> {
        Ok(OpdEntry {
            id: row.id,
            visit_id: row.visit_id,
            doctor_id: row.doctor_id,
            token: row.token,
            service_date: row.service_date,
            status: row.status.parse()?,
            priority: priority_from_db(row.priority)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库检查队列表
#[derive(Debug, FromRow)]
pub struct DbDiagnosticEntry {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub test_type: String,
    pub status: String,
    pub priority: i16,
    pub is_emergency: bool,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DbDiagnosticEntry> for DiagnosticEntry {
    type Error = MedqError;

    fn try_from(row: DbDiagnosticEntry) -> Result<Self> {
        Ok(DiagnosticEntry {
            id: row.id,
            visit_id: row.visit_id,
            test_type: row.test_type.parse()?,
            status: row.status.parse()?,
            priority: priority_from_db(row.priority)?,
            is_emergency: row.is_emergency,
            result: row.result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 数据库处方表
#[derive(Debug, FromRow)]
pub struct DbPrescription {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub medicine_name: String,
    pub dosage: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<DbPrescription> for Prescription {
    fn from(row: DbPrescription) -> Self {
        Prescription {
            id: row.id,
            visit_id: row.visit_id,
            medicine_name: row.medicine_name,
            dosage: row.dosage,
            created_at: row.created_at,
        }
    }
}

/// 数据库审计表
#[derive(Debug, FromRow)]
pub struct DbAuditRecord {
    pub id: Uuid,
    pub action: String,
    pub actor_id: Uuid,
    pub visit_id: Uuid,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<DbAuditRecord> for AuditRecord {
    type Error = MedqError;

    fn try_from(row: DbAuditRecord) -> Result<Self> {
        let action = match row.action.as_str() {
            "EMERGENCY_ESCALATION" => AuditAction::EmergencyEscalation,
            "PRIORITY_OVERRIDE" => AuditAction::PriorityOverride,
            other => {
                return Err(MedqError::Database(format!(
                    "unknown audit action {} in storage",
                    other
                )))
            }
        };

        Ok(AuditRecord {
            id: row.id,
            action,
            actor_id: row.actor_id,
            visit_id: row.visit_id,
            reason: row.reason,
            recorded_at: row.recorded_at,
        })
    }
}
