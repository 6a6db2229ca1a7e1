//! 看板与患者查询
//!
//! 只读视图：患者通过外部引用查询自己的排队位置，公共大屏展示各诊室与检查当前号，
//! 管理端查看医生状态与最近的审计记录。

use chrono::{DateTime, Utc};
use medq_core::utils::is_valid_visit_reference;
use medq_core::{
    AuditRecord, AuditSink, DiagnosticEntry, Doctor, EntryStatus, MedqError, OpdEntry,
    PatientVerifier, Prescription, QueueKey, QueueStore, Result, TestType, Visit, WorkStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::ordering::QueueView;

pub const DEFAULT_MINUTES_PER_PATIENT: u32 = 10;

/// 就诊在门诊队列中的位置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStanding {
    /// 在服务中与候诊条目中的名次（从1开始），不在其中时为空
    pub position: Option<usize>,
    pub tokens_ahead: usize,
    pub estimated_wait_minutes: u32,
    pub current_token: Option<i32>,
}

/// 患者查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitStatusView {
    pub visit: Visit,
    pub entry: Option<OpdEntry>,
    pub standing: QueueStanding,
    pub doctor_name: String,
    pub doctor_status: WorkStatus,
    pub delay_reason: Option<String>,
    pub diagnostics: Vec<DiagnosticEntry>,
    pub prescriptions: Vec<Prescription>,
}

/// 公共大屏的诊室行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorBoardRow {
    pub doctor_id: Uuid,
    pub name: String,
    pub department: String,
    pub opd_room: String,
    pub work_status: WorkStatus,
    pub delay_reason: Option<String>,
    pub current_token: Option<i32>,
    pub queue_length: usize,
}

/// 公共大屏的检查行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticBoardRow {
    pub test_type: TestType,
    pub active: usize,
    pub current_token: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicBoard {
    pub doctors: Vec<DoctorBoardRow>,
    pub diagnostics: Vec<DiagnosticBoardRow>,
    pub generated_at: DateTime<Utc>,
}

/// 管理端的医生概况
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorOverviewRow {
    pub doctor_id: Uuid,
    pub name: String,
    pub work_status: WorkStatus,
    pub delay_reason: Option<String>,
    pub last_action_at: DateTime<Utc>,
    pub queue_length: usize,
    pub current_visit: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticQueueSummary {
    pub test_type: TestType,
    pub entries: Vec<DiagnosticEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminOverview {
    pub doctors: Vec<DoctorOverviewRow>,
    pub diagnostics: Vec<DiagnosticQueueSummary>,
    pub recent_audit: Vec<AuditRecord>,
}

/// 只读视图服务
pub struct Dashboard {
    store: Arc<dyn QueueStore>,
    audit: Arc<dyn AuditSink>,
    verifier: Option<Arc<dyn PatientVerifier>>,
    minutes_per_patient: u32,
}

impl Dashboard {
    pub fn new(
        store: Arc<dyn QueueStore>,
        audit: Arc<dyn AuditSink>,
        minutes_per_patient: u32,
    ) -> Self {
        Self {
            store,
            audit,
            verifier: None,
            minutes_per_patient,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn PatientVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// 患者通过外部引用查询就诊状态
    pub async fn lookup_visit(&self, reference: &str, secret: Option<&str>) -> Result<VisitStatusView> {
        if !is_valid_visit_reference(reference) {
            return Err(MedqError::Validation("malformed visit reference".to_string()));
        }

        let visit = self
            .store
            .find_visit_by_reference(reference)
            .await?
            .ok_or_else(|| MedqError::NotFound("visit not found".to_string()))?;

        if visit.is_protected {
            self.verify(&visit, secret).await?;
        }

        let doctor = self.load_doctor(visit.doctor_id).await?;
        let queue = QueueView::new(
            visit.opd_queue(),
            self.store.load_opd_queue(visit.doctor_id).await?,
        );
        let standing = self.standing(&queue, visit.id);
        let entry = self.store.opd_entry_for_visit(visit.id).await?;
        let diagnostics = self.store.diagnostics_for_visit(visit.id).await?;
        let prescriptions = self.store.prescriptions_for_visit(visit.id).await?;

        tracing::debug!(visit_id = %visit.id, position = ?standing.position, "Visit looked up");

        Ok(VisitStatusView {
            visit,
            entry,
            standing,
            doctor_name: doctor.name,
            doctor_status: doctor.work_status,
            delay_reason: doctor.delay_reason,
            diagnostics,
            prescriptions,
        })
    }

    async fn verify(&self, visit: &Visit, secret: Option<&str>) -> Result<()> {
        let secret = match secret.map(str::trim) {
            Some(secret) if !secret.is_empty() => secret,
            _ => return Err(MedqError::Permission("verification required".to_string())),
        };

        let verified = match &self.verifier {
            Some(verifier) => verifier.verify(visit.patient_id, secret).await?,
            None => false,
        };

        if verified {
            Ok(())
        } else {
            tracing::warn!(visit_id = %visit.id, "Visit lookup verification failed");
            Err(MedqError::Permission("verification failed".to_string()))
        }
    }

    fn standing(&self, queue: &QueueView<OpdEntry>, visit_id: Uuid) -> QueueStanding {
        let active: Vec<OpdEntry> = queue
            .ordered()
            .into_iter()
            .filter(|e| matches!(e.status, EntryStatus::Waiting | EntryStatus::InProgress))
            .collect();

        let index = active.iter().position(|e| e.visit_id == visit_id);
        let tokens_ahead = index.unwrap_or(0);

        QueueStanding {
            position: index.map(|i| i + 1),
            tokens_ahead,
            estimated_wait_minutes: tokens_ahead as u32 * self.minutes_per_patient,
            current_token: queue.in_progress().map(|e| e.token),
        }
    }

    /// 公共大屏
    pub async fn public_board(&self) -> Result<PublicBoard> {
        let mut doctors = Vec::new();
        for doctor in self.store.list_doctors().await? {
            let queue = QueueView::new(doctor.opd_queue(), self.store.load_opd_queue(doctor.id).await?);
            doctors.push(DoctorBoardRow {
                doctor_id: doctor.id,
                current_token: queue.in_progress().map(|e| e.token),
                queue_length: active_len(queue.entries().iter().map(|e| e.status)),
                name: doctor.name,
                department: doctor.department,
                opd_room: doctor.opd_room,
                work_status: doctor.work_status,
                delay_reason: doctor.delay_reason,
            });
        }

        let mut diagnostics = Vec::new();
        for test_type in TestType::ALL {
            let queue = QueueView::new(
                QueueKey::Diagnostic { test_type },
                self.store.load_diagnostic_queue(test_type).await?,
            );
            let current_token = match queue.in_progress() {
                Some(entry) => self.store.get_visit(entry.visit_id).await?.map(|v| v.token),
                None => None,
            };
            diagnostics.push(DiagnosticBoardRow {
                test_type,
                active: active_len(queue.entries().iter().map(|e| e.status)),
                current_token,
            });
        }

        Ok(PublicBoard {
            doctors,
            diagnostics,
            generated_at: Utc::now(),
        })
    }

    /// 管理端概况
    pub async fn admin_overview(&self, audit_limit: usize) -> Result<AdminOverview> {
        let mut doctors = Vec::new();
        for doctor in self.store.list_doctors().await? {
            let queue = QueueView::new(doctor.opd_queue(), self.store.load_opd_queue(doctor.id).await?);
            let ordered = queue.ordered();
            doctors.push(DoctorOverviewRow {
                doctor_id: doctor.id,
                name: doctor.name,
                work_status: doctor.work_status,
                delay_reason: doctor.delay_reason,
                last_action_at: doctor.last_action_at,
                queue_length: active_len(ordered.iter().map(|e| e.status)),
                current_visit: ordered
                    .iter()
                    .find(|e| e.status != EntryStatus::NotAvailable)
                    .map(|e| e.visit_id),
            });
        }

        let mut diagnostics = Vec::new();
        for test_type in TestType::ALL {
            let queue = QueueView::new(
                QueueKey::Diagnostic { test_type },
                self.store.load_diagnostic_queue(test_type).await?,
            );
            diagnostics.push(DiagnosticQueueSummary {
                test_type,
                entries: queue.ordered(),
            });
        }

        Ok(AdminOverview {
            doctors,
            diagnostics,
            recent_audit: self.audit.recent(audit_limit).await?,
        })
    }

    async fn load_doctor(&self, doctor_id: Uuid) -> Result<Doctor> {
        self.store
            .get_doctor(doctor_id)
            .await?
            .ok_or_else(|| MedqError::NotFound(format!("doctor {} not found", doctor_id)))
    }
}

/// 服务中与候诊条目数量
fn active_len(statuses: impl Iterator<Item = EntryStatus>) -> usize {
    statuses
        .filter(|s| matches!(s, EntryStatus::Waiting | EntryStatus::InProgress))
        .count()
}
