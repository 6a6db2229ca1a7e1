//! 排队引擎
//!
//! 协调登记、叫号顺序、状态机、优先级升级与通知发布的核心引擎，
//! 是边界层（HTTP/鉴权）调用的唯一入口。
//!
//! 所有写操作都遵循"先提交、后通知"：变更以带乐观锁的 [`ChangeSet`] 原子提交，
//! 提交成功后才写审计、发通知；并发冲突在内部有限次重试。

use chrono::{FixedOffset, Offset, Utc};
use medq_core::{
    AccessPolicy, Actor, AuditSink, ChangeSet, DiagnosticEntry, Doctor, EntryStatus,
    EventPublisher, MedqError, OpdEntry, Operation, PatientVerifier, Prescription, QueueEntry,
    QueueEvent, QueueKey, QueueStore, Result, RolePolicy, TestType, WorkStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::dashboard::{
    AdminOverview, Dashboard, PublicBoard, VisitStatusView, DEFAULT_MINUTES_PER_PATIENT,
};
use crate::escalation::{new_referral, EscalationOutcome, PriorityEscalation};
use crate::inactivity::{InactivityMonitor, InactivitySettings};
use crate::ordering::{QueueView, Queued};
use crate::registry::{Registration, VisitRegistry, VisitRequest};
use crate::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::state_machine::{EntryEvent, EntryStateMachine};

/// 引擎配置
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub max_attempts: u32,
    pub utc_offset: FixedOffset,
    pub minutes_per_patient: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            utc_offset: Utc.fix(),
            minutes_per_patient: DEFAULT_MINUTES_PER_PATIENT,
        }
    }
}

/// 医生建档信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorProfile {
    pub name: String,
    pub department: String,
    pub opd_room: String,
}

/// 处方药品
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MedicineOrder {
    pub name: String,
    pub dosage: Option<String>,
}

/// 检查转诊
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Referral {
    pub test_type: TestType,
    pub urgent: bool,
}

/// 完成服务时附带的内容
///
/// 门诊完成可携带诊断、处方与检查转诊；检查完成只携带结果。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionDetails {
    pub diagnosis: Option<String>,
    pub medicines: Vec<MedicineOrder>,
    pub referrals: Vec<Referral>,
    pub result: Option<String>,
}

/// 完成服务的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedService {
    pub entry: QueueEntry,
    pub referrals: Vec<DiagnosticEntry>,
}

struct Transition {
    entry: QueueEntry,
    referrals: Vec<DiagnosticEntry>,
    touched: Vec<QueueKey>,
}

/// 排队引擎
pub struct QueueEngine {
    store: Arc<dyn QueueStore>,
    publisher: Arc<dyn EventPublisher>,
    policy: Arc<dyn AccessPolicy>,
    registry: VisitRegistry,
    escalation: PriorityEscalation,
    dashboard: Dashboard,
    opd_machine: EntryStateMachine,
    diagnostic_machine: EntryStateMachine,
    retry: RetryPolicy,
}

impl QueueEngine {
    /// 创建新的排队引擎，默认使用 [`RolePolicy`] 授权
    pub fn new(
        store: Arc<dyn QueueStore>,
        audit: Arc<dyn AuditSink>,
        publisher: Arc<dyn EventPublisher>,
        settings: EngineSettings,
    ) -> Self {
        let retry = RetryPolicy::new(settings.max_attempts);

        Self {
            registry: VisitRegistry::new(
                store.clone(),
                publisher.clone(),
                settings.utc_offset,
                retry,
            ),
            escalation: PriorityEscalation::new(
                store.clone(),
                audit.clone(),
                publisher.clone(),
                retry,
            ),
            dashboard: Dashboard::new(store.clone(), audit, settings.minutes_per_patient),
            opd_machine: EntryStateMachine::opd(),
            diagnostic_machine: EntryStateMachine::diagnostic(),
            policy: Arc::new(RolePolicy),
            store,
            publisher,
            retry,
        }
    }

    pub fn with_access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn PatientVerifier>) -> Self {
        self.dashboard = self.dashboard.with_verifier(verifier);
        self
    }

    /// 基于同一存储与发布器构建空闲监测器
    pub fn inactivity_monitor(&self, settings: InactivitySettings) -> InactivityMonitor {
        InactivityMonitor::new(self.store.clone(), self.publisher.clone(), settings)
    }

    /// 医生建档
    pub async fn enroll_doctor(&self, actor: &Actor, profile: DoctorProfile) -> Result<Doctor> {
        self.policy.authorize(actor, Operation::EnrollDoctor)?;

        let name = required("name", &profile.name)?;
        let department = required("department", &profile.department)?;
        let opd_room = required("opd_room", &profile.opd_room)?;

        let now = Utc::now();
        let doctor = Doctor {
            id: Uuid::new_v4(),
            name: name.to_string(),
            department: department.to_string(),
            opd_room: opd_room.to_string(),
            work_status: WorkStatus::Available,
            delay_reason: None,
            last_action_at: now,
            created_at: now,
        };

        self.store
            .commit(ChangeSet::new().expect(doctor.opd_queue(), 0).doctor(doctor.clone()))
            .await?;

        self.publisher.publish(QueueEvent::DoctorStatusChanged {
            doctor_id: doctor.id,
            status: doctor.work_status,
            delay_reason: None,
        });

        tracing::info!(doctor_id = %doctor.id, name = %doctor.name, "Doctor enrolled");
        Ok(doctor)
    }

    /// 登记就诊
    pub async fn register_visit(&self, actor: &Actor, request: VisitRequest) -> Result<Registration> {
        self.policy.authorize(actor, Operation::RegisterVisit)?;
        self.registry.register(request).await
    }

    /// 医生门诊队列（展示顺序）
    pub async fn list_queue(&self, doctor_id: Uuid) -> Result<Vec<OpdEntry>> {
        self.load_doctor(doctor_id).await?;
        let queue = self.opd_view(doctor_id).await?;
        Ok(queue.ordered())
    }

    /// 检查队列（展示顺序）
    pub async fn list_diagnostic_queue(
        &self,
        actor: &Actor,
        test_type: TestType,
    ) -> Result<Vec<DiagnosticEntry>> {
        self.policy.authorize(actor, Operation::ViewDiagnosticQueue)?;
        let queue = self.diagnostic_view(test_type).await?;
        Ok(queue.ordered())
    }

    /// 队列中下一位应当接受服务的条目
    pub async fn get_next(&self, key: QueueKey) -> Result<Option<QueueEntry>> {
        let next = match key {
            QueueKey::Opd { doctor_id } => self
                .opd_view(doctor_id)
                .await?
                .next()
                .cloned()
                .map(QueueEntry::Opd),
            QueueKey::Diagnostic { test_type } => self
                .diagnostic_view(test_type)
                .await?
                .next()
                .cloned()
                .map(QueueEntry::Diagnostic),
        };
        Ok(next)
    }

    /// 开始服务
    pub async fn start_service(&self, actor: &Actor, entry_id: Uuid) -> Result<QueueEntry> {
        let operation = match self.load_entry(entry_id).await? {
            QueueEntry::Opd(_) => Operation::StartConsultation,
            QueueEntry::Diagnostic(_) => Operation::StartDiagnostic,
        };
        self.policy.authorize(actor, operation)?;

        let transition = self
            .run_transition("start_service", entry_id, EntryEvent::Start, None)
            .await?;
        Ok(transition.entry)
    }

    /// 完成服务
    pub async fn complete_service(
        &self,
        actor: &Actor,
        entry_id: Uuid,
        details: CompletionDetails,
    ) -> Result<CompletedService> {
        let operation = match self.load_entry(entry_id).await? {
            QueueEntry::Opd(_) => Operation::CompleteConsultation,
            QueueEntry::Diagnostic(_) => Operation::CompleteDiagnostic,
        };
        self.policy.authorize(actor, operation)?;

        for medicine in &details.medicines {
            required("medicine name", &medicine.name)?;
        }

        let transition = self
            .run_transition("complete_service", entry_id, EntryEvent::Complete, Some(&details))
            .await?;
        Ok(CompletedService {
            entry: transition.entry,
            referrals: transition.referrals,
        })
    }

    /// 标记患者暂不在场（或设备不可用）
    pub async fn mark_not_available(&self, actor: &Actor, entry_id: Uuid) -> Result<QueueEntry> {
        self.policy.authorize(actor, Operation::MarkNotAvailable)?;
        let transition = self
            .run_transition("mark_not_available", entry_id, EntryEvent::MarkNotAvailable, None)
            .await?;
        Ok(transition.entry)
    }

    /// 重新排队，按原有序号与优先级参与排序
    pub async fn reactivate(&self, actor: &Actor, entry_id: Uuid) -> Result<QueueEntry> {
        self.policy.authorize(actor, Operation::Reactivate)?;
        let transition = self
            .run_transition("reactivate", entry_id, EntryEvent::Reactivate, None)
            .await?;
        Ok(transition.entry)
    }

    /// 标记就诊为紧急
    pub async fn mark_emergency(
        &self,
        actor: &Actor,
        visit_id: Uuid,
        reason: &str,
    ) -> Result<EscalationOutcome> {
        self.policy.authorize(actor, Operation::MarkEmergency)?;
        self.escalation
            .mark_emergency(actor.user_id, visit_id, reason)
            .await
    }

    /// 管理员覆盖门诊优先级
    pub async fn override_priority(
        &self,
        actor: &Actor,
        visit_id: Uuid,
        reason: &str,
    ) -> Result<OpdEntry> {
        self.policy.authorize(actor, Operation::OverridePriority)?;
        self.escalation
            .override_priority(actor.user_id, visit_id, reason)
            .await
    }

    /// 设置医生工作状态
    pub async fn set_doctor_work_status(
        &self,
        actor: &Actor,
        doctor_id: Uuid,
        status: WorkStatus,
    ) -> Result<Doctor> {
        self.policy.authorize(actor, Operation::SetWorkStatus)?;
        self.update_doctor("set_doctor_work_status", doctor_id, |doctor| {
            doctor.work_status = status;
        })
        .await
    }

    /// 更新医生延误原因，空白视为清除
    pub async fn update_delay_reason(
        &self,
        actor: &Actor,
        doctor_id: Uuid,
        reason: Option<String>,
    ) -> Result<Doctor> {
        self.policy.authorize(actor, Operation::UpdateDelayReason)?;
        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        self.update_doctor("update_delay_reason", doctor_id, |doctor| {
            doctor.delay_reason = reason.clone();
        })
        .await
    }

    /// 患者查询
    pub async fn lookup_visit(&self, reference: &str, secret: Option<&str>) -> Result<VisitStatusView> {
        self.dashboard.lookup_visit(reference, secret).await
    }

    /// 公共大屏
    pub async fn public_board(&self) -> Result<PublicBoard> {
        self.dashboard.public_board().await
    }

    /// 管理端概况
    pub async fn admin_overview(&self, actor: &Actor, audit_limit: usize) -> Result<AdminOverview> {
        self.policy.authorize(actor, Operation::ViewAdminOverview)?;
        self.dashboard.admin_overview(audit_limit).await
    }

    async fn update_doctor<F>(&self, operation: &str, doctor_id: Uuid, apply: F) -> Result<Doctor>
    where
        F: Fn(&mut Doctor),
    {
        let mut attempt = 0;
        let doctor = loop {
            attempt += 1;
            match self.try_update_doctor(doctor_id, &apply).await {
                Err(err) if self.retry.should_retry(operation, attempt, &err) => continue,
                other => break other?,
            }
        };

        self.publisher.publish(QueueEvent::DoctorStatusChanged {
            doctor_id,
            status: doctor.work_status,
            delay_reason: doctor.delay_reason.clone(),
        });

        tracing::info!(
            doctor_id = %doctor_id,
            status = doctor.work_status.as_str(),
            delay_reason = ?doctor.delay_reason,
            "Doctor status updated"
        );
        Ok(doctor)
    }

    async fn try_update_doctor<F>(&self, doctor_id: Uuid, apply: &F) -> Result<Doctor>
    where
        F: Fn(&mut Doctor),
    {
        let key = QueueKey::Opd { doctor_id };
        let version = self.store.queue_version(key).await?;
        let mut doctor = self.load_doctor(doctor_id).await?;
        apply(&mut doctor);

        self.store
            .commit(ChangeSet::new().expect(key, version).doctor(doctor.clone()))
            .await?;
        Ok(doctor)
    }

    async fn run_transition(
        &self,
        operation: &str,
        entry_id: Uuid,
        event: EntryEvent,
        details: Option<&CompletionDetails>,
    ) -> Result<Transition> {
        let mut attempt = 0;
        let transition = loop {
            attempt += 1;
            match self.try_transition(entry_id, event, details).await {
                Err(err) if self.retry.should_retry(operation, attempt, &err) => continue,
                other => break other?,
            }
        };

        for key in &transition.touched {
            self.publisher.publish(QueueEvent::queue_changed(*key));
        }

        tracing::info!(
            entry_id = %entry_id,
            ?event,
            status = transition.entry.status().as_str(),
            referrals = transition.referrals.len(),
            "Queue entry transitioned"
        );
        Ok(transition)
    }

    async fn try_transition(
        &self,
        entry_id: Uuid,
        event: EntryEvent,
        details: Option<&CompletionDetails>,
    ) -> Result<Transition> {
        match self.load_entry(entry_id).await? {
            QueueEntry::Opd(entry) => {
                self.try_transition_opd(entry.doctor_id, entry_id, event, details)
                    .await
            }
            QueueEntry::Diagnostic(entry) => {
                self.try_transition_diagnostic(entry.test_type, entry_id, event, details)
                    .await
            }
        }
    }

    async fn try_transition_opd(
        &self,
        doctor_id: Uuid,
        entry_id: Uuid,
        event: EntryEvent,
        details: Option<&CompletionDetails>,
    ) -> Result<Transition> {
        let queue = self.opd_view(doctor_id).await?;
        // 快照只含未完成条目，找不到即已完成
        let mut entry = match queue.find(entry_id) {
            Some(entry) => entry.clone(),
            None => {
                self.opd_machine.transition(EntryStatus::Completed, event)?;
                return Err(MedqError::Internal(format!("entry {} left its queue", entry_id)));
            }
        };

        let to = self.opd_machine.transition(entry.status, event)?;
        if event == EntryEvent::Start {
            ensure_vacant(&queue, entry_id)?;
            queue.enforce_serial(entry_id)?;
        }

        let now = Utc::now();
        let mut visit = self
            .store
            .get_visit(entry.visit_id)
            .await?
            .ok_or_else(|| MedqError::NotFound(format!("visit {} not found", entry.visit_id)))?;

        entry.status = to;
        entry.updated_at = now;
        visit.status = to;

        let mut changes = ChangeSet::new().expect(queue.key(), queue.version());
        let mut touched = vec![queue.key()];
        let mut referrals = Vec::new();

        if matches!(event, EntryEvent::Start | EntryEvent::Complete) {
            let mut doctor = self.load_doctor(doctor_id).await?;
            doctor.last_action_at = now;
            changes = changes.doctor(doctor);
        }

        if event == EntryEvent::Complete {
            let details = details.cloned().unwrap_or_default();
            visit.diagnosis = details
                .diagnosis
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty());
            visit.completed_at = Some(now);

            for medicine in details.medicines {
                changes = changes.prescription(Prescription {
                    id: Uuid::new_v4(),
                    visit_id: visit.id,
                    medicine_name: medicine.name.trim().to_string(),
                    dosage: medicine.dosage,
                    created_at: now,
                });
            }

            // 同一次开单的检查按开单顺序错开一微秒，保证同类检查的先后
            for (index, referral) in details.referrals.into_iter().enumerate() {
                let created_at = now + chrono::Duration::microseconds(index as i64);
                let diagnostic =
                    new_referral(&visit, referral.test_type, referral.urgent, created_at);
                let key = QueueKey::Diagnostic {
                    test_type: diagnostic.test_type,
                };
                if !touched.contains(&key) {
                    touched.push(key);
                }
                changes = changes.diagnostic(diagnostic.clone());
                referrals.push(diagnostic);
            }
        }

        changes = changes.visit(visit).opd_entry(entry.clone());
        self.store.commit(changes).await?;

        Ok(Transition {
            entry: QueueEntry::Opd(entry),
            referrals,
            touched,
        })
    }

    async fn try_transition_diagnostic(
        &self,
        test_type: TestType,
        entry_id: Uuid,
        event: EntryEvent,
        details: Option<&CompletionDetails>,
    ) -> Result<Transition> {
        if let Some(details) = details {
            if !details.medicines.is_empty() || !details.referrals.is_empty() {
                return Err(MedqError::Validation(
                    "diagnostic completion cannot carry prescriptions or referrals".to_string(),
                ));
            }
        }

        let queue = self.diagnostic_view(test_type).await?;
        let mut entry = match queue.find(entry_id) {
            Some(entry) => entry.clone(),
            None => {
                self.diagnostic_machine
                    .transition(EntryStatus::Completed, event)?;
                return Err(MedqError::Internal(format!("entry {} left its queue", entry_id)));
            }
        };

        let to = self.diagnostic_machine.transition(entry.status, event)?;
        match event {
            EntryEvent::Start => {
                ensure_vacant(&queue, entry_id)?;
                queue.enforce_serial(entry_id)?;
            }
            // 一步完成同样必须轮到该条目
            EntryEvent::Complete if entry.status == EntryStatus::Waiting => {
                queue.enforce_serial(entry_id)?;
            }
            _ => {}
        }

        entry.status = to;
        entry.updated_at = Utc::now();
        if event == EntryEvent::Complete {
            entry.result = details
                .and_then(|d| d.result.as_ref())
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty());
        }

        self.store
            .commit(
                ChangeSet::new()
                    .expect(queue.key(), queue.version())
                    .diagnostic(entry.clone()),
            )
            .await?;

        Ok(Transition {
            entry: QueueEntry::Diagnostic(entry),
            referrals: Vec::new(),
            touched: vec![queue.key()],
        })
    }

    async fn opd_view(&self, doctor_id: Uuid) -> Result<QueueView<OpdEntry>> {
        let snapshot = self.store.load_opd_queue(doctor_id).await?;
        Ok(QueueView::new(QueueKey::Opd { doctor_id }, snapshot))
    }

    async fn diagnostic_view(&self, test_type: TestType) -> Result<QueueView<DiagnosticEntry>> {
        let snapshot = self.store.load_diagnostic_queue(test_type).await?;
        Ok(QueueView::new(QueueKey::Diagnostic { test_type }, snapshot))
    }

    async fn load_entry(&self, entry_id: Uuid) -> Result<QueueEntry> {
        self.store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| MedqError::NotFound(format!("queue entry {} not found", entry_id)))
    }

    async fn load_doctor(&self, doctor_id: Uuid) -> Result<Doctor> {
        self.store
            .get_doctor(doctor_id)
            .await?
            .ok_or_else(|| MedqError::NotFound(format!("doctor {} not found", doctor_id)))
    }
}

/// 同一队列同一时刻只能有一个服务中的条目
fn ensure_vacant<T: Queued>(queue: &QueueView<T>, entry_id: Uuid) -> Result<()> {
    match queue.in_progress() {
        Some(current) if current.entry_id() != entry_id => Err(MedqError::QueueOccupied {
            queue: queue.key().to_string(),
            current: current.entry_id(),
        }),
        _ => Ok(()),
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(MedqError::Validation(format!("{} is required", field)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::EventBroadcaster;
    use crate::test_support::{drain, FaultyStore};
    use medq_core::{Notification, Priority, Role};
    use medq_database::{MemoryAuditLog, MemoryStore};
    use tokio::sync::broadcast;

    struct Fixture {
        engine: Arc<QueueEngine>,
        events: broadcast::Receiver<Notification>,
        audit: Arc<MemoryAuditLog>,
        admin: Actor,
        doctor: Actor,
        reception: Actor,
        lab: Actor,
        doctor_id: Uuid,
    }

    async fn fixture() -> Fixture {
        fixture_on(Arc::new(MemoryStore::new())).await
    }

    async fn fixture_on(store: Arc<dyn QueueStore>) -> Fixture {
        let broadcaster = EventBroadcaster::new();
        let events = broadcaster.subscribe();
        let audit = Arc::new(MemoryAuditLog::new());
        let engine = Arc::new(QueueEngine::new(
            store,
            audit.clone(),
            Arc::new(broadcaster),
            EngineSettings::default(),
        ));
        let admin = Actor::new(Uuid::new_v4(), Role::Admin);

        let doctor = engine
            .enroll_doctor(
                &admin,
                DoctorProfile {
                    name: "Dr. Sharma".to_string(),
                    department: "Cardiology".to_string(),
                    opd_room: "204".to_string(),
                },
            )
            .await
            .unwrap();

        let mut fx = Fixture {
            engine,
            events,
            audit,
            admin,
            doctor: Actor::new(Uuid::new_v4(), Role::Doctor),
            reception: Actor::new(Uuid::new_v4(), Role::Receptionist),
            lab: Actor::new(Uuid::new_v4(), Role::LabTech),
            doctor_id: doctor.id,
        };
        drain(&mut fx.events);
        fx
    }

    impl Fixture {
        async fn register(&self, is_emergency: bool) -> Registration {
            self.engine
                .register_visit(
                    &self.reception,
                    VisitRequest {
                        patient_id: Uuid::new_v4(),
                        doctor_id: self.doctor_id,
                        is_emergency,
                        is_protected: false,
                    },
                )
                .await
                .unwrap()
        }

        fn opd_key(&self) -> QueueKey {
            QueueKey::Opd {
                doctor_id: self.doctor_id,
            }
        }

        async fn next_id(&self) -> Option<Uuid> {
            self.engine
                .get_next(self.opd_key())
                .await
                .unwrap()
                .map(|e| e.id())
        }
    }

    #[tokio::test]
    async fn test_emergency_jumps_the_queue() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;
        let p2 = fx.register(false).await;

        assert_eq!(p1.token(), 1);
        assert_eq!(p2.token(), 2);
        assert_eq!(fx.next_id().await, Some(p1.entry.id));

        fx.engine
            .mark_emergency(&fx.doctor, p2.visit.id, "severe bleeding")
            .await
            .unwrap();

        assert_eq!(fx.next_id().await, Some(p2.entry.id));
    }

    #[tokio::test]
    async fn test_out_of_order_start_is_rejected() {
        let mut fx = fixture().await;
        let p1 = fx.register(false).await;
        let p2 = fx.register(false).await;
        drain(&mut fx.events);

        let err = fx
            .engine
            .start_service(&fx.doctor, p2.entry.id)
            .await
            .unwrap_err();
        match err {
            MedqError::OutOfOrder { requested, next } => {
                assert_eq!(requested, p2.entry.id);
                assert_eq!(next, p1.entry.id);
            }
            other => panic!("expected out-of-order, got {:?}", other),
        }
        assert!(drain(&mut fx.events).is_empty());

        let started = fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();
        assert_eq!(started.status(), EntryStatus::InProgress);
        assert_eq!(
            drain(&mut fx.events),
            vec![QueueEvent::queue_changed(fx.opd_key())]
        );

        let queue = fx.engine.list_queue(fx.doctor_id).await.unwrap();
        assert_eq!(queue[0].id, p1.entry.id);
        assert_eq!(queue[0].status, EntryStatus::InProgress);
    }

    #[tokio::test]
    async fn test_single_in_progress_per_queue() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;
        let p2 = fx.register(false).await;

        fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();
        let err = fx
            .engine
            .start_service(&fx.doctor, p2.entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::QueueOccupied { current, .. } if current == p1.entry.id));
        assert_eq!(err.kind(), medq_core::ErrorKind::State);
    }

    #[tokio::test]
    async fn test_complete_records_consultation_and_referrals() {
        let mut fx = fixture().await;
        let p1 = fx.register(true).await;
        fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();
        drain(&mut fx.events);

        let completed = fx
            .engine
            .complete_service(
                &fx.doctor,
                p1.entry.id,
                CompletionDetails {
                    diagnosis: Some("Acute bronchitis".to_string()),
                    medicines: vec![MedicineOrder {
                        name: "Amoxicillin".to_string(),
                        dosage: Some("500mg".to_string()),
                    }],
                    referrals: vec![Referral {
                        test_type: TestType::Xray,
                        urgent: false,
                    }],
                    result: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(completed.entry.status(), EntryStatus::Completed);
        assert_eq!(completed.referrals.len(), 1);
        // 紧急就诊的转诊检查在创建时即为紧急
        assert_eq!(completed.referrals[0].priority, Priority::Urgent);
        assert!(completed.referrals[0].is_emergency);

        let events = drain(&mut fx.events);
        assert!(events.contains(&QueueEvent::queue_changed(fx.opd_key())));
        assert!(events.contains(&QueueEvent::queue_changed(QueueKey::Diagnostic {
            test_type: TestType::Xray
        })));

        let view = fx
            .engine
            .lookup_visit(p1.external_reference(), None)
            .await
            .unwrap();
        assert_eq!(view.visit.status, EntryStatus::Completed);
        assert_eq!(view.visit.diagnosis.as_deref(), Some("Acute bronchitis"));
        assert_eq!(view.prescriptions.len(), 1);
        assert_eq!(view.diagnostics.len(), 1);
        assert_eq!(view.standing.position, None);

        assert!(fx.engine.list_queue(fx.doctor_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completing_waiting_consultation_is_state_error() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;

        let err = fx
            .engine
            .complete_service(&fx.doctor, p1.entry.id, CompletionDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_restarting_completed_entry_is_state_error() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;
        fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();
        fx.engine
            .complete_service(&fx.doctor, p1.entry.id, CompletionDetails::default())
            .await
            .unwrap();

        let err = fx
            .engine
            .start_service(&fx.doctor, p1.entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::InvalidStateTransition { ref from, .. } if from == "COMPLETED"));
    }

    #[tokio::test]
    async fn test_reactivated_entry_keeps_its_place_by_token() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;
        let p2 = fx.register(false).await;
        let p3 = fx.register(false).await;

        fx.engine
            .mark_not_available(&fx.reception, p1.entry.id)
            .await
            .unwrap();
        assert_eq!(fx.next_id().await, Some(p2.entry.id));

        let queue = fx.engine.list_queue(fx.doctor_id).await.unwrap();
        assert_eq!(queue.last().map(|e| e.id), Some(p1.entry.id));

        fx.engine.start_service(&fx.doctor, p2.entry.id).await.unwrap();
        fx.engine
            .complete_service(&fx.doctor, p2.entry.id, CompletionDetails::default())
            .await
            .unwrap();

        let entry = fx.engine.reactivate(&fx.reception, p1.entry.id).await.unwrap();
        assert_eq!(entry.status(), EntryStatus::Waiting);
        assert_eq!(entry.priority(), Priority::Normal);
        // 按原号源排序，token 1 排在 token 3 之前
        assert_eq!(fx.next_id().await, Some(p1.entry.id));

        let urgent = fx.register(true).await;
        let order: Vec<Uuid> = fx
            .engine
            .list_queue(fx.doctor_id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![urgent.entry.id, p1.entry.id, p3.entry.id]);
    }

    #[tokio::test]
    async fn test_in_progress_cannot_be_parked() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;
        fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();

        let err = fx
            .engine
            .mark_not_available(&fx.doctor, p1.entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_diagnostic_queue_flow() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;
        let p2 = fx.register(false).await;

        for p in [&p1, &p2] {
            fx.engine.start_service(&fx.doctor, p.entry.id).await.unwrap();
            fx.engine
                .complete_service(
                    &fx.doctor,
                    p.entry.id,
                    CompletionDetails {
                        referrals: vec![Referral {
                            test_type: TestType::Lab,
                            urgent: false,
                        }],
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        let lab_queue = fx
            .engine
            .list_diagnostic_queue(&fx.lab, TestType::Lab)
            .await
            .unwrap();
        assert_eq!(lab_queue.len(), 2);
        let (first, second) = (lab_queue[0].id, lab_queue[1].id);

        // 一步完成也要求轮到该条目
        let err = fx
            .engine
            .complete_service(&fx.lab, second, CompletionDetails::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::OutOfOrder { next, .. } if next == first));

        let done = fx
            .engine
            .complete_service(
                &fx.lab,
                first,
                CompletionDetails {
                    result: Some("HbA1c 5.4%".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        match done.entry {
            QueueEntry::Diagnostic(entry) => {
                assert_eq!(entry.status, EntryStatus::Completed);
                assert_eq!(entry.result.as_deref(), Some("HbA1c 5.4%"));
            }
            other => panic!("expected diagnostic entry, got {:?}", other),
        }

        let err = fx
            .engine
            .complete_service(
                &fx.lab,
                second,
                CompletionDetails {
                    referrals: vec![Referral {
                        test_type: TestType::Mri,
                        urgent: true,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::Validation(_)));
    }

    #[tokio::test]
    async fn test_role_checks() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;

        let err = fx
            .engine
            .start_service(&fx.lab, p1.entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::Permission(_)));

        let err = fx
            .engine
            .override_priority(&fx.doctor, p1.visit.id, "favour")
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::Permission(_)));

        let err = fx
            .engine
            .register_visit(
                &fx.lab,
                VisitRequest {
                    patient_id: Uuid::new_v4(),
                    doctor_id: fx.doctor_id,
                    is_emergency: false,
                    is_protected: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::Permission(_)));

        assert!(fx.engine.admin_overview(&fx.reception, 10).await.is_err());
        assert!(fx.engine.admin_overview(&fx.admin, 10).await.is_ok());
    }

    #[tokio::test]
    async fn test_doctor_status_changes_are_published() {
        let mut fx = fixture().await;

        let doctor = fx
            .engine
            .set_doctor_work_status(&fx.doctor, fx.doctor_id, WorkStatus::InOt)
            .await
            .unwrap();
        assert_eq!(doctor.work_status, WorkStatus::InOt);

        let doctor = fx
            .engine
            .update_delay_reason(&fx.doctor, fx.doctor_id, Some("Emergency surgery".to_string()))
            .await
            .unwrap();
        assert_eq!(doctor.delay_reason.as_deref(), Some("Emergency surgery"));

        assert_eq!(
            drain(&mut fx.events),
            vec![
                QueueEvent::DoctorStatusChanged {
                    doctor_id: fx.doctor_id,
                    status: WorkStatus::InOt,
                    delay_reason: None,
                },
                QueueEvent::DoctorStatusChanged {
                    doctor_id: fx.doctor_id,
                    status: WorkStatus::InOt,
                    delay_reason: Some("Emergency surgery".to_string()),
                },
            ]
        );

        let cleared = fx
            .engine
            .update_delay_reason(&fx.doctor, fx.doctor_id, Some("  ".to_string()))
            .await
            .unwrap();
        assert!(cleared.delay_reason.is_none());
    }

    #[tokio::test]
    async fn test_start_updates_doctor_last_action() {
        let fx = fixture().await;
        let before = fx.engine.admin_overview(&fx.admin, 0).await.unwrap().doctors[0].last_action_at;
        let p1 = fx.register(false).await;

        fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();

        let after = fx.engine.admin_overview(&fx.admin, 0).await.unwrap().doctors[0].last_action_at;
        assert!(after >= before);
        let board = fx.engine.public_board().await.unwrap();
        assert_eq!(board.doctors[0].current_token, Some(1));
    }

    #[tokio::test]
    async fn test_unknown_entry_and_doctor() {
        let fx = fixture().await;

        let err = fx
            .engine
            .start_service(&fx.doctor, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::NotFound(_)));

        let err = fx.engine.list_queue(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, MedqError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_referrals_from_one_completion_keep_request_order() {
        let fx = fixture().await;
        let p1 = fx.register(false).await;
        fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();

        let lab = Referral {
            test_type: TestType::Lab,
            urgent: false,
        };
        let completed = fx
            .engine
            .complete_service(
                &fx.doctor,
                p1.entry.id,
                CompletionDetails {
                    referrals: vec![
                        lab,
                        lab,
                        Referral {
                            test_type: TestType::Xray,
                            urgent: false,
                        },
                        lab,
                    ],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let requested: Vec<Uuid> = completed
            .referrals
            .iter()
            .filter(|r| r.test_type == TestType::Lab)
            .map(|r| r.id)
            .collect();
        let queued: Vec<Uuid> = fx
            .engine
            .list_diagnostic_queue(&fx.lab, TestType::Lab)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(queued, requested);
        assert_eq!(
            fx.engine
                .get_next(QueueKey::Diagnostic {
                    test_type: TestType::Lab
                })
                .await
                .unwrap()
                .map(|e| e.id()),
            Some(requested[0])
        );
    }

    #[tokio::test]
    async fn test_transitions_recover_from_conflicts() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let mut fx = fixture_on(faulty.clone()).await;
        let p1 = fx.register(false).await;
        let p2 = fx.register(false).await;
        drain(&mut fx.events);

        faulty.fail_commits(2);
        let started = fx.engine.start_service(&fx.doctor, p1.entry.id).await.unwrap();
        assert_eq!(started.status(), EntryStatus::InProgress);

        faulty.fail_commits(2);
        let completed = fx
            .engine
            .complete_service(
                &fx.doctor,
                p1.entry.id,
                CompletionDetails {
                    referrals: vec![Referral {
                        test_type: TestType::Lab,
                        urgent: false,
                    }],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(completed.entry.status(), EntryStatus::Completed);
        // 失败的尝试不会留下检查条目
        let lab_queue = fx
            .engine
            .list_diagnostic_queue(&fx.lab, TestType::Lab)
            .await
            .unwrap();
        assert_eq!(lab_queue.len(), 1);
        assert_eq!(lab_queue[0].id, completed.referrals[0].id);

        faulty.fail_commits(2);
        let entry = fx
            .engine
            .override_priority(&fx.admin, p2.visit.id, "wheelchair transfer")
            .await
            .unwrap();
        assert_eq!(entry.priority, Priority::Urgent);

        faulty.fail_commits(2);
        let outcome = fx
            .engine
            .mark_emergency(&fx.reception, p2.visit.id, "fainted at the counter")
            .await
            .unwrap();
        assert!(outcome.escalated);

        assert_eq!(fx.audit.recent(10).await.unwrap().len(), 2);
        let events = drain(&mut fx.events);
        assert!(events.contains(&QueueEvent::queue_changed(QueueKey::Diagnostic {
            test_type: TestType::Lab
        })));
        assert!(matches!(events.last(), Some(QueueEvent::EmergencyRaised { .. })));
    }

    #[tokio::test]
    async fn test_failed_start_has_no_side_effects() {
        let faulty = Arc::new(FaultyStore::new(Arc::new(MemoryStore::new())));
        let mut fx = fixture_on(faulty.clone()).await;
        let p1 = fx.register(false).await;
        drain(&mut fx.events);

        faulty.fail_commits(10);
        let err = fx
            .engine
            .start_service(&fx.doctor, p1.entry.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::Conflict(_)));
        assert!(drain(&mut fx.events).is_empty());
        assert!(fx.audit.recent(10).await.unwrap().is_empty());

        faulty.fail_commits(0);
        let queue = fx.engine.list_queue(fx.doctor_id).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].status, EntryStatus::Waiting);
        assert_eq!(fx.next_id().await, Some(p1.entry.id));
        let board = fx.engine.public_board().await.unwrap();
        assert_eq!(board.doctors[0].current_token, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_leave_one_in_progress() {
        for _ in 0..20 {
            let fx = fixture().await;
            let p1 = fx.register(false).await;
            let p2 = fx.register(false).await;
            fx.register(false).await;

            let mut starts = Vec::new();
            for i in 0..8 {
                let engine = fx.engine.clone();
                let doctor = fx.doctor;
                let entry_id = if i % 2 == 0 { p1.entry.id } else { p2.entry.id };
                starts.push(tokio::spawn(async move {
                    engine.start_service(&doctor, entry_id).await.is_ok()
                }));
            }
            let engine = fx.engine.clone();
            let reception = fx.reception;
            let visit_id = p2.visit.id;
            let escalation = tokio::spawn(async move {
                engine.mark_emergency(&reception, visit_id, "sudden collapse").await
            });

            let mut started = 0;
            for start in starts {
                if start.await.unwrap() {
                    started += 1;
                }
            }
            escalation.await.unwrap().unwrap();

            let in_progress = fx
                .engine
                .list_queue(fx.doctor_id)
                .await
                .unwrap()
                .into_iter()
                .filter(|e| e.status == EntryStatus::InProgress)
                .count();
            assert!(started <= 1);
            assert_eq!(in_progress, started);
        }
    }
}
