//! 测试辅助

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use medq_core::*;
use medq_database::MemoryStore;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub(crate) fn doctor(name: &str) -> Doctor {
    let now = Utc::now();
    Doctor {
        id: Uuid::new_v4(),
        name: name.to_string(),
        department: "General Medicine".to_string(),
        opd_room: "101".to_string(),
        work_status: WorkStatus::InOpd,
        delay_reason: None,
        last_action_at: now,
        created_at: now,
    }
}

pub(crate) async fn seed_doctor(store: &dyn QueueStore, doctor: &Doctor) {
    store
        .commit(ChangeSet::new().doctor(doctor.clone()))
        .await
        .unwrap();
}

/// 取出目前已收到的全部通知
pub(crate) fn drain(receiver: &mut broadcast::Receiver<Notification>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(notification) = receiver.try_recv() {
        events.push(notification.event);
    }
    events
}

/// 可注入故障的存储包装
pub(crate) struct FaultyStore {
    inner: Arc<MemoryStore>,
    failing_commits: AtomicU32,
    broken_queue: Option<Uuid>,
}

impl FaultyStore {
    pub(crate) fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_commits: AtomicU32::new(0),
            broken_queue: None,
        }
    }

    /// 接下来 `count` 次提交返回并发冲突
    pub(crate) fn fail_next_commits(self, count: u32) -> Self {
        self.fail_commits(count);
        self
    }

    /// 在已共享的存储上重新设置失败次数
    pub(crate) fn fail_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// 读取该医生的门诊队列时返回数据库错误
    pub(crate) fn break_queue(mut self, doctor_id: Uuid) -> Self {
        self.broken_queue = Some(doctor_id);
        self
    }
}

#[async_trait]
impl QueueStore for FaultyStore {
    async fn allocate_token(&self, doctor_id: Uuid, day: NaiveDate) -> Result<i32> {
        self.inner.allocate_token(doctor_id, day).await
    }

    async fn get_visit(&self, visit_id: Uuid) -> Result<Option<Visit>> {
        self.inner.get_visit(visit_id).await
    }

    async fn find_visit_by_reference(&self, reference: &str) -> Result<Option<Visit>> {
        self.inner.find_visit_by_reference(reference).await
    }

    async fn get_doctor(&self, doctor_id: Uuid) -> Result<Option<Doctor>> {
        self.inner.get_doctor(doctor_id).await
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        self.inner.list_doctors().await
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<QueueEntry>> {
        self.inner.get_entry(entry_id).await
    }

    async fn opd_entry_for_visit(&self, visit_id: Uuid) -> Result<Option<OpdEntry>> {
        self.inner.opd_entry_for_visit(visit_id).await
    }

    async fn diagnostics_for_visit(&self, visit_id: Uuid) -> Result<Vec<DiagnosticEntry>> {
        self.inner.diagnostics_for_visit(visit_id).await
    }

    async fn prescriptions_for_visit(&self, visit_id: Uuid) -> Result<Vec<Prescription>> {
        self.inner.prescriptions_for_visit(visit_id).await
    }

    async fn load_opd_queue(&self, doctor_id: Uuid) -> Result<Versioned<Vec<OpdEntry>>> {
        if self.broken_queue == Some(doctor_id) {
            return Err(MedqError::Database("connection reset".to_string()));
        }
        self.inner.load_opd_queue(doctor_id).await
    }

    async fn load_diagnostic_queue(
        &self,
        test_type: TestType,
    ) -> Result<Versioned<Vec<DiagnosticEntry>>> {
        self.inner.load_diagnostic_queue(test_type).await
    }

    async fn queue_version(&self, key: QueueKey) -> Result<u64> {
        self.inner.queue_version(key).await
    }

    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let remaining = self.failing_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_commits.store(remaining - 1, Ordering::SeqCst);
            return Err(MedqError::Conflict("injected conflict".to_string()));
        }
        self.inner.commit(changes).await
    }
}
