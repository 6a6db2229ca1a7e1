//! 事务性存储协作接口
//!
//! 每个队列键带一个版本号。变更以 [`ChangeSet`] 为单位提交：先校验所有乐观锁版本，
//! 再原子地写入记录并递增所有被触及队列的版本。版本不匹配时返回
//! [`MedqError::Conflict`](crate::MedqError::Conflict)，不写入任何内容。

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    DiagnosticEntry, Doctor, OpdEntry, Prescription, QueueEntry, QueueKey, TestType, Visit,
};

/// 带版本号的队列快照
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// 一次原子提交的全部写入
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub expected: Vec<(QueueKey, u64)>,
    pub visits: Vec<Visit>,
    pub opd_entries: Vec<OpdEntry>,
    pub diagnostics: Vec<DiagnosticEntry>,
    pub doctors: Vec<Doctor>,
    pub prescriptions: Vec<Prescription>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 要求提交时该队列版本仍为 `version`
    pub fn expect(mut self, key: QueueKey, version: u64) -> Self {
        self.expected.push((key, version));
        self
    }

    pub fn visit(mut self, visit: Visit) -> Self {
        self.visits.push(visit);
        self
    }

    pub fn opd_entry(mut self, entry: OpdEntry) -> Self {
        self.opd_entries.push(entry);
        self
    }

    pub fn diagnostic(mut self, entry: DiagnosticEntry) -> Self {
        self.diagnostics.push(entry);
        self
    }

    pub fn doctor(mut self, doctor: Doctor) -> Self {
        self.doctors.push(doctor);
        self
    }

    pub fn prescription(mut self, prescription: Prescription) -> Self {
        self.prescriptions.push(prescription);
        self
    }

    /// 本次提交触及的全部队列（其版本将被递增）
    pub fn touched_queues(&self) -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = Vec::new();
        let mut seen = BTreeSet::new();
        let candidates = self
            .expected
            .iter()
            .map(|(key, _)| *key)
            .chain(self.visits.iter().map(Visit::opd_queue))
            .chain(self.opd_entries.iter().map(|e| QueueKey::Opd {
                doctor_id: e.doctor_id,
            }))
            .chain(self.diagnostics.iter().map(|e| QueueKey::Diagnostic {
                test_type: e.test_type,
            }))
            .chain(self.doctors.iter().map(Doctor::opd_queue));

        for key in candidates {
            if seen.insert(key.storage_key()) {
                keys.push(key);
            }
        }
        keys
    }
}

/// 事务性存储
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 原子递增 (医生, 日期) 的号源序列并返回新号
    async fn allocate_token(&self, doctor_id: Uuid, day: NaiveDate) -> Result<i32>;

    async fn get_visit(&self, visit_id: Uuid) -> Result<Option<Visit>>;

    async fn find_visit_by_reference(&self, reference: &str) -> Result<Option<Visit>>;

    async fn get_doctor(&self, doctor_id: Uuid) -> Result<Option<Doctor>>;

    async fn list_doctors(&self) -> Result<Vec<Doctor>>;

    /// 按ID查找门诊或检查条目
    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<QueueEntry>>;

    async fn opd_entry_for_visit(&self, visit_id: Uuid) -> Result<Option<OpdEntry>>;

    async fn diagnostics_for_visit(&self, visit_id: Uuid) -> Result<Vec<DiagnosticEntry>>;

    async fn prescriptions_for_visit(&self, visit_id: Uuid) -> Result<Vec<Prescription>>;

    /// 医生门诊队列中未完成的条目及队列版本
    async fn load_opd_queue(&self, doctor_id: Uuid) -> Result<Versioned<Vec<OpdEntry>>>;

    /// 检查队列中未完成的条目及队列版本
    async fn load_diagnostic_queue(
        &self,
        test_type: TestType,
    ) -> Result<Versioned<Vec<DiagnosticEntry>>>;

    async fn queue_version(&self, key: QueueKey) -> Result<u64>;

    /// 原子提交
    async fn commit(&self, changes: ChangeSet) -> Result<()>;
}
