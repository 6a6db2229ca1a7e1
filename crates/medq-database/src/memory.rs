//! 进程内事务存储
//!
//! 单把读写锁保护全部状态，提交在持锁期间完成版本校验与写入，
//! 因此与 PostgreSQL 实现具有相同的原子提交语义。

use async_trait::async_trait;
use chrono::NaiveDate;
use medq_core::{
    AuditRecord, AuditSink, ChangeSet, DiagnosticEntry, Doctor, MedqError, OpdEntry,
    Prescription, QueueEntry, QueueKey, QueueStore, Result, TestType, Versioned, Visit,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct MemoryState {
    visits: HashMap<Uuid, Visit>,
    references: HashMap<String, Uuid>,
    tokens: HashMap<(Uuid, NaiveDate, i32), Uuid>, // (医生, 日期, 号) -> 就诊ID
    opd_entries: HashMap<Uuid, OpdEntry>,
    opd_by_visit: HashMap<Uuid, Uuid>,
    diagnostics: HashMap<Uuid, DiagnosticEntry>,
    doctors: HashMap<Uuid, Doctor>,
    prescriptions: Vec<Prescription>,
    token_sequences: HashMap<(Uuid, NaiveDate), i32>,
    queue_versions: HashMap<String, u64>,
}

impl MemoryState {
    fn version(&self, key: &QueueKey) -> u64 {
        self.queue_versions
            .get(&key.storage_key())
            .copied()
            .unwrap_or(0)
    }

    fn check(&self, changes: &ChangeSet) -> Result<()> {
        for (key, expected) in &changes.expected {
            let current = self.version(key);
            if current != *expected {
                return Err(MedqError::Conflict(format!(
                    "queue {} is at version {}, expected {}",
                    key, current, expected
                )));
            }
        }

        for visit in &changes.visits {
            let slot = (visit.doctor_id, visit.service_date, visit.token);
            if let Some(owner) = self.tokens.get(&slot) {
                if *owner != visit.id {
                    return Err(MedqError::Conflict(format!(
                        "token {} already issued for doctor {} on {}",
                        visit.token, visit.doctor_id, visit.service_date
                    )));
                }
            }
            if let Some(owner) = self.references.get(&visit.external_reference) {
                if *owner != visit.id {
                    return Err(MedqError::Conflict(
                        "external reference already in use".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn apply(&mut self, changes: ChangeSet) {
        for key in changes.touched_queues() {
            *self.queue_versions.entry(key.storage_key()).or_insert(0) += 1;
        }

        for visit in changes.visits {
            self.tokens
                .insert((visit.doctor_id, visit.service_date, visit.token), visit.id);
            self.references
                .insert(visit.external_reference.clone(), visit.id);
            self.visits.insert(visit.id, visit);
        }

        for entry in changes.opd_entries {
            self.opd_by_visit.insert(entry.visit_id, entry.id);
            self.opd_entries.insert(entry.id, entry);
        }

        for entry in changes.diagnostics {
            self.diagnostics.insert(entry.id, entry);
        }

        for doctor in changes.doctors {
            self.doctors.insert(doctor.id, doctor);
        }

        for prescription in changes.prescriptions {
            self.prescriptions.retain(|p| p.id != prescription.id);
            self.prescriptions.push(prescription);
        }
    }
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn allocate_token(&self, doctor_id: Uuid, day: NaiveDate) -> Result<i32> {
        let mut state = self.state.write().await;
        let counter = state.token_sequences.entry((doctor_id, day)).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn get_visit(&self, visit_id: Uuid) -> Result<Option<Visit>> {
        Ok(self.state.read().await.visits.get(&visit_id).cloned())
    }

    async fn find_visit_by_reference(&self, reference: &str) -> Result<Option<Visit>> {
        let state = self.state.read().await;
        Ok(state
            .references
            .get(reference)
            .and_then(|id| state.visits.get(id))
            .cloned())
    }

    async fn get_doctor(&self, doctor_id: Uuid) -> Result<Option<Doctor>> {
        Ok(self.state.read().await.doctors.get(&doctor_id).cloned())
    }

    async fn list_doctors(&self) -> Result<Vec<Doctor>> {
        let state = self.state.read().await;
        let mut doctors: Vec<Doctor> = state.doctors.values().cloned().collect();
        doctors.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(doctors)
    }

    async fn get_entry(&self, entry_id: Uuid) -> Result<Option<QueueEntry>> {
        let state = self.state.read().await;
        if let Some(entry) = state.opd_entries.get(&entry_id) {
            return Ok(Some(QueueEntry::Opd(entry.clone())));
        }
        Ok(state
            .diagnostics
            .get(&entry_id)
            .map(|entry| QueueEntry::Diagnostic(entry.clone())))
    }

    async fn opd_entry_for_visit(&self, visit_id: Uuid) -> Result<Option<OpdEntry>> {
        let state = self.state.read().await;
        Ok(state
            .opd_by_visit
            .get(&visit_id)
            .and_then(|id| state.opd_entries.get(id))
            .cloned())
    }

    async fn diagnostics_for_visit(&self, visit_id: Uuid) -> Result<Vec<DiagnosticEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<DiagnosticEntry> = state
            .diagnostics
            .values()
            .filter(|entry| entry.visit_id == visit_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn prescriptions_for_visit(&self, visit_id: Uuid) -> Result<Vec<Prescription>> {
        let state = self.state.read().await;
        Ok(state
            .prescriptions
            .iter()
            .filter(|p| p.visit_id == visit_id)
            .cloned()
            .collect())
    }

    async fn load_opd_queue(&self, doctor_id: Uuid) -> Result<Versioned<Vec<OpdEntry>>> {
        let state = self.state.read().await;
        let mut entries: Vec<OpdEntry> = state
            .opd_entries
            .values()
            .filter(|entry| entry.doctor_id == doctor_id && entry.status.is_active())
            .cloned()
            .collect();
        entries.sort_by_key(|entry| (entry.service_date, entry.token));

        Ok(Versioned {
            version: state.version(&QueueKey::Opd { doctor_id }),
            value: entries,
        })
    }

    async fn load_diagnostic_queue(
        &self,
        test_type: TestType,
    ) -> Result<Versioned<Vec<DiagnosticEntry>>> {
        let state = self.state.read().await;
        let mut entries: Vec<DiagnosticEntry> = state
            .diagnostics
            .values()
            .filter(|entry| entry.test_type == test_type && entry.status.is_active())
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(Versioned {
            version: state.version(&QueueKey::Diagnostic { test_type }),
            value: entries,
        })
    }

    async fn queue_version(&self, key: QueueKey) -> Result<u64> {
        Ok(self.state.read().await.version(&key))
    }

    async fn commit(&self, changes: ChangeSet) -> Result<()> {
        let mut state = self.state.write().await;
        state.check(&changes)?;
        state.apply(changes);
        Ok(())
    }
}

/// 内存审计日志
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditLog {
    async fn record(&self, record: AuditRecord) -> Result<()> {
        tracing::debug!(action = record.action.as_str(), visit_id = %record.visit_id, "Audit record stored");
        self.records.write().await.push(record);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}
