//! 优先级升级处理
//!
//! 紧急标记作用于整个就诊：门诊条目与该就诊的全部检查条目都提升为紧急，
//! 之后新建的检查条目也在创建时继承紧急优先级（见 [`referral_priority`]）。
//! 管理员的优先级覆盖只影响门诊条目，不设置就诊级紧急标记。

use chrono::{DateTime, Utc};
use medq_core::{
    AuditAction, AuditRecord, AuditSink, ChangeSet, DiagnosticEntry, EntryStatus,
    EventPublisher, MedqError, OpdEntry, Priority, QueueEvent, QueueKey, QueueStore, Result,
    Visit,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// 新建检查条目的优先级：就诊为紧急或该项检查本身标记加急时为紧急
pub fn referral_priority(visit: &Visit, urgent: bool) -> Priority {
    Priority::from_flag(visit.is_emergency || urgent)
}

/// 升级结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationOutcome {
    pub visit: Visit,
    /// 本次调用是否新升级（重复调用只更新原因）
    pub escalated: bool,
    pub affected_queues: Vec<QueueKey>,
}

struct PendingEscalation {
    outcome: EscalationOutcome,
    emergency_message: Option<String>,
}

/// 优先级升级处理器
pub struct PriorityEscalation {
    store: Arc<dyn QueueStore>,
    audit: Arc<dyn AuditSink>,
    publisher: Arc<dyn EventPublisher>,
    retry: RetryPolicy,
}

impl PriorityEscalation {
    pub fn new(
        store: Arc<dyn QueueStore>,
        audit: Arc<dyn AuditSink>,
        publisher: Arc<dyn EventPublisher>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            publisher,
            retry,
        }
    }

    /// 标记就诊为紧急
    pub async fn mark_emergency(
        &self,
        actor_id: Uuid,
        visit_id: Uuid,
        reason: &str,
    ) -> Result<EscalationOutcome> {
        let reason = require_reason(reason)?;

        let mut attempt = 0;
        let pending = loop {
            attempt += 1;
            match self.try_mark_emergency(visit_id, reason).await {
                Err(err) if self.retry.should_retry("mark_emergency", attempt, &err) => continue,
                other => break other?,
            }
        };

        self.record_audit(AuditRecord::new(
            AuditAction::EmergencyEscalation,
            actor_id,
            visit_id,
            reason,
        ))
        .await;

        let outcome = pending.outcome;
        if let Some(message) = pending.emergency_message {
            for key in &outcome.affected_queues {
                self.publisher.publish(QueueEvent::queue_changed(*key));
            }
            self.publisher.publish(QueueEvent::EmergencyRaised {
                doctor_id: outcome.visit.doctor_id,
                message,
            });

            tracing::warn!(
                visit_id = %visit_id,
                token = outcome.visit.token,
                queues = outcome.affected_queues.len(),
                "Visit escalated to emergency"
            );
        } else {
            tracing::info!(visit_id = %visit_id, "Emergency reason updated");
        }

        Ok(outcome)
    }

    async fn try_mark_emergency(&self, visit_id: Uuid, reason: &str) -> Result<PendingEscalation> {
        let opd_key = self.load_visit(visit_id).await?.opd_queue();
        // 先读版本再读数据，之后的并发修改会在提交时暴露为冲突
        let opd_version = self.store.queue_version(opd_key).await?;
        let mut visit = self.load_visit(visit_id).await?;

        if visit.is_emergency {
            visit.emergency_reason = Some(reason.to_string());
            self.store
                .commit(ChangeSet::new().expect(opd_key, opd_version).visit(visit.clone()))
                .await?;
            return Ok(PendingEscalation {
                outcome: EscalationOutcome {
                    visit,
                    escalated: false,
                    affected_queues: Vec::new(),
                },
                emergency_message: None,
            });
        }

        // 新的检查条目只会在门诊完成时创建，受门诊版本保护，因此检查队列集合在此期间不变
        let mut changes = ChangeSet::new().expect(opd_key, opd_version);
        let mut affected = vec![opd_key];
        for entry in self.store.diagnostics_for_visit(visit_id).await? {
            let key = QueueKey::Diagnostic {
                test_type: entry.test_type,
            };
            if !affected.contains(&key) {
                changes = changes.expect(key, self.store.queue_version(key).await?);
                affected.push(key);
            }
        }
        let mut opd = self.load_opd_entry(visit_id).await?;
        let diagnostics = self.store.diagnostics_for_visit(visit_id).await?;

        let now = Utc::now();
        visit.is_emergency = true;
        visit.emergency_reason = Some(reason.to_string());
        opd.priority = Priority::Urgent;
        opd.updated_at = now;

        changes = changes.visit(visit.clone()).opd_entry(opd);
        for mut entry in diagnostics {
            entry.priority = Priority::Urgent;
            entry.is_emergency = true;
            entry.updated_at = now;
            changes = changes.diagnostic(entry);
        }

        self.store.commit(changes).await?;

        let message = format!("Emergency Alert: Token {} marked as Emergency!", visit.token);
        Ok(PendingEscalation {
            outcome: EscalationOutcome {
                visit,
                escalated: true,
                affected_queues: affected,
            },
            emergency_message: Some(message),
        })
    }

    /// 管理员覆盖门诊优先级
    pub async fn override_priority(
        &self,
        actor_id: Uuid,
        visit_id: Uuid,
        reason: &str,
    ) -> Result<OpdEntry> {
        let reason = require_reason(reason)?;

        let mut attempt = 0;
        let entry = loop {
            attempt += 1;
            match self.try_override(visit_id).await {
                Err(err) if self.retry.should_retry("override_priority", attempt, &err) => continue,
                other => break other?,
            }
        };

        self.record_audit(AuditRecord::new(
            AuditAction::PriorityOverride,
            actor_id,
            visit_id,
            reason,
        ))
        .await;

        self.publisher.publish(QueueEvent::queue_changed(QueueKey::Opd {
            doctor_id: entry.doctor_id,
        }));

        tracing::info!(
            visit_id = %visit_id,
            actor_id = %actor_id,
            "Priority overridden"
        );
        Ok(entry)
    }

    async fn try_override(&self, visit_id: Uuid) -> Result<OpdEntry> {
        let visit = self.load_visit(visit_id).await?;
        let opd_key = visit.opd_queue();
        let version = self.store.queue_version(opd_key).await?;
        let mut entry = self.load_opd_entry(visit_id).await?;

        if entry.status == EntryStatus::Completed {
            return Err(MedqError::InvalidStateTransition {
                from: entry.status.as_str().to_string(),
                event: "OverridePriority".to_string(),
            });
        }

        entry.priority = Priority::Urgent;
        entry.updated_at = Utc::now();
        self.store
            .commit(ChangeSet::new().expect(opd_key, version).opd_entry(entry.clone()))
            .await?;
        Ok(entry)
    }

    async fn load_visit(&self, visit_id: Uuid) -> Result<Visit> {
        self.store
            .get_visit(visit_id)
            .await?
            .ok_or_else(|| MedqError::NotFound(format!("visit {} not found", visit_id)))
    }

    async fn load_opd_entry(&self, visit_id: Uuid) -> Result<OpdEntry> {
        self.store
            .opd_entry_for_visit(visit_id)
            .await?
            .ok_or_else(|| MedqError::NotFound(format!("OPD entry for visit {} not found", visit_id)))
    }

    async fn record_audit(&self, record: AuditRecord) {
        let action = record.action;
        let visit_id = record.visit_id;
        if let Err(err) = self.audit.record(record).await {
            tracing::error!(
                action = action.as_str(),
                visit_id = %visit_id,
                error = %err,
                "Failed to write audit record"
            );
        }
    }
}

fn require_reason(reason: &str) -> Result<&str> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(MedqError::Validation("a reason is required".to_string()));
    }
    Ok(reason)
}

/// 按就诊紧急标记创建检查条目
///
/// 同类检查按 `created_at` 排队，同一次开单的多项检查由调用方给出递增的时间。
pub fn new_referral(
    visit: &Visit,
    test_type: medq_core::TestType,
    urgent: bool,
    now: DateTime<Utc>,
) -> DiagnosticEntry {
    DiagnosticEntry {
        id: Uuid::new_v4(),
        visit_id: visit.id,
        test_type,
        status: EntryStatus::Waiting,
        priority: referral_priority(visit, urgent),
        is_emergency: visit.is_emergency,
        result: None,
        created_at: now,
        updated_at: now,
    }
}
