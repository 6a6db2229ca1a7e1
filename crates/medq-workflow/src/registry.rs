//! 就诊登记
//!
//! 登记时原子地分配 (医生, 日期) 内唯一且递增的号源，并同时创建就诊与门诊队列条目。

use chrono::{FixedOffset, Utc};
use medq_core::utils::{generate_visit_reference, service_day};
use medq_core::{
    ChangeSet, EntryStatus, EventPublisher, MedqError, OpdEntry, Priority, QueueEvent,
    QueueStore, Result, Visit,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::retry::RetryPolicy;

/// 登记请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitRequest {
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub is_emergency: bool,
    pub is_protected: bool,
}

/// 登记结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub visit: Visit,
    pub entry: OpdEntry,
}

impl Registration {
    pub fn token(&self) -> i32 {
        self.visit.token
    }

    pub fn external_reference(&self) -> &str {
        &self.visit.external_reference
    }
}

/// 就诊登记处
pub struct VisitRegistry {
    store: Arc<dyn QueueStore>,
    publisher: Arc<dyn EventPublisher>,
    utc_offset: FixedOffset,
    retry: RetryPolicy,
}

impl VisitRegistry {
    pub fn new(
        store: Arc<dyn QueueStore>,
        publisher: Arc<dyn EventPublisher>,
        utc_offset: FixedOffset,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            utc_offset,
            retry,
        }
    }

    /// 登记就诊
    pub async fn register(&self, request: VisitRequest) -> Result<Registration> {
        if request.patient_id.is_nil() {
            return Err(MedqError::Validation("patient id is required".to_string()));
        }
        if self.store.get_doctor(request.doctor_id).await?.is_none() {
            return Err(MedqError::NotFound(format!(
                "doctor {} not found",
                request.doctor_id
            )));
        }

        let mut attempt = 0;
        let registration = loop {
            attempt += 1;
            match self.try_register(&request).await {
                Err(err) if self.retry.should_retry("register_visit", attempt, &err) => continue,
                other => break other?,
            }
        };

        self.publisher
            .publish(QueueEvent::queue_changed(registration.visit.opd_queue()));

        tracing::info!(
            visit_id = %registration.visit.id,
            doctor_id = %registration.visit.doctor_id,
            token = registration.visit.token,
            emergency = registration.visit.is_emergency,
            "Visit registered"
        );
        Ok(registration)
    }

    async fn try_register(&self, request: &VisitRequest) -> Result<Registration> {
        let now = Utc::now();
        let day = service_day(now, self.utc_offset);

        // 每次尝试都重新取号，冲突时放弃的号码留作空号
        let token = self.store.allocate_token(request.doctor_id, day).await?;

        let visit = Visit {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            doctor_id: request.doctor_id,
            token,
            service_date: day,
            external_reference: generate_visit_reference(
                request.patient_id,
                request.doctor_id,
                now,
            ),
            is_emergency: request.is_emergency,
            emergency_reason: None,
            is_protected: request.is_protected,
            status: EntryStatus::Waiting,
            diagnosis: None,
            created_at: now,
            completed_at: None,
        };

        let entry = OpdEntry {
            id: Uuid::new_v4(),
            visit_id: visit.id,
            doctor_id: request.doctor_id,
            token,
            service_date: day,
            status: EntryStatus::Waiting,
            priority: Priority::from_flag(request.is_emergency),
            created_at: now,
            updated_at: now,
        };

        self.store
            .commit(ChangeSet::new().visit(visit.clone()).opd_entry(entry.clone()))
            .await?;

        Ok(Registration { visit, entry })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::EventBroadcaster;
    use crate::test_support::{doctor, drain, seed_doctor, FaultyStore};
    use medq_core::utils::is_valid_visit_reference;
    use medq_core::QueueKey;
    use medq_database::MemoryStore;

    fn registry(store: Arc<dyn QueueStore>, broadcaster: &EventBroadcaster) -> VisitRegistry {
        VisitRegistry::new(
            store,
            Arc::new(broadcaster.clone()),
            FixedOffset::east_opt(0).unwrap(),
            RetryPolicy::default(),
        )
    }

    fn request(doctor_id: Uuid, is_emergency: bool) -> VisitRequest {
        VisitRequest {
            patient_id: Uuid::new_v4(),
            doctor_id,
            is_emergency,
            is_protected: false,
        }
    }

    #[tokio::test]
    async fn test_tokens_start_at_one_and_increase() {
        let store = Arc::new(MemoryStore::new());
        let d = doctor("Dr. Rao");
        seed_doctor(store.as_ref(), &d).await;
        let broadcaster = EventBroadcaster::new();
        let mut events = broadcaster.subscribe();
        let registry = registry(store.clone(), &broadcaster);

        let first = registry.register(request(d.id, false)).await.unwrap();
        let second = registry.register(request(d.id, true)).await.unwrap();

        assert_eq!(first.token(), 1);
        assert_eq!(second.token(), 2);
        assert_eq!(first.entry.priority, Priority::Normal);
        assert_eq!(second.entry.priority, Priority::Urgent);
        assert!(second.visit.is_emergency);
        assert!(is_valid_visit_reference(first.external_reference()));
        assert_ne!(first.external_reference(), second.external_reference());

        let published = drain(&mut events);
        assert_eq!(
            published,
            vec![
                QueueEvent::queue_changed(QueueKey::Opd { doctor_id: d.id }),
                QueueEvent::queue_changed(QueueKey::Opd { doctor_id: d.id }),
            ]
        );
    }

    #[tokio::test]
    async fn test_tokens_are_per_doctor() {
        let store = Arc::new(MemoryStore::new());
        let a = doctor("Dr. A");
        let b = doctor("Dr. B");
        seed_doctor(store.as_ref(), &a).await;
        seed_doctor(store.as_ref(), &b).await;
        let registry = registry(store, &EventBroadcaster::new());

        registry.register(request(a.id, false)).await.unwrap();
        let other = registry.register(request(b.id, false)).await.unwrap();
        assert_eq!(other.token(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_get_unique_tokens() {
        let store = Arc::new(MemoryStore::new());
        let d = doctor("Dr. Busy");
        seed_doctor(store.as_ref(), &d).await;
        let registry = Arc::new(registry(store.clone(), &EventBroadcaster::new()));

        let mut handles = Vec::new();
        for _ in 0..24 {
            let registry = registry.clone();
            let doctor_id = d.id;
            handles.push(tokio::spawn(async move {
                registry.register(request(doctor_id, false)).await
            }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().unwrap().token());
        }
        tokens.sort_unstable();
        assert_eq!(tokens, (1..=24).collect::<Vec<i32>>());

        let queue = store.load_opd_queue(d.id).await.unwrap();
        assert_eq!(queue.value.len(), 24);
    }

    #[tokio::test]
    async fn test_conflict_is_retried_with_fresh_token() {
        let memory = Arc::new(MemoryStore::new());
        let d = doctor("Dr. Retry");
        seed_doctor(memory.as_ref(), &d).await;
        let store = Arc::new(FaultyStore::new(memory.clone()).fail_next_commits(2));
        let registry = registry(store, &EventBroadcaster::new());

        let registration = registry.register(request(d.id, false)).await.unwrap();

        // 两次失败尝试消耗的号码不再使用
        assert_eq!(registration.token(), 3);
        assert!(memory.get_visit(registration.visit.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_budget() {
        let memory = Arc::new(MemoryStore::new());
        let d = doctor("Dr. Unlucky");
        seed_doctor(memory.as_ref(), &d).await;
        let store = Arc::new(FaultyStore::new(memory.clone()).fail_next_commits(10));
        let broadcaster = EventBroadcaster::new();
        let mut events = broadcaster.subscribe();
        let registry = registry(store, &broadcaster);

        let err = registry.register(request(d.id, false)).await.unwrap_err();
        assert!(matches!(err, MedqError::Conflict(_)));
        assert!(drain(&mut events).is_empty());
        assert!(memory.load_opd_queue(d.id).await.unwrap().value.is_empty());
    }

    #[tokio::test]
    async fn test_validation() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(store, &EventBroadcaster::new());

        let err = registry
            .register(request(Uuid::new_v4(), false))
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::NotFound(_)));

        let err = registry
            .register(VisitRequest {
                patient_id: Uuid::nil(),
                doctor_id: Uuid::new_v4(),
                is_emergency: false,
                is_protected: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MedqError::Validation(_)));
    }
}
