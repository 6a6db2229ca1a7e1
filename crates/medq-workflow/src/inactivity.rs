//! 医生空闲监测
//!
//! 周期性扫描门诊中的医生：没有正在接诊的患者、最近一次接诊动作早于阈值、
//! 且队列中仍有候诊患者时，分别向医生和管理端发出告警。条件持续期间每个周期都会再次告警。

use chrono::{DateTime, Utc};
use medq_core::{AdminAlertKind, Doctor, EventPublisher, QueueEvent, QueueStore, Result, WorkStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use uuid::Uuid;

use crate::ordering::QueueView;

/// 监测配置
#[derive(Debug, Clone, Copy)]
pub struct InactivitySettings {
    pub interval: Duration,
    pub threshold: Duration,
}

impl Default for InactivitySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            threshold: Duration::from_secs(600),
        }
    }
}

/// 一次扫描中命中的医生
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InactivityFinding {
    pub doctor_id: Uuid,
    pub idle_minutes: i64,
    pub waiting: usize,
}

/// 空闲监测器
#[derive(Clone)]
pub struct InactivityMonitor {
    store: Arc<dyn QueueStore>,
    publisher: Arc<dyn EventPublisher>,
    settings: InactivitySettings,
}

impl InactivityMonitor {
    pub fn new(
        store: Arc<dyn QueueStore>,
        publisher: Arc<dyn EventPublisher>,
        settings: InactivitySettings,
    ) -> Self {
        Self {
            store,
            publisher,
            settings,
        }
    }

    /// 执行一次扫描
    ///
    /// 单个医生的评估失败只记录日志，不影响其余医生。
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<InactivityFinding>> {
        let doctors = self.store.list_doctors().await?;
        let mut findings = Vec::new();

        for doctor in doctors
            .iter()
            .filter(|d| d.work_status == WorkStatus::InOpd)
        {
            match self.evaluate(doctor, now).await {
                Ok(Some(finding)) => {
                    self.alert(doctor, &finding);
                    findings.push(finding);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(
                        doctor_id = %doctor.id,
                        error = %err,
                        "Failed to evaluate doctor inactivity"
                    );
                }
            }
        }

        tracing::debug!(alerts = findings.len(), "Inactivity sweep finished");
        Ok(findings)
    }

    async fn evaluate(&self, doctor: &Doctor, now: DateTime<Utc>) -> Result<Option<InactivityFinding>> {
        // 最近动作时间晚于 now 时视为未空闲
        let idle = match (now - doctor.last_action_at).to_std() {
            Ok(idle) if idle > self.settings.threshold => idle,
            _ => return Ok(None),
        };

        let queue = QueueView::new(
            doctor.opd_queue(),
            self.store.load_opd_queue(doctor.id).await?,
        );
        if queue.in_progress().is_some() {
            return Ok(None);
        }

        let waiting = queue.waiting_count();
        if waiting == 0 {
            return Ok(None);
        }

        Ok(Some(InactivityFinding {
            doctor_id: doctor.id,
            idle_minutes: (idle.as_secs() / 60) as i64,
            waiting,
        }))
    }

    fn alert(&self, doctor: &Doctor, finding: &InactivityFinding) {
        tracing::warn!(
            doctor_id = %doctor.id,
            idle_minutes = finding.idle_minutes,
            waiting = finding.waiting,
            "Doctor inactive with patients waiting"
        );

        self.publisher.publish(QueueEvent::InactivityAlert {
            doctor_id: doctor.id,
            message: format!(
                "System Alert: You have been inactive for {} minutes with {} patients waiting.",
                finding.idle_minutes, finding.waiting
            ),
        });
        self.publisher.publish(QueueEvent::AdminAlert {
            kind: AdminAlertKind::Inactivity,
            doctor_id: doctor.id,
            message: format!(
                "Dr. {} has been inactive for {} minutes with {} patients waiting.",
                doctor.name, finding.idle_minutes, finding.waiting
            ),
        });
    }

    /// 在后台任务中周期执行扫描
    pub fn start(self) -> InactivityMonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.settings.interval.as_secs(),
                threshold_secs = self.settings.threshold.as_secs(),
                "Inactivity monitor started"
            );

            let mut ticker = interval(self.settings.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep(Utc::now()).await {
                            tracing::error!(error = %err, "Inactivity sweep failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("Inactivity monitor shutting down");
                            break;
                        }
                    }
                }
            }
        });

        InactivityMonitorHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// 后台监测任务句柄
pub struct InactivityMonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl InactivityMonitorHandle {
    /// 通知任务停止并等待其退出
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "Inactivity monitor task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::EventBroadcaster;
    use crate::registry::{VisitRegistry, VisitRequest};
    use crate::retry::RetryPolicy;
    use crate::test_support::{doctor, drain, seed_doctor, FaultyStore};
    use chrono::FixedOffset;
    use medq_core::{ChangeSet, EntryStatus};
    use medq_database::MemoryStore;

    async fn idle_doctor(store: &Arc<MemoryStore>, name: &str, waiting: usize) -> Doctor {
        let mut d = doctor(name);
        d.last_action_at = Utc::now() - chrono::Duration::minutes(11);
        seed_doctor(store.as_ref(), &d).await;

        let registry = VisitRegistry::new(
            store.clone(),
            Arc::new(EventBroadcaster::new()),
            FixedOffset::east_opt(0).unwrap(),
            RetryPolicy::default(),
        );
        for _ in 0..waiting {
            registry
                .register(VisitRequest {
                    patient_id: Uuid::new_v4(),
                    doctor_id: d.id,
                    is_emergency: false,
                    is_protected: false,
                })
                .await
                .unwrap();
        }
        d
    }

    fn monitor(store: Arc<dyn QueueStore>, broadcaster: &EventBroadcaster) -> InactivityMonitor {
        InactivityMonitor::new(store, Arc::new(broadcaster.clone()), InactivitySettings::default())
    }

    #[tokio::test]
    async fn test_idle_doctor_with_waiting_patients_is_flagged() {
        let store = Arc::new(MemoryStore::new());
        let idle = idle_doctor(&store, "Dr. Idle", 3).await;
        let empty = idle_doctor(&store, "Dr. Empty", 0).await;
        let broadcaster = EventBroadcaster::new();
        let mut events = broadcaster.subscribe();

        let findings = monitor(store.clone(), &broadcaster)
            .sweep(Utc::now())
            .await
            .unwrap();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].doctor_id, idle.id);
        assert_eq!(findings[0].waiting, 3);
        assert_eq!(findings[0].idle_minutes, 11);

        let published = drain(&mut events);
        assert_eq!(published.len(), 2);
        assert!(matches!(
            &published[0],
            QueueEvent::InactivityAlert { doctor_id, .. } if *doctor_id == idle.id
        ));
        assert!(matches!(
            &published[1],
            QueueEvent::AdminAlert { kind: AdminAlertKind::Inactivity, doctor_id, .. } if *doctor_id == idle.id
        ));
        assert!(published.iter().all(|e| !e.concerns_doctor(empty.id)));
    }

    #[tokio::test]
    async fn test_sweep_repeats_alerts_while_idle() {
        let store = Arc::new(MemoryStore::new());
        idle_doctor(&store, "Dr. Idle", 1).await;
        let broadcaster = EventBroadcaster::new();
        let monitor = monitor(store.clone(), &broadcaster);

        assert_eq!(monitor.sweep(Utc::now()).await.unwrap().len(), 1);
        assert_eq!(monitor.sweep(Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_recent_or_off_duty_doctors_are_skipped() {
        let store = Arc::new(MemoryStore::new());

        let serving = idle_doctor(&store, "Dr. Serving", 2).await;
        let mut entry = store.load_opd_queue(serving.id).await.unwrap().value[0].clone();
        entry.status = EntryStatus::InProgress;
        store.commit(ChangeSet::new().opd_entry(entry)).await.unwrap();

        let mut recent = idle_doctor(&store, "Dr. Recent", 2).await;
        recent.last_action_at = Utc::now() - chrono::Duration::minutes(2);
        store.commit(ChangeSet::new().doctor(recent)).await.unwrap();

        let mut away = idle_doctor(&store, "Dr. Away", 2).await;
        away.work_status = WorkStatus::InOt;
        store.commit(ChangeSet::new().doctor(away)).await.unwrap();

        let findings = monitor(store.clone(), &EventBroadcaster::new())
            .sweep(Utc::now())
            .await
            .unwrap();
        assert!(findings.is_empty());
    }

    #[tokio::test]
    async fn test_failure_for_one_doctor_does_not_abort_sweep() {
        let memory = Arc::new(MemoryStore::new());
        let broken = idle_doctor(&memory, "Dr. Broken", 2).await;
        let healthy = idle_doctor(&memory, "Dr. Healthy", 2).await;
        let store = Arc::new(FaultyStore::new(memory.clone()).break_queue(broken.id));

        let findings = monitor(store, &EventBroadcaster::new())
            .sweep(Utc::now())
            .await
            .unwrap();

        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].doctor_id, healthy.id);
    }

    #[tokio::test]
    async fn test_background_task_alerts_and_shuts_down() {
        let store = Arc::new(MemoryStore::new());
        let idle = idle_doctor(&store, "Dr. Idle", 1).await;
        let broadcaster = EventBroadcaster::new();
        let mut events = broadcaster.subscribe();

        let handle = InactivityMonitor::new(
            store.clone(),
            Arc::new(broadcaster.clone()),
            InactivitySettings {
                interval: Duration::from_millis(20),
                threshold: Duration::from_secs(600),
            },
        )
        .start();

        let notification = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("monitor should alert")
            .unwrap();
        assert!(notification.event.concerns_doctor(idle.id));

        handle.shutdown().await;
    }
}
