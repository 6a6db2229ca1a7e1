//! 变更通知约定
//!
//! 所有成功提交的变更都会发布一条带作用域的通知。投递为尽力而为、至多一次：
//! 没有回放日志，重连的观察者需要重新拉取队列状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{QueueKey, WorkStatus};

/// 管理端告警类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminAlertKind {
    Inactivity,
}

/// 排队事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    QueueChanged {
        scope: QueueKey,
    },
    DoctorStatusChanged {
        doctor_id: Uuid,
        status: WorkStatus,
        delay_reason: Option<String>,
    },
    EmergencyRaised {
        doctor_id: Uuid,
        message: String,
    },
    InactivityAlert {
        doctor_id: Uuid,
        message: String,
    },
    AdminAlert {
        kind: AdminAlertKind,
        doctor_id: Uuid,
        message: String,
    },
}

impl QueueEvent {
    pub fn queue_changed(scope: QueueKey) -> Self {
        QueueEvent::QueueChanged { scope }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::QueueChanged { .. } => "queue_changed",
            QueueEvent::DoctorStatusChanged { .. } => "doctor_status_changed",
            QueueEvent::EmergencyRaised { .. } => "emergency_raised",
            QueueEvent::InactivityAlert { .. } => "inactivity_alert",
            QueueEvent::AdminAlert { .. } => "admin_alert",
        }
    }

    /// 事件是否与某位医生相关（医生屏幕据此过滤）
    pub fn concerns_doctor(&self, id: Uuid) -> bool {
        match self {
            QueueEvent::QueueChanged {
                scope: QueueKey::Opd { doctor_id },
            } => *doctor_id == id,
            QueueEvent::QueueChanged { .. } => false,
            QueueEvent::DoctorStatusChanged { doctor_id, .. }
            | QueueEvent::EmergencyRaised { doctor_id, .. }
            | QueueEvent::InactivityAlert { doctor_id, .. }
            | QueueEvent::AdminAlert { doctor_id, .. } => *doctor_id == id,
        }
    }
}

/// 通知信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: QueueEvent,
}

impl Notification {
    pub fn new(event: QueueEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            emitted_at: Utc::now(),
            event,
        }
    }
}

/// 事件发布器
///
/// 只能在变更提交之后调用；实现必须是非阻塞的，且发布失败不能影响调用方。
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: QueueEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TestType;

    #[test]
    fn test_event_wire_format() {
        let doctor_id = Uuid::new_v4();
        let notification = Notification::new(QueueEvent::queue_changed(QueueKey::Opd { doctor_id }));
        let json = serde_json::to_value(&notification).unwrap();

        assert_eq!(json["type"], "queue_changed");
        assert_eq!(json["scope"]["kind"], "opd");
        assert_eq!(json["scope"]["doctor_id"], doctor_id.to_string());
    }

    #[test]
    fn test_concerns_doctor() {
        let doctor_id = Uuid::new_v4();
        let alert = QueueEvent::InactivityAlert {
            doctor_id,
            message: "idle".to_string(),
        };
        assert!(alert.concerns_doctor(doctor_id));
        assert!(!alert.concerns_doctor(Uuid::new_v4()));

        let lab = QueueEvent::queue_changed(QueueKey::Diagnostic {
            test_type: TestType::Lab,
        });
        assert!(!lab.concerns_doctor(doctor_id));
    }
}
