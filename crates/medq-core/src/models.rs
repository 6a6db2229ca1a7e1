//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MedqError;

/// 排队优先级（0 = 普通, 1 = 紧急）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Priority {
    Normal,
    Urgent,
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Normal => 0,
            Priority::Urgent => 1,
        }
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Normal),
            1 => Ok(Priority::Urgent),
            other => Err(format!("invalid priority {}", other)),
        }
    }
}

impl Priority {
    pub fn from_flag(urgent: bool) -> Self {
        if urgent {
            Priority::Urgent
        } else {
            Priority::Normal
        }
    }
}

/// 队列条目状态，同时也是就诊的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Waiting,      // 候诊
    InProgress,   // 就诊中
    Completed,    // 已完成
    NotAvailable, // 暂不在场
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Waiting => "WAITING",
            EntryStatus::InProgress => "IN_PROGRESS",
            EntryStatus::Completed => "COMPLETED",
            EntryStatus::NotAvailable => "NOT_AVAILABLE",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, EntryStatus::Completed)
    }
}

impl FromStr for EntryStatus {
    type Err = MedqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(EntryStatus::Waiting),
            "IN_PROGRESS" => Ok(EntryStatus::InProgress),
            "COMPLETED" => Ok(EntryStatus::Completed),
            "NOT_AVAILABLE" => Ok(EntryStatus::NotAvailable),
            other => Err(MedqError::Validation(format!("unknown entry status {}", other))),
        }
    }
}

/// 医生工作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    Available, // 空闲
    InOpd,     // 门诊中
    InOt,      // 手术中
    Leave,     // 休假
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Available => "AVAILABLE",
            WorkStatus::InOpd => "IN_OPD",
            WorkStatus::InOt => "IN_OT",
            WorkStatus::Leave => "LEAVE",
        }
    }
}

impl FromStr for WorkStatus {
    type Err = MedqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(WorkStatus::Available),
            "IN_OPD" => Ok(WorkStatus::InOpd),
            "IN_OT" => Ok(WorkStatus::InOt),
            "LEAVE" => Ok(WorkStatus::Leave),
            other => Err(MedqError::Validation(format!("unknown work status {}", other))),
        }
    }
}

/// 检查类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TestType {
    #[serde(rename = "XRAY")]
    Xray,
    #[serde(rename = "MRI")]
    Mri,
    #[serde(rename = "LAB")]
    Lab,
}

impl TestType {
    pub const ALL: [TestType; 3] = [TestType::Xray, TestType::Mri, TestType::Lab];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Xray => "XRAY",
            TestType::Mri => "MRI",
            TestType::Lab => "LAB",
        }
    }
}

impl FromStr for TestType {
    type Err = MedqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "XRAY" => Ok(TestType::Xray),
            "MRI" => Ok(TestType::Mri),
            "LAB" => Ok(TestType::Lab),
            other => Err(MedqError::Validation(format!("unknown test type {}", other))),
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 队列键：门诊按医生划分，检查按检查类型划分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueKey {
    Opd { doctor_id: Uuid },
    Diagnostic { test_type: TestType },
}

impl QueueKey {
    /// 持久化层使用的字符串键
    pub fn storage_key(&self) -> String {
        match self {
            QueueKey::Opd { doctor_id } => format!("opd:{}", doctor_id),
            QueueKey::Diagnostic { test_type } => format!("diagnostic:{}", test_type.as_str()),
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// 就诊信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub token: i32,
    pub service_date: NaiveDate, // 号源所属日期
    pub external_reference: String, // 二维码/患者查询使用的外部引用
    pub is_emergency: bool,
    pub emergency_reason: Option<String>,
    pub is_protected: bool,
    pub status: EntryStatus,
    pub diagnosis: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Visit {
    pub fn opd_queue(&self) -> QueueKey {
        QueueKey::Opd {
            doctor_id: self.doctor_id,
        }
    }
}

/// 门诊队列条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpdEntry {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub doctor_id: Uuid,
    pub token: i32,
    pub service_date: NaiveDate,
    pub status: EntryStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 检查队列条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub test_type: TestType,
    pub status: EntryStatus,
    pub priority: Priority,
    pub is_emergency: bool,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 按条目ID查询时返回的任一队列条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queue", rename_all = "snake_case")]
pub enum QueueEntry {
    Opd(OpdEntry),
    Diagnostic(DiagnosticEntry),
}

impl QueueEntry {
    pub fn id(&self) -> Uuid {
        match self {
            QueueEntry::Opd(entry) => entry.id,
            QueueEntry::Diagnostic(entry) => entry.id,
        }
    }

    pub fn visit_id(&self) -> Uuid {
        match self {
            QueueEntry::Opd(entry) => entry.visit_id,
            QueueEntry::Diagnostic(entry) => entry.visit_id,
        }
    }

    pub fn status(&self) -> EntryStatus {
        match self {
            QueueEntry::Opd(entry) => entry.status,
            QueueEntry::Diagnostic(entry) => entry.status,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            QueueEntry::Opd(entry) => entry.priority,
            QueueEntry::Diagnostic(entry) => entry.priority,
        }
    }

    pub fn queue_key(&self) -> QueueKey {
        match self {
            QueueEntry::Opd(entry) => QueueKey::Opd {
                doctor_id: entry.doctor_id,
            },
            QueueEntry::Diagnostic(entry) => QueueKey::Diagnostic {
                test_type: entry.test_type,
            },
        }
    }
}

/// 医生
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Uuid,
    pub name: String,
    pub department: String,
    pub opd_room: String,
    pub work_status: WorkStatus,
    pub delay_reason: Option<String>,
    pub last_action_at: DateTime<Utc>, // 最近一次接诊或完成就诊的时间
    pub created_at: DateTime<Utc>,
}

impl Doctor {
    pub fn opd_queue(&self) -> QueueKey {
        QueueKey::Opd { doctor_id: self.id }
    }
}

/// 处方药品
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prescription {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub medicine_name: String,
    pub dosage: Option<String>,
    pub created_at: DateTime<Utc>,
}
