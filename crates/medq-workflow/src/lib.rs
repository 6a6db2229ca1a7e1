//! # MedQ 排队工作流模块
//!
//! 提供门诊与检查排队的完整流程管理，包括：
//! - 就诊登记：原子分配号源并入队
//! - 叫号顺序：优先级 + 号源/到达时间的确定性排序与串行叫号校验
//! - 条目状态机：管理候诊、就诊中、暂不在场、已完成之间的转换
//! - 优先级升级：紧急标记与管理员覆盖，附带审计
//! - 空闲监测：医生长时间无接诊动作时告警
//! - 看板视图：患者查询、公共大屏与管理端概况

pub mod broadcaster;
pub mod dashboard;
pub mod engine;
pub mod escalation;
pub mod inactivity;
pub mod ordering;
pub mod registry;
pub mod retry;
pub mod state_machine;

#[cfg(test)]
mod test_support;

// 重新导出主要类型
pub use broadcaster::EventBroadcaster;
pub use dashboard::{
    AdminOverview, Dashboard, DiagnosticBoardRow, DiagnosticQueueSummary, DoctorBoardRow,
    DoctorOverviewRow, PublicBoard, QueueStanding, VisitStatusView,
};
pub use engine::{
    CompletedService, CompletionDetails, DoctorProfile, EngineSettings, MedicineOrder,
    QueueEngine, Referral,
};
pub use escalation::{EscalationOutcome, PriorityEscalation};
pub use inactivity::{
    InactivityFinding, InactivityMonitor, InactivityMonitorHandle, InactivitySettings,
};
pub use ordering::{queue_order, QueueView, Queued};
pub use registry::{Registration, VisitRegistry, VisitRequest};
pub use retry::RetryPolicy;
pub use state_machine::{EntryEvent, EntryStateMachine};
