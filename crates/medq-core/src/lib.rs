//! # MedQ Core
//!
//! 排队引擎的核心模块，提供数据模型、错误定义、事件约定以及存储/审计/权限协作接口。

pub mod access;
pub mod audit;
pub mod error;
pub mod events;
pub mod models;
pub mod store;
pub mod utils;

pub use access::{AccessPolicy, Actor, Operation, PatientVerifier, Role, RolePolicy};
pub use audit::{AuditAction, AuditRecord, AuditSink};
pub use error::{ErrorKind, MedqError, Result};
pub use events::{AdminAlertKind, EventPublisher, Notification, QueueEvent};
pub use models::*;
pub use store::{ChangeSet, QueueStore, Versioned};
