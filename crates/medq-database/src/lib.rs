//! # MedQ数据库模块
//!
//! 负责就诊、队列条目、医生状态与审计记录的持久化，提供内存与PostgreSQL两种存储实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod postgres;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::{MemoryAuditLog, MemoryStore};
pub use postgres::{PgAuditLog, PgQueueStore};
