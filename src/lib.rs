//! # MedQ
//!
//! 门诊与检查排队调度引擎的统一入口，重新导出各子 crate。

pub use medq_core as core;
pub use medq_database as database;
pub use medq_workflow as workflow;
