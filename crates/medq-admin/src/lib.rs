//! # MedQ 管理模块
//!
//! 提供配置加载与校验、日志初始化以及队列指标等运维功能

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{
    BroadcasterConfig, ConfigManager, ConfigValidator, DatabaseBackend, DatabaseConfig,
    InactivityConfig, LoggingConfig, MedqConfig, RegistryConfig, ServerConfig,
};
pub use logging::{build_filter, init_logging};
pub use metrics::QueueMetrics;
