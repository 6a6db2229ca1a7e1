//! 配置管理
//!
//! 默认值 → TOML 配置文件 → `MEDQ_` 环境变量，逐层覆盖后再经 [`ConfigValidator`] 校验。
//! 环境变量使用 `__` 分隔层级，例如 `MEDQ_DATABASE__URL`。

use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

const ENV_PREFIX: &str = "MEDQ";
const MAX_OFFSET_MINUTES: i32 = 14 * 60;

/// 配置管理器
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: MedqConfig,
    validator: ConfigValidator,
}

/// MedQ 完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MedqConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub registry: RegistryConfig,
    pub inactivity: InactivityConfig,
    pub broadcaster: BroadcasterConfig,
    pub logging: LoggingConfig,
}

/// 服务进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    /// 关闭时等待后台任务退出的最长时间
    pub shutdown_timeout_secs: u64,
}

/// 存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Memory,
    Postgres,
}

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// 登记与叫号配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 并发冲突时的最大尝试次数
    pub max_attempts: u32,
    /// 医院所在时区相对 UTC 的分钟数，用于确定号源日期
    pub utc_offset_minutes: i32,
    pub minutes_per_patient: u32,
}

/// 空闲监测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InactivityConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub threshold_secs: u64,
}

/// 通知广播配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    pub capacity: usize,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter 指令，如 `info` 或 `medq_workflow=debug,info`
    pub level: String,
    /// pretty / json / compact
    pub format: String,
}

/// 配置验证器
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug, Clone)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&MedqConfig) -> Result<()>,
}

impl ConfigManager {
    /// 加载配置；未指定路径时尝试读取当前目录下可选的 `medq.toml`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("medq").required(false),
        };

        let manager = Self::build(Self::defaults()?.add_source(file))?;
        match path {
            Some(path) => info!("Configuration loaded from: {}", path.display()),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(manager)
    }

    /// 从 TOML 文本加载配置（同样叠加环境变量）
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::build(
            Self::defaults()?.add_source(File::from_str(content, FileFormat::Toml)),
        )
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let defaults = Config::try_from(&MedqConfig::default())
            .context("Failed to serialize default configuration")?;
        Ok(Config::builder().add_source(defaults))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: MedqConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self { config, validator })
    }

    pub fn config(&self) -> &MedqConfig {
        &self.config
    }

    pub fn into_config(self) -> MedqConfig {
        self.config
    }

    /// 重新校验当前配置
    pub fn validate_config(&self) -> Result<()> {
        self.validator.validate(&self.config)
    }

    /// 以 TOML 形式导出生效配置
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("Failed to serialize configuration")
    }
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "registry.max_attempts",
                validator: |config| {
                    if config.registry.max_attempts == 0 {
                        Err(anyhow!("max attempts cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "registry.utc_offset_minutes",
                validator: |config| {
                    if config.registry.utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
                        Err(anyhow!(
                            "offset {} is outside ±{} minutes",
                            config.registry.utc_offset_minutes,
                            MAX_OFFSET_MINUTES
                        ))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "inactivity",
                validator: |config| {
                    if config.inactivity.interval_secs == 0 || config.inactivity.threshold_secs == 0 {
                        Err(anyhow!("interval and threshold must be positive"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "broadcaster.capacity",
                validator: |config| {
                    if config.broadcaster.capacity == 0 {
                        Err(anyhow!("capacity cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "database.url",
                validator: |config| match (&config.database.backend, &config.database.url) {
                    (DatabaseBackend::Postgres, None) => {
                        Err(anyhow!("postgres backend requires a database url"))
                    }
                    (DatabaseBackend::Postgres, Some(url)) if url.trim().is_empty() => {
                        Err(anyhow!("postgres backend requires a database url"))
                    }
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "logging.format",
                validator: |config| match config.logging.format.as_str() {
                    "pretty" | "json" | "compact" => Ok(()),
                    other => Err(anyhow!("unknown log format: {}", other)),
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &MedqConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow!("Invalid {}: {}", rule.field_path, e));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryConfig {
    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .ok_or_else(|| anyhow!("invalid utc offset: {} minutes", self.utc_offset_minutes))
    }
}

impl InactivityConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "medq-server".to_string(),
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            url: None,
            max_connections: 10,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            utc_offset_minutes: 0,
            minutes_per_patient: 10,
        }
    }
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            threshold_secs: 600,
        }
    }
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
