//! MedQ 排队服务主程序

use anyhow::{Context, Result};
use clap::Parser;
use medq_admin::{init_logging, ConfigManager, DatabaseBackend, MedqConfig, QueueMetrics};
use medq_core::{AuditSink, Notification, QueueEvent, QueueStore};
use medq_database::{DatabasePool, MemoryAuditLog, MemoryStore, PgAuditLog, PgQueueStore};
use medq_workflow::{EngineSettings, EventBroadcaster, InactivitySettings, QueueEngine};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// MedQ 服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "medq-server")]
#[command(about = "门诊与检查排队调度服务")]
struct Args {
    /// 配置文件路径（TOML）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 覆盖配置中的日志级别
    #[arg(short, long)]
    log_level: Option<String>,

    /// 打印生效配置后退出
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let manager = ConfigManager::load(args.config.as_deref())?;
    if args.print_config {
        println!("{}", manager.to_toml()?);
        return Ok(());
    }

    let mut config = manager.into_config();
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    init_logging(&config.logging)?;

    info!("启动MedQ排队服务: {}", config.server.name);
    info!("  存储后端: {:?}", config.database.backend);
    info!("  空闲监测: {}", config.inactivity.enabled);

    let (store, audit) = open_store(&config).await?;

    let broadcaster = Arc::new(EventBroadcaster::with_capacity(config.broadcaster.capacity));
    let metrics = Arc::new(QueueMetrics::new()?);
    let metrics_task = metrics.clone().spawn(broadcaster.subscribe());
    let event_log_task = log_notifications(broadcaster.subscribe());

    let engine = QueueEngine::new(
        store,
        audit,
        broadcaster.clone(),
        EngineSettings {
            max_attempts: config.registry.max_attempts,
            utc_offset: config.registry.utc_offset()?,
            minutes_per_patient: config.registry.minutes_per_patient,
        },
    );

    let board = engine
        .public_board()
        .await
        .context("Failed to read initial queue state")?;
    info!("已加载 {} 位医生的门诊队列", board.doctors.len());

    let monitor = if config.inactivity.enabled {
        Some(
            engine
                .inactivity_monitor(InactivitySettings {
                    interval: config.inactivity.interval(),
                    threshold: config.inactivity.threshold(),
                })
                .start(),
        )
    } else {
        None
    };

    info!("MedQ排队服务已就绪，按 Ctrl-C 退出");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("收到退出信号，正在关闭...");

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    if let Some(monitor) = monitor {
        if tokio::time::timeout(timeout, monitor.shutdown()).await.is_err() {
            warn!("空闲监测任务未在 {:?} 内退出", timeout);
        }
    }

    // 释放全部发送端后订阅任务自行结束
    drop(engine);
    drop(broadcaster);
    for task in [metrics_task, event_log_task] {
        match tokio::time::timeout(timeout, task).await {
            Ok(Err(e)) => error!("订阅任务异常退出: {}", e),
            Err(_) => warn!("订阅任务未在 {:?} 内退出", timeout),
            Ok(Ok(())) => {}
        }
    }

    info!("运行期间指标:\n{}", metrics.render()?);
    info!("MedQ排队服务已停止");
    Ok(())
}

async fn open_store(config: &MedqConfig) -> Result<(Arc<dyn QueueStore>, Arc<dyn AuditSink>)> {
    match config.database.backend {
        DatabaseBackend::Memory => {
            warn!("使用内存存储，重启后数据将丢失");
            Ok((Arc::new(MemoryStore::new()), Arc::new(MemoryAuditLog::new())))
        }
        DatabaseBackend::Postgres => {
            let url = config
                .database
                .url
                .as_deref()
                .context("database.url is required for the postgres backend")?;
            let pool = DatabasePool::connect(
                url,
                config.database.max_connections,
                Duration::from_secs(config.database.connect_timeout_secs),
            )
            .await
            .context("Failed to connect to PostgreSQL")?;

            let store = PgQueueStore::new(pool.clone());
            store
                .create_tables()
                .await
                .context("Failed to create tables")?;

            Ok((Arc::new(store), Arc::new(PgAuditLog::new(pool))))
        }
    }
}

/// 将告警类通知写入日志，其余通知以 debug 级别记录
fn log_notifications(mut receiver: broadcast::Receiver<Notification>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(notification) => {
                    let payload = serde_json::to_string(&notification).unwrap_or_default();
                    match &notification.event {
                        QueueEvent::EmergencyRaised { .. }
                        | QueueEvent::InactivityAlert { .. }
                        | QueueEvent::AdminAlert { .. } => {
                            warn!(event = notification.event.name(), %payload, "Alert notification");
                        }
                        _ => {
                            tracing::debug!(event = notification.event.name(), %payload, "Notification");
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log subscriber lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
