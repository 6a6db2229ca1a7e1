//! 队列指标
//!
//! 作为通知订阅者按事件类型计数，并以 Prometheus 文本格式导出。

use anyhow::Result;
use medq_core::Notification;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 队列指标收集器
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    registry: Registry,
    notifications_total: IntCounterVec,
    notifications_lagged_total: IntCounter,
}

impl QueueMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let notifications_total = IntCounterVec::new(
            Opts::new("medq_notifications_total", "Published queue notifications by type"),
            &["type"],
        )?;

        let notifications_lagged_total = IntCounter::with_opts(Opts::new(
            "medq_notifications_lagged_total",
            "Notifications dropped because the metrics subscriber lagged",
        ))?;

        registry.register(Box::new(notifications_total.clone()))?;
        registry.register(Box::new(notifications_lagged_total.clone()))?;

        Ok(Self {
            registry,
            notifications_total,
            notifications_lagged_total,
        })
    }

    /// 记录一条通知
    pub fn observe(&self, notification: &Notification) {
        self.notifications_total
            .with_label_values(&[notification.event.name()])
            .inc();
    }

    pub fn record_lagged(&self, skipped: u64) {
        self.notifications_lagged_total.inc_by(skipped);
    }

    /// 某一事件类型的累计数量
    pub fn count(&self, event_type: &str) -> u64 {
        self.notifications_total
            .with_label_values(&[event_type])
            .get()
    }

    pub fn lagged(&self) -> u64 {
        self.notifications_lagged_total.get()
    }

    /// Prometheus 文本格式
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }

    /// 启动订阅任务，广播关闭时退出
    pub fn spawn(self: Arc<Self>, mut receiver: broadcast::Receiver<Notification>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(notification) => {
                        debug!(
                            notification_id = %notification.id,
                            event = notification.event.name(),
                            "Notification observed"
                        );
                        self.observe(&notification);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics subscriber lagged behind");
                        self.record_lagged(skipped);
                    }
                    Err(RecvError::Closed) => {
                        info!("Notification channel closed, metrics subscriber stopping");
                        break;
                    }
                }
            }
        })
    }
}
