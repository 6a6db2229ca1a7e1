//! 事件广播器
//!
//! 基于 tokio broadcast 通道的多生产者多消费者通知总线。通道有界，
//! 落后的订阅者会丢失最旧的通知；没有订阅者时通知直接丢弃。

use medq_core::{EventPublisher, Notification, QueueEvent};
use tokio::sync::broadcast;

/// 默认通道容量
pub const DEFAULT_CAPACITY: usize = 1024;

/// 排队通知广播器
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<Notification>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发送通知，返回收到通知的订阅者数量
    pub fn send(&self, event: QueueEvent) -> usize {
        let notification = Notification::new(event);
        tracing::debug!(
            event = notification.event.name(),
            id = %notification.id,
            "Broadcasting notification"
        );
        self.sender.send(notification).unwrap_or_default()
    }

    /// 订阅之后发出的通知；订阅之前的通知不会补发
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventPublisher for EventBroadcaster {
    fn publish(&self, event: QueueEvent) {
        self.send(event);
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
