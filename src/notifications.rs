//! Notification Bus — relays `new_trade`-style events to every connected
//! client sink. One `Arc<NotificationBus>` is built in `main()` and cloned
//! into the Supervisor and Control Surface, rather than a process global.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::fanout::OutboundFrame;

pub struct NotificationBus {
    sinks: Mutex<Vec<mpsc::UnboundedSender<OutboundFrame>>>,
}

impl NotificationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sinks: Mutex::new(Vec::new()),
        })
    }

    pub async fn register(&self, sink: mpsc::UnboundedSender<OutboundFrame>) {
        self.sinks.lock().await.push(sink);
    }

    pub async fn send(&self, notification_type: &str, bot_id: i64, payload: Value) {
        let frame = OutboundFrame::Notification {
            notification_type: notification_type.to_string(),
            bot_id,
            payload,
        };
        let mut sinks = self.sinks.lock().await;
        sinks.retain(|s| s.send(frame.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_prunes_dropped_receivers() {
        let bus = NotificationBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.register(tx).await;
        drop(rx);
        bus.send("new_trade", 1, serde_json::json!({})).await;
        assert_eq!(bus.sinks.lock().await.len(), 0);
    }
}
