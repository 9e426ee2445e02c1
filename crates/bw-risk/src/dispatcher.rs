//! Alert fan-out to registered channels.
//!
//! Each channel receives each alert on its own task, so a slow or failing
//! channel never delays the others or the evaluation loop.

use std::sync::Arc;

use async_trait::async_trait;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::alerts::{Alert, RiskSeverity};

/// Errors surfaced by alert channels.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("channel {channel} is closed")]
    Closed { channel: String },
    #[error("channel {channel} is full")]
    Full { channel: String },
    #[error("delivery via {channel} failed: {message}")]
    Failed { channel: String, message: String },
}

/// Destination for alerts (pager, chat, queue, log...).
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: Alert) -> Result<(), DeliveryError>;
}

/// Wraps a synchronous callback.
pub struct CallbackChannel<F> {
    name: String,
    callback: F,
}

impl<F> CallbackChannel<F>
where
    F: Fn(&Alert) -> Result<(), DeliveryError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> AlertChannel for CallbackChannel<F>
where
    F: Fn(&Alert) -> Result<(), DeliveryError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: Alert) -> Result<(), DeliveryError> {
        (self.callback)(&alert)
    }
}

/// Forwards alerts into a crossbeam channel for consumers outside the
/// async runtime. Never blocks: a full channel is a delivery failure.
pub struct CrossbeamChannel {
    name: String,
    tx: Sender<Alert>,
}

impl CrossbeamChannel {
    pub fn new(name: impl Into<String>, tx: Sender<Alert>) -> Self {
        Self { name: name.into(), tx }
    }
}

#[async_trait]
impl AlertChannel for CrossbeamChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, alert: Alert) -> Result<(), DeliveryError> {
        self.tx.try_send(alert).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full {
                channel: self.name.clone(),
            },
            TrySendError::Disconnected(_) => DeliveryError::Closed {
                channel: self.name.clone(),
            },
        })
    }
}

/// Writes alerts to the tracing log.
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: Alert) -> Result<(), DeliveryError> {
        match alert.severity {
            RiskSeverity::Critical => error!(alert_id = %alert.id, %alert.message, "RISK CRITICAL"),
            RiskSeverity::Warning => warn!(alert_id = %alert.id, %alert.message, "RISK WARNING"),
            RiskSeverity::Info => info!(alert_id = %alert.id, %alert.message, "RISK INFO"),
        }
        Ok(())
    }
}

/// Registry of alert channels. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct AlertDispatcher {
    channels: Arc<RwLock<Vec<Arc<dyn AlertChannel>>>>,
}

impl AlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn AlertChannel>) {
        info!(channel = channel.name(), "alert channel registered");
        self.channels.write().push(channel);
    }

    /// Register a callback invoked for every alert.
    pub fn on_alert<F>(&self, callback: F)
    where
        F: Fn(&Alert) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        let name = format!("callback-{}", self.channel_count());
        self.register(Arc::new(CallbackChannel::new(name, callback)));
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Hand `alert` to every registered channel, each on its own task.
    /// Delivery failures are logged and never propagated. Must be called
    /// from within a tokio runtime.
    pub fn dispatch(&self, alert: &Alert) -> Vec<JoinHandle<()>> {
        let channels: Vec<Arc<dyn AlertChannel>> = self.channels.read().iter().cloned().collect();
        if channels.is_empty() {
            warn!(alert_id = %alert.id, %alert.message, "alert raised with no channels registered");
        }
        channels
            .into_iter()
            .map(|channel| {
                let alert = alert.clone();
                tokio::spawn(async move {
                    let alert_id = alert.id;
                    if let Err(e) = channel.deliver(alert).await {
                        warn!(channel = channel.name(), %alert_id, error = %e, "alert delivery failed");
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{LimitMetric, RiskLimit};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn alert() -> Alert {
        let limit = RiskLimit::above(LimitMetric::Concentration, 0.3, RiskSeverity::Critical);
        Alert::breach(&limit, 0.45, Uuid::new_v4())
    }

    struct Failing;

    #[async_trait]
    impl AlertChannel for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _alert: Alert) -> Result<(), DeliveryError> {
            Err(DeliveryError::Failed {
                channel: "failing".into(),
                message: "down".into(),
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl AlertChannel for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn deliver(&self, _alert: Alert) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn callback_receives_alert() {
        let dispatcher = AlertDispatcher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        dispatcher.on_alert(move |a| {
            assert_eq!(a.current_value, 0.45);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        for handle in dispatcher.dispatch(&alert()) {
            handle.await.unwrap();
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let dispatcher = AlertDispatcher::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        dispatcher.register(Arc::new(Failing));
        dispatcher.register(Arc::new(Slow));
        dispatcher.register(Arc::new(CrossbeamChannel::new("queue", tx)));
        assert_eq!(dispatcher.channel_count(), 3);

        let handles = dispatcher.dispatch(&alert());
        let mut handles = handles.into_iter();
        handles.next().unwrap().await.unwrap();
        let slow = handles.next().unwrap();
        handles.next().unwrap().await.unwrap();

        assert!(!slow.is_finished());
        let received = rx.try_recv().unwrap();
        assert_eq!(received.threshold, 0.3);
        slow.abort();
    }

    #[tokio::test]
    async fn closed_crossbeam_channel_reports_error() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        let channel = CrossbeamChannel::new("queue", tx);
        assert!(matches!(channel.deliver(alert()).await, Err(DeliveryError::Closed { .. })));
    }

    #[tokio::test]
    async fn full_crossbeam_channel_reports_error() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let channel = CrossbeamChannel::new("queue", tx);
        channel.deliver(alert()).await.unwrap();
        assert!(matches!(channel.deliver(alert()).await, Err(DeliveryError::Full { .. })));
    }
}
