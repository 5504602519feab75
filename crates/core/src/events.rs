use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::LongLinkStatus;

/// Signals broadcast between components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreEvent {
    NetworkChanged,
    Foreground(bool),
    Active(bool),
    LongLinkStatus { generation: u64, status: LongLinkStatus },
}

/// Typed broadcast bus. Subscribers get a handle that stops delivery on drop.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn receiver(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Runs `handler` on a spawned task for every event until the handle drops.
    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(CoreEvent) + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(subscriber = name, skipped, "事件订阅者处理过慢，丢弃部分事件");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }
}

#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
