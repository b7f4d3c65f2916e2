use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::models::InstallerEvent;

const DEFAULT_CAPACITY: usize = 256;

/// In-process fan-out of installer outcomes. Events published while nobody
/// listens are dropped.
#[derive(Clone)]
pub struct StatusEventBus {
    tx: broadcast::Sender<InstallerEvent>,
}

impl Default for StatusEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl StatusEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns how many subscribers the event reached.
    pub fn publish(&self, event: InstallerEvent) -> usize {
        tracing::debug!("status bus publish {:?}", event);
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(
                    "status bus has no subscribers, dropping event for {}",
                    event.package_name()
                );
                0
            }
        }
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct EventSubscription {
    rx: broadcast::Receiver<InstallerEvent>,
}

impl EventSubscription {
    /// Next event in publish order; a lagging subscriber skips what it missed.
    /// `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<InstallerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("status bus subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(package: &str) -> InstallerEvent {
        InstallerEvent::Installed {
            package_name: package.to_string(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let bus = StatusEventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.publish(installed("com.example.a")), 2);
        assert_eq!(
            bus.publish(InstallerEvent::Uninstalled {
                package_name: "com.example.b".to_string()
            }),
            2
        );

        for subscription in [&mut first, &mut second] {
            assert_eq!(subscription.recv().await, Some(installed("com.example.a")));
            assert_eq!(
                subscription.recv().await.map(|event| event.package_name().to_string()),
                Some("com.example.b".to_string())
            );
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_lossy_not_an_error() {
        let bus = StatusEventBus::default();
        assert_eq!(bus.publish(installed("com.example.lost")), 0);

        let mut late = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(installed("com.example.seen"));
        assert_eq!(late.recv().await, Some(installed("com.example.seen")));
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let bus = StatusEventBus::new(2);
        let mut slow = bus.subscribe();
        for index in 0..5 {
            bus.publish(installed(&format!("com.example.{index}")));
        }
        let next = slow.recv().await.expect("event after lag");
        assert_eq!(next.package_name(), "com.example.3");
    }
}
