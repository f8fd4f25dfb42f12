//! Installation change bus
//!
//! Multicast of [`InstallationChangeEvent`]s to every attached subscriber.
//! There is no history: a subscriber sees only what is published after it
//! subscribed. Events from one publisher arrive in publish order.
//!
//! A subscriber that falls more than the channel capacity behind is not
//! silently skipped ahead: it receives [`ChangeNotice::Missed`] and must
//! rebuild its view from the filesystem.

use futures::stream::{self, Stream};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::InstallationChangeEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Fan-out channel for install and uninstall notifications
#[derive(Clone)]
pub struct InstallationChangeBus {
    sender: broadcast::Sender<InstallationChangeEvent>,
}

impl InstallationChangeBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a slow subscriber may fall behind
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver `event` to current subscribers; returns how many there were
    pub fn publish(&self, event: InstallationChangeEvent) -> usize {
        debug!(package_id = %event.package_id, kind = ?event.kind, "Publishing installation change");
        // No subscribers is not an error
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription { receiver: self.sender.subscribe() }
    }

}

impl Default for InstallationChangeBus {
    fn default() -> Self {
        Self::new()
    }
}

/// What a subscriber receives from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeNotice {
    Changed(InstallationChangeEvent),
    /// This many events were dropped before reaching the subscriber
    Missed(u64),
}

impl ChangeNotice {
    pub fn into_event(self) -> Option<InstallationChangeEvent> {
        match self {
            ChangeNotice::Changed(event) => Some(event),
            ChangeNotice::Missed(_) => None,
        }
    }
}

/// Receiving end of the bus
pub struct ChangeSubscription {
    receiver: broadcast::Receiver<InstallationChangeEvent>,
}

impl ChangeSubscription {
    /// Next notice, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<ChangeNotice> {
        match self.receiver.recv().await {
            Ok(event) => Some(ChangeNotice::Changed(event)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Installation change subscriber fell behind");
                Some(ChangeNotice::Missed(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ChangeNotice> {
        stream::unfold(self, |mut sub| async move {
            let notice = sub.recv().await?;
            Some((notice, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::types::ChangeKind;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_multicast_to_all_subscribers() {
        let bus = InstallationChangeBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.publish(InstallationChangeEvent::new("demo", ChangeKind::LocalInstall)), 2);

        let ChangeNotice::Changed(first) = a.recv().await.unwrap() else { panic!("expected an event") };
        assert_eq!(first.package_id, "demo");
        let ChangeNotice::Changed(second) = b.recv().await.unwrap() else { panic!("expected an event") };
        assert_eq!(second.kind, ChangeKind::LocalInstall);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscribers() {
        let bus = InstallationChangeBus::new();
        assert_eq!(bus.publish(InstallationChangeEvent::new("early", ChangeKind::LocalInstall)), 0);

        let mut late = bus.subscribe();
        bus.publish(InstallationChangeEvent::new("late", ChangeKind::LocalUninstall));

        let notice = late.recv().await.unwrap().into_event().unwrap();
        assert_eq!(notice.package_id, "late");
    }

    #[tokio::test]
    async fn test_order_preserved_per_publisher() {
        let bus = InstallationChangeBus::new();
        let sub = bus.subscribe();

        for i in 0..5 {
            bus.publish(InstallationChangeEvent::new(format!("p{}", i), ChangeKind::LocalInstall));
        }
        drop(bus);

        let ids: Vec<String> = sub
            .into_stream()
            .filter_map(|n| async move { n.into_event() })
            .map(|e| e.package_id)
            .collect()
            .await;
        assert_eq!(ids, vec!["p0", "p1", "p2", "p3", "p4"]);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_is_told_what_it_missed() {
        let bus = InstallationChangeBus::with_capacity(2);
        let mut sub = bus.subscribe();
        for i in 0..4 {
            bus.publish(InstallationChangeEvent::new(format!("p{}", i), ChangeKind::LocalInstall));
        }

        assert_eq!(sub.recv().await.unwrap(), ChangeNotice::Missed(2));
        assert_eq!(sub.recv().await.unwrap().into_event().unwrap().package_id, "p2");
        assert_eq!(sub.recv().await.unwrap().into_event().unwrap().package_id, "p3");
    }
}
