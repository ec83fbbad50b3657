//! Notification fan-out to interface subscribers.
//!
//! Delivery is fire-and-forget and asynchronous: events are queued on
//! unbounded per-subscriber channels, so a slow or dead subscriber never
//! blocks the channel read loop or other subscribers. Entries whose
//! receiver has gone away are pruned on the next failed send.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::bridge::protocol::Notification;

struct SubscriberEntry {
    id: u64,
    tx: mpsc::UnboundedSender<Notification>,
}

/// Concurrent registry mapping interface names to live subscribers.
///
/// Registration and deregistration may happen from arbitrary caller
/// contexts while the worker's dispatch path reads; DashMap's per-shard
/// locking keeps the two from contending on a single table lock.
pub struct SubscriptionRegistry {
    subscribers: DashMap<String, Vec<SubscriberEntry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Register interest in events for one interface name.
    ///
    /// Many subscribers may watch the same name; one subscriber may hold
    /// subscriptions for several names.
    pub fn subscribe(self: &Arc<Self>, ifname: impl Into<String>) -> Subscription {
        let ifname = ifname.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(ifname.clone())
            .or_default()
            .push(SubscriberEntry { id, tx });
        tracing::debug!(%ifname, subscriber = id, "subscribed");
        Subscription {
            ifname,
            id,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Deliver an event to every subscriber registered for its interface.
    pub fn dispatch(&self, notification: &Notification) {
        let ifname = notification.ifname();
        let Some(mut entries) = self.subscribers.get_mut(ifname) else {
            tracing::trace!(ifname, event = notification.tag(), "no subscribers for event");
            return;
        };
        entries.retain(|entry| match entry.tx.send(notification.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(ifname, subscriber = entry.id, "pruning dead subscriber");
                false
            }
        });
    }

    fn unsubscribe(&self, ifname: &str, id: u64) {
        if let Some(mut entries) = self.subscribers.get_mut(ifname) {
            entries.retain(|entry| entry.id != id);
            if !entries.is_empty() {
                return;
            }
        }
        self.subscribers.remove_if(ifname, |_, entries| entries.is_empty());
    }

    #[cfg(test)]
    fn subscriber_count(&self, ifname: &str) -> usize {
        self.subscribers
            .get(ifname)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }
}

/// Live interest in one interface's events. Deregisters on drop.
pub struct Subscription {
    ifname: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Notification>,
    registry: Arc<SubscriptionRegistry>,
}

impl Subscription {
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Next event dispatched to this subscription.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Already-queued event, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.ifname, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{IfIdentity, sample_status};

    fn changed(ifname: &str) -> Notification {
        Notification::Ifchanged(sample_status(ifname))
    }

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let registry = SubscriptionRegistry::new();
        let mut eth0_a = registry.subscribe("eth0");
        let mut eth0_b = registry.subscribe("eth0");
        let mut wlan0 = registry.subscribe("wlan0");

        registry.dispatch(&changed("eth0"));

        assert_eq!(eth0_a.recv().await.unwrap().ifname(), "eth0");
        assert_eq!(eth0_b.recv().await.unwrap().ifname(), "eth0");
        assert!(wlan0.try_recv().is_none());
    }

    #[tokio::test]
    async fn one_subscriber_may_watch_multiple_names() {
        let registry = SubscriptionRegistry::new();
        let mut eth0 = registry.subscribe("eth0");
        let mut eth1 = registry.subscribe("eth1");

        registry.dispatch(&Notification::Ifremoved(IfIdentity {
            index: 3,
            ifname: "eth1".to_string(),
        }));

        assert_eq!(eth1.recv().await.unwrap().tag(), "ifremoved");
        assert!(eth0.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_deregisters() {
        let registry = SubscriptionRegistry::new();
        let keep = registry.subscribe("eth0");
        let gone = registry.subscribe("eth0");
        assert_eq!(registry.subscriber_count("eth0"), 2);

        drop(gone);
        assert_eq!(registry.subscriber_count("eth0"), 1);
        drop(keep);
        assert_eq!(registry.subscriber_count("eth0"), 0);
    }

    #[tokio::test]
    async fn stale_entries_are_pruned_on_failed_send() {
        let registry = SubscriptionRegistry::new();
        let mut live = registry.subscribe("eth0");

        // A receiver whose channel is closed but whose entry was never
        // deregistered: close the receiver without dropping the handle.
        let mut stale = registry.subscribe("eth0");
        stale.rx.close();
        assert_eq!(registry.subscriber_count("eth0"), 2);

        registry.dispatch(&changed("eth0"));
        assert_eq!(live.recv().await.unwrap().ifname(), "eth0");
        assert_eq!(registry.subscriber_count("eth0"), 1);
    }
}
