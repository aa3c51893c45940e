//! Client-side subscription records and the table that indexes them.
//!
//! Wraps [`crate::topic::TopicTrie`] with the fields a live subscription
//! needs to track: which packet identifier its SUBACK will correlate to,
//! whether it has been unsubscribed, and the user's callback. The broker's
//! `SubscriptionStore` (share-group routing, retained-message cache) has no
//! counterpart here — a client only ever matches its own inbound PUBLISHes
//! against its own filters.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::protocol::QoS;
use crate::topic::TopicTrie;

use super::operation::asserts_enabled;

/// User callback invoked for each inbound PUBLISH matching a subscription's
/// filter.
pub type SubscribeCallback = Arc<dyn Fn(&str, &[u8], QoS) + Send + Sync>;

/// A single client subscription.
///
/// `references` is a domain-level in-flight-use counter, independent of the
/// `Arc`'s own strong count: it tracks how many in-progress callback
/// invocations and table lookups currently hold a borrow. A subscription is
/// torn down only once `unsubscribed` is set and `references == 0`.
pub struct Subscription {
    pub topic_filter: String,
    pub qos: QoS,
    pub packet_id_of_subscribe: u16,
    pub callback: SubscribeCallback,
    references: AtomicI64,
    unsubscribed: std::sync::atomic::AtomicBool,
}

impl Subscription {
    pub fn new(
        topic_filter: impl Into<String>,
        qos: QoS,
        packet_id_of_subscribe: u16,
        callback: SubscribeCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            topic_filter: topic_filter.into(),
            qos,
            packet_id_of_subscribe,
            callback,
            references: AtomicI64::new(1),
            unsubscribed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn acquire(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a reference; returns `true` if this was the last reference
    /// on an unsubscribed subscription (the caller may now drop it).
    pub fn release(&self) -> bool {
        let remaining = self.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if asserts_enabled() {
            debug_assert!(remaining >= 0, "subscription reference count underflow");
        }
        remaining == 0 && self.is_unsubscribed()
    }

    pub fn mark_unsubscribed(&self) {
        self.unsubscribed.store(true, Ordering::Release);
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::Acquire)
    }

    pub fn reference_count(&self) -> i64 {
        self.references.load(Ordering::Acquire)
    }
}

/// Guarded map from topic filter to subscription record, with
/// wildcard-aware lookup by inbound topic name. Callers acquire the
/// surrounding lock themselves (see `connection::core`) so the table itself
/// stays a plain, non-concurrent structure.
#[derive(Default)]
pub struct SubscriptionTable {
    trie: TopicTrie<Arc<Subscription>>,
    /// A single SUBSCRIBE packet can request several filters under one
    /// packet identifier, so the correlation key maps to all of them, in
    /// the order they appear in the packet — the same order as the
    /// eventual SUBACK's per-filter return codes.
    by_packet_id: std::collections::HashMap<u16, Vec<Arc<Subscription>>>,
    len: usize,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subscription: Arc<Subscription>) {
        self.by_packet_id
            .entry(subscription.packet_id_of_subscribe)
            .or_default()
            .push(subscription.clone());
        self.trie.insert(&subscription.topic_filter, subscription);
        self.len += 1;
    }

    pub fn remove_by_filter(&mut self, filter: &str) -> Option<Arc<Subscription>> {
        let removed = self.trie.remove(filter);
        if let Some(ref sub) = removed {
            if let Some(group) = self.by_packet_id.get_mut(&sub.packet_id_of_subscribe) {
                group.retain(|s| !Arc::ptr_eq(s, sub));
                if group.is_empty() {
                    self.by_packet_id.remove(&sub.packet_id_of_subscribe);
                }
            }
            self.len -= 1;
        }
        removed
    }

    /// Removes every subscription correlated to `packet_id` in one shot,
    /// since every subscription in the group shares that packet identifier.
    pub fn remove_by_packet_id(&mut self, packet_id: u16) -> Vec<Arc<Subscription>> {
        let Some(group) = self.by_packet_id.remove(&packet_id) else {
            return Vec::new();
        };
        for sub in &group {
            self.trie.remove(&sub.topic_filter);
        }
        self.len -= group.len();
        group
    }

    /// Collects every subscription matching `topic`, acquiring a reference
    /// on each before the caller releases the surrounding lock — so a
    /// subscription can be dispatched to safely after the table lock is
    /// dropped, even if it's removed concurrently.
    pub fn matches(&self, topic: &str) -> Vec<Arc<Subscription>> {
        let mut out = Vec::new();
        self.trie.matches(topic, |sub| {
            sub.acquire();
            out.push(sub.clone());
        });
        out
    }

    /// Applies a SUBACK's per-filter return codes to the group registered
    /// under `packet_id`, in order, removing any subscription whose return
    /// code was not accepted.
    pub fn apply_suback(&mut self, packet_id: u16, accepted: &[bool]) {
        let Some(group) = self.by_packet_id.remove(&packet_id) else {
            return;
        };
        let mut kept = Vec::with_capacity(group.len());
        for (sub, ok) in group.into_iter().zip(accepted.iter().copied()) {
            if ok {
                kept.push(sub);
            } else {
                self.trie.remove(&sub.topic_filter);
                self.len -= 1;
            }
        }
        if !kept.is_empty() {
            self.by_packet_id.insert(packet_id, kept);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_callback() -> SubscribeCallback {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn insert_then_match_finds_subscription() {
        let mut table = SubscriptionTable::new();
        table.insert(Subscription::new(
            "sensors/+/temp",
            QoS::AtMostOnce,
            1,
            noop_callback(),
        ));

        let matches = table.matches("sensors/42/temp");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].topic_filter, "sensors/+/temp");

        assert!(table.matches("sensors/42/humidity").is_empty());
    }

    #[test]
    fn round_trip_subscribe_unsubscribe_empties_table() {
        let mut table = SubscriptionTable::new();
        table.insert(Subscription::new("a/b", QoS::AtMostOnce, 7, noop_callback()));
        assert_eq!(table.len(), 1);

        table.remove_by_filter("a/b");
        assert!(table.is_empty());
    }

    #[test]
    fn remove_by_packet_id_removes_every_filter_in_the_batch() {
        let mut table = SubscriptionTable::new();
        table.insert(Subscription::new("a/b", QoS::AtMostOnce, 9, noop_callback()));
        table.insert(Subscription::new("c/d", QoS::AtMostOnce, 9, noop_callback()));
        assert_eq!(table.len(), 2);

        let removed = table.remove_by_packet_id(9);
        assert_eq!(removed.len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn apply_suback_drops_only_rejected_filters() {
        let mut table = SubscriptionTable::new();
        table.insert(Subscription::new("a/b", QoS::AtMostOnce, 4, noop_callback()));
        table.insert(Subscription::new("c/d", QoS::AtMostOnce, 4, noop_callback()));

        table.apply_suback(4, &[true, false]);

        assert_eq!(table.len(), 1);
        assert!(!table.matches("a/b").is_empty());
        assert!(table.matches("c/d").is_empty());
    }
}
