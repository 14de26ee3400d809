//! Subscription registry and event payload types.
//!
//! Each Event node owns its subscriber list behind its own reader/writer
//! lock, independent of the tree lock: raising an event on one node is never
//! serialized behind structural mutation elsewhere. Fan-out itself lives on
//! [`crate::Core`], which snapshots the list here and releases the lock
//! before touching the tree.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_value::{Map, Value};
use parking_lot::RwLock;

use crate::error::CoreError;
use crate::mirror::EventBridge;

/// Callback invoked for local (in-process) subscribers.
pub type LocalCallback = dyn Fn(EventData) + Send + Sync;

/// Notification handed to each subscriber on a raise.
#[derive(Clone, Debug, PartialEq)]
pub struct EventData {
    /// Monotonic per Event node, starting at 0.
    pub event_number: u64,
    /// Address of the raising Event node.
    pub event_source: String,
    /// Collected payload: one `{code, value}` entry per requested address,
    /// or the raise payload when no addresses were requested.
    pub payload: Value,
    pub subscription_id: String,
}

impl EventData {
    /// Wire shape for remote delivery.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("eventnumber".into(), Value::UInt(self.event_number));
        map.insert("eventsource".into(), Value::Str(self.event_source.clone()));
        map.insert("payload".into(), self.payload.clone());
        map.insert("subscriptionid".into(), Value::Str(self.subscription_id.clone()));
        Value::Map(map)
    }
}

/// Where a subscription delivers.
#[derive(Clone)]
pub enum SubscriberTarget {
    /// Direct in-process callback.
    Local(Arc<LocalCallback>),
    /// Remote peer: events are sent as code-80 messages addressed to
    /// `callback_address` through the client for `uri`.
    Remote { uri: String, callback_address: String },
}

/// Registered interest in one Event node's notifications.
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub target: SubscriberTarget,
    /// Addresses resolved to `{code, value}` pairs at raise time.
    pub requested_addresses: Vec<String>,
    /// Persistence marker carried for management surfaces; the core itself
    /// holds all subscriptions in memory.
    pub persist: bool,
}

/// Subscribable node state.
pub struct EventNode {
    subscribers: RwLock<Vec<Subscription>>,
    event_number: AtomicU64,
    /// Present on mirrored events: the remote peer this node bridges.
    pub(crate) bridge: Option<EventBridge>,
}

impl EventNode {
    pub(crate) fn local() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            event_number: AtomicU64::new(0),
            bridge: None,
        }
    }

    pub(crate) fn bridged(bridge: EventBridge) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            event_number: AtomicU64::new(0),
            bridge: Some(bridge),
        }
    }

    fn write_subscribers(
        &self,
        timeout: Duration,
    ) -> Result<parking_lot::RwLockWriteGuard<'_, Vec<Subscription>>, CoreError> {
        self.subscribers
            .try_write_for(timeout)
            .ok_or_else(|| CoreError::Locked("subscription write lock timed out".into()))
    }

    /// Inserts or replaces (same id) a subscription. Returns the id and
    /// whether the list was empty beforehand.
    pub(crate) fn upsert(
        &self,
        subscription: Subscription,
        timeout: Duration,
    ) -> Result<(String, bool), CoreError> {
        let mut subscribers = self.write_subscribers(timeout)?;
        let was_empty = subscribers.is_empty();
        let id = subscription.id.clone();
        match subscribers.iter_mut().find(|existing| existing.id == id) {
            Some(existing) => *existing = subscription,
            None => subscribers.push(subscription),
        }
        Ok((id, was_empty))
    }

    /// Removes the subscription with `id`. Returns whether an entry matched
    /// and whether the list is empty afterwards.
    pub(crate) fn remove_by_id(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<(bool, bool), CoreError> {
        let mut subscribers = self.write_subscribers(timeout)?;
        let before = subscribers.len();
        subscribers.retain(|subscription| subscription.id != id);
        Ok((subscribers.len() < before, subscribers.is_empty()))
    }

    /// Removes every subscription delivering to `callback` (pointer
    /// identity). Returns whether the list is empty afterwards; no match is
    /// not an error.
    pub(crate) fn remove_by_callback(
        &self,
        callback: &Arc<LocalCallback>,
        timeout: Duration,
    ) -> Result<bool, CoreError> {
        let mut subscribers = self.write_subscribers(timeout)?;
        subscribers.retain(|subscription| match &subscription.target {
            SubscriberTarget::Local(existing) => !Arc::ptr_eq(existing, callback),
            SubscriberTarget::Remote { .. } => true,
        });
        Ok(subscribers.is_empty())
    }

    /// Copies the current subscriber list out from under the read lock so
    /// fan-out (and its tree lookups) runs lock-free.
    pub(crate) fn snapshot(&self, timeout: Duration) -> Result<Vec<Subscription>, CoreError> {
        self.subscribers
            .try_read_for(timeout)
            .map(|subscribers| subscribers.clone())
            .ok_or_else(|| CoreError::Locked("subscription read lock timed out".into()))
    }

    /// Current subscription ids, for the `getsubscriberlist` contract.
    pub(crate) fn subscriber_ids(&self, timeout: Duration) -> Result<Vec<String>, CoreError> {
        Ok(self
            .snapshot(timeout)?
            .into_iter()
            .map(|subscription| subscription.id)
            .collect())
    }

    /// Claims the next event number (monotonic, starts at 0).
    pub(crate) fn next_event_number(&self) -> u64 {
        self.event_number.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn local(id: &str) -> Subscription {
        Subscription {
            id: id.into(),
            target: SubscriberTarget::Local(Arc::new(|_| {})),
            requested_addresses: Vec::new(),
            persist: false,
        }
    }

    #[test]
    fn upsert_replaces_same_id() {
        let event = EventNode::local();
        let (_, was_empty) = event.upsert(local("s1"), TIMEOUT).expect("subscribe");
        assert!(was_empty);
        let (_, was_empty) = event.upsert(local("s1"), TIMEOUT).expect("re-subscribe");
        assert!(!was_empty);
        assert_eq!(event.subscriber_ids(TIMEOUT).expect("ids"), ["s1"]);
    }

    #[test]
    fn remove_reports_match_and_emptiness() {
        let event = EventNode::local();
        event.upsert(local("s1"), TIMEOUT).expect("subscribe");
        event.upsert(local("s2"), TIMEOUT).expect("subscribe");
        assert_eq!(event.remove_by_id("s1", TIMEOUT).expect("remove"), (true, false));
        assert_eq!(event.remove_by_id("s1", TIMEOUT).expect("remove"), (false, false));
        assert_eq!(event.remove_by_id("s2", TIMEOUT).expect("remove"), (true, true));
    }

    #[test]
    fn remove_by_callback_is_a_quiet_noop_when_unknown() {
        let event = EventNode::local();
        let callback: Arc<LocalCallback> = Arc::new(|_| {});
        event.upsert(local("kept"), TIMEOUT).expect("subscribe");
        assert!(!event.remove_by_callback(&callback, TIMEOUT).expect("noop"));
        assert_eq!(event.subscriber_ids(TIMEOUT).expect("ids"), ["kept"]);
    }

    #[test]
    fn event_numbers_start_at_zero_and_increment() {
        let event = EventNode::local();
        assert_eq!(event.next_event_number(), 0);
        assert_eq!(event.next_event_number(), 1);
        let other = EventNode::local();
        assert_eq!(other.next_event_number(), 0);
    }

    #[test]
    fn event_data_wire_shape() {
        let data = EventData {
            event_number: 3,
            event_source: "/alarm".into(),
            payload: Value::Null,
            subscription_id: "s1".into(),
        };
        let value = data.to_value();
        assert_eq!(value.get("eventnumber"), Some(&Value::UInt(3)));
        assert_eq!(value.get("eventsource"), Some(&Value::Str("/alarm".into())));
        assert_eq!(value.get("subscriptionid"), Some(&Value::Str("s1".into())));
    }
}
