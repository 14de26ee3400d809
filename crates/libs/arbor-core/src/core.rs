//! The exposition core: one tree, one client registry, one dispatcher.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_transport::ClientRegistry;
use arbor_value::{Map, Value};
use arbor_wire::{codes, Message};
use log::{debug, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::event::{EventData, LocalCallback, SubscriberTarget, Subscription};
use crate::node::{CachedRead, DataBackend, Node, ServiceBackend};
use crate::tree::{NodeId, Tree, TreeChange};

/// Identifier of the root's structural-change Event node.
pub const TREECHANGED: &str = "treechanged";
/// Reserved top-level container holding mirrored device sub-trees.
pub const REMOTE_CONTAINER: &str = "remote";

/// Construction parameters for a [`Core`].
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Identifier of the root Device.
    pub identifier: String,
    pub uid: Option<String>,
    pub version: String,
    /// Bound on every tree and subscription lock acquisition; expiry
    /// surfaces as response code 423.
    pub lock_timeout: Duration,
    /// Bound on every remote round-trip issued by proxies and event
    /// delivery.
    pub remote_timeout: Duration,
}

impl CoreConfig {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            uid: None,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            lock_timeout: Duration::from_millis(500),
            remote_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one event raise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RaiseOutcome {
    pub event_number: u64,
    pub delivered: usize,
    /// Per-subscriber failures, collected after full fan-out. One
    /// subscriber failing never blocks delivery to the rest.
    pub failures: Vec<String>,
}

/// A protocol-agnostic device/service exposition core.
///
/// Owns the addressable tree (rooted at a Device), dispatches address-routed
/// messages against it, fans out events, and grafts remote trees in through
/// the mirroring subsystem. Transports talk to it through the
/// `arbor_transport::InboundHandler` implementation on this type.
pub struct Core {
    pub(crate) tree: Arc<Tree>,
    pub(crate) clients: Arc<ClientRegistry>,
    pub(crate) config: CoreConfig,
    cid: AtomicU32,
}

impl Core {
    /// Builds a core with a fresh root Device and a `treechanged` Event node
    /// re-raising every structural change.
    pub fn new(config: CoreConfig, clients: Arc<ClientRegistry>) -> Arc<Self> {
        let mut root = Node::device(&config.identifier).with_version(&config.version);
        if let Some(uid) = &config.uid {
            root = root.with_uid(uid);
        }
        let tree = Arc::new(Tree::new(root, config.lock_timeout));
        tree.add_child(tree.root(), Node::event(TREECHANGED))
            .expect("fresh tree accepts the treechanged node");

        let core = Arc::new(Self {
            tree,
            clients,
            config,
            cid: AtomicU32::new(1),
        });
        let observer = Arc::downgrade(&core);
        core.tree.set_observer(move |change| {
            if let Some(core) = observer.upgrade() {
                core.on_tree_change(change);
            }
        });
        core
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub(crate) fn next_cid(&self) -> u32 {
        self.cid.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn resolve_required(&self, address: &str) -> Result<(NodeId, Arc<Node>), CoreError> {
        self.tree
            .resolve(address)?
            .ok_or_else(|| CoreError::NotFound(format!("'{address}' does not resolve")))
    }

    fn on_tree_change(&self, change: TreeChange) {
        let mut map = Map::new();
        map.insert("action".into(), Value::Str(change.action.tag().into()));
        map.insert("parent".into(), Value::Str(change.parent));
        map.insert("child".into(), Value::Str(change.child));
        if let Some(link) = change.link {
            map.insert("link".into(), Value::Str(link));
        }
        let address = format!("/{TREECHANGED}");
        if let Err(err) = self.raise_event_with(&address, Some(Value::Map(map))) {
            debug!("treechanged raise skipped: {err}");
        }
    }

    // ── Data contracts ────────────────────────────────────────────────────

    /// Reads a Data node, honoring its cache window and backend strategy.
    pub fn data_get(&self, node: &Node) -> Result<Value, CoreError> {
        let data = node
            .as_data()
            .ok_or_else(|| CoreError::InvalidRequest("getdata targets a data node".into()))?;
        if let Some(window) = data.cache_window {
            let cache = data.cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < window {
                    return Ok(cached.value.clone());
                }
            }
        }
        let value = match &data.backend {
            DataBackend::Local { read, .. } => read()?,
            DataBackend::Remote(binding) => self
                .forward_request(binding, Some("getdata"), None)?
                .unwrap_or(Value::Null),
        };
        if data.cache_window.is_some() {
            *data.cache.lock() =
                Some(CachedRead { value: value.clone(), fetched_at: Instant::now() });
        }
        Ok(value)
    }

    /// Writes a Data node through its backend strategy.
    pub fn data_set(&self, node: &Node, value: Value) -> Result<(), CoreError> {
        let data = node
            .as_data()
            .ok_or_else(|| CoreError::InvalidRequest("setdata targets a data node".into()))?;
        match &data.backend {
            DataBackend::Local { write, .. } => {
                let write = write
                    .as_ref()
                    .ok_or_else(|| CoreError::InvalidRequest("data point is read-only".into()))?;
                write(value)?;
            }
            DataBackend::Remote(binding) => {
                self.forward_request(binding, Some("setdata"), Some(value))?;
            }
        }
        // A write makes the last fetched value stale regardless of window.
        *data.cache.lock() = None;
        Ok(())
    }

    /// Invokes a Service node's contract with `payload`.
    pub fn service_invoke(
        &self,
        node: &Node,
        payload: Option<Value>,
    ) -> Result<Option<Value>, CoreError> {
        match &node.kind {
            crate::node::NodeKind::Service(service) => match &service.backend {
                ServiceBackend::Local(contract) => contract(payload),
                ServiceBackend::Remote(binding) => self.forward_request(binding, None, payload),
            },
            _ => Err(CoreError::InvalidRequest("node is not an invocable service".into())),
        }
    }

    // ── Subscriptions ─────────────────────────────────────────────────────

    /// Subscribes a local callback to the Event node at `address`; returns
    /// the assigned subscription id.
    pub fn subscribe(
        &self,
        address: &str,
        callback: Arc<LocalCallback>,
        requested_addresses: Vec<String>,
    ) -> Result<String, CoreError> {
        self.subscribe_with(
            address,
            Subscription {
                id: Uuid::new_v4().to_string(),
                target: SubscriberTarget::Local(callback),
                requested_addresses,
                persist: false,
            },
        )
    }

    /// Registers `subscription` on the Event node at `address`. A
    /// subscription with an existing id replaces that entry. On a mirrored
    /// event, the first subscriber engages the remote bridge; if that
    /// engagement fails the local entry is rolled back and the error
    /// propagates.
    pub fn subscribe_with(
        &self,
        address: &str,
        subscription: Subscription,
    ) -> Result<String, CoreError> {
        let (id, node) = self.resolve_required(address)?;
        let event = node
            .as_event()
            .ok_or_else(|| CoreError::InvalidRequest("subscribe targets an event node".into()))?;
        let (sub_id, was_empty) = event.upsert(subscription, self.config.lock_timeout)?;
        if was_empty {
            let local_address = self.tree.address_of(id)?;
            if let Err(err) = self.bridge_engage(&node, &local_address) {
                let _ = event.remove_by_id(&sub_id, self.config.lock_timeout);
                return Err(err);
            }
        }
        Ok(sub_id)
    }

    /// Removes the subscription `id` from the Event node at `address`;
    /// unknown ids are an error on this overload.
    pub fn unsubscribe(&self, address: &str, id: &str) -> Result<(), CoreError> {
        let (_, node) = self.resolve_required(address)?;
        let event = node
            .as_event()
            .ok_or_else(|| CoreError::InvalidRequest("unsubscribe targets an event node".into()))?;
        let (matched, now_empty) = event.remove_by_id(id, self.config.lock_timeout)?;
        if !matched {
            return Err(CoreError::NotFound(format!("no subscription '{id}' on '{address}'")));
        }
        if now_empty {
            self.bridge_release(&node);
        }
        Ok(())
    }

    /// Removes every subscription delivering to `callback`. Unknown
    /// callbacks are a no-op on this overload.
    pub fn unsubscribe_callback(
        &self,
        address: &str,
        callback: &Arc<LocalCallback>,
    ) -> Result<(), CoreError> {
        let (_, node) = self.resolve_required(address)?;
        let event = node
            .as_event()
            .ok_or_else(|| CoreError::InvalidRequest("unsubscribe targets an event node".into()))?;
        let now_empty = event.remove_by_callback(callback, self.config.lock_timeout)?;
        if now_empty {
            self.bridge_release(&node);
        }
        Ok(())
    }

    // ── Raising ───────────────────────────────────────────────────────────

    /// Raises the Event node at `address` with no raise payload.
    pub fn raise_event(&self, address: &str) -> Result<RaiseOutcome, CoreError> {
        self.raise_event_with(address, None)
    }

    /// Raises the Event node at `address`.
    ///
    /// The subscriber list is snapshotted under the event's own lock and the
    /// lock released before any tree lookup (lock order: subscription lock
    /// never held across a tree acquisition). Per subscriber, requested
    /// addresses are collected into `{code, value}` pairs — a missing
    /// address yields `(404, null)` inside the payload; subscribers without
    /// requested addresses receive `data` as-is.
    pub fn raise_event_with(
        &self,
        address: &str,
        data: Option<Value>,
    ) -> Result<RaiseOutcome, CoreError> {
        let (id, node) = self.resolve_required(address)?;
        let event = node
            .as_event()
            .ok_or_else(|| CoreError::InvalidRequest("raise targets an event node".into()))?;
        let subscribers = event.snapshot(self.config.lock_timeout)?;
        let event_number = event.next_event_number();
        let event_source = self.tree.address_of(id)?;

        let mut delivered = 0;
        let mut failures = Vec::new();
        for subscription in subscribers {
            let payload = if subscription.requested_addresses.is_empty() {
                data.clone().unwrap_or(Value::Null)
            } else {
                self.collect_payload(&subscription.requested_addresses)
            };
            let notification = EventData {
                event_number,
                event_source: event_source.clone(),
                payload,
                subscription_id: subscription.id.clone(),
            };
            let result = match &subscription.target {
                SubscriberTarget::Local(callback) => {
                    let callback = Arc::clone(callback);
                    catch_unwind(AssertUnwindSafe(move || callback(notification)))
                        .map_err(|_| format!("local subscriber '{}' panicked", subscription.id))
                }
                SubscriberTarget::Remote { uri, callback_address } => self
                    .deliver_remote(uri, callback_address, &notification)
                    .map_err(|err| {
                        format!("remote subscriber '{}' at '{uri}': {err}", subscription.id)
                    }),
            };
            match result {
                Ok(()) => delivered += 1,
                Err(failure) => {
                    warn!("event '{event_source}' delivery failure: {failure}");
                    failures.push(failure);
                }
            }
        }
        Ok(RaiseOutcome { event_number, delivered, failures })
    }

    pub(crate) fn collect_payload(&self, addresses: &[String]) -> Value {
        let mut map = Map::new();
        for address in addresses {
            let (code, value) = match self.tree.resolve(address) {
                Ok(Some((_, node))) if node.as_data().is_some() => match self.data_get(&node) {
                    Ok(value) => (codes::OK, value),
                    Err(err) => (err.code(), Value::Null),
                },
                Ok(Some(_)) => (codes::BAD_REQUEST, Value::Null),
                Ok(None) => (codes::NOT_FOUND, Value::Null),
                Err(err) => (err.code(), Value::Null),
            };
            let mut entry = Map::new();
            entry.insert("code".into(), Value::UInt(u64::from(code)));
            entry.insert("value".into(), value);
            map.insert(address.clone(), Value::Map(entry));
        }
        Value::Map(map)
    }

    fn deliver_remote(
        &self,
        uri: &str,
        callback_address: &str,
        notification: &EventData,
    ) -> Result<(), CoreError> {
        let client = self.clients.client_for(uri)?;
        client.send_event(Message::event(callback_address, Some(notification.to_value())))?;
        Ok(())
    }
}
