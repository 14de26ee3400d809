//! Device mirroring: grafting a remote tree into the local one.
//!
//! A mirror is an ordinary sub-tree under `/remote/<alias>` whose nodes
//! carry remote-forwarding strategies instead of local state. Reads, writes,
//! invocations and device contracts forward through a [`RemoteBinding`];
//! events bridge back via a remote subscription whose callback re-enters
//! this core's event engine.
//!
//! Failure policy: a remote error response re-raises locally with the
//! remote's code and message; a transport-level failure degrades the single
//! forwarded call (500/504) and never mutates the local tree.

use std::sync::Arc;
use std::time::Duration;

use arbor_value::{Map, Value};
use arbor_wire::{codes, Auth, Message};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::core::{Core, REMOTE_CONTAINER};
use crate::error::CoreError;
use crate::event::EventNode;
use crate::node::{DataBackend, DeviceNode, Node, NodeKind, ServiceBackend, ServiceNode};
use crate::tree::NodeId;

/// Immutable addressing/auth bundle identifying one mirrored peer.
#[derive(Clone, Debug)]
pub struct RemoteContext {
    pub remote_uri: String,
    /// Address of the mirrored sub-tree's root on the remote tree; empty for
    /// the remote root device.
    pub remote_address: String,
    pub auth: Option<Auth>,
    /// Base URI the remote peer delivers bridged events to; the proxy
    /// node's local address is appended per subscription.
    pub callback_base_uri: String,
}

/// Couples a shared [`RemoteContext`] with one proxy node's remote address.
#[derive(Clone)]
pub struct RemoteBinding {
    pub(crate) context: Arc<RemoteContext>,
    pub(crate) remote_address: String,
}

impl RemoteBinding {
    pub fn context(&self) -> &RemoteContext {
        &self.context
    }

    /// Remote address for `verb` applied to this node, or the node's own
    /// address when the node itself is the operation (services).
    pub(crate) fn verb_address(&self, verb: Option<&str>) -> String {
        match verb {
            None => self.remote_address.clone(),
            Some(verb) if self.remote_address.is_empty() || self.remote_address == "/" => {
                format!("/{verb}")
            }
            Some(verb) => format!("{}/{verb}", self.remote_address),
        }
    }
}

/// Bridge state of a mirrored Event node.
///
/// The remote subscription exists exactly while at least one local
/// subscriber does: engaged on the first subscribe, released (best-effort)
/// on the last unsubscribe.
pub struct EventBridge {
    pub(crate) binding: RemoteBinding,
    pub(crate) remote_subscription: Mutex<Option<String>>,
}

impl EventBridge {
    fn new(binding: RemoteBinding) -> Self {
        Self { binding, remote_subscription: Mutex::new(None) }
    }
}

/// Options for [`Core::mirror`].
#[derive(Clone, Debug, Default)]
pub struct MirrorOptions {
    /// Name of the mirrored sub-tree under `/remote`; defaults to the remote
    /// root's own identifier.
    pub alias: Option<String>,
    /// Cache window applied to every mirrored Data node (per proxy instance:
    /// one last value plus fetch instant).
    pub cache_timeout: Option<Duration>,
    pub auth: Option<Auth>,
}

impl Core {
    /// Sends one request through the binding's client and unwraps the
    /// response: success yields the payload, a remote error code re-raises
    /// as [`CoreError::Remote`], a transport failure maps to 500/504.
    pub(crate) fn forward_request(
        &self,
        binding: &RemoteBinding,
        verb: Option<&str>,
        payload: Option<Value>,
    ) -> Result<Option<Value>, CoreError> {
        let client = self.clients.client_for(&binding.context.remote_uri)?;
        let mut message =
            Message::request(self.next_cid(), binding.verb_address(verb), payload);
        if let Some(auth) = &binding.context.auth {
            message.auth = Some(auth.clone());
        }
        let response = client.send_request(message, self.config.remote_timeout)?;
        if codes::is_error(response.code) {
            let message = response
                .data
                .as_ref()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            return Err(CoreError::from_response(response.code, message));
        }
        Ok(response.data)
    }

    /// Mirrors the device exposed at `remote_uri` under `/remote/<alias>`.
    ///
    /// Issues a remote `gettree` and instantiates a proxy sub-tree matching
    /// the remote shape 1:1. Returns the alias in use. An alias collision
    /// fails with 901 and leaves the tree untouched.
    pub fn mirror(
        &self,
        remote_uri: &str,
        callback_base_uri: &str,
        options: MirrorOptions,
    ) -> Result<String, CoreError> {
        let context = Arc::new(RemoteContext {
            remote_uri: remote_uri.to_owned(),
            remote_address: String::new(),
            auth: options.auth.clone(),
            callback_base_uri: callback_base_uri.trim_end_matches('/').to_owned(),
        });
        let root_binding =
            RemoteBinding { context: Arc::clone(&context), remote_address: String::new() };
        let mut all = Map::new();
        all.insert("all".into(), Value::Bool(true));
        let description = self
            .forward_request(&root_binding, Some("gettree"), Some(Value::Map(all)))?
            .ok_or_else(|| CoreError::DataInvalid("remote gettree returned no payload".into()))?;
        let alias = match options.alias {
            Some(alias) => alias,
            None => description
                .get("identifier")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CoreError::DataInvalid("remote tree description lacks an identifier".into())
                })?
                .to_owned(),
        };

        let container_address = format!("/{REMOTE_CONTAINER}");
        let (container, created) = match self.tree.resolve(&container_address)? {
            Some((id, _)) => (id, false),
            None => (
                self.tree.add_child(self.tree.root(), Node::structure(REMOTE_CONTAINER))?,
                true,
            ),
        };
        let mirror_address = format!("/{REMOTE_CONTAINER}/{alias}");
        if self.tree.resolve(&mirror_address)?.is_some() {
            if created {
                let _ = self.tree.remove_child(container);
            }
            return Err(CoreError::AlreadyExists(format!("mirror alias '{alias}' is taken")));
        }

        match self.build_proxy_node(
            container,
            &description,
            &context,
            "",
            Some(&alias),
            options.cache_timeout,
        ) {
            Ok(_) => {
                debug!("mirrored '{remote_uri}' as '{mirror_address}'");
                Ok(alias)
            }
            Err(err) => {
                // A half-built mirror must not survive; drop whatever was
                // attached, and the container when it ends up childless.
                if let Ok(Some((id, _))) = self.tree.resolve(&mirror_address) {
                    let _ = self.tree.remove_child(id);
                }
                let _ = self.prune_remote_container();
                Err(err)
            }
        }
    }

    /// Removes the mirrored sub-tree matching `key` (alias or remote URI),
    /// releasing active event bridges best-effort. When the last mirror is
    /// gone the `/remote` container goes with it.
    pub fn unmirror(&self, key: &str) -> Result<(), CoreError> {
        let container_address = format!("/{REMOTE_CONTAINER}");
        let (container, _) = self
            .tree
            .resolve(&container_address)?
            .ok_or_else(|| CoreError::NotFound("nothing is mirrored".into()))?;
        let children = self.tree.children(container)?;
        let (target, _) = children
            .into_iter()
            .find(|(_, node)| {
                node.identifier() == key
                    || node
                        .as_device()
                        .and_then(|device| device.binding.as_ref())
                        .is_some_and(|binding| binding.context.remote_uri == key)
            })
            .ok_or_else(|| CoreError::NotFound(format!("no mirror matches '{key}'")))?;

        let mut bridged = Vec::new();
        self.tree.walk(target, |_, node, _| {
            if node.as_event().is_some_and(|event| event.bridge.is_some()) {
                bridged.push(Arc::clone(node));
            }
        })?;
        for node in bridged {
            self.bridge_release(&node);
        }

        self.tree.remove_child(target)?;
        self.prune_remote_container()
    }

    fn prune_remote_container(&self) -> Result<(), CoreError> {
        let container_address = format!("/{REMOTE_CONTAINER}");
        if let Some((id, _)) = self.tree.resolve(&container_address)? {
            if self.tree.children(id)?.is_empty() {
                self.tree.remove_child(id)?;
            }
        }
        Ok(())
    }

    /// Engages the remote bridge of a mirrored Event node: issues a remote
    /// `subscribe` whose callback re-enters this core at the proxy's local
    /// address. A no-op for unbridged events and already-engaged bridges.
    pub(crate) fn bridge_engage(&self, node: &Node, local_address: &str) -> Result<(), CoreError> {
        let Some(event) = node.as_event() else { return Ok(()) };
        let Some(bridge) = &event.bridge else { return Ok(()) };
        let mut slot = bridge.remote_subscription.lock();
        if slot.is_some() {
            return Ok(());
        }
        let callback = format!("{}{local_address}", bridge.binding.context.callback_base_uri);
        let mut payload = Map::new();
        payload.insert("callback".into(), Value::Str(callback));
        let response =
            self.forward_request(&bridge.binding, Some("subscribe"), Some(Value::Map(payload)))?;
        let remote_id = response
            .as_ref()
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::DataInvalid("remote subscribe returned no subscription id".into())
            })?
            .to_owned();
        debug!(
            "bridged '{local_address}' to '{}' as remote subscription '{remote_id}'",
            bridge.binding.context.remote_uri
        );
        *slot = Some(remote_id);
        Ok(())
    }

    /// Releases the remote bridge, best-effort: the remote unsubscribe may
    /// fail (peer gone, timeout) without affecting local state.
    pub(crate) fn bridge_release(&self, node: &Node) {
        let Some(event) = node.as_event() else { return };
        let Some(bridge) = &event.bridge else { return };
        let Some(remote_id) = bridge.remote_subscription.lock().take() else { return };
        let mut payload = Map::new();
        payload.insert("id".into(), Value::Str(remote_id.clone()));
        if let Err(err) =
            self.forward_request(&bridge.binding, Some("unsubscribe"), Some(Value::Map(payload)))
        {
            warn!(
                "best-effort remote unsubscribe '{remote_id}' at '{}' failed: {err}",
                bridge.binding.context.remote_uri
            );
        }
    }

    /// Instantiates one proxy node from a remote tree description and
    /// recurses into its children. `identifier_override` renames the mirror
    /// root to its alias; `parent_remote_address` is the remote address of
    /// the described node's parent.
    fn build_proxy_node(
        &self,
        parent: NodeId,
        description: &Value,
        context: &Arc<RemoteContext>,
        parent_remote_address: &str,
        identifier_override: Option<&str>,
        cache_window: Option<Duration>,
    ) -> Result<NodeId, CoreError> {
        let map = description
            .as_map()
            .ok_or_else(|| CoreError::DataInvalid("tree description entry is not a map".into()))?;
        let described_identifier = map
            .get("identifier")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::DataInvalid("tree description lacks an identifier".into()))?;
        let kind_tag = map
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::DataInvalid("tree description lacks a kind".into()))?;

        // The mirror root keeps the remote root's address (empty); every
        // other node's remote address is its described path.
        let remote_address = if identifier_override.is_some() {
            String::new()
        } else if parent_remote_address.is_empty() {
            format!("/{described_identifier}")
        } else {
            format!("{parent_remote_address}/{described_identifier}")
        };
        let identifier = identifier_override.unwrap_or(described_identifier);
        let binding =
            RemoteBinding { context: Arc::clone(context), remote_address: remote_address.clone() };

        let mut node = match kind_tag {
            "structure" => Node::structure(identifier),
            "device" => Node::with_kind(
                identifier,
                NodeKind::Device(DeviceNode { binding: Some(binding), version: None }),
            ),
            "data" => {
                let mut data = Node::data(identifier, DataBackend::Remote(binding));
                if let Some(window) = cache_window {
                    data = data.with_cache_window(window);
                }
                data
            }
            "service" => Node::with_kind(
                identifier,
                NodeKind::Service(ServiceNode { backend: ServiceBackend::Remote(binding) }),
            ),
            "event" => {
                Node::with_kind(identifier, NodeKind::Event(EventNode::bridged(EventBridge::new(binding))))
            }
            other => {
                return Err(CoreError::DataInvalid(format!(
                    "tree description has unknown kind '{other}'"
                )))
            }
        };
        if let Some(uid) = map.get("uid").and_then(Value::as_str) {
            node = node.with_uid(uid);
        }
        if let Some(format) = map.get("format").and_then(Value::as_str) {
            node = node.with_format(format);
        }
        if map.get("hidden").and_then(Value::as_bool).unwrap_or(false) {
            node = node.hidden();
        }
        if let Some(profiles) = map.get("profiles").and_then(Value::as_list) {
            for profile in profiles {
                if let Some(profile) = profile.as_str() {
                    node = node.with_profile(profile);
                }
            }
        }

        let id = self.tree.add_child(parent, node)?;
        if let Some(children) = map.get("children").and_then(Value::as_list) {
            for child in children {
                self.build_proxy_node(id, child, context, &remote_address, None, cache_window)?;
            }
        }
        Ok(id)
    }
}
