//! Node model.
//!
//! A [`Node`] is one entry in the addressable tree. The five kinds form a
//! closed set; local-versus-remote behavior is not a class hierarchy but a
//! strategy value carried per instance — a [`DataBackend::Local`] closure
//! pair versus a [`DataBackend::Remote`] forwarding binding, and likewise for
//! services, events and device contracts. The mirroring subsystem builds
//! whole sub-trees of remote-strategy nodes; the dispatcher never needs to
//! know which strategy it is invoking.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_value::Value;
use parking_lot::Mutex;

use crate::error::CoreError;
use crate::event::EventNode;
use crate::mirror::RemoteBinding;

/// Read closure for a local Data node.
pub type ReadFn = dyn Fn() -> Result<Value, CoreError> + Send + Sync;
/// Write closure for a local Data node.
pub type WriteFn = dyn Fn(Value) -> Result<(), CoreError> + Send + Sync;
/// Contract closure for a local Service node.
pub type ServiceFn = dyn Fn(Option<Value>) -> Result<Option<Value>, CoreError> + Send + Sync;

/// Behavior strategy of a Data node.
pub enum DataBackend {
    Local {
        read: Box<ReadFn>,
        write: Option<Box<WriteFn>>,
    },
    Remote(RemoteBinding),
}

pub(crate) struct CachedRead {
    pub value: Value,
    pub fetched_at: Instant,
}

/// Gettable/settable typed value point.
pub struct DataNode {
    pub(crate) backend: DataBackend,
    /// Single last-value cache per instance, honored within `cache_window`.
    pub(crate) cache: Mutex<Option<CachedRead>>,
    pub(crate) cache_window: Option<Duration>,
}

/// Behavior strategy of a Service node.
pub enum ServiceBackend {
    Local(Box<ServiceFn>),
    Remote(RemoteBinding),
}

pub struct ServiceNode {
    pub(crate) backend: ServiceBackend,
}

/// Structure specialization answering the device contracts; the tree root is
/// always a Device.
pub struct DeviceNode {
    /// Set on mirrored devices; all six contracts forward through it.
    pub(crate) binding: Option<RemoteBinding>,
    pub(crate) version: Option<String>,
}

pub enum NodeKind {
    Structure,
    Device(DeviceNode),
    Data(DataNode),
    Service(ServiceNode),
    Event(EventNode),
}

impl NodeKind {
    /// Wire-facing kind tag, also used in `gettree` descriptions.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Structure => "structure",
            NodeKind::Device(_) => "device",
            NodeKind::Data(_) => "data",
            NodeKind::Service(_) => "service",
            NodeKind::Event(_) => "event",
        }
    }
}

/// One entry in the addressable tree.
pub struct Node {
    identifier: String,
    format: Option<String>,
    uid: Option<String>,
    hidden: bool,
    context: Option<Value>,
    profiles: Mutex<BTreeSet<String>>,
    pub(crate) kind: NodeKind,
}

impl Node {
    fn new(identifier: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            identifier: identifier.into(),
            format: None,
            uid: None,
            hidden: false,
            context: None,
            profiles: Mutex::new(BTreeSet::new()),
            kind,
        }
    }

    /// Pure container.
    pub fn structure(identifier: impl Into<String>) -> Self {
        Self::new(identifier, NodeKind::Structure)
    }

    /// Device container (identity/tree/query/bulk contracts).
    pub fn device(identifier: impl Into<String>) -> Self {
        Self::new(
            identifier,
            NodeKind::Device(DeviceNode { binding: None, version: None }),
        )
    }

    /// Data point with an explicit backend strategy.
    pub fn data(identifier: impl Into<String>, backend: DataBackend) -> Self {
        Self::new(
            identifier,
            NodeKind::Data(DataNode {
                backend,
                cache: Mutex::new(None),
                cache_window: None,
            }),
        )
    }

    /// Read-only data point backed by a closure.
    pub fn data_read(
        identifier: impl Into<String>,
        read: impl Fn() -> Result<Value, CoreError> + Send + Sync + 'static,
    ) -> Self {
        Self::data(identifier, DataBackend::Local { read: Box::new(read), write: None })
    }

    /// Readable and writable data point holding its value in-process.
    pub fn value_cell(identifier: impl Into<String>, initial: Value) -> Self {
        let cell = Arc::new(Mutex::new(initial));
        let read_cell = Arc::clone(&cell);
        Self::data(
            identifier,
            DataBackend::Local {
                read: Box::new(move || Ok(read_cell.lock().clone())),
                write: Some(Box::new(move |value| {
                    *cell.lock() = value;
                    Ok(())
                })),
            },
        )
    }

    /// Invocable service backed by a closure.
    pub fn service(
        identifier: impl Into<String>,
        contract: impl Fn(Option<Value>) -> Result<Option<Value>, CoreError> + Send + Sync + 'static,
    ) -> Self {
        Self::new(
            identifier,
            NodeKind::Service(ServiceNode { backend: ServiceBackend::Local(Box::new(contract)) }),
        )
    }

    /// Subscribable event source.
    pub fn event(identifier: impl Into<String>) -> Self {
        Self::new(identifier, NodeKind::Event(EventNode::local()))
    }

    pub(crate) fn with_kind(identifier: impl Into<String>, kind: NodeKind) -> Self {
        Self::new(identifier, kind)
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    /// Excludes the node from default tree queries.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Opaque user payload carried by the node.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_profile(self, profile: impl Into<String>) -> Self {
        self.profiles.lock().insert(profile.into());
        self
    }

    /// Cache window for Data nodes; ignored on other kinds.
    pub fn with_cache_window(mut self, window: Duration) -> Self {
        if let NodeKind::Data(data) = &mut self.kind {
            data.cache_window = Some(window);
        }
        self
    }

    pub(crate) fn with_version(mut self, version: impl Into<String>) -> Self {
        if let NodeKind::Device(device) = &mut self.kind {
            device.version = Some(version.into());
        }
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn format(&self) -> Option<&str> {
        self.format.as_deref()
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn context(&self) -> Option<&Value> {
        self.context.as_ref()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn profiles(&self) -> Vec<String> {
        self.profiles.lock().iter().cloned().collect()
    }

    pub fn has_profile(&self, profile: &str) -> bool {
        self.profiles.lock().contains(profile)
    }

    /// Idempotent; returns `true` when the set actually changed.
    pub fn add_profile(&self, profile: impl Into<String>) -> bool {
        self.profiles.lock().insert(profile.into())
    }

    /// Idempotent; returns `true` when the set actually changed.
    pub fn remove_profile(&self, profile: &str) -> bool {
        self.profiles.lock().remove(profile)
    }

    pub(crate) fn as_data(&self) -> Option<&DataNode> {
        match &self.kind {
            NodeKind::Data(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn as_event(&self) -> Option<&EventNode> {
        match &self.kind {
            NodeKind::Event(event) => Some(event),
            _ => None,
        }
    }

    pub(crate) fn as_device(&self) -> Option<&DeviceNode> {
        match &self.kind {
            NodeKind::Device(device) => Some(device),
            _ => None,
        }
    }
}

// Backends carry closures, so Debug is by hand: identity, not contents.
impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("identifier", &self.identifier)
            .field("kind", &self.kind.tag())
            .field("hidden", &self.hidden)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_ops_are_idempotent() {
        let node = Node::structure("sensors").with_profile("measuring");
        assert!(node.has_profile("measuring"));
        assert!(!node.add_profile("measuring"));
        assert!(node.add_profile("calibrated"));
        assert!(node.remove_profile("calibrated"));
        assert!(!node.remove_profile("calibrated"));
        assert_eq!(node.profiles(), ["measuring"]);
    }

    #[test]
    fn value_cell_reads_back_writes() {
        let node = Node::value_cell("temp", Value::Int(20));
        let data = node.as_data().expect("data kind");
        let DataBackend::Local { read, write } = &data.backend else {
            panic!("expected local backend");
        };
        assert_eq!(read().expect("read"), Value::Int(20));
        write.as_ref().expect("writable")(Value::Int(25)).expect("write");
        assert_eq!(read().expect("read"), Value::Int(25));
    }

    #[test]
    fn debug_names_identifier_and_kind() {
        let rendered = format!("{:?}", Node::service("reboot", |_| Ok(None)));
        assert!(rendered.contains("reboot"));
        assert!(rendered.contains("service"));
    }

    #[test]
    fn kind_tags_are_wire_stable() {
        assert_eq!(Node::structure("a").kind().tag(), "structure");
        assert_eq!(Node::device("a").kind().tag(), "device");
        assert_eq!(Node::event("a").kind().tag(), "event");
        assert_eq!(Node::value_cell("a", Value::Null).kind().tag(), "data");
        assert_eq!(Node::service("a", |_| Ok(None)).kind().tag(), "service");
    }
}
