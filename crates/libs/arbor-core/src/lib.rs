//! Protocol-agnostic device/service exposition core.
//!
//! An [`Core`] owns a thread-safe addressable tree of typed nodes rooted at
//! a Device, dispatches address-routed request messages against it, fans out
//! event notifications to local and remote subscribers, and can graft the
//! tree of a remote peer into its own through the mirroring subsystem.
//!
//! The crate splits along those seams:
//!
//! - [`tree`]: the node tree, links, profiles and structural-change
//!   observation, all behind one timed reader/writer lock.
//! - [`node`]: the five node kinds and their per-instance behavior
//!   strategies (local closures versus remote forwarding bindings).
//! - [`dispatch`]: address + operation-verb routing of inbound
//!   [`arbor_wire::Message`]s, exposed to transports through
//!   [`arbor_transport::InboundHandler`].
//! - [`event`] and the raise/fan-out machinery on [`Core`]: isolated
//!   per-subscriber delivery where one failing subscriber never starves the
//!   rest.
//! - [`mirror`]: proxy sub-trees under `/remote/<alias>` forwarding through
//!   [`arbor_transport::ClientTransport`]s, with event bridging back into
//!   the local engine.

mod core;
mod device;
mod dispatch;
mod error;
mod event;
mod mirror;
mod node;
mod tree;

pub use arbor_value::{Map, Value};

pub use crate::core::{Core, CoreConfig, RaiseOutcome, REMOTE_CONTAINER, TREECHANGED};
pub use crate::error::CoreError;
pub use crate::event::{EventData, LocalCallback, SubscriberTarget, Subscription};
pub use crate::mirror::{MirrorOptions, RemoteBinding, RemoteContext};
pub use crate::node::{DataBackend, Node, NodeKind, ReadFn, ServiceBackend, ServiceFn, WriteFn};
pub use crate::tree::{NodeId, Tree, TreeAction, TreeChange};
