//! # arbor-transport
//!
//! Transport collaborator contracts for the arbor exposition core.
//!
//! The core never touches sockets. It consumes transports through two narrow
//! traits:
//!
//! - [`ClientTransport`] — outbound: blocking request/response plus
//!   fire-and-forget event delivery to a remote peer.
//! - [`ServerTransport`] — inbound: a started/stopped listener that feeds
//!   received messages into an [`InboundHandler`] (implemented by the core's
//!   dispatcher).
//!
//! Concrete bindings (HTTP, MQTT, WebSocket, CAN bridges) live outside this
//! workspace and register a [`ClientFactory`] per URI scheme with the
//! [`ClientRegistry`]. The registry serializes factory lookup and client
//! caching under its own mutex so transport bookkeeping never contends with
//! the core's tree lock.
//!
//! [`LoopbackNetwork`] ships in-tree: an in-process transport that routes
//! messages directly into a registered peer's handler. Tests and embeddings
//! hosting several cores in one process use it in place of a real wire.

mod error;
mod loopback;
mod registry;
mod traits;

pub use error::TransportError;
pub use loopback::{LoopbackClient, LoopbackFactory, LoopbackNetwork, LOOPBACK_SCHEME};
pub use registry::{scheme_of, ClientRegistry};
pub use traits::{ClientFactory, ClientTransport, InboundHandler, ServerTransport};
