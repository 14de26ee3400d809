use std::sync::Arc;
use std::time::Duration;

use arbor_wire::Message;

use crate::error::TransportError;

/// Inbound side of the core, fed by server transports.
///
/// Implemented by the core's dispatcher. A server transport holds an
/// `Arc<dyn InboundHandler>` and calls it from whatever threads its wire
/// handling runs on; both methods are safe to call concurrently.
pub trait InboundHandler: Send + Sync {
    /// Handle a request message; always produces exactly one response.
    fn handle_request(&self, message: Message) -> Message;

    /// Handle a fire-and-forget event message; never produces a response.
    fn handle_event(&self, message: Message);
}

/// Outbound connection to one remote peer.
pub trait ClientTransport: Send + Sync {
    /// Send a request and block for its response, bounded by `timeout`.
    fn send_request(&self, message: Message, timeout: Duration)
        -> Result<Message, TransportError>;

    /// Send a fire-and-forget event. Delivery is best-effort; an `Ok` return
    /// means handed to the wire, not acknowledged.
    fn send_event(&self, message: Message) -> Result<(), TransportError>;
}

/// Creates [`ClientTransport`] instances for one URI scheme.
pub trait ClientFactory: Send + Sync {
    /// The scheme this factory answers for, without the `://` suffix.
    fn scheme(&self) -> &str;

    fn create(&self, uri: &str) -> Result<Arc<dyn ClientTransport>, TransportError>;
}

/// Inbound listener lifecycle.
///
/// Implementations are constructed around an `Arc<dyn InboundHandler>`;
/// `start` must not block past listener setup.
pub trait ServerTransport: Send + Sync {
    fn start(&self) -> Result<(), TransportError>;
    fn stop(&self) -> Result<(), TransportError>;
}
