//! In-process loopback transport.
//!
//! A [`LoopbackNetwork`] is a broker shared by every core hosted in one
//! process: each core registers its inbound handler under a peer name, and a
//! [`LoopbackClient`] for `loop://<peer>` routes messages straight into that
//! handler on the calling thread. No queues, no serialization — the wire
//! shape is exercised by the codec tests, not re-proven here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_wire::Message;
use parking_lot::Mutex;

use crate::error::TransportError;
use crate::traits::{ClientFactory, ClientTransport, InboundHandler};

/// URI scheme served by [`LoopbackFactory`].
pub const LOOPBACK_SCHEME: &str = "loop";

/// Broker routing between in-process peers.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: Mutex<HashMap<String, Arc<dyn InboundHandler>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` under `peer`, replacing any previous registration.
    pub fn register(&self, peer: impl Into<String>, handler: Arc<dyn InboundHandler>) {
        self.peers.lock().insert(peer.into(), handler);
    }

    /// Removes `peer` from the network. Subsequent sends to it fail with
    /// [`TransportError::Unreachable`], which is how tests simulate outages.
    pub fn unregister(&self, peer: &str) {
        self.peers.lock().remove(peer);
    }

    fn handler_for(&self, peer: &str) -> Option<Arc<dyn InboundHandler>> {
        self.peers.lock().get(peer).cloned()
    }
}

/// Client half of the loopback transport, bound to one peer name.
pub struct LoopbackClient {
    network: Arc<LoopbackNetwork>,
    peer: String,
    uri: String,
    requests_sent: AtomicU64,
}

impl LoopbackClient {
    pub fn new(network: Arc<LoopbackNetwork>, peer: impl Into<String>) -> Self {
        let peer = peer.into();
        let uri = format!("{LOOPBACK_SCHEME}://{peer}");
        Self {
            network,
            peer,
            uri,
            requests_sent: AtomicU64::new(0),
        }
    }

    /// Number of requests issued through this client. Cache and
    /// first-subscriber semantics in the core are asserted against this.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::SeqCst)
    }
}

impl ClientTransport for LoopbackClient {
    fn send_request(
        &self,
        message: Message,
        _timeout: Duration,
    ) -> Result<Message, TransportError> {
        self.requests_sent.fetch_add(1, Ordering::SeqCst);
        let handler = self
            .network
            .handler_for(&self.peer)
            .ok_or_else(|| TransportError::Unreachable {
                uri: self.uri.clone(),
                reason: "peer not registered".into(),
            })?;
        Ok(handler.handle_request(message))
    }

    fn send_event(&self, message: Message) -> Result<(), TransportError> {
        let handler = self
            .network
            .handler_for(&self.peer)
            .ok_or_else(|| TransportError::Unreachable {
                uri: self.uri.clone(),
                reason: "peer not registered".into(),
            })?;
        handler.handle_event(message);
        Ok(())
    }
}

/// Factory answering for the `loop` scheme against one shared network.
pub struct LoopbackFactory {
    network: Arc<LoopbackNetwork>,
}

impl LoopbackFactory {
    pub fn new(network: Arc<LoopbackNetwork>) -> Self {
        Self { network }
    }
}

impl ClientFactory for LoopbackFactory {
    fn scheme(&self) -> &str {
        LOOPBACK_SCHEME
    }

    fn create(&self, uri: &str) -> Result<Arc<dyn ClientTransport>, TransportError> {
        let peer = uri
            .strip_prefix("loop://")
            .filter(|peer| !peer.is_empty())
            .ok_or_else(|| TransportError::InvalidUri(uri.to_owned()))?;
        Ok(Arc::new(LoopbackClient::new(Arc::clone(&self.network), peer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_wire::codes;
    use parking_lot::Mutex as PlMutex;

    struct EchoHandler {
        events: PlMutex<Vec<Message>>,
    }

    impl InboundHandler for EchoHandler {
        fn handle_request(&self, message: Message) -> Message {
            Message::response(message.cid, codes::OK, message.data)
        }

        fn handle_event(&self, message: Message) {
            self.events.lock().push(message);
        }
    }

    #[test]
    fn routes_requests_to_the_registered_peer() {
        let network = LoopbackNetwork::new();
        let handler = Arc::new(EchoHandler { events: PlMutex::new(Vec::new()) });
        network.register("core-a", handler.clone());

        let client = LoopbackClient::new(Arc::clone(&network), "core-a");
        let response = client
            .send_request(
                Message::request(3, "x", Some(arbor_value::Value::Int(1))),
                Duration::from_secs(1),
            )
            .expect("response");
        assert_eq!(response.code, codes::OK);
        assert_eq!(response.cid, 3);
        assert_eq!(client.requests_sent(), 1);

        client.send_event(Message::event("x/ev", None)).expect("event");
        assert_eq!(handler.events.lock().len(), 1);
    }

    #[test]
    fn unregistered_peer_is_unreachable() {
        let network = LoopbackNetwork::new();
        let client = LoopbackClient::new(Arc::clone(&network), "gone");
        let err = client
            .send_request(Message::request(1, "x", None), Duration::from_secs(1))
            .expect_err("must fail");
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[test]
    fn factory_rejects_malformed_uris() {
        let network = LoopbackNetwork::new();
        let factory = LoopbackFactory::new(network);
        assert!(factory.create("loop://").is_err());
        assert!(factory.create("tcp://peer").is_err());
        assert!(factory.create("loop://peer-a").is_ok());
    }
}
