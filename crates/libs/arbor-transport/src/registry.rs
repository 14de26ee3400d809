use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TransportError;
use crate::traits::{ClientFactory, ClientTransport};

/// Extracts the scheme from `scheme://rest` style URIs.
pub fn scheme_of(uri: &str) -> Result<&str, TransportError> {
    match uri.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(scheme),
        _ => Err(TransportError::InvalidUri(uri.to_owned())),
    }
}

#[derive(Default)]
struct RegistryState {
    factories: HashMap<String, Arc<dyn ClientFactory>>,
    // One cached client per exact URI; factories decide whether instances
    // share underlying connections.
    clients: HashMap<String, Arc<dyn ClientTransport>>,
}

/// Scheme-keyed client transport registry.
///
/// Factory lookup and client caching are serialized under a single mutex,
/// deliberately separate from any core lock: creating a client must never
/// wait on tree operations and vice versa.
#[derive(Default)]
pub struct ClientRegistry {
    state: Mutex<RegistryState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for its scheme, replacing any previous factory.
    pub fn register_factory(&self, factory: Arc<dyn ClientFactory>) {
        let scheme = factory.scheme().to_owned();
        log::debug!("registering client factory for scheme '{scheme}'");
        self.state.lock().factories.insert(scheme, factory);
    }

    /// Returns the cached client for `uri`, creating one on first use.
    pub fn client_for(&self, uri: &str) -> Result<Arc<dyn ClientTransport>, TransportError> {
        let scheme = scheme_of(uri)?.to_owned();
        let mut state = self.state.lock();
        if let Some(client) = state.clients.get(uri) {
            return Ok(Arc::clone(client));
        }
        let factory = state
            .factories
            .get(&scheme)
            .ok_or(TransportError::UnknownScheme(scheme))?
            .clone();
        let client = factory.create(uri)?;
        state.clients.insert(uri.to_owned(), Arc::clone(&client));
        Ok(client)
    }

    /// Drops the cached client for `uri`, if any. The next `client_for`
    /// creates a fresh one.
    pub fn evict(&self, uri: &str) {
        self.state.lock().clients.remove(uri);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use arbor_wire::Message;

    struct NullClient;

    impl ClientTransport for NullClient {
        fn send_request(
            &self,
            message: Message,
            _timeout: Duration,
        ) -> Result<Message, TransportError> {
            Ok(Message::response(message.cid, arbor_wire::codes::OK, None))
        }

        fn send_event(&self, _message: Message) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct CountingFactory {
        created: AtomicUsize,
    }

    impl ClientFactory for CountingFactory {
        fn scheme(&self) -> &str {
            "null"
        }

        fn create(&self, _uri: &str) -> Result<Arc<dyn ClientTransport>, TransportError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullClient))
        }
    }

    #[test]
    fn scheme_parsing() {
        assert_eq!(scheme_of("http://host:80").expect("scheme"), "http");
        assert_eq!(scheme_of("loop://peer-a").expect("scheme"), "loop");
        assert!(scheme_of("no-scheme-here").is_err());
        assert!(scheme_of("://host").is_err());
        assert!(scheme_of("http://").is_err());
    }

    #[test]
    fn clients_are_cached_per_uri() {
        let registry = ClientRegistry::new();
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        registry.register_factory(factory.clone());

        registry.client_for("null://a").expect("client");
        registry.client_for("null://a").expect("client");
        registry.client_for("null://b").expect("client");
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);

        registry.evict("null://a");
        registry.client_for("null://a").expect("client");
        assert_eq!(factory.created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unknown_scheme_is_reported() {
        let registry = ClientRegistry::new();
        // Client handles carry no Debug, so unwrap the error by hand.
        let err = match registry.client_for("mqtt://broker") {
            Ok(_) => panic!("unknown scheme must fail"),
            Err(err) => err,
        };
        assert_eq!(err, TransportError::UnknownScheme("mqtt".into()));
    }
}
