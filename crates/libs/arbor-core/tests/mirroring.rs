//! Mirroring two cores over the in-process loopback transport.

use std::sync::Arc;
use std::time::Duration;

use arbor_core::{Core, CoreConfig, CoreError, EventData, MirrorOptions, Node, Value};
use arbor_transport::{
    ClientFactory, ClientRegistry, ClientTransport, LoopbackClient, LoopbackNetwork,
    TransportError,
};
use arbor_wire::{codes, Message};
use parking_lot::Mutex;

/// Loopback factory that keeps every created client visible to the test, so
/// request counts can be asserted without reaching into the registry cache.
struct ObservedFactory {
    network: Arc<LoopbackNetwork>,
    clients: Mutex<Vec<Arc<LoopbackClient>>>,
}

impl ObservedFactory {
    fn new(network: Arc<LoopbackNetwork>) -> Arc<Self> {
        Arc::new(Self { network, clients: Mutex::new(Vec::new()) })
    }

    fn requests_sent(&self) -> u64 {
        self.clients.lock().iter().map(|client| client.requests_sent()).sum()
    }
}

impl ClientFactory for ObservedFactory {
    fn scheme(&self) -> &str {
        "loop"
    }

    fn create(&self, uri: &str) -> Result<Arc<dyn ClientTransport>, TransportError> {
        let peer = uri
            .strip_prefix("loop://")
            .filter(|peer| !peer.is_empty())
            .ok_or_else(|| TransportError::InvalidUri(uri.to_owned()))?;
        let client = Arc::new(LoopbackClient::new(Arc::clone(&self.network), peer));
        self.clients.lock().push(Arc::clone(&client));
        Ok(client)
    }
}

struct Pair {
    network: Arc<LoopbackNetwork>,
    local: Arc<Core>,
    remote: Arc<Core>,
    local_factory: Arc<ObservedFactory>,
}

/// Two cores wired together: `local` mirrors `remote` ("device-b"), which
/// exposes a writable data point, a service and an event.
fn pair() -> Pair {
    let network = LoopbackNetwork::new();

    let remote_registry = Arc::new(ClientRegistry::new());
    remote_registry.register_factory(ObservedFactory::new(Arc::clone(&network)));
    let remote = Core::new(CoreConfig::new("device-b"), remote_registry);
    {
        let tree = remote.tree();
        let sensors = tree.add_child(tree.root(), Node::structure("sensors")).expect("add");
        tree.add_child(sensors, Node::value_cell("temp", Value::Str("data123".into())))
            .expect("add");
        tree.add_child(
            tree.root(),
            Node::service("echo", |payload| Ok(payload)),
        )
        .expect("add");
        tree.add_child(tree.root(), Node::event("alarm")).expect("add");
    }
    network.register("device-b", remote.clone());

    let local_registry = Arc::new(ClientRegistry::new());
    let local_factory = ObservedFactory::new(Arc::clone(&network));
    local_registry.register_factory(Arc::clone(&local_factory) as Arc<dyn ClientFactory>);
    let local = Core::new(CoreConfig::new("device-a"), local_registry);
    network.register("device-a", local.clone());

    Pair { network, local, remote, local_factory }
}

fn request(core: &Core, adr: &str, data: Option<Value>) -> Message {
    core.handle_request_message(&Message::request(1, adr, data))
}

#[test]
fn mirror_grafts_the_remote_tree_under_remote_alias() {
    let pair = pair();
    let alias = pair
        .local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");
    assert_eq!(alias, "device-b");

    let tree = pair.local.tree();
    assert!(tree.resolve("/remote/device-b/sensors/temp").expect("resolve").is_some());
    assert!(tree.resolve("/remote/device-b/echo").expect("resolve").is_some());
    assert!(tree.resolve("/remote/device-b/alarm").expect("resolve").is_some());
}

#[test]
fn mirrored_data_and_services_forward_transparently() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    let response = request(&pair.local, "/remote/device-b/sensors/temp/getdata", None);
    assert_eq!(response.code, codes::OK);
    assert_eq!(response.data, Some(Value::Str("data123".into())));

    assert_eq!(
        request(
            &pair.local,
            "/remote/device-b/sensors/temp/setdata",
            Some(Value::Str("updated".into())),
        )
        .code,
        codes::OK
    );
    // The write landed on the remote side, not in a local shadow.
    assert_eq!(
        request(&pair.remote, "/sensors/temp/getdata", None).data,
        Some(Value::Str("updated".into()))
    );

    let response = request(
        &pair.local,
        "/remote/device-b/echo",
        Some(Value::Str("ping".into())),
    );
    assert_eq!(response.code, codes::OK);
    assert_eq!(response.data, Some(Value::Str("ping".into())));
}

#[test]
fn mirrored_device_contracts_forward_verbatim() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    let identity = request(&pair.local, "/remote/device-b/getidentity", None)
        .data
        .expect("identity");
    assert_eq!(identity.get("identifier"), Some(&Value::Str("device-b".into())));
}

#[test]
fn remote_errors_re_raise_with_the_remote_code() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    // getdatamulti forwards verbatim through the device binding; the remote
    // rejects the missing payload and its 422 comes back unchanged.
    let response = request(&pair.local, "/remote/device-b/getdatamulti", None);
    assert_eq!(response.code, codes::DATA_INVALID);
}

#[test]
fn an_outage_degrades_the_call_and_leaves_the_mirror_intact() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    pair.network.unregister("device-b");
    let response = request(&pair.local, "/remote/device-b/sensors/temp/getdata", None);
    assert!(codes::is_server_error(response.code));
    assert!(pair
        .local
        .tree()
        .resolve("/remote/device-b/sensors/temp")
        .expect("resolve")
        .is_some());
}

#[test]
fn alias_collision_fails_without_touching_the_tree() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");
    let err = pair
        .local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect_err("alias taken");
    assert!(matches!(err, CoreError::AlreadyExists(_)));
    assert!(pair
        .local
        .tree()
        .resolve("/remote/device-b/sensors/temp")
        .expect("resolve")
        .is_some());
}

#[test]
fn unmirror_removes_the_subtree_and_prunes_the_container() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    // Either the alias or the remote URI selects the mirror.
    pair.local.unmirror("loop://device-b").expect("unmirror");
    assert!(pair.local.tree().resolve("/remote").expect("resolve").is_none());

    assert!(matches!(
        pair.local.unmirror("device-b").expect_err("gone"),
        CoreError::NotFound(_)
    ));
}

#[test]
fn cache_window_serves_repeated_reads_locally() {
    let pair = pair();
    pair.local
        .mirror(
            "loop://device-b",
            "loop://device-a",
            MirrorOptions { cache_timeout: Some(Duration::from_secs(60)), ..Default::default() },
        )
        .expect("mirror");
    let after_mirror = pair.local_factory.requests_sent();

    assert_eq!(
        request(&pair.local, "/remote/device-b/sensors/temp/getdata", None).data,
        Some(Value::Str("data123".into()))
    );
    assert_eq!(pair.local_factory.requests_sent(), after_mirror + 1);

    // Second read within the window never leaves the process.
    assert_eq!(
        request(&pair.local, "/remote/device-b/sensors/temp/getdata", None).data,
        Some(Value::Str("data123".into()))
    );
    assert_eq!(pair.local_factory.requests_sent(), after_mirror + 1);

    // A forwarded write invalidates the cached value.
    request(
        &pair.local,
        "/remote/device-b/sensors/temp/setdata",
        Some(Value::Str("fresh".into())),
    );
    assert_eq!(
        request(&pair.local, "/remote/device-b/sensors/temp/getdata", None).data,
        Some(Value::Str("fresh".into()))
    );
}

#[test]
fn an_expired_cache_window_refetches() {
    let pair = pair();
    pair.local
        .mirror(
            "loop://device-b",
            "loop://device-a",
            MirrorOptions {
                cache_timeout: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        )
        .expect("mirror");
    let after_mirror = pair.local_factory.requests_sent();

    request(&pair.local, "/remote/device-b/sensors/temp/getdata", None);
    std::thread::sleep(Duration::from_millis(50));
    request(&pair.local, "/remote/device-b/sensors/temp/getdata", None);
    assert_eq!(pair.local_factory.requests_sent(), after_mirror + 2);
}

#[test]
fn event_bridge_delivers_remote_raises_to_local_subscribers() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    let received: Arc<Mutex<Vec<EventData>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    pair.local
        .subscribe(
            "/remote/device-b/alarm",
            Arc::new(move |event| sink.lock().push(event)),
            Vec::new(),
        )
        .expect("subscribe");

    // The bridge registered exactly one remote subscription.
    let listing = request(&pair.remote, "/getsubscriberlist", None).data.expect("listing");
    let remote_subs = listing.get("/alarm").and_then(Value::as_list).expect("alarm subs");
    assert_eq!(remote_subs.len(), 1);

    let outcome = pair
        .remote
        .raise_event_with("/alarm", Some(Value::Str("overheat".into())))
        .expect("raise");
    assert_eq!(outcome.delivered, 1);
    assert!(outcome.failures.is_empty());

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].event_source, "/remote/device-b/alarm");
    // The bridged payload is the remote notification's wire shape.
    assert_eq!(
        received[0].payload.get("payload"),
        Some(&Value::Str("overheat".into()))
    );
    assert_eq!(
        received[0].payload.get("eventsource"),
        Some(&Value::Str("/alarm".into()))
    );
}

#[test]
fn the_last_unsubscribe_releases_the_bridge() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    let id = pair
        .local
        .subscribe("/remote/device-b/alarm", Arc::new(|_| {}), Vec::new())
        .expect("subscribe");
    let listing = request(&pair.remote, "/getsubscriberlist", None).data.expect("listing");
    assert_eq!(
        listing.get("/alarm").and_then(Value::as_list).map(|ids| ids.len()),
        Some(1)
    );

    pair.local.unsubscribe("/remote/device-b/alarm", &id).expect("unsubscribe");
    let listing = request(&pair.remote, "/getsubscriberlist", None).data.expect("listing");
    assert_eq!(
        listing.get("/alarm").and_then(Value::as_list).map(|ids| ids.len()),
        Some(0)
    );
}

#[test]
fn unmirror_releases_engaged_bridges() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");
    pair.local
        .subscribe("/remote/device-b/alarm", Arc::new(|_| {}), Vec::new())
        .expect("subscribe");

    pair.local.unmirror("device-b").expect("unmirror");
    let listing = request(&pair.remote, "/getsubscriberlist", None).data.expect("listing");
    assert_eq!(
        listing.get("/alarm").and_then(Value::as_list).map(|ids| ids.len()),
        Some(0)
    );
}

#[test]
fn a_failed_bridge_engagement_rolls_the_subscription_back() {
    let pair = pair();
    pair.local
        .mirror("loop://device-b", "loop://device-a", MirrorOptions::default())
        .expect("mirror");

    pair.network.unregister("device-b");
    let err = pair
        .local
        .subscribe("/remote/device-b/alarm", Arc::new(|_| {}), Vec::new())
        .expect_err("engagement must fail");
    assert!(codes::is_server_error(err.code()));

    // No half-registered local subscription survives.
    let listing = request(&pair.local, "/getsubscriberlist", None).data.expect("listing");
    assert_eq!(
        listing
            .get("/remote/device-b/alarm")
            .and_then(Value::as_list)
            .map(|ids| ids.len()),
        Some(0)
    );
}
