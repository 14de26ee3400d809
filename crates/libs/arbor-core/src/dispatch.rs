//! Address-routed message dispatch.
//!
//! A request address either resolves to a node outright (services are
//! invoked directly; structural nodes answer with tree introspection) or
//! carries an operation verb as its terminal segment (`.../getdata`,
//! `.../subscribe`, device contracts). Every request produces exactly one
//! response; domain errors serialize with their carried code and message,
//! anything else is a 500 by construction of [`CoreError`].

use arbor_transport::InboundHandler;
use arbor_value::Value;
use arbor_wire::{codes, Message};
use log::{debug, warn};
use uuid::Uuid;

use crate::core::Core;
use crate::error::CoreError;
use crate::event::{SubscriberTarget, Subscription};
use crate::node::{Node, NodeKind};
use crate::tree::NodeId;

/// Splits a subscription callback of the form `scheme://peer/address` into
/// the client URI and the callback address on that peer.
pub(crate) fn split_callback(callback: &str) -> Result<(String, String), CoreError> {
    let scheme_end = callback.find("://").ok_or_else(|| {
        CoreError::DataInvalid(format!("callback '{callback}' lacks a uri scheme"))
    })?;
    let rest = &callback[scheme_end + 3..];
    if rest.is_empty() {
        return Err(CoreError::DataInvalid(format!("callback '{callback}' lacks a peer")));
    }
    match rest.find('/') {
        Some(slash) => Ok((
            callback[..scheme_end + 3 + slash].to_owned(),
            rest[slash..].to_owned(),
        )),
        None => Ok((callback.to_owned(), "/".to_owned())),
    }
}

impl Core {
    /// Dispatches one request message; always returns exactly one response.
    pub fn handle_request_message(&self, message: &Message) -> Message {
        match self.dispatch(message) {
            Ok(data) => Message::response(message.cid, codes::OK, data),
            Err(err) => {
                debug!("request '{}' failed: {err}", message.adr.as_deref().unwrap_or(""));
                Message::response(message.cid, err.code(), Some(Value::Str(err.to_string())))
            }
        }
    }

    /// Dispatches one fire-and-forget event message. Resolution failures
    /// are logged and dropped; events never produce a response.
    pub fn handle_event_message(&self, message: &Message) {
        let Some(address) = message.adr.as_deref() else {
            debug!("inbound event without an address dropped");
            return;
        };
        match self.raise_event_with(address, message.data.clone()) {
            Ok(outcome) if !outcome.failures.is_empty() => {
                warn!(
                    "inbound event '{address}': {} of {} deliveries failed",
                    outcome.failures.len(),
                    outcome.delivered + outcome.failures.len()
                );
            }
            Ok(_) => {}
            Err(err) => debug!("inbound event '{address}' dropped: {err}"),
        }
    }

    fn dispatch(&self, message: &Message) -> Result<Option<Value>, CoreError> {
        if !message.is_request() {
            return Err(CoreError::InvalidRequest(format!(
                "code {} is not a request code",
                message.code
            )));
        }
        let address = message.adr.clone().unwrap_or_default();
        let payload = message.data.clone();

        // A fully resolving address names the operation target itself.
        if let Some((id, node)) = self.tree.resolve(&address)? {
            return match node.kind() {
                NodeKind::Service(_) => self.service_invoke(&node, payload),
                NodeKind::Structure | NodeKind::Device(_) => {
                    // Bare structural address defaults to tree introspection.
                    self.dispatch_device_verb(id, &node, "gettree", payload)
                }
                NodeKind::Data(_) | NodeKind::Event(_) => Err(CoreError::InvalidRequest(format!(
                    "'{address}' is not invocable without an operation segment"
                ))),
            };
        }

        // Otherwise the terminal segment is the operation verb.
        let trimmed = address.trim_matches('/');
        let (prefix, verb) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        if verb.is_empty() {
            return Err(CoreError::NotFound(format!("'{address}' does not resolve")));
        }
        let Some((id, node)) = self.tree.resolve(prefix)? else {
            return Err(CoreError::NotFound(format!("'{address}' does not resolve")));
        };
        match node.kind() {
            NodeKind::Data(_) => match verb {
                "getdata" => Ok(Some(self.data_get(&node)?)),
                "setdata" => {
                    let value = payload.ok_or_else(|| {
                        CoreError::DataInvalid("setdata requires a payload".into())
                    })?;
                    self.data_set(&node, value)?;
                    Ok(None)
                }
                _ => Err(CoreError::InvalidRequest(format!(
                    "'{verb}' is not valid for a data node"
                ))),
            },
            NodeKind::Event(_) => match verb {
                "subscribe" => self.wire_subscribe(id, payload),
                "unsubscribe" => self.wire_unsubscribe(id, payload),
                _ => Err(CoreError::InvalidRequest(format!(
                    "'{verb}' is not valid for an event node"
                ))),
            },
            NodeKind::Device(_) => self.dispatch_device_verb(id, &node, verb, payload),
            // An unmatched segment under a structure or service is simply an
            // address that does not resolve.
            NodeKind::Structure | NodeKind::Service(_) => {
                Err(CoreError::NotFound(format!("'{address}' does not resolve")))
            }
        }
    }

    fn dispatch_device_verb(
        &self,
        id: NodeId,
        node: &Node,
        verb: &str,
        payload: Option<Value>,
    ) -> Result<Option<Value>, CoreError> {
        // Mirrored devices forward every contract verbatim.
        if let Some(binding) = node.as_device().and_then(|device| device.binding.as_ref()) {
            return self.forward_request(binding, Some(verb), payload);
        }
        match verb {
            "getidentity" => self.device_getidentity(node),
            "gettree" => self.device_gettree(id, payload.as_ref()),
            "querytree" => self.device_querytree(payload.as_ref()),
            "getdatamulti" => self.device_getdatamulti(payload.as_ref()),
            "setdatamulti" => self.device_setdatamulti(payload.as_ref()),
            "getsubscriberlist" => self.device_getsubscriberlist(id),
            _ => Err(CoreError::InvalidRequest(format!("'{verb}' is not a device operation"))),
        }
    }

    fn wire_subscribe(
        &self,
        id: NodeId,
        payload: Option<Value>,
    ) -> Result<Option<Value>, CoreError> {
        let payload = payload
            .ok_or_else(|| CoreError::DataInvalid("subscribe requires a payload".into()))?;
        let map = payload
            .as_map()
            .ok_or_else(|| CoreError::DataInvalid("subscribe payload is not a map".into()))?;
        let callback = map
            .get("callback")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::DataInvalid("subscribe payload lacks a callback".into()))?;
        let (uri, callback_address) = split_callback(callback)?;
        let subscription = Subscription {
            id: map
                .get("id")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            target: SubscriberTarget::Remote { uri, callback_address },
            requested_addresses: map
                .get("addresses")
                .and_then(Value::as_list)
                .map(|addresses| {
                    addresses
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToOwned::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            persist: map.get("persist").and_then(Value::as_bool).unwrap_or(false),
        };
        let local_address = self.tree.address_of(id)?;
        let assigned = self.subscribe_with(&local_address, subscription)?;
        Ok(Some(Value::Str(assigned)))
    }

    fn wire_unsubscribe(
        &self,
        id: NodeId,
        payload: Option<Value>,
    ) -> Result<Option<Value>, CoreError> {
        let payload = payload
            .ok_or_else(|| CoreError::DataInvalid("unsubscribe requires a payload".into()))?;
        let subscription_id = payload
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| payload.as_str())
            .ok_or_else(|| {
                CoreError::DataInvalid("unsubscribe payload lacks a subscription id".into())
            })?
            .to_owned();
        let local_address = self.tree.address_of(id)?;
        self.unsubscribe(&local_address, &subscription_id)?;
        Ok(None)
    }
}

impl InboundHandler for Core {
    fn handle_request(&self, message: Message) -> Message {
        self.handle_request_message(&message)
    }

    fn handle_event(&self, message: Message) {
        self.handle_event_message(&message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use arbor_transport::ClientRegistry;

    use super::*;
    use crate::core::CoreConfig;

    #[test]
    fn a_contended_tree_lock_answers_423() {
        let mut config = CoreConfig::new("device0");
        config.lock_timeout = Duration::from_millis(50);
        let core = Core::new(config, Arc::new(ClientRegistry::new()));

        let guard = core.tree.hold_write_lock();
        let response = core.handle_request_message(&Message::request(1, "/getidentity", None));
        assert_eq!(response.code, codes::LOCKED);
        drop(guard);

        let response = core.handle_request_message(&Message::request(2, "/getidentity", None));
        assert_eq!(response.code, codes::OK);
    }

    #[test]
    fn callback_splits_into_uri_and_address() {
        let (uri, address) = split_callback("loop://core-b/remote/id0/event1").expect("split");
        assert_eq!(uri, "loop://core-b");
        assert_eq!(address, "/remote/id0/event1");

        let (uri, address) = split_callback("loop://core-b").expect("split");
        assert_eq!(uri, "loop://core-b");
        assert_eq!(address, "/");

        assert!(split_callback("not-a-uri").is_err());
        assert!(split_callback("loop://").is_err());
    }
}
