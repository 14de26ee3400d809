//! Local implementations of the device contracts.
//!
//! `getidentity`, `gettree`, `querytree`, `getdatamulti`, `setdatamulti`,
//! `getsubscriberlist`. Mirrored devices never reach these: the dispatcher
//! forwards their verbs through the device's remote binding verbatim.

use std::sync::Arc;

use arbor_value::{Map, Value};
use arbor_wire::codes;

use crate::core::Core;
use crate::error::CoreError;
use crate::node::Node;
use crate::tree::NodeId;

impl Core {
    pub(crate) fn device_getidentity(&self, node: &Node) -> Result<Option<Value>, CoreError> {
        let mut map = Map::new();
        map.insert("identifier".into(), Value::Str(node.identifier().to_owned()));
        map.insert("kind".into(), Value::Str("device".into()));
        if let Some(device) = node.as_device() {
            if let Some(version) = &device.version {
                map.insert("version".into(), Value::Str(version.clone()));
            }
        }
        if let Some(uid) = node.uid() {
            map.insert("uid".into(), Value::Str(uid.to_owned()));
        }
        Ok(Some(Value::Map(map)))
    }

    /// Recursive tree description from `id` downwards. Hidden nodes are
    /// omitted unless the payload carries `all: true`.
    pub(crate) fn device_gettree(
        &self,
        id: NodeId,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, CoreError> {
        let include_all = payload
            .and_then(|payload| payload.get("all"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let node = self.tree.node(id)?;
        Ok(Some(self.describe_node(id, &node, include_all)?))
    }

    fn describe_node(
        &self,
        id: NodeId,
        node: &Arc<Node>,
        include_all: bool,
    ) -> Result<Value, CoreError> {
        let mut map = Map::new();
        map.insert("identifier".into(), Value::Str(node.identifier().to_owned()));
        map.insert("kind".into(), Value::Str(node.kind().tag().into()));
        let profiles = node.profiles();
        if !profiles.is_empty() {
            map.insert(
                "profiles".into(),
                Value::List(profiles.into_iter().map(Value::Str).collect()),
            );
        }
        if let Some(uid) = node.uid() {
            map.insert("uid".into(), Value::Str(uid.to_owned()));
        }
        if let Some(format) = node.format() {
            map.insert("format".into(), Value::Str(format.to_owned()));
        }
        if node.is_hidden() {
            map.insert("hidden".into(), Value::Bool(true));
        }
        let mut children = Vec::new();
        for (child_id, child) in self.tree.children(id)? {
            if child.is_hidden() && !include_all {
                continue;
            }
            children.push(self.describe_node(child_id, &child, include_all)?);
        }
        if !children.is_empty() {
            map.insert("children".into(), Value::List(children));
        }
        Ok(Value::Map(map))
    }

    /// Addresses of all matching nodes: optional `profile` filter, hidden
    /// nodes included only with `all: true`.
    pub(crate) fn device_querytree(
        &self,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, CoreError> {
        let profile = payload
            .and_then(|payload| payload.get("profile"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        let include_all = payload
            .and_then(|payload| payload.get("all"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut addresses = Vec::new();
        self.tree.walk(self.tree.root(), |_, node, address| {
            if node.is_hidden() && !include_all {
                return;
            }
            if let Some(profile) = &profile {
                if !node.has_profile(profile) {
                    return;
                }
            }
            addresses.push(Value::Str(address.to_owned()));
        })?;
        Ok(Some(Value::List(addresses)))
    }

    /// Bulk read: list of addresses in, `address -> {code, value}` out.
    /// Per-address failures stay inside the payload; the request succeeds.
    pub(crate) fn device_getdatamulti(
        &self,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, CoreError> {
        let addresses: Vec<String> = payload
            .and_then(Value::as_list)
            .ok_or_else(|| {
                CoreError::DataInvalid("getdatamulti requires a list of addresses".into())
            })?
            .iter()
            .filter_map(Value::as_str)
            .map(ToOwned::to_owned)
            .collect();
        Ok(Some(self.collect_payload(&addresses)))
    }

    /// Bulk write: `address -> value` in, `address -> code` out.
    pub(crate) fn device_setdatamulti(
        &self,
        payload: Option<&Value>,
    ) -> Result<Option<Value>, CoreError> {
        let writes = payload.and_then(Value::as_map).ok_or_else(|| {
            CoreError::DataInvalid("setdatamulti requires an address-to-value map".into())
        })?;
        let mut statuses = Map::new();
        for (address, value) in writes {
            let code = match self.tree.resolve(address) {
                Ok(Some((_, node))) if node.as_data().is_some() => {
                    match self.data_set(&node, value.clone()) {
                        Ok(()) => codes::OK,
                        Err(err) => err.code(),
                    }
                }
                Ok(Some(_)) => codes::BAD_REQUEST,
                Ok(None) => codes::NOT_FOUND,
                Err(err) => err.code(),
            };
            statuses.insert(address.clone(), Value::UInt(u64::from(code)));
        }
        Ok(Some(Value::Map(statuses)))
    }

    /// `event address -> subscription ids` for every Event node under `id`.
    pub(crate) fn device_getsubscriberlist(&self, id: NodeId) -> Result<Option<Value>, CoreError> {
        let mut events = Vec::new();
        self.tree.walk(id, |_, node, address| {
            if node.as_event().is_some() {
                events.push((Arc::clone(node), address.to_owned()));
            }
        })?;
        let mut map = Map::new();
        for (node, address) in events {
            let Some(event) = node.as_event() else { continue };
            let ids = event.subscriber_ids(self.config.lock_timeout)?;
            map.insert(address, Value::List(ids.into_iter().map(Value::Str).collect()));
        }
        Ok(Some(Value::Map(map)))
    }
}
