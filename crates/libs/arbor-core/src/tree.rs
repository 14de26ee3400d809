//! Element tree and addressing.
//!
//! The tree owns the parent/child graph and a separate non-owning link table.
//! Both live behind one reader/writer lock per tree: resolution and walks
//! take the read side, structural mutation the write side, every acquisition
//! bounded by the tree's lock timeout so contention surfaces as
//! [`CoreError::Locked`] instead of an unbounded stall.
//!
//! Addresses are never stored; `address_of` walks parent edges on demand so
//! the rendered address can never desync from the actual shape.
//!
//! Lock order invariant: the tree lock is never acquired while an event
//! node's subscription lock is held. The event engine snapshots subscribers
//! and releases its lock before resolving payload addresses here.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::CoreError;
use crate::node::Node;

/// Stable handle to a node within one tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

/// What a structural change notification describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeAction {
    Added,
    Removed,
    LinkAdded,
    LinkRemoved,
    TreeChanged,
}

impl TreeAction {
    pub fn tag(&self) -> &'static str {
        match self {
            TreeAction::Added => "added",
            TreeAction::Removed => "removed",
            TreeAction::LinkAdded => "linkadded",
            TreeAction::LinkRemoved => "linkremoved",
            TreeAction::TreeChanged => "treechanged",
        }
    }
}

/// Structural change notification.
///
/// Addresses are captured while the mutation still holds the write lock, so
/// a `Removed` change carries the pre-removal address of the removed node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeChange {
    pub action: TreeAction,
    /// Address of the parent (for link changes: the link source).
    pub parent: String,
    /// Address of the affected node (for link changes: the link target).
    pub child: String,
    /// Link identifier for `LinkAdded`/`LinkRemoved`.
    pub link: Option<String>,
}

type ObserverFn = dyn Fn(TreeChange) + Send + Sync;

struct LinkEdge {
    identifier: String,
    target: NodeId,
}

struct NodeEntry {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    node: Arc<Node>,
}

pub(crate) struct TreeState {
    next_id: u64,
    root: NodeId,
    entries: HashMap<NodeId, NodeEntry>,
    /// Non-owning alias edges, keyed by source. A link never keeps its
    /// target alive; removal of either endpoint scrubs the edge.
    links: HashMap<NodeId, Vec<LinkEdge>>,
}

impl TreeState {
    fn entry(&self, id: NodeId) -> Result<&NodeEntry, CoreError> {
        self.entries
            .get(&id)
            .ok_or_else(|| CoreError::NotFound(format!("node id {id:?} is gone")))
    }

    fn address_of(&self, id: NodeId) -> Result<String, CoreError> {
        let mut segments = Vec::new();
        let mut cursor = id;
        while let Some(parent) = self.entry(cursor)?.parent {
            segments.push(self.entry(cursor)?.node.identifier().to_owned());
            cursor = parent;
        }
        if cursor != self.root {
            return Err(CoreError::NotFound("node is detached from the root".into()));
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    fn resolve_segment(&self, from: NodeId, segment: &str) -> Option<NodeId> {
        let entry = self.entries.get(&from)?;
        // Children first: a real child shadows a same-named link.
        for child in &entry.children {
            if let Some(child_entry) = self.entries.get(child) {
                if child_entry.node.identifier() == segment {
                    return Some(*child);
                }
            }
        }
        self.links
            .get(&from)
            .and_then(|edges| edges.iter().find(|edge| edge.identifier == segment))
            .map(|edge| edge.target)
    }
}

/// Splits an address into identifier segments; leading/trailing slashes and
/// empty segments are ignored, so `/a/b`, `a/b` and `a/b/` are equivalent.
pub fn segments(address: &str) -> impl Iterator<Item = &str> {
    address.split('/').filter(|segment| !segment.is_empty())
}

/// The addressable node tree.
pub struct Tree {
    state: RwLock<TreeState>,
    lock_timeout: Duration,
    observer: Mutex<Option<Arc<ObserverFn>>>,
}

impl Tree {
    /// Creates a tree owning `root`. The root of an exposed core is always a
    /// Device so the device contracts answer at the empty address.
    pub fn new(root: Node, lock_timeout: Duration) -> Self {
        let root_id = NodeId(0);
        let mut entries = HashMap::new();
        entries.insert(root_id, NodeEntry { parent: None, children: Vec::new(), node: Arc::new(root) });
        Self {
            state: RwLock::new(TreeState {
                next_id: 1,
                root: root_id,
                entries,
                links: HashMap::new(),
            }),
            lock_timeout,
            observer: Mutex::new(None),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Registers the structural-change observer, replacing any previous one.
    /// The observer runs after the write lock is released and may therefore
    /// re-enter the tree.
    pub fn set_observer(&self, observer: impl Fn(TreeChange) + Send + Sync + 'static) {
        *self.observer.lock() = Some(Arc::new(observer));
    }

    fn notify(&self, change: TreeChange) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer(change);
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, TreeState>, CoreError> {
        self.state
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| CoreError::Locked("tree read lock timed out".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, TreeState>, CoreError> {
        self.state
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| CoreError::Locked("tree write lock timed out".into()))
    }

    #[cfg(test)]
    pub(crate) fn hold_write_lock(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.state.write()
    }

    /// The node behind `id`, if it is still part of the tree.
    pub fn node(&self, id: NodeId) -> Result<Arc<Node>, CoreError> {
        Ok(Arc::clone(&self.read()?.entry(id)?.node))
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, CoreError> {
        Ok(self.read()?.entry(id)?.parent)
    }

    /// Children of `id` in insertion order.
    pub fn children(&self, id: NodeId) -> Result<Vec<(NodeId, Arc<Node>)>, CoreError> {
        let state = self.read()?;
        let entry = state.entry(id)?;
        let mut out = Vec::with_capacity(entry.children.len());
        for child in &entry.children {
            out.push((*child, Arc::clone(&state.entry(*child)?.node)));
        }
        Ok(out)
    }

    /// `/`-joined address of `id`, recomputed by walking parent edges.
    pub fn address_of(&self, id: NodeId) -> Result<String, CoreError> {
        self.read()?.address_of(id)
    }

    /// Resolves an address to a node. Each segment is matched first against
    /// the current node's children, then against its outgoing links.
    pub fn resolve(&self, address: &str) -> Result<Option<(NodeId, Arc<Node>)>, CoreError> {
        let state = self.read()?;
        let mut cursor = state.root;
        for segment in segments(address) {
            match state.resolve_segment(cursor, segment) {
                Some(next) => cursor = next,
                None => return Ok(None),
            }
        }
        Ok(Some((cursor, Arc::clone(&state.entry(cursor)?.node))))
    }

    /// Adds `node` under `parent`. Sibling identifiers must be unique.
    pub fn add_child(&self, parent: NodeId, node: Node) -> Result<NodeId, CoreError> {
        let (id, change) = {
            let mut state = self.write()?;
            state.entry(parent)?;
            let identifier = node.identifier().to_owned();
            let duplicate = state
                .entry(parent)?
                .children
                .iter()
                .any(|child| {
                    state
                        .entries
                        .get(child)
                        .is_some_and(|entry| entry.node.identifier() == identifier)
                });
            if duplicate {
                return Err(CoreError::AlreadyExists(format!(
                    "child '{identifier}' already exists under {}",
                    state.address_of(parent)?
                )));
            }
            let id = NodeId(state.next_id);
            state.next_id += 1;
            state
                .entries
                .insert(id, NodeEntry { parent: Some(parent), children: Vec::new(), node: Arc::new(node) });
            if let Some(entry) = state.entries.get_mut(&parent) {
                entry.children.push(id);
            }
            let change = TreeChange {
                action: TreeAction::Added,
                parent: state.address_of(parent)?,
                child: state.address_of(id)?,
                link: None,
            };
            (id, change)
        };
        self.notify(change);
        Ok(id)
    }

    /// Removes `id` and every descendant, scrubbing all link-table entries
    /// that reference any removed node. The root cannot be removed.
    pub fn remove_child(&self, id: NodeId) -> Result<(), CoreError> {
        let change = {
            let mut state = self.write()?;
            if id == state.root {
                return Err(CoreError::InvalidRequest("the root cannot be removed".into()));
            }
            let entry = state.entry(id)?;
            let parent = entry
                .parent
                .ok_or_else(|| CoreError::Internal("non-root node without parent".into()))?;
            let child_address = state.address_of(id)?;
            let parent_address = state.address_of(parent)?;

            let mut removed = HashSet::new();
            let mut stack = vec![id];
            while let Some(current) = stack.pop() {
                if let Some(entry) = state.entries.get(&current) {
                    stack.extend(entry.children.iter().copied());
                }
                removed.insert(current);
            }

            if let Some(entry) = state.entries.get_mut(&parent) {
                entry.children.retain(|child| *child != id);
            }
            for current in &removed {
                state.entries.remove(current);
                state.links.remove(current);
            }
            for edges in state.links.values_mut() {
                edges.retain(|edge| !removed.contains(&edge.target));
            }
            state.links.retain(|_, edges| !edges.is_empty());

            TreeChange {
                action: TreeAction::Removed,
                parent: parent_address,
                child: child_address,
                link: None,
            }
        };
        self.notify(change);
        Ok(())
    }

    /// Adds a non-owning alias edge `(source, identifier) -> target`. The
    /// identifier must collide with neither an existing link nor a child of
    /// `source` (a child would permanently shadow the link).
    pub fn add_link(
        &self,
        source: NodeId,
        target: NodeId,
        identifier: impl Into<String>,
    ) -> Result<(), CoreError> {
        let identifier = identifier.into();
        let change = {
            let mut state = self.write()?;
            state.entry(target)?;
            let source_address = state.address_of(source)?;
            if state.resolve_segment(source, &identifier).is_some() {
                return Err(CoreError::AlreadyExists(format!(
                    "'{identifier}' already resolves under {source_address}"
                )));
            }
            let target_address = state.address_of(target)?;
            state
                .links
                .entry(source)
                .or_default()
                .push(LinkEdge { identifier: identifier.clone(), target });
            TreeChange {
                action: TreeAction::LinkAdded,
                parent: source_address,
                child: target_address,
                link: Some(identifier),
            }
        };
        self.notify(change);
        Ok(())
    }

    /// Removes the link named `identifier` on `source`. The target node's
    /// own address and lifecycle are unaffected.
    pub fn remove_link(&self, source: NodeId, identifier: &str) -> Result<(), CoreError> {
        let change = {
            let mut state = self.write()?;
            let source_address = state.address_of(source)?;
            let edges = state
                .links
                .get_mut(&source)
                .ok_or_else(|| CoreError::NotFound(format!("no links under {source_address}")))?;
            let index = edges
                .iter()
                .position(|edge| edge.identifier == identifier)
                .ok_or_else(|| {
                    CoreError::NotFound(format!("no link '{identifier}' under {source_address}"))
                })?;
            let edge = edges.remove(index);
            if edges.is_empty() {
                state.links.remove(&source);
            }
            let target_address = state.address_of(edge.target)?;
            TreeChange {
                action: TreeAction::LinkRemoved,
                parent: source_address,
                child: target_address,
                link: Some(identifier.to_owned()),
            }
        };
        self.notify(change);
        Ok(())
    }

    /// Adds `profile` to the node's tag set. Idempotent; a `TreeChanged`
    /// notification fires only when the set actually changed.
    pub fn add_profile(&self, id: NodeId, profile: impl Into<String>) -> Result<bool, CoreError> {
        let node = self.node(id)?;
        let changed = node.add_profile(profile);
        if changed {
            self.notify_profile_change(id)?;
        }
        Ok(changed)
    }

    /// Removes `profile` from the node's tag set. Idempotent.
    pub fn remove_profile(&self, id: NodeId, profile: &str) -> Result<bool, CoreError> {
        let node = self.node(id)?;
        let changed = node.remove_profile(profile);
        if changed {
            self.notify_profile_change(id)?;
        }
        Ok(changed)
    }

    fn notify_profile_change(&self, id: NodeId) -> Result<(), CoreError> {
        let (parent, child) = {
            let state = self.read()?;
            let parent = match state.entry(id)?.parent {
                Some(parent) => state.address_of(parent)?,
                None => "/".to_owned(),
            };
            (parent, state.address_of(id)?)
        };
        self.notify(TreeChange { action: TreeAction::TreeChanged, parent, child, link: None });
        Ok(())
    }

    /// Depth-first walk from `from`, visiting every owned descendant with
    /// its id, node and address. Links are not followed.
    pub fn walk<F>(&self, from: NodeId, mut visit: F) -> Result<(), CoreError>
    where
        F: FnMut(NodeId, &Arc<Node>, &str),
    {
        let state = self.read()?;
        let base = state.address_of(from)?;
        let mut stack = vec![(from, base)];
        while let Some((id, address)) = stack.pop() {
            let entry = state.entry(id)?;
            visit(id, &entry.node, &address);
            for child in entry.children.iter().rev() {
                let child_entry = state.entry(*child)?;
                let child_address = if address == "/" {
                    format!("/{}", child_entry.node.identifier())
                } else {
                    format!("{address}/{}", child_entry.node.identifier())
                };
                stack.push((*child, child_address));
            }
        }
        Ok(())
    }

    /// Full-tree walk collecting nodes matching `predicate`.
    pub fn find<F>(&self, predicate: F) -> Result<Vec<(NodeId, Arc<Node>)>, CoreError>
    where
        F: Fn(&Arc<Node>) -> bool,
    {
        let mut matches = Vec::new();
        self.walk(self.root(), |id, node, _| {
            if predicate(node) {
                matches.push((id, Arc::clone(node)));
            }
        })?;
        Ok(matches)
    }
}
